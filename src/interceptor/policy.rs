// SPDX-License-Identifier: Apache-2.0

//! Policy Engine
//!
//! Decides whether a query may reach the database. Rules run in a fixed
//! order and the first match blocks:
//!
//! 1. empty text
//! 2. text longer than `max_query_length`
//! 3. injection heuristics, in configuration order
//! 4. more JOINs than `max_joins`
//! 5. schema changes from non-privileged principals (hardened mode only)
//! 6. `DELETE FROM` without `WHERE`
//! 7. `UPDATE ... SET` without `WHERE`
//!
//! Rules 4 to 7 look at the text with comments and quoted literals masked
//! out. A `WHERE` only qualifies a DELETE or UPDATE when it follows the
//! statement target at the same parenthesis depth, before any `;`.
//!
//! Anything else is allowed. An allowed query carrying an SQL comment is
//! flagged for an audit note.
//!
//! This is pattern matching, not parsing. It sits behind parameterized
//! queries as a second line of defense and will miss what a grammar would
//! catch.

use regex::Regex;
use tracing::{debug, info};

use super::config::InterceptorConfig;
use super::error::{ConfigError, PolicyViolation};
use super::types::{AlertCategory, AlertSeverity, Principal};

pub const RULE_EMPTY: &str = "empty-query";
pub const RULE_MAX_LENGTH: &str = "max-length";
pub const RULE_EXCESSIVE_JOINS: &str = "excessive-joins";
pub const RULE_SCHEMA_CHANGE: &str = "unauthorized-schema-change";
pub const RULE_UNQUALIFIED_DELETE: &str = "unqualified-delete";
pub const RULE_UNQUALIFIED_UPDATE: &str = "unqualified-update";

pub const REASON_UNQUALIFIED_DELETE: &str = "Unqualified DELETE statement (missing WHERE clause)";
pub const REASON_UNQUALIFIED_UPDATE: &str = "Unqualified UPDATE statement (missing WHERE clause)";

/// Outcome of evaluating one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allow {
        /// Set when the query should be noted in the audit trail for review
        audit_note: Option<String>,
    },
    Block(PolicyViolation),
}

impl PolicyVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// A compiled injection heuristic
#[derive(Debug)]
struct CompiledPattern {
    id: String,
    description: String,
    regex: Regex,
}

/// Structural regexes shared by every engine instance
#[derive(Debug)]
struct StructuralRules {
    join: Regex,
    schema_change: Regex,
    delete_from: Regex,
    update_set: Regex,
    /// `WHERE` keywords plus the tokens that bound a statement's scope
    where_scope: Regex,
    comment: Regex,
}

impl StructuralRules {
    fn compile() -> Result<Self, ConfigError> {
        Ok(Self {
            join: compile(r"\bjoin\b")?,
            schema_change: compile(
                r"\b(?:create|alter|drop)\s+(?:table|database|schema|index|view)\b|^\s*truncate\b",
            )?,
            delete_from: compile(r"\bdelete\s+from\b")?,
            update_set: compile(r"\bupdate\s+\S+(?:\s+(?:as\s+)?\w+)?\s+set\b")?,
            where_scope: compile(r"\bwhere\b|[();]")?,
            comment: compile(r"--|/\*")?,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("(?is){}", pattern)).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Rule set loaded once at startup and never mutated afterwards
#[derive(Debug)]
pub struct PolicyEngine {
    max_query_length: usize,
    max_joins: usize,
    hardened_mode: bool,
    patterns: Vec<CompiledPattern>,
    structural: StructuralRules,
}

impl PolicyEngine {
    /// Compiles every configured pattern; any invalid regex fails construction.
    pub fn from_config(config: &InterceptorConfig) -> Result<Self, ConfigError> {
        let patterns = config
            .injection_patterns
            .iter()
            .map(|p| {
                Ok(CompiledPattern {
                    id: p.id.clone(),
                    description: p.description.clone(),
                    regex: compile(&p.pattern)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        info!(
            patterns = patterns.len(),
            hardened = config.hardened_mode,
            "Policy engine loaded"
        );

        Ok(Self {
            max_query_length: config.max_query_length,
            max_joins: config.max_joins,
            hardened_mode: config.hardened_mode,
            patterns,
            structural: StructuralRules::compile()?,
        })
    }

    /// Evaluates a query against every rule in order
    pub fn evaluate(&self, query: &str, principal: &Principal) -> PolicyVerdict {
        match self.first_violation(query, principal) {
            Some(violation) => {
                debug!(rule = violation.rule_id(), "Policy rule triggered for query");
                PolicyVerdict::Block(violation)
            }
            None => PolicyVerdict::Allow {
                audit_note: self
                    .structural
                    .comment
                    .is_match(query)
                    .then(|| "Query contains an inline SQL comment".to_string()),
            },
        }
    }

    fn first_violation(&self, query: &str, principal: &Principal) -> Option<PolicyViolation> {
        if query.trim().is_empty() {
            return Some(structural(RULE_EMPTY, "Empty query"));
        }

        let length = query.chars().count();
        if length > self.max_query_length {
            return Some(structural(
                RULE_MAX_LENGTH,
                format!(
                    "Query exceeds maximum length ({} > {} characters)",
                    length, self.max_query_length
                ),
            ));
        }

        if let Some(pattern) = self.patterns.iter().find(|p| p.regex.is_match(query)) {
            return Some(PolicyViolation::new(
                pattern.id.clone(),
                pattern.description.clone(),
                AlertCategory::InjectionAttempt,
                AlertSeverity::High,
            ));
        }

        let masked = mask_literals(query);

        let joins = self.structural.join.find_iter(&masked).count();
        if joins > self.max_joins {
            return Some(structural(
                RULE_EXCESSIVE_JOINS,
                format!("Excessive joins ({} > {})", joins, self.max_joins),
            ));
        }

        if self.hardened_mode
            && !principal.privileged
            && self.structural.schema_change.is_match(&masked)
        {
            return Some(PolicyViolation::new(
                RULE_SCHEMA_CHANGE,
                "Schema-mutating statement from non-privileged principal",
                AlertCategory::UnauthorizedSchemaChange,
                AlertSeverity::Critical,
            ));
        }

        if self.lacks_where(&self.structural.delete_from, &masked) {
            return Some(structural(RULE_UNQUALIFIED_DELETE, REASON_UNQUALIFIED_DELETE));
        }

        if self.lacks_where(&self.structural.update_set, &masked) {
            return Some(structural(RULE_UNQUALIFIED_UPDATE, REASON_UNQUALIFIED_UPDATE));
        }

        None
    }

    /// True when any statement matched by `target` has no WHERE of its own
    fn lacks_where(&self, target: &Regex, masked: &str) -> bool {
        target
            .find_iter(masked)
            .any(|m| !self.where_follows(&masked[m.end()..]))
    }

    fn where_follows(&self, rest: &str) -> bool {
        let mut depth = 0usize;
        for token in self.structural.where_scope.find_iter(rest) {
            match token.as_str() {
                "(" => depth += 1,
                ")" if depth == 0 => return false,
                ")" => depth -= 1,
                ";" if depth == 0 => return false,
                ";" => {}
                _ if depth == 0 => return true,
                _ => {}
            }
        }
        false
    }
}

/// Replaces comments with spaces and quoted literals with `_`
///
/// Handles `--` and `/* */` comments, single-quoted strings with `''`
/// escapes, double-quoted identifiers and dollar-quoted bodies. An
/// unterminated literal or comment runs to the end of the text.
fn mask_literals(query: &str) -> String {
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match (c, next) {
            ('-', Some('-')) => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                out.push_str("  ");
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    out.push(if chars[i] == '\n' { '\n' } else { ' ' });
                    i += 1;
                }
                if i < chars.len() {
                    out.push_str("  ");
                    i += 2;
                }
            }
            ('\'', _) | ('"', _) => {
                out.push(c);
                i += 1;
                while i < chars.len() {
                    if chars[i] == c {
                        if chars.get(i + 1) == Some(&c) {
                            out.push_str("__");
                            i += 2;
                            continue;
                        }
                        out.push(c);
                        i += 1;
                        break;
                    }
                    out.push('_');
                    i += 1;
                }
            }
            ('$', _) => match dollar_tag(&chars[i..]) {
                Some(tag_len) => {
                    let tag = &chars[i..i + tag_len];
                    for _ in 0..tag_len {
                        out.push('$');
                    }
                    i += tag_len;
                    while i < chars.len() && !chars[i..].starts_with(tag) {
                        out.push('_');
                        i += 1;
                    }
                    if i < chars.len() {
                        for _ in 0..tag_len {
                            out.push('$');
                        }
                        i += tag_len;
                    }
                }
                None => {
                    out.push(c);
                    i += 1;
                }
            },
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Length of a `$$` or `$tag$` opener; positional parameters like `$1` are not tags
fn dollar_tag(chars: &[char]) -> Option<usize> {
    let mut len = 1;
    while let Some(&c) = chars.get(len) {
        match c {
            '$' => return Some(len + 1),
            c if c == '_' || c.is_ascii_alphabetic() => len += 1,
            c if c.is_ascii_digit() && len > 1 => len += 1,
            _ => return None,
        }
    }
    None
}

fn structural(rule_id: &str, reason: impl Into<String>) -> PolicyViolation {
    PolicyViolation::new(
        rule_id,
        reason,
        AlertCategory::PolicyViolation,
        AlertSeverity::Medium,
    )
}
