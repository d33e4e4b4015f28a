//! Interceptor Types
//!
//! Type definitions shared by the policy engine, registry, statistics
//! tracker, sensitivity classifier and alert/audit funnels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::types::{QueryId, Value};

/// The authenticated actor issuing a query
///
/// Identity is established upstream; the interceptor only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    /// Allowed to run schema-mutating statements in hardened mode
    #[serde(default)]
    pub privileged: bool,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privileged: false,
        }
    }

    pub fn privileged(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privileged: true,
        }
    }
}

/// Query operation type for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryOperationType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Truncate,
    Grant,
    Revoke,
    Execute,
    #[default]
    Other,
}

impl QueryOperationType {
    /// Classifies by the first non-whitespace keyword
    pub fn classify(query: &str) -> Self {
        let first_word = query
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_start_matches('(')
            .to_ascii_uppercase();

        match first_word.as_str() {
            "SELECT" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CREATE" => Self::Create,
            "ALTER" => Self::Alter,
            "DROP" => Self::Drop,
            "TRUNCATE" => Self::Truncate,
            "GRANT" => Self::Grant,
            "REVOKE" => Self::Revoke,
            "EXEC" | "EXECUTE" | "CALL" => Self::Execute,
            _ => Self::Other,
        }
    }
}

/// Snapshot of an in-flight query
///
/// The registry owns the live entry; callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveQuery {
    pub id: QueryId,
    pub query: String,
    pub params: Vec<Value>,
    pub principal: String,
    pub origin: String,
    /// Optional hint about where in the application the query was issued
    #[serde(default)]
    pub call_site: Option<String>,
    pub operation_type: QueryOperationType,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
}

/// Per-principal query counts, split by statement family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCounts {
    pub read: u64,
    pub write: u64,
    pub delete: u64,
}

/// Cumulative activity for one principal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalStats {
    pub total_queries: u64,
    pub total_execution_time_ms: f64,
    pub rows_fetched: u64,
    pub queries: QueryCounts,
    /// Queries rejected by the policy engine
    #[serde(default)]
    pub blocked_queries: u64,
    /// Queries that reached the driver and failed there
    #[serde(default)]
    pub failed_queries: u64,
    pub last_activity: DateTime<Utc>,
}

impl PrincipalStats {
    pub fn new() -> Self {
        Self {
            total_queries: 0,
            total_execution_time_ms: 0.0,
            rows_fetched: 0,
            queries: QueryCounts::default(),
            blocked_queries: 0,
            failed_queries: 0,
            last_activity: Utc::now(),
        }
    }
}

impl Default for PrincipalStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A slow query entry for detailed analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQueryEntry {
    pub query_id: QueryId,
    pub timestamp: DateTime<Utc>,
    pub principal: String,
    /// Truncated query text
    pub query_preview: String,
    pub execution_time_ms: f64,
    #[serde(default)]
    pub row_count: Option<u64>,
}

/// Alert severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// What triggered an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertCategory {
    InjectionAttempt,
    SlowQuery,
    LargeResultSet,
    UnauthorizedSchemaChange,
    ManualTermination,
    /// Structural rejection (oversized, unqualified DELETE/UPDATE, ...)
    PolicyViolation,
}

/// A notification handed to the external alert collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub message: String,
    pub context: serde_json::Value,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only forensic record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub principal: String,
    pub action: String,
    pub details: serde_json::Value,
    pub origin: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        principal: impl Into<String>,
        action: impl Into<String>,
        details: serde_json::Value,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            action: action.into(),
            details,
            origin: origin.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Audit actions written by the interceptor
pub mod actions {
    pub const QUERY_BLOCKED: &str = "query_blocked";
    pub const QUERY_COMMENT_NOTE: &str = "query_comment_note";
    pub const SENSITIVE_DATA_ACCESS: &str = "sensitive_data_access";
    pub const QUERY_KILLED: &str = "query_killed";
    pub const STATISTICS_RESET: &str = "statistics_reset";
}

/// Returns at most `max` characters of `query`, with an ellipsis when cut.
pub(crate) fn preview(query: &str, max: usize) -> String {
    let mut preview = query.chars().take(max).collect::<String>();
    if query.chars().nth(max).is_some() {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_first_keyword() {
        assert_eq!(QueryOperationType::classify("  select 1"), QueryOperationType::Select);
        assert_eq!(
            QueryOperationType::classify("\n\tINSERT INTO t VALUES (1)"),
            QueryOperationType::Insert
        );
        assert_eq!(
            QueryOperationType::classify("Delete from t where id = 1"),
            QueryOperationType::Delete
        );
        assert_eq!(QueryOperationType::classify("WITH x AS (SELECT 1) SELECT * FROM x"), QueryOperationType::Other);
        assert_eq!(QueryOperationType::classify(""), QueryOperationType::Other);
    }

    #[test]
    fn severity_is_ordered() {
        assert!(AlertSeverity::Low < AlertSeverity::Medium);
        assert!(AlertSeverity::High < AlertSeverity::Critical);
    }

    #[test]
    fn category_serializes_kebab_case() {
        let json = serde_json::to_string(&AlertCategory::LargeResultSet).unwrap();
        assert_eq!(json, "\"large-result-set\"");
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("abc", 5), "abc");
        assert_eq!(preview("abcdef", 3), "abc...");
    }
}
