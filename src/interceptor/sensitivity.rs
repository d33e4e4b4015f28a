// SPDX-License-Identifier: Apache-2.0

//! Sensitivity Classifier
//!
//! Flags successfully executed queries that touched confidential tables or
//! columns. Table names are pulled out with a regex over `FROM`, `JOIN`,
//! `UPDATE`, `INSERT INTO` and `DELETE FROM`; aliased tables, CTE names and
//! sub-selects are missed. Column fragments are matched anywhere in the
//! text, so they over-report rather than under-report.

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;

use super::config::SensitivityConfig;
use super::error::ConfigError;

const TABLE_REFERENCE: &str = r#"(?i)\b(?:from|join|update|insert\s+into|delete\s+from)\s+["`\[]?([A-Za-z_][\w$]*(?:["`\]]?\.["`\[]?[A-Za-z_][\w$]*)?)"#;

/// A sensitive table referenced by a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensitiveTable {
    pub name: String,
    pub level: u8,
}

/// Why a query was flagged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SensitiveAccess {
    pub tables: Vec<SensitiveTable>,
    /// Sensitive column-name fragments found in the text
    pub columns: Vec<String>,
}

impl SensitiveAccess {
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

#[derive(Debug)]
pub struct SensitivityClassifier {
    table_reference: Regex,
    tables: HashMap<String, u8>,
    column_fragments: Vec<String>,
    threshold: u8,
}

impl SensitivityClassifier {
    pub fn new(config: &SensitivityConfig) -> Result<Self, ConfigError> {
        let table_reference = Regex::new(TABLE_REFERENCE).map_err(|e| ConfigError::InvalidPattern {
            pattern: TABLE_REFERENCE.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            table_reference,
            tables: config
                .tables
                .iter()
                .map(|(name, level)| (name.to_ascii_lowercase(), *level))
                .collect(),
            column_fragments: config
                .column_fragments
                .iter()
                .map(|f| f.to_ascii_lowercase())
                .collect(),
            threshold: config.threshold,
        })
    }

    /// Table names referenced by the query, lowercased and unqualified,
    /// in order of first appearance
    pub fn extract_tables(&self, query: &str) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for caps in self.table_reference.captures_iter(query) {
            let Some(reference) = caps.get(1) else {
                continue;
            };
            let name = reference
                .as_str()
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
                .to_ascii_lowercase();
            if !name.is_empty() && !tables.contains(&name) {
                tables.push(name);
            }
        }
        tables
    }

    /// Returns `Some` when the query touched sensitive data
    pub fn classify(&self, query: &str) -> Option<SensitiveAccess> {
        let tables: Vec<SensitiveTable> = self
            .extract_tables(query)
            .into_iter()
            .filter_map(|name| {
                let level = *self.tables.get(&name)?;
                (level >= self.threshold).then_some(SensitiveTable { name, level })
            })
            .collect();

        let lowered = query.to_ascii_lowercase();
        let columns: Vec<String> = self
            .column_fragments
            .iter()
            .filter(|fragment| lowered.contains(fragment.as_str()))
            .cloned()
            .collect();

        if tables.is_empty() && columns.is_empty() {
            None
        } else {
            Some(SensitiveAccess { tables, columns })
        }
    }
}
