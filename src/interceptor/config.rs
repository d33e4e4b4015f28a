// SPDX-License-Identifier: Apache-2.0

//! Interceptor Configuration
//!
//! Thresholds, heuristic patterns and the sensitivity map. Loaded once at
//! startup from an optional JSON file plus environment overrides, then
//! frozen inside the interceptor.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::ConfigError;

pub const ENV_HARDENED_MODE: &str = "QOREGUARD_HARDENED_MODE";
pub const ENV_MAX_QUERY_LENGTH: &str = "QOREGUARD_MAX_QUERY_LENGTH";
pub const ENV_MAX_JOINS: &str = "QOREGUARD_MAX_JOINS";
pub const ENV_SLOW_QUERY_MS: &str = "QOREGUARD_SLOW_QUERY_MS";
pub const ENV_MAX_ROWS: &str = "QOREGUARD_MAX_ROWS";

/// Highest level a table can be assigned in the sensitivity map
pub const MAX_SENSITIVITY_LEVEL: u8 = 5;

/// A heuristic regular expression and the reason reported when it matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionPattern {
    /// Stable identifier, used as the rule id in audit records
    pub id: String,
    /// Regex, matched case-insensitively
    pub pattern: String,
    pub description: String,
}

impl InjectionPattern {
    fn new(id: &str, pattern: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            description: description.to_string(),
        }
    }
}

/// Built-in injection heuristics, evaluated in this order
pub fn default_injection_patterns() -> Vec<InjectionPattern> {
    vec![
        InjectionPattern::new(
            "injection-union",
            r"\bunion\s+(?:all\s+|distinct\s+)?select\b",
            "UNION-based injection",
        ),
        InjectionPattern::new(
            "injection-always-true",
            r#"\bor\s+(?:1\s*=\s*1\b|'1'\s*=\s*'1'|"1"\s*=\s*"1"|true\b|'[^']*'\s*=\s*'[^']*'\s*(?:--|$))"#,
            "Always-true boolean condition (OR 1=1)",
        ),
        InjectionPattern::new(
            "injection-stacked-destructive",
            r";\s*(?:drop|delete|truncate|alter|update|insert|create|grant|shutdown)\b",
            "Chained statement with destructive verb after ';'",
        ),
        InjectionPattern::new(
            "injection-time-based",
            r"\b(?:sleep|pg_sleep|benchmark)\s*\(|\bwaitfor\s+delay\b",
            "Time-based blind injection function",
        ),
        InjectionPattern::new(
            "injection-schema-probe",
            r"\binformation_schema\b|\bpg_catalog\b|\bpg_shadow\b|\bsysobjects\b|\bsys\.(?:tables|columns|objects)\b|\bmysql\.user\b|\bsqlite_master\b",
            "Schema metadata probing",
        ),
        InjectionPattern::new(
            "injection-comment-obfuscation",
            r"\w/\*.*?\*/\w|/\*!",
            "Inline comment obfuscation",
        ),
        InjectionPattern::new(
            "injection-dynamic-exec",
            r"\bexec(?:ute)?\s*\(|\bexec(?:ute)?\s+(?:immediate\b|sp_|xp_)|\bdeclare\s+@\w+|\bsp_executesql\b",
            "Dynamic EXECUTE/DECLARE construct",
        ),
        InjectionPattern::new(
            "injection-file-access",
            r"\bxp_cmdshell\b|\binto\s+(?:out|dump)file\b|\bload_file\s*\(|\bcopy\s+\S+\s+(?:from|to)\s+program\b",
            "File or command execution primitive",
        ),
    ]
}

/// Table sensitivity levels and sensitive column-name fragments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityConfig {
    /// Table name (lowercase, unqualified) -> level 0-5
    #[serde(default = "default_sensitive_tables")]
    pub tables: HashMap<String, u8>,
    /// Fragments that flag a query when present anywhere in its text
    #[serde(default = "default_column_fragments")]
    pub column_fragments: Vec<String>,
    /// Tables at or above this level flag a query
    #[serde(default = "default_sensitivity_threshold")]
    pub threshold: u8,
}

fn default_sensitive_tables() -> HashMap<String, u8> {
    [
        ("users", 4),
        ("students", 4),
        ("student_records", 5),
        ("grades", 4),
        ("parent_contacts", 4),
        ("medical_records", 5),
        ("payments", 5),
        ("billing", 5),
        ("api_keys", 5),
        ("sessions", 3),
        ("audit_logs", 3),
        ("enrollments", 2),
        ("orders", 2),
        ("courses", 1),
        ("lessons", 0),
    ]
    .into_iter()
    .map(|(name, level)| (name.to_string(), level))
    .collect()
}

fn default_column_fragments() -> Vec<String> {
    [
        "password",
        "passwd",
        "ssn",
        "social_security",
        "credit_card",
        "card_number",
        "cvv",
        "address",
        "phone",
        "email",
        "dob",
        "date_of_birth",
        "secret",
        "api_key",
        "access_token",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_sensitivity_threshold() -> u8 {
    4
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            tables: default_sensitive_tables(),
            column_fragments: default_column_fragments(),
            threshold: default_sensitivity_threshold(),
        }
    }
}

/// Configuration for the interceptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Queries longer than this many characters are rejected
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    /// Queries with more JOIN keywords than this are rejected
    #[serde(default = "default_max_joins")]
    pub max_joins: usize,
    /// Threshold for slow query detection (milliseconds)
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_ms: u64,
    /// Result sets larger than this raise an alert
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
    /// Reject schema changes from non-privileged principals
    #[serde(default = "default_true")]
    pub hardened_mode: bool,
    #[serde(default = "default_injection_patterns")]
    pub injection_patterns: Vec<InjectionPattern>,
    #[serde(default)]
    pub sensitivity: SensitivityConfig,
    /// Maximum number of slow query entries to retain
    #[serde(default = "default_max_slow_queries")]
    pub max_slow_queries: usize,
    /// Upper bound on one alert delivery
    #[serde(default = "default_alert_timeout_ms")]
    pub alert_timeout_ms: u64,
    /// Alerts in delivery at once; further alerts are dropped and counted
    #[serde(default = "default_max_pending_alerts")]
    pub max_pending_alerts: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_query_length() -> usize {
    8000
}

fn default_max_joins() -> usize {
    5
}

fn default_slow_query_ms() -> u64 {
    5000
}

fn default_max_rows() -> u64 {
    10000
}

fn default_max_slow_queries() -> usize {
    100
}

fn default_alert_timeout_ms() -> u64 {
    2000
}

fn default_max_pending_alerts() -> usize {
    64
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            max_query_length: default_max_query_length(),
            max_joins: default_max_joins(),
            slow_query_ms: default_slow_query_ms(),
            max_rows: default_max_rows(),
            hardened_mode: true,
            injection_patterns: default_injection_patterns(),
            sensitivity: SensitivityConfig::default(),
            max_slow_queries: default_max_slow_queries(),
            alert_timeout_ms: default_alert_timeout_ms(),
            max_pending_alerts: default_max_pending_alerts(),
        }
    }
}

impl InterceptorConfig {
    /// Loads configuration from a JSON file, then applies environment overrides.
    ///
    /// A missing file is not an error: defaults are used.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: InterceptorConfig = serde_json::from_str(&content)?;
            info!("Loaded interceptor configuration from {:?}", path);
            config
        } else {
            debug!("No interceptor config file found at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `QOREGUARD_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_HARDENED_MODE) {
            self.hardened_mode = parse_bool(ENV_HARDENED_MODE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_QUERY_LENGTH) {
            self.max_query_length = parse_number(ENV_MAX_QUERY_LENGTH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_JOINS) {
            self.max_joins = parse_number(ENV_MAX_JOINS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SLOW_QUERY_MS) {
            self.slow_query_ms = parse_number(ENV_SLOW_QUERY_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_ROWS) {
            self.max_rows = parse_number(ENV_MAX_ROWS, &raw)?;
        }
        Ok(())
    }

    /// Checks values that serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (table, level) in &self.sensitivity.tables {
            if *level > MAX_SENSITIVITY_LEVEL {
                return Err(ConfigError::InvalidSensitivityLevel {
                    table: table.clone(),
                    level: *level,
                });
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidOverride {
        key: key.to_string(),
        value: raw.to_string(),
    })
}
