// SPDX-License-Identifier: Apache-2.0

//! Interceptor error types
//!
//! A rejected query, a failed query and a terminated query are kept apart
//! and never converted into one another.

use thiserror::Error;

use crate::engine::error::EngineError;
use crate::engine::types::QueryId;
use crate::interceptor::types::{AlertCategory, AlertSeverity};

/// Generic message shown to untrusted callers for any rejected query
pub const POLICY_REJECTED: &str = "Query rejected by security policy";

/// A query the policy engine refused to execute
///
/// The `Display` text never includes the reason. Operators read it from
/// the audit trail and alerts, or through [`PolicyViolation::reason`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Query rejected by security policy")]
pub struct PolicyViolation {
    rule_id: String,
    reason: String,
    category: AlertCategory,
    severity: AlertSeverity,
}

impl PolicyViolation {
    pub fn new(
        rule_id: impl Into<String>,
        reason: impl Into<String>,
        category: AlertCategory,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            reason: reason.into(),
            category,
            severity,
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn category(&self) -> AlertCategory {
        self.category
    }

    pub fn severity(&self) -> AlertSeverity {
        self.severity
    }
}

/// Everything `QueryInterceptor::execute` can fail with
#[derive(Debug, Error)]
pub enum InterceptError {
    /// Never executed
    #[error(transparent)]
    PolicyViolation(PolicyViolation),

    /// Executed and failed at the data layer, passed through unchanged
    #[error(transparent)]
    Driver(#[from] EngineError),

    /// Killed mid-flight on a driver with cooperative cancellation
    #[error("Query {query_id} was terminated by an administrator")]
    Terminated { query_id: QueryId },
}

impl InterceptError {
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation(_))
    }

    /// The violation, if this is one
    pub fn as_policy_violation(&self) -> Option<&PolicyViolation> {
        match self {
            Self::PolicyViolation(violation) => Some(violation),
            _ => None,
        }
    }
}

impl From<PolicyViolation> for InterceptError {
    fn from(violation: PolicyViolation) -> Self {
        Self::PolicyViolation(violation)
    }
}

/// Startup configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid regex pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid sensitivity level {level} for table '{table}' (expected 0-5)")]
    InvalidSensitivityLevel { table: String, level: u8 },

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
}

/// Failure of the external audit sink
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Failure of the external alert collaborator
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Alert delivery failed: {0}")]
    Delivery(String),

    #[error("Alert delivery timed out after {0}ms")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_violation_display_hides_reason() {
        let violation = PolicyViolation::new(
            "injection-always-true",
            "Always-true boolean condition (OR 1=1)",
            AlertCategory::InjectionAttempt,
            AlertSeverity::High,
        );
        let err = InterceptError::from(violation);
        assert_eq!(err.to_string(), POLICY_REJECTED);
        assert!(!err.to_string().contains("1=1"));
        assert_eq!(
            err.as_policy_violation().map(|v| v.reason()),
            Some("Always-true boolean condition (OR 1=1)")
        );
    }

    #[test]
    fn driver_errors_pass_through_unchanged() {
        let original = EngineError::execution_error("relation \"nope\" does not exist");
        let err = InterceptError::from(original.clone());
        assert_eq!(err.to_string(), original.to_string());
        assert!(matches!(err, InterceptError::Driver(ref inner) if *inner == original));
        assert!(!err.is_policy_violation());
    }
}
