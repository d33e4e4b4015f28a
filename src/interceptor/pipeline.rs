// SPDX-License-Identifier: Apache-2.0

//! Interceptor Pipeline
//!
//! Orchestrates every query:
//! 1. Submission: statistics, then the policy engine
//! 2. Blocked: audit, alert, reject; the driver is never called
//! 3. Allowed: register, execute, measure, unregister
//! 4. Completion: statistics, sensitivity audit, threshold alerts

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::alerts::{AlertDispatcher, AlertNotifier, AlertRequest};
use super::audit::AuditSink;
use super::config::InterceptorConfig;
use super::error::{ConfigError, InterceptError, PolicyViolation};
use super::policy::{PolicyEngine, PolicyVerdict};
use super::registry::{ActiveQueryRegistry, NewActiveQuery, MANUAL_KILL_REASON};
use super::sensitivity::SensitivityClassifier;
use super::statistics::{Completion, StatisticsTracker, ThresholdFlags};
use super::types::{
    actions, preview, ActiveQuery, AlertCategory, AlertSeverity, AuditEvent, Principal,
    PrincipalStats, QueryOperationType, SlowQueryEntry,
};
use crate::engine::traits::QueryDriver;
use crate::engine::types::{CancelSupport, QueryId, QueryResult, Value};
use crate::metrics::{QueryMetrics, QueryMetricsSnapshot};
use crate::observability::ParamSummary;

/// Characters of query text copied into audit details and alert context
const CONTEXT_PREVIEW_CHARS: usize = 200;

/// One query as submitted by application code
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub params: Vec<Value>,
    pub principal: Principal,
    pub origin: String,
    /// Where in the application the query was issued
    pub call_site: Option<String>,
}

impl QueryRequest {
    pub fn new(
        query: impl Into<String>,
        params: Vec<Value>,
        principal: Principal,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            params,
            principal,
            origin: origin.into(),
            call_site: None,
        }
    }

    pub fn with_call_site(mut self, call_site: impl Into<String>) -> Self {
        self.call_site = Some(call_site.into());
        self
    }
}

/// Query execution as seen by call sites
///
/// Application code depends on this trait rather than on a concrete
/// interceptor, so the raw driver is never in reach.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute_request(&self, request: QueryRequest) -> Result<QueryResult, InterceptError>;
}

/// The sole entry point for query execution
pub struct QueryInterceptor {
    driver: Arc<dyn QueryDriver>,
    config: InterceptorConfig,
    policy: PolicyEngine,
    registry: ActiveQueryRegistry,
    stats: StatisticsTracker,
    sensitivity: SensitivityClassifier,
    alerts: AlertDispatcher,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<QueryMetrics>,
}

impl QueryInterceptor {
    /// Builds the interceptor; configuration is fixed from here on
    pub fn new(
        driver: Arc<dyn QueryDriver>,
        config: InterceptorConfig,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let policy = PolicyEngine::from_config(&config)?;
        let sensitivity = SensitivityClassifier::new(&config.sensitivity)?;
        let stats = StatisticsTracker::new(
            config.slow_query_ms,
            config.max_rows,
            config.max_slow_queries,
        );
        let metrics = Arc::new(QueryMetrics::new());
        let alerts = AlertDispatcher::new(
            notifier,
            config.alert_timeout_ms,
            config.max_pending_alerts,
            metrics.clone(),
        );

        info!(
            driver = driver.driver_id(),
            hardened = config.hardened_mode,
            "Query interceptor initialized"
        );

        Ok(Self {
            driver,
            config,
            policy,
            registry: ActiveQueryRegistry::new(),
            stats,
            sensitivity,
            alerts,
            audit,
            metrics,
        })
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    /// Executes a query on behalf of `principal`
    pub async fn execute(
        &self,
        query: &str,
        params: Vec<Value>,
        principal: &Principal,
        origin: &str,
    ) -> Result<QueryResult, InterceptError> {
        self.execute_request(QueryRequest::new(query, params, principal.clone(), origin))
            .await
    }

    #[instrument(
        skip(self, request),
        fields(
            principal = %request.principal.id,
            origin = %request.origin,
            params = %ParamSummary(&request.params),
            call_site = ?request.call_site
        )
    )]
    pub async fn execute_request(
        &self,
        request: QueryRequest,
    ) -> Result<QueryResult, InterceptError> {
        let QueryRequest {
            query,
            params,
            principal,
            origin,
            call_site,
        } = request;

        self.stats
            .record_submission(&principal.id, QueryOperationType::classify(&query));

        let audit_note = match self.policy.evaluate(&query, &principal) {
            PolicyVerdict::Allow { audit_note } => audit_note,
            PolicyVerdict::Block(violation) => {
                self.reject(&query, &principal, &origin, &violation);
                return Err(violation.into());
            }
        };

        if let Some(note) = audit_note {
            self.write_audit(AuditEvent::new(
                &principal.id,
                actions::QUERY_COMMENT_NOTE,
                json!({
                    "note": note,
                    "query_preview": preview(&query, CONTEXT_PREVIEW_CHARS),
                }),
                &origin,
            ));
        }

        let guard = self.registry.insert(NewActiveQuery {
            query: query.clone(),
            params: params.clone(),
            principal: principal.id.clone(),
            origin: origin.clone(),
            call_site,
        });
        let query_id = guard.id();

        let start = Instant::now();
        let outcome = self.driver.execute(&query, &params, query_id).await;
        let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        let was_killed = guard.was_killed();
        drop(guard);

        let row_count = outcome.as_ref().ok().and_then(QueryResult::row_count);
        let flags = self.stats.record_completion(Completion {
            query_id,
            principal: &principal.id,
            query: &query,
            execution_time_ms,
            row_count,
            success: outcome.is_ok(),
        });
        self.metrics.record_query(execution_time_ms, outcome.is_ok());

        if flags.slow {
            info!(
                query_id = %query_id,
                execution_time_ms,
                threshold_ms = self.config.slow_query_ms,
                "Slow query"
            );
        }

        if was_killed {
            if self.driver.cancel_support() == CancelSupport::None {
                warn!(
                    query_id = %query_id,
                    "Killed query ran to completion on a driver without cancellation; result discarded"
                );
            }
            return Err(InterceptError::Terminated { query_id });
        }

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(query_id = %query_id, "Query failed: {}", e);
                return Err(e.into());
            }
        };
        result.execution_time_ms = execution_time_ms;

        if let Some(access) = self.sensitivity.classify(&query) {
            self.write_audit(AuditEvent::new(
                &principal.id,
                actions::SENSITIVE_DATA_ACCESS,
                json!({
                    "query_id": query_id,
                    "tables": access.table_names(),
                    "levels": access.tables,
                    "columns": access.columns,
                    "row_count": row_count,
                }),
                &origin,
            ));
        }

        self.raise_threshold_alerts(
            flags,
            query_id,
            &query,
            execution_time_ms,
            row_count,
            &principal,
            &origin,
        );

        debug!(query_id = %query_id, execution_time_ms, "Query completed");
        Ok(result)
    }

    fn reject(
        &self,
        query: &str,
        principal: &Principal,
        origin: &str,
        violation: &PolicyViolation,
    ) {
        self.stats.record_blocked(&principal.id);
        self.metrics.record_blocked();

        warn!(
            rule = violation.rule_id(),
            reason = violation.reason(),
            "Query blocked by policy"
        );

        let query_preview = preview(query, CONTEXT_PREVIEW_CHARS);
        self.write_audit(AuditEvent::new(
            &principal.id,
            actions::QUERY_BLOCKED,
            json!({
                "rule": violation.rule_id(),
                "reason": violation.reason(),
                "query_preview": query_preview,
            }),
            origin,
        ));

        self.alerts.dispatch(AlertRequest {
            severity: violation.severity(),
            category: violation.category(),
            message: format!("Query blocked: {}", violation.reason()),
            context: json!({
                "rule": violation.rule_id(),
                "query_preview": query_preview,
            }),
            principal: Some(principal.id.as_str()),
            origin: Some(origin),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn raise_threshold_alerts(
        &self,
        flags: ThresholdFlags,
        query_id: QueryId,
        query: &str,
        execution_time_ms: f64,
        row_count: Option<u64>,
        principal: &Principal,
        origin: &str,
    ) {
        if flags.very_slow {
            self.alerts.dispatch(AlertRequest {
                severity: AlertSeverity::Medium,
                category: AlertCategory::SlowQuery,
                message: format!("Very slow query: {:.0}ms", execution_time_ms),
                context: json!({
                    "query_id": query_id,
                    "execution_time_ms": execution_time_ms,
                    "threshold_ms": self.config.slow_query_ms,
                    "query_preview": preview(query, CONTEXT_PREVIEW_CHARS),
                }),
                principal: Some(principal.id.as_str()),
                origin: Some(origin),
            });
        }

        if flags.large_result {
            self.alerts.dispatch(AlertRequest {
                severity: AlertSeverity::Medium,
                category: AlertCategory::LargeResultSet,
                message: format!("Large result set: {} rows", row_count.unwrap_or_default()),
                context: json!({
                    "query_id": query_id,
                    "row_count": row_count,
                    "max_rows": self.config.max_rows,
                    "query_preview": preview(query, CONTEXT_PREVIEW_CHARS),
                }),
                principal: Some(principal.id.as_str()),
                origin: Some(origin),
            });
        }
    }

    /// Copies of the queries currently executing
    pub fn list_active_queries(&self) -> Vec<ActiveQuery> {
        self.registry.list()
    }

    /// Every principal's statistics, sorted by principal
    pub fn principal_statistics(&self) -> Vec<(String, PrincipalStats)> {
        self.stats.snapshot()
    }

    pub fn statistics_for(&self, principal: &str) -> Option<PrincipalStats> {
        self.stats.get(principal)
    }

    /// Slow query log, most recent first
    pub fn slow_queries(&self, limit: usize, offset: usize) -> Vec<SlowQueryEntry> {
        self.stats.slow_queries(limit, offset)
    }

    pub fn metrics(&self) -> QueryMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Waits for alerts already raised to be delivered or abandoned
    pub async fn flush_alerts(&self) {
        self.alerts.flush().await;
    }

    /// Clears all statistics; audited as an administrative action
    #[instrument(skip(self, reset_by), fields(reset_by = %reset_by.id))]
    pub fn reset_statistics(&self, reset_by: &Principal, origin: &str) {
        let principals = self.stats.snapshot().len();
        self.stats.reset();
        self.write_audit(AuditEvent::new(
            &reset_by.id,
            actions::STATISTICS_RESET,
            json!({ "principals_cleared": principals }),
            origin,
        ));
    }

    /// Terminates an in-flight query
    ///
    /// Returns `false`, with no side effects, when `query_id` is not running.
    /// The driver is only signalled when it supports cooperative cancellation.
    #[instrument(skip(self, killed_by), fields(query_id = %query_id, killed_by = %killed_by.id))]
    pub async fn kill_query(&self, query_id: QueryId, killed_by: &Principal, origin: &str) -> bool {
        let Some(killed) = self.registry.terminate(query_id, MANUAL_KILL_REASON) else {
            debug!("Kill requested for unknown query");
            return false;
        };

        let cancel_support = self.driver.cancel_support();
        if cancel_support == CancelSupport::Driver {
            if let Err(e) = self.driver.cancel(query_id).await {
                warn!("Driver failed to cancel query: {}", e);
            }
        } else {
            warn!("Driver cannot cancel running queries; termination is bookkeeping only");
        }
        self.metrics.record_kill();

        let query_preview = preview(&killed.query, CONTEXT_PREVIEW_CHARS);
        self.write_audit(AuditEvent::new(
            &killed_by.id,
            actions::QUERY_KILLED,
            json!({
                "query_id": query_id,
                "query_principal": killed.principal,
                "query_origin": killed.origin,
                "reason": MANUAL_KILL_REASON,
                "cancel_support": cancel_support,
                "query_preview": query_preview,
            }),
            origin,
        ));

        self.alerts.dispatch(AlertRequest {
            severity: AlertSeverity::Medium,
            category: AlertCategory::ManualTermination,
            message: format!("Query {} killed by {}", query_id, killed_by.id),
            context: json!({
                "query_id": query_id,
                "query_principal": killed.principal,
                "query_preview": query_preview,
            }),
            principal: Some(killed_by.id.as_str()),
            origin: Some(origin),
        });

        info!("Query killed");
        true
    }

    fn write_audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event) {
            error!(action = %event.action, "Failed to write audit event: {}", e);
        }
    }
}

#[async_trait]
impl QueryExecutor for QueryInterceptor {
    async fn execute_request(&self, request: QueryRequest) -> Result<QueryResult, InterceptError> {
        QueryInterceptor::execute_request(self, request).await
    }
}
