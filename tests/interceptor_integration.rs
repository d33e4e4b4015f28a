//! End-to-end behaviour of the interceptor against a stub driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use qore_guard::engine::{ColumnInfo, Row};
use qore_guard::interceptor::policy::REASON_UNQUALIFIED_DELETE;
use qore_guard::interceptor::{actions, AlertError, AuditFilter, MANUAL_KILL_REASON};
use qore_guard::{
    Alert, AlertCategory, AlertNotifier, AlertSeverity, AuditStore, CancelSupport, EngineError,
    EngineResult, InterceptError, InterceptorConfig, Principal, QueryDriver, QueryExecutor, QueryId,
    QueryInterceptor, QueryRequest, QueryResult, Value,
};

// ==================== Test collaborators ====================

struct StubDriver {
    calls: AtomicUsize,
    cancels: AtomicUsize,
    rows: usize,
    delay: Duration,
    cancellable: bool,
    failure: Option<EngineError>,
    cancel_signal: Notify,
}

impl StubDriver {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            rows: 1,
            delay: Duration::ZERO,
            cancellable: false,
            failure: None,
            cancel_signal: Notify::new(),
        }
    }

    fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    fn failing(mut self, error: EngineError) -> Self {
        self.failure = Some(error);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn result(&self) -> QueryResult {
        let columns = vec![ColumnInfo {
            name: "id".to_string(),
            data_type: "int8".to_string(),
            nullable: false,
        }];
        let rows = (0..self.rows)
            .map(|i| Row {
                values: vec![Value::Int(i as i64)],
            })
            .collect();
        QueryResult::with_rows(columns, rows)
    }
}

#[async_trait]
impl QueryDriver for StubDriver {
    fn driver_id(&self) -> &'static str {
        "stub"
    }

    async fn execute(
        &self,
        _query: &str,
        _params: &[Value],
        _query_id: QueryId,
    ) -> EngineResult<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.cancellable {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.cancel_signal.notified() => return Err(EngineError::Cancelled),
            }
        } else if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(self.result()),
        }
    }

    async fn cancel(&self, _query_id: QueryId) -> EngineResult<()> {
        if !self.cancellable {
            return Err(EngineError::not_supported("no cancel"));
        }
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancel_signal.notify_one();
        Ok(())
    }

    fn cancel_support(&self) -> CancelSupport {
        if self.cancellable {
            CancelSupport::Driver
        } else {
            CancelSupport::None
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    fn count(&self, category: AlertCategory) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.category == category)
            .count()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

struct BrokenNotifier;

#[async_trait]
impl AlertNotifier for BrokenNotifier {
    async fn notify(&self, _alert: &Alert) -> Result<(), AlertError> {
        Err(AlertError::Delivery("pager offline".to_string()))
    }
}

struct HangingNotifier;

#[async_trait]
impl AlertNotifier for HangingNotifier {
    async fn notify(&self, _alert: &Alert) -> Result<(), AlertError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

struct Harness {
    interceptor: Arc<QueryInterceptor>,
    driver: Arc<StubDriver>,
    audit: Arc<AuditStore>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(driver: StubDriver) -> Self {
        Self::with_config(driver, InterceptorConfig::default())
    }

    fn with_config(driver: StubDriver, config: InterceptorConfig) -> Self {
        let driver = Arc::new(driver);
        let audit = Arc::new(AuditStore::in_memory(100));
        let notifier = Arc::new(RecordingNotifier::default());
        let interceptor = QueryInterceptor::new(
            driver.clone(),
            config,
            audit.clone(),
            notifier.clone(),
        )
        .unwrap();

        Self {
            interceptor: Arc::new(interceptor),
            driver,
            audit,
            notifier,
        }
    }

    async fn run(&self, query: &str, principal: &str) -> Result<QueryResult, InterceptError> {
        self.interceptor
            .execute(query, vec![], &Principal::new(principal), "10.0.0.7")
            .await
    }

    /// Alerts delivered so far, after waiting for pending deliveries
    async fn alerts(&self) -> Vec<Alert> {
        self.interceptor.flush_alerts().await;
        self.notifier.alerts()
    }

    async fn alert_count(&self, category: AlertCategory) -> usize {
        self.interceptor.flush_alerts().await;
        self.notifier.count(category)
    }

    fn audit_count(&self, action: &str) -> usize {
        self.audit.entries(&AuditFilter::action(action), 100, 0).len()
    }

    async fn wait_for_active(&self) -> QueryId {
        for _ in 0..200 {
            if let Some(active) = self.interceptor.list_active_queries().first() {
                return active.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("query never became active");
    }
}

// ==================== Policy enforcement ====================

#[tokio::test]
async fn always_true_injection_never_reaches_driver() {
    let h = Harness::new(StubDriver::new());

    let err = h
        .run("SELECT * FROM users WHERE id = 1 OR 1=1", "student-7")
        .await
        .unwrap_err();

    let violation = err.as_policy_violation().unwrap();
    assert!(violation.reason().contains("OR 1=1"));
    assert_eq!(violation.category(), AlertCategory::InjectionAttempt);
    assert_eq!(h.driver.calls(), 0);

    assert_eq!(h.audit_count(actions::QUERY_BLOCKED), 1);
    let alerts = h.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::High);
    assert_eq!(alerts[0].principal.as_deref(), Some("student-7"));
    assert!(h.interceptor.list_active_queries().is_empty());
}

#[tokio::test]
async fn caller_facing_message_hides_the_rule() {
    let h = Harness::new(StubDriver::new());
    let err = h
        .run("SELECT name FROM courses UNION SELECT password FROM users", "p")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Query rejected by security policy");
}

#[tokio::test]
async fn unqualified_delete_is_blocked_with_reason() {
    let h = Harness::new(StubDriver::new());

    let err = h.run("DELETE FROM orders", "clerk").await.unwrap_err();

    assert_eq!(
        err.as_policy_violation().map(|v| v.reason()),
        Some(REASON_UNQUALIFIED_DELETE)
    );
    assert_eq!(h.driver.calls(), 0);

    let blocked = h.audit.entries(&AuditFilter::action(actions::QUERY_BLOCKED), 10, 0);
    assert_eq!(blocked[0].details["reason"], REASON_UNQUALIFIED_DELETE);
    assert_eq!(h.alert_count(AlertCategory::PolicyViolation).await, 1);
}

#[tokio::test]
async fn where_outside_the_statement_does_not_qualify() {
    let h = Harness::new(StubDriver::new());

    for query in [
        "DELETE FROM orders -- where",
        "DELETE FROM orders /* where */",
        "UPDATE users SET note = 'where'",
        "UPDATE users SET role = (SELECT role FROM roles WHERE id = 1)",
        "UPDATE users u SET active = false",
        "UPDATE public.users AS u SET active = false",
    ] {
        let err = h.run(query, "clerk").await.unwrap_err();
        assert!(err.is_policy_violation(), "query: {query}");
    }

    assert_eq!(h.driver.calls(), 0);
    assert_eq!(h.audit_count(actions::QUERY_BLOCKED), 6);
    assert_eq!(h.alert_count(AlertCategory::PolicyViolation).await, 6);
}

#[tokio::test]
async fn schema_change_requires_privilege_in_hardened_mode() {
    let h = Harness::new(StubDriver::new());

    let err = h.run("DROP TABLE students", "clerk").await.unwrap_err();
    assert_eq!(
        err.as_policy_violation().map(|v| v.severity()),
        Some(AlertSeverity::Critical)
    );
    assert_eq!(h.driver.calls(), 0);

    h.interceptor
        .execute("DROP TABLE students", vec![], &Principal::privileged("dba"), "10.0.0.1")
        .await
        .unwrap();
    assert_eq!(h.driver.calls(), 1);
}

// ==================== Allowed path ====================

#[tokio::test]
async fn plain_select_is_allowed_and_counted_once() {
    let h = Harness::new(StubDriver::new());

    let result = h
        .run("SELECT name FROM courses LIMIT 10", "instructor-42")
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 1);
    assert!(result.execution_time_ms >= 0.0);
    assert!(h.alerts().await.is_empty());
    assert!(h.audit.is_empty());

    let stats = h.interceptor.statistics_for("instructor-42").unwrap();
    assert_eq!(stats.queries.read, 1);
    assert_eq!(stats.total_queries, 1);
    assert_eq!(stats.rows_fetched, 1);
    assert!(h.interceptor.list_active_queries().is_empty());
}

#[tokio::test]
async fn statistics_count_at_submission_regardless_of_outcome() {
    let h = Harness::new(StubDriver::new());

    h.run("SELECT title FROM courses", "p").await.unwrap();
    h.run("SELECT * FROM courses WHERE id = 1 OR 1=1", "p")
        .await
        .unwrap_err();
    h.run("select id from lessons where id = 2", "p").await.unwrap();
    h.run("DELETE FROM orders", "p").await.unwrap_err();
    h.run("UPDATE orders SET total = 0 WHERE id = 3", "p").await.unwrap();

    let stats = h.interceptor.statistics_for("p").unwrap();
    assert_eq!(stats.total_queries, 5);
    assert_eq!(stats.queries.read, 3);
    assert_eq!(stats.queries.write, 1);
    assert_eq!(stats.queries.delete, 1);
    assert_eq!(stats.blocked_queries, 2);
    assert_eq!(h.driver.calls(), 3);
}

#[tokio::test]
async fn sensitive_table_writes_exactly_one_audit_event() {
    let h = Harness::new(StubDriver::new().with_rows(3));

    h.run("SELECT id FROM users WHERE id = 1", "registrar").await.unwrap();

    let events = h
        .audit
        .entries(&AuditFilter::action(actions::SENSITIVE_DATA_ACCESS), 10, 0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].principal, "registrar");
    assert_eq!(events[0].details["tables"], serde_json::json!(["users"]));
    assert_eq!(events[0].details["row_count"], 3);
}

#[tokio::test]
async fn driver_errors_pass_through_unchanged() {
    let original = EngineError::execution_error("relation \"nope\" does not exist");
    let h = Harness::new(StubDriver::new().failing(original.clone()));

    let err = h.run("SELECT id FROM users WHERE id = 1", "p").await.unwrap_err();

    match err {
        InterceptError::Driver(inner) => assert_eq!(inner, original),
        other => panic!("expected driver error, got {other:?}"),
    }
    assert_eq!(h.driver.calls(), 1);
    assert!(h.interceptor.list_active_queries().is_empty());
    assert_eq!(h.audit_count(actions::SENSITIVE_DATA_ACCESS), 0);
    assert_eq!(h.interceptor.statistics_for("p").unwrap().failed_queries, 1);
}

// ==================== Thresholds ====================

#[tokio::test]
async fn very_slow_query_raises_one_alert() {
    let config = InterceptorConfig {
        slow_query_ms: 20,
        ..InterceptorConfig::default()
    };
    let h = Harness::with_config(
        StubDriver::new().with_delay(Duration::from_millis(60)),
        config,
    );

    h.run("SELECT title FROM courses", "p").await.unwrap();

    let alerts = h.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].category, AlertCategory::SlowQuery);
    assert_eq!(alerts[0].severity, AlertSeverity::Medium);

    let slow = h.interceptor.slow_queries(10, 0);
    assert_eq!(slow.len(), 1);
    assert!(slow[0].execution_time_ms > 40.0);
}

#[tokio::test]
async fn large_result_raises_one_alert() {
    let config = InterceptorConfig {
        max_rows: 5,
        ..InterceptorConfig::default()
    };
    let h = Harness::with_config(StubDriver::new().with_rows(6), config);

    h.run("SELECT title FROM courses", "p").await.unwrap();

    assert_eq!(h.alert_count(AlertCategory::LargeResultSet).await, 1);
    assert_eq!(h.alerts().await.len(), 1);
    assert_eq!(h.interceptor.statistics_for("p").unwrap().rows_fetched, 6);
}

#[tokio::test]
async fn alerting_outage_does_not_break_queries() {
    let config = InterceptorConfig {
        max_rows: 0,
        ..InterceptorConfig::default()
    };
    let driver = Arc::new(StubDriver::new());
    let interceptor = QueryInterceptor::new(
        driver.clone(),
        config,
        Arc::new(AuditStore::in_memory(10)),
        Arc::new(BrokenNotifier),
    )
    .unwrap();
    let principal = Principal::new("p");

    let result = interceptor
        .execute("SELECT title FROM courses", vec![], &principal, "o")
        .await;
    assert!(result.is_ok());

    let blocked = interceptor
        .execute("DELETE FROM orders", vec![], &principal, "o")
        .await;
    assert!(blocked.unwrap_err().is_policy_violation());

    interceptor.flush_alerts().await;
    assert_eq!(interceptor.metrics().alerts_dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn hung_alert_collaborator_adds_no_latency() {
    let config = InterceptorConfig {
        max_rows: 0,
        ..InterceptorConfig::default()
    };
    let driver = Arc::new(StubDriver::new());
    let interceptor = QueryInterceptor::new(
        driver.clone(),
        config,
        Arc::new(AuditStore::in_memory(10)),
        Arc::new(HangingNotifier),
    )
    .unwrap();
    let principal = Principal::new("p");

    // Paused clock: any wait on the collaborator would advance time
    let started = tokio::time::Instant::now();
    let blocked = interceptor
        .execute("DELETE FROM orders", vec![], &principal, "o")
        .await;
    let large = interceptor
        .execute("SELECT title FROM courses", vec![], &principal, "o")
        .await;
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(blocked.unwrap_err().is_policy_violation());
    assert!(large.is_ok());

    interceptor.flush_alerts().await;
    assert!(started.elapsed() >= Duration::from_millis(interceptor.config().alert_timeout_ms));
    assert_eq!(interceptor.metrics().alerts_dropped, 2);
}

// ==================== Administration ====================

#[tokio::test]
async fn killing_unknown_query_has_no_side_effects() {
    let h = Harness::new(StubDriver::new());

    let killed = h
        .interceptor
        .kill_query(QueryId::new(), &Principal::privileged("admin"), "10.0.0.1")
        .await;

    assert!(!killed);
    assert!(h.audit.is_empty());
    assert!(h.alerts().await.is_empty());
    assert_eq!(h.interceptor.metrics().killed, 0);
}

#[tokio::test]
async fn kill_signals_cancellable_driver() {
    let h = Harness::new(
        StubDriver::new()
            .cancellable()
            .with_delay(Duration::from_secs(30)),
    );

    let interceptor = h.interceptor.clone();
    let running = tokio::spawn(async move {
        let executor: &dyn QueryExecutor = interceptor.as_ref();
        executor
            .execute_request(
                QueryRequest::new("SELECT title FROM courses", vec![], Principal::new("p"), "o")
                    .with_call_site("reports::export"),
            )
            .await
    });

    let id = h.wait_for_active().await;
    let active = h.interceptor.list_active_queries();
    assert_eq!(active[0].call_site.as_deref(), Some("reports::export"));

    assert!(
        h.interceptor
            .kill_query(id, &Principal::privileged("admin"), "10.0.0.1")
            .await
    );
    assert!(h.interceptor.list_active_queries().is_empty());

    let outcome = running.await.unwrap();
    assert!(matches!(outcome, Err(InterceptError::Terminated { query_id }) if query_id == id));
    assert_eq!(h.driver.cancels(), 1);

    let killed = h.audit.entries(&AuditFilter::action(actions::QUERY_KILLED), 10, 0);
    assert_eq!(killed.len(), 1);
    assert_eq!(killed[0].principal, "admin");
    assert_eq!(killed[0].details["reason"], MANUAL_KILL_REASON);
    assert_eq!(h.alert_count(AlertCategory::ManualTermination).await, 1);
}

#[tokio::test]
async fn kill_without_driver_cancellation_is_bookkeeping_only() {
    let h = Harness::new(StubDriver::new().with_delay(Duration::from_millis(150)));

    let interceptor = h.interceptor.clone();
    let running = tokio::spawn(async move {
        interceptor
            .execute("SELECT title FROM courses", vec![], &Principal::new("p"), "o")
            .await
    });

    let id = h.wait_for_active().await;
    assert!(
        h.interceptor
            .kill_query(id, &Principal::privileged("admin"), "10.0.0.1")
            .await
    );
    assert!(h.interceptor.list_active_queries().is_empty());

    let outcome = running.await.unwrap();
    assert!(matches!(outcome, Err(InterceptError::Terminated { .. })));
    assert_eq!(h.driver.cancels(), 0);
    assert_eq!(h.driver.calls(), 1);
    assert_eq!(h.audit_count(actions::QUERY_KILLED), 1);
    assert_eq!(h.alert_count(AlertCategory::ManualTermination).await, 1);
}

#[tokio::test]
async fn reset_clears_statistics() {
    let h = Harness::new(StubDriver::new());
    h.run("SELECT title FROM courses", "a").await.unwrap();
    h.run("SELECT title FROM courses", "b").await.unwrap();

    let names: Vec<String> = h
        .interceptor
        .principal_statistics()
        .into_iter()
        .map(|(principal, _)| principal)
        .collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

    h.interceptor
        .reset_statistics(&Principal::privileged("admin"), "10.0.0.1");

    assert!(h.interceptor.principal_statistics().is_empty());
    assert_eq!(h.audit_count(actions::STATISTICS_RESET), 1);
}

#[tokio::test]
async fn concurrent_queries_are_all_accounted() {
    let h = Harness::new(StubDriver::new().with_delay(Duration::from_millis(10)));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let interceptor = h.interceptor.clone();
            tokio::spawn(async move {
                interceptor
                    .execute(
                        "SELECT title FROM courses WHERE id = $1",
                        vec![Value::Int(i)],
                        &Principal::new(format!("p{}", i % 4)),
                        "o",
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let total: u64 = h
        .interceptor
        .principal_statistics()
        .iter()
        .map(|(_, stats)| stats.queries.read)
        .sum();
    assert_eq!(total, 16);
    assert!(h.interceptor.list_active_queries().is_empty());
    assert_eq!(h.interceptor.metrics().total, 16);
}
