// qore-guard - Query interception and security monitoring
// Core library

//! Wraps a database driver so that every statement is checked, tracked and
//! audited before and after it runs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use qore_guard::{
//!     AuditStore, InterceptorConfig, Principal, QueryDriver, QueryInterceptor, TracingNotifier, Value,
//! };
//!
//! # async fn demo(driver: Arc<dyn QueryDriver>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = InterceptorConfig::load(std::path::Path::new("interceptor.json"))?;
//! let interceptor = QueryInterceptor::new(
//!     driver,
//!     config,
//!     Arc::new(AuditStore::in_memory(1000)),
//!     Arc::new(TracingNotifier),
//! )?;
//!
//! let rows = interceptor
//!     .execute(
//!         "SELECT name FROM courses WHERE id = $1",
//!         vec![Value::Int(42)],
//!         &Principal::new("instructor-42"),
//!         "10.0.0.7",
//!     )
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod interceptor;
pub mod metrics;
pub mod observability;

pub use engine::{CancelSupport, EngineError, EngineResult, QueryDriver, QueryId, QueryResult, Value};
pub use interceptor::{
    ActiveQuery, Alert, AlertCategory, AlertNotifier, AlertSeverity, AuditEvent, AuditSink,
    AuditStore, InterceptError, InterceptorConfig, Principal, PrincipalStats, QueryExecutor,
    QueryInterceptor, QueryRequest, TracingNotifier,
};
pub use metrics::QueryMetricsSnapshot;
