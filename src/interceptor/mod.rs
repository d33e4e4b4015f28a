//! Query Interceptor
//!
//! Every query passes through here before it reaches the database:
//! - **Policy Engine**: ordered rules that reject dangerous text outright
//! - **Active Query Registry**: what is running now, and manual termination
//! - **Statistics Tracker**: per-principal counters and the slow query log
//! - **Sensitivity Classifier**: audit of access to confidential tables/columns
//! - **Alert Dispatcher**: one funnel to the external alerting collaborator
//!
//! [`QueryInterceptor`] owns all of them; there is no process-global state.

pub mod alerts;
pub mod audit;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod sensitivity;
pub mod statistics;
pub mod types;

pub use alerts::{AlertDispatcher, AlertNotifier, AlertRequest, TracingNotifier};
pub use audit::{AuditFilter, AuditSink, AuditStats, AuditStore};
pub use config::{InjectionPattern, InterceptorConfig, SensitivityConfig};
pub use error::{AlertError, AuditError, ConfigError, InterceptError, PolicyViolation};
pub use pipeline::{QueryExecutor, QueryInterceptor, QueryRequest};
pub use policy::{PolicyEngine, PolicyVerdict};
pub use registry::{ActiveQueryGuard, ActiveQueryRegistry, NewActiveQuery, MANUAL_KILL_REASON};
pub use sensitivity::{SensitiveAccess, SensitiveTable, SensitivityClassifier};
pub use statistics::{StatisticsTracker, ThresholdFlags};
pub use types::*;
