//! QueryDriver trait definition
//!
//! The narrow interface the interceptor needs from a database client:
//! run one statement with its bound parameters, and optionally abort a
//! statement that is already running.

use async_trait::async_trait;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{CancelSupport, QueryId, QueryResult, Value};

/// Core trait that every wrapped database client implements
///
/// The interceptor never talks to a connection pool directly. Application
/// code builds a driver, hands it to [`crate::QueryInterceptor::new`], and
/// from then on only the interceptor calls `execute`.
#[async_trait]
pub trait QueryDriver: Send + Sync {
    /// Returns the unique identifier for this driver (e.g., "postgres")
    fn driver_id(&self) -> &'static str;

    /// Executes one statement with its ordered parameters
    ///
    /// `query_id` identifies the statement for a later [`QueryDriver::cancel`].
    async fn execute(
        &self,
        query: &str,
        params: &[Value],
        query_id: QueryId,
    ) -> EngineResult<QueryResult>;

    /// Cancels a running statement
    async fn cancel(&self, _query_id: QueryId) -> EngineResult<()> {
        Err(EngineError::not_supported(
            "Query cancellation is not supported by this driver",
        ))
    }

    /// Whether `cancel` can actually abort a running statement
    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::None
    }
}
