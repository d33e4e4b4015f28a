//! PostgreSQL Driver
//!
//! Implements the QueryDriver trait for PostgreSQL using SQLx.
//!
//! ## Cancellation
//!
//! Every statement runs on a connection acquired for its whole duration.
//! The backend PID of that connection is recorded against the `QueryId`
//! so that `cancel()` can issue `pg_cancel_backend` from a dedicated
//! connection kept outside the pool. The cancelled statement then fails
//! with SQLSTATE 57014, which is mapped to [`EngineError::Cancelled`].
//!
//! The PID map lock is held from lookup until the cancel has been sent,
//! and `execute` only releases its connection to the pool while holding
//! that same lock. A cancel can therefore never reach a backend that has
//! moved on to another caller's statement. It can still land after the
//! target statement finished but before its entry was removed; the server
//! ignores a cancel for an idle backend, so that case is a no-op.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, PgConnection, Row, TypeInfo};
use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::QueryDriver;
use crate::engine::types::{CancelSupport, ColumnInfo, QueryId, QueryResult, Row as QRow, Value};

/// SQLSTATE raised by the server for a statement cancelled on request
const QUERY_CANCELED: &str = "57014";

/// PostgreSQL driver implementation
pub struct PostgresDriver {
    pool: PgPool,
    /// Active queries (query_id -> backend_pid)
    active_queries: Mutex<HashMap<QueryId, i32>>,
    /// Opened on first cancel; never shared with the pool
    cancel_conn: Mutex<Option<PgConnection>>,
}

impl PostgresDriver {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            active_queries: Mutex::new(HashMap::new()),
            cancel_conn: Mutex::new(None),
        }
    }

    /// Opens a pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Ok(Self::new(pool))
    }

    fn bind_param<'q>(
        query: Query<'q, Postgres, PgArguments>,
        value: &Value,
    ) -> Query<'q, Postgres, PgArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Json(j) => query.bind(j.clone()),
            // Fallback for arrays
            Value::Array(_) => query.bind(Option::<String>::None),
        }
    }

    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    fn convert_row(pg_row: &PgRow) -> QRow {
        let values = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();
        QRow { values }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
            return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn map_error(err: sqlx::Error) -> EngineError {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(QUERY_CANCELED) {
                return EngineError::Cancelled;
            }
        }
        let msg = err.to_string();
        if msg.contains("syntax") {
            EngineError::syntax_error(msg)
        } else {
            EngineError::execution_error(msg)
        }
    }

    async fn run(
        &self,
        conn: &mut sqlx::PgConnection,
        query: &str,
        params: &[Value],
    ) -> EngineResult<QueryResult> {
        let mut statement = sqlx::query(query);
        for param in params {
            statement = Self::bind_param(statement, param);
        }

        if returns_rows(query) {
            let pg_rows: Vec<PgRow> = statement.fetch_all(conn).await.map_err(Self::map_error)?;
            if pg_rows.is_empty() {
                return Ok(QueryResult::empty());
            }
            let columns = Self::get_column_info(&pg_rows[0]);
            let rows = pg_rows.iter().map(Self::convert_row).collect();
            Ok(QueryResult::with_rows(columns, rows))
        } else {
            let done = statement.execute(conn).await.map_err(Self::map_error)?;
            Ok(QueryResult::with_affected_rows(done.rows_affected()))
        }
    }
}

#[async_trait]
impl QueryDriver for PostgresDriver {
    fn driver_id(&self) -> &'static str {
        "postgres"
    }

    async fn execute(
        &self,
        query: &str,
        params: &[Value],
        query_id: QueryId,
    ) -> EngineResult<QueryResult> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::map_error)?;
        self.active_queries.lock().await.insert(query_id, backend_pid);

        let result = self.run(&mut *conn, query, params).await;

        let mut active = self.active_queries.lock().await;
        active.remove(&query_id);
        drop(conn);
        drop(active);
        result
    }

    async fn cancel(&self, query_id: QueryId) -> EngineResult<()> {
        let active = self.active_queries.lock().await;
        let Some(&backend_pid) = active.get(&query_id) else {
            return Err(EngineError::execution_error("Query not found"));
        };

        let mut slot = self.cancel_conn.lock().await;
        if slot.is_none() {
            let conn = self
                .pool
                .connect_options()
                .connect()
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()))?;
            *slot = Some(conn);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(EngineError::internal("Cancel connection unavailable"));
        };

        let sent = sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(backend_pid)
            .execute(&mut *conn)
            .await;
        if let Err(e) = sent {
            // Reopen on the next cancel
            *slot = None;
            return Err(EngineError::execution_error(e.to_string()));
        }
        drop(active);

        debug!(%query_id, backend_pid, "Sent cancel request to backend");
        Ok(())
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }
}

/// Whether a statement produces a result set rather than an affected-row count.
fn returns_rows(query: &str) -> bool {
    let upper = query.trim_start().to_ascii_uppercase();
    let first_word = upper.split_whitespace().next().unwrap_or("");
    matches!(
        first_word,
        "SELECT" | "WITH" | "SHOW" | "VALUES" | "TABLE" | "EXPLAIN"
    ) || upper.contains(" RETURNING ")
}
