// SPDX-License-Identifier: Apache-2.0

//! Active Query Registry
//!
//! Tracks queries between submission and completion. Every critical
//! section is a single map operation; the lock is never held while a
//! query runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::types::{ActiveQuery, QueryOperationType};
use crate::engine::types::{QueryId, Value};

/// Reason recorded on an entry terminated through `kill_query`
pub const MANUAL_KILL_REASON: &str = "manually killed by administrator";

/// What a caller submits
#[derive(Debug, Clone)]
pub struct NewActiveQuery {
    pub query: String,
    pub params: Vec<Value>,
    pub principal: String,
    pub origin: String,
    pub call_site: Option<String>,
}

struct Entry {
    query: ActiveQuery,
    killed: Arc<AtomicBool>,
}

/// Concurrency-safe map of in-flight queries
#[derive(Default)]
pub struct ActiveQueryRegistry {
    entries: Mutex<HashMap<QueryId, Entry>>,
}

impl ActiveQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a query under a fresh id
    ///
    /// The returned guard removes the entry when dropped, whichever way the
    /// caller leaves its scope.
    pub fn insert(&self, new: NewActiveQuery) -> ActiveQueryGuard<'_> {
        let id = QueryId::new();
        let killed = Arc::new(AtomicBool::new(false));
        let query = ActiveQuery {
            id,
            operation_type: QueryOperationType::classify(&new.query),
            query: new.query,
            params: new.params,
            principal: new.principal,
            origin: new.origin,
            call_site: new.call_site,
            started_at: Utc::now(),
            blocked: false,
            block_reason: None,
        };

        self.entries.lock().insert(
            id,
            Entry {
                query,
                killed: Arc::clone(&killed),
            },
        );
        debug!(query_id = %id, "Registered active query");

        ActiveQueryGuard {
            registry: self,
            id,
            killed,
        }
    }

    /// Removes an entry; absent ids are ignored
    pub fn remove(&self, id: QueryId) -> Option<ActiveQuery> {
        self.entries.lock().remove(&id).map(|entry| entry.query)
    }

    /// Copy of every in-flight query, oldest first
    pub fn list(&self) -> Vec<ActiveQuery> {
        let mut queries: Vec<ActiveQuery> = self
            .entries
            .lock()
            .values()
            .map(|entry| entry.query.clone())
            .collect();
        queries.sort_by_key(|q| q.started_at);
        queries
    }

    pub fn get(&self, id: QueryId) -> Option<ActiveQuery> {
        self.entries.lock().get(&id).map(|entry| entry.query.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Marks an entry as killed and takes it out of the registry
    ///
    /// Returns the final snapshot, or `None` if the id is unknown.
    pub fn terminate(&self, id: QueryId, reason: &str) -> Option<ActiveQuery> {
        let mut entry = self.entries.lock().remove(&id)?;
        entry.killed.store(true, Ordering::SeqCst);
        entry.query.blocked = true;
        entry.query.block_reason = Some(reason.to_string());
        Some(entry.query)
    }
}

/// Scoped registration of one in-flight query
pub struct ActiveQueryGuard<'a> {
    registry: &'a ActiveQueryRegistry,
    id: QueryId,
    killed: Arc<AtomicBool>,
}

impl ActiveQueryGuard<'_> {
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Whether an administrator terminated this query
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveQueryGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
