// SPDX-License-Identifier: Apache-2.0

//! Statistics Tracker
//!
//! Per-principal counters plus a bounded log of slow queries. Counters only
//! grow until an explicit reset.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::types::{preview, PrincipalStats, QueryOperationType, SlowQueryEntry};
use crate::engine::types::QueryId;

/// Characters of query text kept in a slow query entry
const SLOW_QUERY_PREVIEW_CHARS: usize = 200;

/// Thresholds a completed query crossed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdFlags {
    /// Above `slow_query_ms`
    pub slow: bool,
    /// Above twice `slow_query_ms`
    pub very_slow: bool,
    /// Above `max_rows`
    pub large_result: bool,
}

/// A finished query as seen by the tracker
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub query_id: QueryId,
    pub principal: &'a str,
    pub query: &'a str,
    pub execution_time_ms: f64,
    pub row_count: Option<u64>,
    pub success: bool,
}

/// Per-principal statistics store
pub struct StatisticsTracker {
    stats: Mutex<HashMap<String, PrincipalStats>>,
    slow_queries: Mutex<VecDeque<SlowQueryEntry>>,
    slow_query_ms: u64,
    max_rows: u64,
    max_slow_queries: usize,
}

impl StatisticsTracker {
    pub fn new(slow_query_ms: u64, max_rows: u64, max_slow_queries: usize) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            slow_queries: Mutex::new(VecDeque::with_capacity(max_slow_queries)),
            slow_query_ms,
            max_rows,
            max_slow_queries,
        }
    }

    /// Counts a submitted query, before the policy engine sees it
    pub fn record_submission(&self, principal: &str, operation: QueryOperationType) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(principal.to_string()).or_default();

        entry.total_queries += 1;
        match operation {
            QueryOperationType::Select => entry.queries.read += 1,
            QueryOperationType::Insert | QueryOperationType::Update => entry.queries.write += 1,
            QueryOperationType::Delete => entry.queries.delete += 1,
            _ => {}
        }
        entry.last_activity = Utc::now();
    }

    /// Counts a query the policy engine rejected
    pub fn record_blocked(&self, principal: &str) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(principal.to_string()).or_default();
        entry.blocked_queries += 1;
        entry.last_activity = Utc::now();
    }

    /// Adds execution time and rows, and reports which thresholds were crossed
    pub fn record_completion(&self, completion: Completion<'_>) -> ThresholdFlags {
        {
            let mut stats = self.stats.lock();
            let entry = stats.entry(completion.principal.to_string()).or_default();

            entry.total_execution_time_ms += completion.execution_time_ms.max(0.0);
            if let Some(rows) = completion.row_count {
                entry.rows_fetched += rows;
            }
            if !completion.success {
                entry.failed_queries += 1;
            }
            entry.last_activity = Utc::now();
        }

        let threshold = self.slow_query_ms as f64;
        let flags = ThresholdFlags {
            slow: completion.execution_time_ms > threshold,
            very_slow: completion.execution_time_ms > threshold * 2.0,
            large_result: completion.row_count.is_some_and(|rows| rows > self.max_rows),
        };

        if flags.slow {
            self.record_slow_query(&completion);
        }

        flags
    }

    fn record_slow_query(&self, completion: &Completion<'_>) {
        if self.max_slow_queries == 0 {
            return;
        }

        let entry = SlowQueryEntry {
            query_id: completion.query_id,
            timestamp: Utc::now(),
            principal: completion.principal.to_string(),
            query_preview: preview(completion.query, SLOW_QUERY_PREVIEW_CHARS),
            execution_time_ms: completion.execution_time_ms,
            row_count: completion.row_count,
        };

        let mut slow_queries = self.slow_queries.lock();
        if slow_queries.len() >= self.max_slow_queries {
            slow_queries.pop_front();
        }
        slow_queries.push_back(entry);

        debug!("Recorded slow query: {}ms", completion.execution_time_ms);
    }

    /// Copy of every principal's statistics, sorted by principal
    pub fn snapshot(&self) -> Vec<(String, PrincipalStats)> {
        let mut all: Vec<(String, PrincipalStats)> = self
            .stats
            .lock()
            .iter()
            .map(|(principal, stats)| (principal.clone(), stats.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn get(&self, principal: &str) -> Option<PrincipalStats> {
        self.stats.lock().get(principal).cloned()
    }

    /// Slow query entries, most recent first
    pub fn slow_queries(&self, limit: usize, offset: usize) -> Vec<SlowQueryEntry> {
        self.slow_queries
            .lock()
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Clears every counter and the slow query log
    pub fn reset(&self) {
        self.stats.lock().clear();
        self.slow_queries.lock().clear();
        info!("Query statistics reset");
    }
}
