//! Lightweight in-memory counters for one interceptor instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct QueryMetrics {
    total: AtomicU64,
    blocked: AtomicU64,
    failed: AtomicU64,
    killed: AtomicU64,
    alerts_dropped: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a query that reached the driver
    pub fn record_query(&self, duration_ms: f64, success: bool) {
        let duration_ms = duration_ms.max(0.0) as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_total_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.duration_max_ms.fetch_max(duration_ms, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kill(&self) {
        self.killed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_dropped(&self) {
        self.alerts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueryMetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let duration_total = self.duration_total_ms.load(Ordering::Relaxed);
        let max_ms = self.duration_max_ms.load(Ordering::Relaxed);

        let avg_ms = if total > 0 {
            Some(duration_total as f64 / total as f64)
        } else {
            None
        };

        QueryMetricsSnapshot {
            total,
            blocked: self.blocked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            alerts_dropped: self.alerts_dropped.load(Ordering::Relaxed),
            avg_ms,
            max_ms: if max_ms > 0 { Some(max_ms) } else { None },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetricsSnapshot {
    /// Queries that reached the driver
    pub total: u64,
    pub blocked: u64,
    pub failed: u64,
    pub killed: u64,
    /// Alerts that were never delivered
    pub alerts_dropped: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_flow() {
        let metrics = QueryMetrics::new();
        assert!(metrics.snapshot().avg_ms.is_none());

        metrics.record_query(100.0, true);
        metrics.record_query(50.0, false);
        metrics.record_blocked();
        metrics.record_kill();
        metrics.record_alert_dropped();

        let s = metrics.snapshot();
        assert_eq!(s.total, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.blocked, 1);
        assert_eq!(s.killed, 1);
        assert_eq!(s.alerts_dropped, 1);
        assert_eq!(s.avg_ms, Some(75.0));
        assert_eq!(s.max_ms, Some(100));
    }
}
