// SPDX-License-Identifier: Apache-2.0

//! Alert Dispatcher
//!
//! Single funnel for alerts. Each alert is handed to a background task and
//! the caller moves on at once. Delivery is bounded by a timeout, and at most
//! `max_pending` alerts are in delivery at a time. An alert that is not
//! delivered is logged and counted, never surfaced to the query caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use super::error::AlertError;
use super::types::{Alert, AlertCategory, AlertSeverity};
use crate::metrics::QueryMetrics;

/// External alert collaborator (pager, chat webhook, SIEM, ...)
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the tracing pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl AlertNotifier for TracingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        let principal = alert.principal.as_deref().unwrap_or("-");
        let origin = alert.origin.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Low | AlertSeverity::Medium => warn!(
                severity = ?alert.severity,
                category = ?alert.category,
                principal,
                origin,
                context = %alert.context,
                "{}",
                alert.message
            ),
            AlertSeverity::High | AlertSeverity::Critical => error!(
                severity = ?alert.severity,
                category = ?alert.category,
                principal,
                origin,
                context = %alert.context,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Fields of an alert before it is stamped and sent
#[derive(Debug, Clone)]
pub struct AlertRequest<'a> {
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub message: String,
    pub context: serde_json::Value,
    pub principal: Option<&'a str>,
    pub origin: Option<&'a str>,
}

pub struct AlertDispatcher {
    notifier: Arc<dyn AlertNotifier>,
    timeout: Duration,
    slots: Arc<Semaphore>,
    max_pending: u32,
    metrics: Arc<QueryMetrics>,
}

impl AlertDispatcher {
    pub fn new(
        notifier: Arc<dyn AlertNotifier>,
        timeout_ms: u64,
        max_pending: usize,
        metrics: Arc<QueryMetrics>,
    ) -> Self {
        let max_pending = u32::try_from(max_pending.max(1)).unwrap_or(u32::MAX);
        Self {
            notifier,
            timeout: Duration::from_millis(timeout_ms),
            slots: Arc::new(Semaphore::new(max_pending as usize)),
            max_pending,
            metrics,
        }
    }

    /// Queues one alert for delivery without waiting on the collaborator
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, request: AlertRequest<'_>) {
        let alert = Alert {
            severity: request.severity,
            category: request.category,
            message: request.message,
            context: request.context,
            principal: request.principal.map(str::to_string),
            origin: request.origin.map(str::to_string),
            timestamp: Utc::now(),
        };

        let Ok(slot) = self.slots.clone().try_acquire_owned() else {
            warn!(
                category = ?alert.category,
                severity = ?alert.severity,
                "Alert backlog full; alert dropped"
            );
            self.metrics.record_alert_dropped();
            return;
        };

        let notifier = self.notifier.clone();
        let metrics = self.metrics.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, notifier.notify(&alert)).await {
                Ok(result) => result,
                Err(_) => Err(AlertError::Timeout(timeout.as_millis() as u64)),
            };

            if let Err(e) = outcome {
                error!(
                    category = ?alert.category,
                    severity = ?alert.severity,
                    "Failed to deliver alert: {}",
                    e
                );
                metrics.record_alert_dropped();
            }
            drop(slot);
        });
    }

    /// Waits until every alert handed to [`dispatch`](Self::dispatch) so far
    /// has been delivered or abandoned
    pub async fn flush(&self) {
        if let Ok(all) = self.slots.acquire_many(self.max_pending).await {
            drop(all);
        }
    }
}
