//! Metrics collection for the approval engine.
//!
//! Registers descriptions for the counters the engine and scheduler emit
//! through the `metrics` facade, and aggregates approval KPIs for
//! dashboards.

use chrono::{DateTime, Duration, Utc};
use metrics::{describe_counter, describe_gauge, gauge};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Key performance indicators for the approval pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalKpis {
    /// Mean time from request creation to a terminal decision.
    pub mean_time_to_decision: Option<Duration>,
    /// Share of decided requests that were approved.
    pub approval_rate: f64,
    /// Share of decided requests that expired at the escalation ceiling.
    pub expiry_rate: f64,
    /// Escalation events per decided request.
    pub escalations_per_request: f64,
    /// Total requests observed.
    pub total_requests: u64,
    /// Decided requests by terminal status.
    pub decided_by_status: HashMap<String, u64>,
}

/// Timing data for one request.
#[derive(Debug, Clone)]
struct RequestTiming {
    created_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    terminal_status: Option<String>,
    escalations: u32,
}

/// Aggregates approval metrics across the engine's lifecycle events.
pub struct ApprovalMetrics {
    timings: Arc<RwLock<HashMap<Uuid, RequestTiming>>>,
}

impl ApprovalMetrics {
    /// Creates a collector and registers metric descriptions.
    pub fn new() -> Self {
        Self::register_metrics();
        Self {
            timings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn register_metrics() {
        describe_counter!(
            "vg_requests_created_total",
            "Total approval requests created"
        );
        describe_counter!(
            "vg_requests_approved_total",
            "Total approval requests approved"
        );
        describe_counter!(
            "vg_requests_rejected_total",
            "Total approval requests rejected"
        );
        describe_counter!(
            "vg_requests_cancelled_total",
            "Total approval requests cancelled"
        );
        describe_counter!(
            "vg_requests_expired_total",
            "Total approval requests expired at the escalation ceiling"
        );
        describe_counter!("vg_escalations_total", "Total escalation events raised");
        describe_counter!(
            "vg_cas_conflicts_total",
            "Total conditional writes that exhausted their retries"
        );
        describe_gauge!(
            "vg_requests_pending",
            "Approval requests currently awaiting sign-off"
        );
    }

    /// Records a created request.
    pub async fn record_created(&self, request_id: Uuid, created_at: DateTime<Utc>) {
        let mut timings = self.timings.write().await;
        timings.insert(
            request_id,
            RequestTiming {
                created_at,
                decided_at: None,
                terminal_status: None,
                escalations: 0,
            },
        );
        gauge!("vg_requests_pending").increment(1.0);
    }

    /// Records a terminal decision for a request.
    pub async fn record_decided(&self, request_id: Uuid, status: &str) {
        let mut timings = self.timings.write().await;
        if let Some(timing) = timings.get_mut(&request_id) {
            if timing.decided_at.is_none() {
                timing.decided_at = Some(Utc::now());
                timing.terminal_status = Some(status.to_string());
                gauge!("vg_requests_pending").decrement(1.0);
            }
        }
    }

    /// Records an escalation event for a request.
    pub async fn record_escalation(&self, request_id: Uuid) {
        let mut timings = self.timings.write().await;
        if let Some(timing) = timings.get_mut(&request_id) {
            timing.escalations += 1;
        }
    }

    /// Computes KPIs from the observed requests.
    pub async fn kpis(&self) -> ApprovalKpis {
        let timings = self.timings.read().await;

        let total_requests = timings.len() as u64;
        let decided: Vec<&RequestTiming> =
            timings.values().filter(|t| t.decided_at.is_some()).collect();

        let mut decided_by_status: HashMap<String, u64> = HashMap::new();
        for timing in &decided {
            if let Some(status) = &timing.terminal_status {
                *decided_by_status.entry(status.clone()).or_insert(0) += 1;
            }
        }

        let mean_time_to_decision = if decided.is_empty() {
            None
        } else {
            let total: Duration = decided
                .iter()
                .filter_map(|t| t.decided_at.map(|d| d - t.created_at))
                .fold(Duration::zero(), |acc, d| acc + d);
            Some(total / decided.len() as i32)
        };

        let decided_count = decided.len() as f64;
        let approval_rate = if decided.is_empty() {
            0.0
        } else {
            *decided_by_status.get("approved").unwrap_or(&0) as f64 / decided_count
        };
        let expiry_rate = if decided.is_empty() {
            0.0
        } else {
            *decided_by_status.get("expired").unwrap_or(&0) as f64 / decided_count
        };
        let escalations_per_request = if decided.is_empty() {
            0.0
        } else {
            decided.iter().map(|t| t.escalations as f64).sum::<f64>() / decided_count
        };

        ApprovalKpis {
            mean_time_to_decision,
            approval_rate,
            expiry_rate,
            escalations_per_request,
            total_requests,
            decided_by_status,
        }
    }

    /// Drops timing data older than the retention window.
    pub async fn prune(&self, max_age_hours: i64) {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let mut timings = self.timings.write().await;
        timings.retain(|_, t| t.created_at > cutoff || t.decided_at.is_none());
    }
}

impl Default for ApprovalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kpis_empty() {
        let metrics = ApprovalMetrics::new();
        let kpis = metrics.kpis().await;
        assert_eq!(kpis.total_requests, 0);
        assert!(kpis.mean_time_to_decision.is_none());
    }

    #[tokio::test]
    async fn test_approval_rate() {
        let metrics = ApprovalMetrics::new();

        for status in ["approved", "approved", "rejected", "expired"] {
            let id = Uuid::new_v4();
            metrics.record_created(id, Utc::now()).await;
            metrics.record_decided(id, status).await;
        }
        // One request still pending.
        metrics.record_created(Uuid::new_v4(), Utc::now()).await;

        let kpis = metrics.kpis().await;
        assert_eq!(kpis.total_requests, 5);
        assert!((kpis.approval_rate - 0.5).abs() < f64::EPSILON);
        assert!((kpis.expiry_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(kpis.decided_by_status.get("approved"), Some(&2));
    }

    #[tokio::test]
    async fn test_escalations_per_request() {
        let metrics = ApprovalMetrics::new();
        let id = Uuid::new_v4();
        metrics.record_created(id, Utc::now()).await;
        metrics.record_escalation(id).await;
        metrics.record_escalation(id).await;
        metrics.record_decided(id, "expired").await;

        let kpis = metrics.kpis().await;
        assert!((kpis.escalations_per_request - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_double_decision_counted_once() {
        let metrics = ApprovalMetrics::new();
        let id = Uuid::new_v4();
        metrics.record_created(id, Utc::now()).await;
        metrics.record_decided(id, "approved").await;
        metrics.record_decided(id, "rejected").await;

        let kpis = metrics.kpis().await;
        assert_eq!(kpis.decided_by_status.get("approved"), Some(&1));
        assert_eq!(kpis.decided_by_status.get("rejected"), None);
    }

    #[tokio::test]
    async fn test_prune_keeps_pending() {
        let metrics = ApprovalMetrics::new();
        let pending = Uuid::new_v4();
        let decided = Uuid::new_v4();

        metrics
            .record_created(pending, Utc::now() - Duration::hours(48))
            .await;
        metrics
            .record_created(decided, Utc::now() - Duration::hours(48))
            .await;
        metrics.record_decided(decided, "approved").await;

        metrics.prune(24).await;

        let kpis = metrics.kpis().await;
        // The old decided request was pruned; the pending one survives.
        assert_eq!(kpis.total_requests, 1);
    }
}
