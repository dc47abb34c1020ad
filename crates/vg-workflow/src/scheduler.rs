//! Timeout escalation scheduler.
//!
//! A periodic, idempotent sweep over pending requests whose current step has
//! timed out. Each timed-out request is claimed by a conditional write that
//! recomputes `timeout_at` — the recomputation is the lease, so concurrent
//! scheduler replicas cannot escalate the same timeout twice. Escalation
//! reassigns who is expected to act; it never bypasses quorum evaluation.
//! Reaching the configured ceiling expires the request outright, so nothing
//! can stay stuck forever.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vg_core::{
    ApprovalEvent, ApprovalRequest, Authorizer, EscalationLog, EscalationReason,
    EscalationStatus, EventBus, RequestGuard, RequestStatus, RequestStore, StoreError,
    WorkflowStep, WorkflowStore,
};

use crate::audit::AuditRecorder;
use crate::config::EngineConfig;
use crate::error::EngineError;

/// What the sweep did with one timed-out request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    /// Escalation log written and the timeout window extended.
    Escalated,
    /// Escalation ceiling reached; the request expired.
    Expired,
    /// Another replica claimed the request first.
    Skipped,
}

/// Counters from one sweep pass, for operator logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Timed-out requests the sweep examined.
    pub examined: usize,
    /// Requests escalated with a fresh timeout window.
    pub escalated: usize,
    /// Requests expired at the escalation ceiling.
    pub expired: usize,
    /// Requests claimed by a concurrent replica.
    pub skipped_conflicts: usize,
    /// Requests that hit a store failure; retried on the next tick.
    pub failed: usize,
}

/// Periodic escalation sweep over pending requests.
pub struct EscalationScheduler {
    requests: Arc<dyn RequestStore>,
    workflows: Arc<dyn WorkflowStore>,
    authorizer: Arc<dyn Authorizer>,
    audit: AuditRecorder,
    events: Arc<EventBus>,
    config: EngineConfig,
}

impl EscalationScheduler {
    /// Wires a scheduler over its collaborators.
    pub fn new(
        requests: Arc<dyn RequestStore>,
        workflows: Arc<dyn WorkflowStore>,
        authorizer: Arc<dyn Authorizer>,
        audit: AuditRecorder,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            requests,
            workflows,
            authorizer,
            audit,
            events,
            config,
        }
    }

    /// One sweep pass: escalates every pending request whose timeout has
    /// elapsed, expiring those at the ceiling.
    ///
    /// Store failures on individual targets are logged and left for the next
    /// tick; a timed-out request is never silently dropped.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let targets = match self.requests.list_timed_out(now).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "Sweep could not list timed-out requests; retrying next tick");
                report.failed += 1;
                return report;
            }
        };

        report.examined = targets.len();
        for request in targets {
            match self.escalate_timed_out(&request, now).await {
                Ok(SweepAction::Escalated) => report.escalated += 1,
                Ok(SweepAction::Expired) => report.expired += 1,
                Ok(SweepAction::Skipped) => report.skipped_conflicts += 1,
                Err(e) => {
                    warn!(
                        request_id = %request.id,
                        error = %e,
                        "Escalation failed; request stays timed out and retries next tick"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.escalated + report.expired > 0 {
            info!(
                examined = report.examined,
                escalated = report.escalated,
                expired = report.expired,
                skipped = report.skipped_conflicts,
                "Escalation sweep complete"
            );
        }

        report
    }

    /// Escalates one timed-out request, or expires it at the ceiling.
    async fn escalate_timed_out(
        &self,
        request: &ApprovalRequest,
        now: DateTime<Utc>,
    ) -> Result<SweepAction, EngineError> {
        let workflow = self
            .workflows
            .get(request.workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow", request.workflow_id))?;
        let step = workflow
            .step(request.current_step)
            .ok_or_else(|| EngineError::not_found("step", request.current_step))?;

        let level = self
            .audit
            .last_escalation_level(request.id, request.current_step)
            .await?
            + 1;

        // Claim the target before writing anything: the conditional write on
        // the observed row is the lease a concurrent replica loses.
        let guard = RequestGuard::from_observed(request);
        let expiring = level >= self.config.escalation_ceiling;

        let mut updated = request.clone();
        if expiring {
            updated.status = RequestStatus::Expired;
            updated.completed_at = Some(now);
        } else {
            updated.timeout_at = now + Duration::hours(step.timeout_hours);
        }

        match self.requests.update_if(request.id, &guard, &updated).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(request_id = %request.id, "Sweep target already claimed; skipping");
                return Ok(SweepAction::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        let escalated_from = self.previous_holder(request, step).await?;
        let escalated_to = self
            .authorizer
            .resolve_escalation_target(step, level)
            .await
            .unwrap_or_else(|| step.approver.to_string());

        let log = EscalationLog::new(
            request.id,
            request.current_step,
            Some(&escalated_from),
            &escalated_to,
            EscalationReason::Timeout,
            level,
        );
        self.audit.record_escalation(&log).await?;
        counter!("vg_escalations_total").increment(1);

        info!(
            request_id = %request.id,
            step = request.current_step,
            level,
            escalated_to = %escalated_to,
            expiring,
            "Step timeout escalated"
        );

        self.events
            .publish(ApprovalEvent::Escalated {
                request_id: request.id,
                step_order: request.current_step,
                level,
                escalated_to,
            })
            .await;

        if expiring {
            counter!("vg_requests_expired_total").increment(1);
            self.events
                .publish(ApprovalEvent::RequestExpired {
                    request_id: request.id,
                    step_order: request.current_step,
                })
                .await;
            return Ok(SweepAction::Expired);
        }

        Ok(SweepAction::Escalated)
    }

    /// Who held the outstanding approval before this escalation: the target
    /// of the previous escalation, or the step's own approver reference.
    async fn previous_holder(
        &self,
        request: &ApprovalRequest,
        step: &WorkflowStep,
    ) -> Result<String, EngineError> {
        let escalations = self.audit.escalations_for_request(request.id).await?;
        Ok(escalations
            .iter()
            .filter(|e| e.step_order == request.current_step)
            .max_by_key(|e| e.level)
            .map(|e| e.escalated_to.clone())
            .unwrap_or_else(|| step.approver.to_string()))
    }

    /// Raises a manual escalation without touching the timeout window.
    #[instrument(skip(self))]
    pub async fn manual_escalate(
        &self,
        request_id: Uuid,
        by: &str,
        to: &str,
    ) -> Result<EscalationLog, EngineError> {
        let request = self
            .requests
            .get(request_id)
            .await?
            .ok_or_else(|| EngineError::not_found("request", request_id))?;

        if request.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "request {} is already {}",
                request_id, request.status
            )));
        }

        let level = self
            .audit
            .last_escalation_level(request_id, request.current_step)
            .await?
            + 1;

        let log = EscalationLog::new(
            request_id,
            request.current_step,
            Some(by),
            to,
            EscalationReason::Manual,
            level,
        );
        self.audit.record_escalation(&log).await?;
        counter!("vg_escalations_total").increment(1);

        info!(
            request_id = %request_id,
            step = request.current_step,
            level,
            escalated_by = %by,
            escalated_to = %to,
            "Manual escalation raised"
        );

        self.events
            .publish(ApprovalEvent::Escalated {
                request_id,
                step_order: request.current_step,
                level,
                escalated_to: to.to_string(),
            })
            .await;

        Ok(log)
    }

    /// Acknowledges a pending escalation.
    #[instrument(skip(self))]
    pub async fn acknowledge(
        &self,
        escalation_id: Uuid,
        by: &str,
    ) -> Result<EscalationLog, EngineError> {
        self.transition_escalation(
            escalation_id,
            &[EscalationStatus::Pending],
            EscalationStatus::Acknowledged,
            by,
        )
        .await
    }

    /// Resolves a pending or acknowledged escalation.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        escalation_id: Uuid,
        by: &str,
    ) -> Result<EscalationLog, EngineError> {
        self.transition_escalation(
            escalation_id,
            &[EscalationStatus::Pending, EscalationStatus::Acknowledged],
            EscalationStatus::Resolved,
            by,
        )
        .await
    }

    async fn transition_escalation(
        &self,
        escalation_id: Uuid,
        allowed_from: &[EscalationStatus],
        to: EscalationStatus,
        by: &str,
    ) -> Result<EscalationLog, EngineError> {
        match self
            .audit
            .update_escalation_status(escalation_id, allowed_from, to, by, Utc::now())
            .await
        {
            Ok(log) => {
                debug!(escalation_id = %escalation_id, status = ?to, by = %by, "Escalation status updated");
                Ok(log)
            }
            Err(StoreError::Conflict(msg)) => Err(EngineError::InvalidTransition(msg)),
            Err(StoreError::NotFound { .. }) => {
                Err(EngineError::not_found("escalation", escalation_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vg_core::store::memory::{
        MemoryActionStore, MemoryEscalationStore, MemoryRequestStore, MemoryWorkflowStore,
    };
    use vg_core::{
        ApprovalType, ApproverRef, RoleDirectory, Workflow, WorkflowStep, WorkflowStore,
    };

    struct Harness {
        scheduler: EscalationScheduler,
        requests: Arc<MemoryRequestStore>,
        workflows: Arc<MemoryWorkflowStore>,
        audit: AuditRecorder,
        events: Arc<EventBus>,
    }

    async fn harness() -> Harness {
        let directory = Arc::new(RoleDirectory::new(vec![
            "manager".to_string(),
            "director".to_string(),
            "executive".to_string(),
        ]));
        directory.add_role_member("manager", "mallory").await;
        directory.add_role_member("director", "dana").await;
        directory.add_role_member("executive", "erin").await;

        let requests = Arc::new(MemoryRequestStore::new());
        let workflows = Arc::new(MemoryWorkflowStore::new());
        let audit = AuditRecorder::new(
            Arc::new(MemoryActionStore::new()),
            Arc::new(MemoryEscalationStore::new()),
        );
        let events = Arc::new(EventBus::new(64));

        let scheduler = EscalationScheduler::new(
            requests.clone(),
            workflows.clone(),
            directory.clone(),
            audit.clone(),
            events.clone(),
            EngineConfig::default(),
        );

        Harness {
            scheduler,
            requests,
            workflows,
            audit,
            events,
        }
    }

    async fn pending_request(h: &Harness) -> ApprovalRequest {
        let workflow = Workflow::new(
            "procurement",
            "award_contract",
            None,
            vec![WorkflowStep::new(
                1,
                "manager-review",
                ApproverRef::Role("manager".to_string()),
                ApprovalType::Single,
                24,
            )],
        )
        .unwrap();
        h.workflows.insert(&workflow).await.unwrap();

        let request =
            ApprovalRequest::new(&workflow, "alice", "po-9", serde_json::json!({"total": 500}));
        h.requests.insert(&request).await.unwrap();
        request
    }

    async fn force_timeout(h: &Harness, request_id: Uuid) {
        h.requests
            .backdate_timeout(request_id, Utc::now() - Duration::hours(1))
            .await;
    }

    #[tokio::test]
    async fn test_fresh_requests_not_swept() {
        let h = harness().await;
        pending_request(&h).await;

        let report = h.scheduler.sweep().await;
        assert_eq!(report.examined, 0);
        assert_eq!(report.escalated, 0);
    }

    #[tokio::test]
    async fn test_timed_out_request_escalates_and_extends_timeout() {
        let h = harness().await;
        let request = pending_request(&h).await;
        force_timeout(&h, request.id).await;

        let report = h.scheduler.sweep().await;
        assert_eq!(report.escalated, 1);
        assert_eq!(report.expired, 0);

        let escalations = h.audit.escalations_for_request(request.id).await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].level, 1);
        assert_eq!(escalations[0].reason, EscalationReason::Timeout);
        assert_eq!(escalations[0].status, EscalationStatus::Pending);
        // Manager step escalates one rank up the hierarchy.
        assert_eq!(escalations[0].escalated_to, "dana");
        assert_eq!(
            escalations[0].escalated_from.as_deref(),
            Some("role:manager")
        );

        // Grace extension: the request is pending again with a fresh window.
        let updated = h.requests.get(request.id).await.unwrap().unwrap();
        assert_eq!(updated.status, RequestStatus::Pending);
        assert_eq!(updated.current_step, 1);
        assert!(updated.timeout_at > Utc::now());

        let events = h.events.events_for_request(request.id).await;
        assert_eq!(events.last().unwrap().event_type(), "escalated");
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_between_timeouts() {
        let h = harness().await;
        let request = pending_request(&h).await;
        force_timeout(&h, request.id).await;

        h.scheduler.sweep().await;
        // The second sweep sees no timed-out requests: the extension already
        // happened and the same timeout event is never escalated twice.
        let report = h.scheduler.sweep().await;
        assert_eq!(report.examined, 0);

        let escalations = h.audit.escalations_for_request(request.id).await.unwrap();
        assert_eq!(escalations.len(), 1);
    }

    #[tokio::test]
    async fn test_levels_are_monotonic_and_expire_at_ceiling() {
        // Scenario C: three consecutive timeouts with ceiling 3 produce
        // levels 1 and 2 with grace extensions, then level 3 with expiry.
        let h = harness().await;
        let request = pending_request(&h).await;

        for expected_level in 1..=2 {
            force_timeout(&h, request.id).await;
            let report = h.scheduler.sweep().await;
            assert_eq!(report.escalated, 1);

            let escalations = h.audit.escalations_for_request(request.id).await.unwrap();
            assert_eq!(escalations.len(), expected_level as usize);
            assert_eq!(escalations.last().unwrap().level, expected_level);
        }

        force_timeout(&h, request.id).await;
        let report = h.scheduler.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.escalated, 0);

        let expired = h.requests.get(request.id).await.unwrap().unwrap();
        assert_eq!(expired.status, RequestStatus::Expired);
        assert!(expired.completed_at.is_some());

        let escalations = h.audit.escalations_for_request(request.id).await.unwrap();
        assert_eq!(escalations.len(), 3);
        assert_eq!(escalations.last().unwrap().level, 3);

        let events = h.events.events_for_request(request.id).await;
        assert_eq!(events.last().unwrap().event_type(), "request_expired");

        // Expired is absorbing: further sweeps never touch the request.
        let report = h.scheduler.sweep().await;
        assert_eq!(report.examined, 0);
        let after = h.requests.get(request.id).await.unwrap().unwrap();
        assert_eq!(after.status, RequestStatus::Expired);
        assert_eq!(
            h.audit
                .escalations_for_request(request.id)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_escalation_chain_walks_hierarchy() {
        let h = harness().await;
        let request = pending_request(&h).await;

        force_timeout(&h, request.id).await;
        h.scheduler.sweep().await;
        force_timeout(&h, request.id).await;
        h.scheduler.sweep().await;

        let escalations = h.audit.escalations_for_request(request.id).await.unwrap();
        assert_eq!(escalations[0].escalated_to, "dana");
        assert_eq!(escalations[1].escalated_to, "erin");
        // The second escalation took over from the first target.
        assert_eq!(escalations[1].escalated_from.as_deref(), Some("dana"));
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_escalate_once() {
        let h = harness().await;
        let request = pending_request(&h).await;
        force_timeout(&h, request.id).await;

        let (r1, r2) = tokio::join!(h.scheduler.sweep(), h.scheduler.sweep());

        // The lease lets exactly one pass claim the target.
        assert_eq!(r1.escalated + r2.escalated, 1);
        let escalations = h.audit.escalations_for_request(request.id).await.unwrap();
        assert_eq!(escalations.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_escalation_keeps_timeout() {
        let h = harness().await;
        let request = pending_request(&h).await;
        let before = h.requests.get(request.id).await.unwrap().unwrap();

        let log = h
            .scheduler
            .manual_escalate(request.id, "alice", "dana")
            .await
            .unwrap();

        assert_eq!(log.reason, EscalationReason::Manual);
        assert_eq!(log.level, 1);
        assert_eq!(log.escalated_from.as_deref(), Some("alice"));

        let after = h.requests.get(request.id).await.unwrap().unwrap();
        assert_eq!(after.timeout_at, before.timeout_at);
    }

    #[tokio::test]
    async fn test_manual_escalation_on_terminal_request_fails() {
        let h = harness().await;
        let request = pending_request(&h).await;

        let mut terminal = request.clone();
        terminal.status = RequestStatus::Cancelled;
        terminal.completed_at = Some(Utc::now());
        h.requests
            .update_if(request.id, &RequestGuard::from_observed(&request), &terminal)
            .await
            .unwrap();

        let result = h.scheduler.manual_escalate(request.id, "alice", "dana").await;
        assert!(matches!(result, Err(EngineError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_manual_escalation_levels_share_step_scope() {
        let h = harness().await;
        let request = pending_request(&h).await;

        force_timeout(&h, request.id).await;
        h.scheduler.sweep().await;

        // The manual escalation continues the same per-step level sequence.
        let log = h
            .scheduler
            .manual_escalate(request.id, "alice", "erin")
            .await
            .unwrap();
        assert_eq!(log.level, 2);
    }

    #[tokio::test]
    async fn test_acknowledge_and_resolve_lifecycle() {
        let h = harness().await;
        let request = pending_request(&h).await;
        let log = h
            .scheduler
            .manual_escalate(request.id, "alice", "dana")
            .await
            .unwrap();

        let acked = h.scheduler.acknowledge(log.id, "dana").await.unwrap();
        assert_eq!(acked.status, EscalationStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("dana"));
        assert!(acked.acknowledged_at.is_some());

        // Acknowledging twice is an invalid transition.
        let result = h.scheduler.acknowledge(log.id, "dana").await;
        assert!(matches!(result, Err(EngineError::InvalidTransition(_))));

        let resolved = h.scheduler.resolve(log.id, "dana").await.unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        // Resolving twice is an invalid transition.
        let result = h.scheduler.resolve(log.id, "dana").await;
        assert!(matches!(result, Err(EngineError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_resolve_straight_from_pending() {
        let h = harness().await;
        let request = pending_request(&h).await;
        let log = h
            .scheduler
            .manual_escalate(request.id, "alice", "dana")
            .await
            .unwrap();

        let resolved = h.scheduler.resolve(log.id, "erin").await.unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("erin"));
    }

    #[tokio::test]
    async fn test_unknown_escalation_not_found() {
        let h = harness().await;
        let result = h.scheduler.acknowledge(Uuid::new_v4(), "dana").await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_no_eligible_approver_step_escalates_to_fallback() {
        let h = harness().await;
        let workflow = Workflow::new(
            "procurement",
            "award_contract",
            Some("legal"),
            vec![WorkflowStep::new(
                1,
                "ghost-review",
                ApproverRef::Role("auditor".to_string()),
                ApprovalType::Single,
                24,
            )],
        )
        .unwrap();
        h.workflows.insert(&workflow).await.unwrap();

        let mut request =
            ApprovalRequest::new(&workflow, "alice", "po-11", serde_json::json!({"total": 1}));
        // The engine flags such requests as immediately timed out.
        request.timeout_at = request.created_at;
        h.requests.insert(&request).await.unwrap();
        force_timeout(&h, request.id).await;

        let report = h.scheduler.sweep().await;
        assert_eq!(report.escalated, 1);

        let escalations = h.audit.escalations_for_request(request.id).await.unwrap();
        // "auditor" is outside the hierarchy, so the walk starts at the
        // bottom and lands on the director rank.
        assert_eq!(escalations[0].escalated_to, "dana");
    }
}
