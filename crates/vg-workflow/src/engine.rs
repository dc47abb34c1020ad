//! Approval request engine.
//!
//! Owns the request state machine: `Pending -> {Approved, Rejected,
//! Expired, Cancelled}`, with the four right-hand states absorbing. The
//! engine is stateless over its stores; every transition is serialized
//! through a compare-and-swap on the observed request row, so any number of
//! worker processes can call it concurrently.

use chrono::{Duration, Utc};
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vg_core::{
    ActionType, ApprovalAction, ApprovalEvent, ApprovalRequest, Authorizer, EventBus,
    RequestGuard, RequestStatus, RequestStore, StoreError, Workflow, WorkflowStep, WorkflowStore,
};

use crate::audit::{AuditRecorder, RequestSummary};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::evaluator::{evaluate, StepOutcome};

/// Returns true for blobs the engine refuses to snapshot: null, empty
/// object/array/string.
fn is_empty_resource(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// The approval request state machine.
pub struct ApprovalRequestEngine {
    requests: Arc<dyn RequestStore>,
    workflows: Arc<dyn WorkflowStore>,
    authorizer: Arc<dyn Authorizer>,
    audit: AuditRecorder,
    events: Arc<EventBus>,
    config: EngineConfig,
}

impl ApprovalRequestEngine {
    /// Wires an engine over its collaborators.
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

    /// The audit recorder this engine writes through.
    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    /// Creates a pending request bound to `workflow` and a resource snapshot.
    ///
    /// Fails `Validation` when `resource_data` is empty; the engine never
    /// interprets the blob beyond that.
    #[instrument(skip(self, workflow, resource_data), fields(workflow_id = %workflow.id))]
    pub async fn create(
        &self,
        workflow: &Workflow,
        requester: &str,
        resource_id: &str,
        resource_data: Value,
    ) -> Result<ApprovalRequest, EngineError> {
        if is_empty_resource(&resource_data) {
            return Err(EngineError::Validation(
                "resource_data must not be empty".to_string(),
            ));
        }

        let mut request = ApprovalRequest::new(workflow, requester, resource_id, resource_data);

        // A step nobody can act on would deadlock; route it straight into
        // the escalation sweep by treating it as already timed out.
        if let Some(step) = workflow.step(1) {
            if self.authorizer.eligible_approvers(&step.approver).await.is_empty() {
                warn!(
                    request_id = %request.id,
                    step = step.order,
                    approver = %step.approver,
                    "Entry step has no eligible approvers; flagging for immediate escalation"
                );
                request.timeout_at = request.created_at;
            }
        }

        self.requests.insert(&request).await?;
        counter!("vg_requests_created_total").increment(1);

        info!(
            request_id = %request.id,
            requester = %requester,
            resource_id = %resource_id,
            timeout_at = %request.timeout_at,
            "Approval request created"
        );

        self.events
            .publish(ApprovalEvent::RequestCreated {
                request_id: request.id,
                workflow_id: workflow.id,
                requester: requester.to_string(),
            })
            .await;

        Ok(request)
    }

    /// Fetches a request by id.
    pub async fn get(&self, request_id: Uuid) -> Result<ApprovalRequest, EngineError> {
        self.requests
            .get(request_id)
            .await?
            .ok_or_else(|| EngineError::not_found("request", request_id))
    }

    /// Read-side summary for a request.
    pub async fn summary(&self, request_id: Uuid) -> Result<RequestSummary, EngineError> {
        let request = self.get(request_id).await?;
        Ok(self.audit.summary(&request, Utc::now()).await?)
    }

    /// Records an approver's action on the request's current step and applies
    /// the quorum outcome.
    ///
    /// Failure modes, in order: `InvalidTransition` on a terminal request,
    /// `StepMismatch` when `step_order` is not the current step, `Forbidden`
    /// for an ineligible approver, `DuplicateAction` on a repeated decisive
    /// action. A caller that loses the compare-and-swap race re-evaluates
    /// from fresh state; if the step was decided underneath it, the fresh
    /// request is returned as observed.
    #[instrument(skip(self, comment), fields(request_id = %request_id))]
    pub async fn record_action(
        &self,
        request_id: Uuid,
        step_order: u32,
        approver: &str,
        action_type: ActionType,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, EngineError> {
        let request = self.get(request_id).await?;

        if request.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "request {} is already {}",
                request_id, request.status
            )));
        }
        if step_order != request.current_step {
            return Err(EngineError::StepMismatch {
                expected: request.current_step,
                got: step_order,
            });
        }

        let workflow = self
            .workflows
            .get(request.workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow", request.workflow_id))?;
        let step = workflow
            .step(step_order)
            .ok_or_else(|| EngineError::not_found("step", step_order))?;

        if !self.authorizer.is_eligible(&step.approver, approver).await {
            return Err(EngineError::Forbidden {
                approver: approver.to_string(),
                step: step_order,
            });
        }

        let action = ApprovalAction::new(request_id, step_order, approver, action_type, comment);
        match self.audit.record_action(&action).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Err(EngineError::DuplicateAction {
                    approver: approver.to_string(),
                    step: step_order,
                })
            }
            Err(e) => return Err(e.into()),
        }

        debug!(
            approver = %approver,
            action_type = %action_type,
            step = step_order,
            "Action recorded"
        );

        if !action_type.is_decisive() {
            // Comments and delegations never change the step outcome.
            return Ok(request);
        }

        self.apply_step_outcome(request_id, step_order, &workflow, step)
            .await
    }

    /// Evaluates the step and applies the outcome under compare-and-swap,
    /// retrying from fresh state a bounded number of times.
    async fn apply_step_outcome(
        &self,
        request_id: Uuid,
        step_order: u32,
        workflow: &Workflow,
        step: &WorkflowStep,
    ) -> Result<ApprovalRequest, EngineError> {
        for attempt in 0..=self.config.max_cas_retries {
            let fresh = self.get(request_id).await?;

            // Someone else already decided or advanced the step; our action
            // is on record, so return the observed state.
            if fresh.is_terminal() || fresh.current_step != step_order {
                return Ok(fresh);
            }

            let actions = self.audit.actions_for_step(request_id, step_order).await?;
            let eligible = self.authorizer.eligible_approvers(&step.approver).await;

            let updated = match evaluate(step, &actions, &eligible) {
                StepOutcome::Pending => return Ok(fresh),
                StepOutcome::Reject => self.rejected_state(&fresh, &actions),
                StepOutcome::Advance => self.advanced_state(&fresh, workflow).await,
            };

            let guard = RequestGuard::from_observed(&fresh);
            match self.requests.update_if(request_id, &guard, &updated).await {
                Ok(()) => {
                    self.publish_outcome(&fresh, &updated, &actions).await;
                    return Ok(updated);
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(
                        request_id = %request_id,
                        attempt,
                        "Lost compare-and-swap race, re-evaluating"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        counter!("vg_cas_conflicts_total").increment(1);
        Err(EngineError::Conflict(request_id.to_string()))
    }

    /// Terminal rejected state derived from the earliest rejection on record.
    fn rejected_state(
        &self,
        fresh: &ApprovalRequest,
        actions: &[ApprovalAction],
    ) -> ApprovalRequest {
        let first_reject = actions
            .iter()
            .filter(|a| a.action_type == ActionType::Reject)
            .min_by_key(|a| a.created_at);

        let mut updated = fresh.clone();
        updated.status = RequestStatus::Rejected;
        updated.completed_at = Some(Utc::now());
        updated.rejection_reason = first_reject.and_then(|a| a.comment.clone());
        updated
    }

    /// State after an approved step: next step armed, or terminal approval.
    async fn advanced_state(
        &self,
        fresh: &ApprovalRequest,
        workflow: &Workflow,
    ) -> ApprovalRequest {
        let mut updated = fresh.clone();
        let now = Utc::now();

        if workflow.is_last_step(fresh.current_step) {
            updated.status = RequestStatus::Approved;
            updated.completed_at = Some(now);
            return updated;
        }

        let next_order = fresh.current_step + 1;
        updated.current_step = next_order;

        // The escalation level is derived per (request, step), so moving to
        // a new step resets it implicitly.
        if let Some(next_step) = workflow.step(next_order) {
            updated.timeout_at = now + Duration::hours(next_step.timeout_hours);
            if self
                .authorizer
                .eligible_approvers(&next_step.approver)
                .await
                .is_empty()
            {
                warn!(
                    request_id = %fresh.id,
                    step = next_order,
                    approver = %next_step.approver,
                    "Next step has no eligible approvers; flagging for immediate escalation"
                );
                updated.timeout_at = now;
            }
        }

        updated
    }

    /// Emits the event matching a committed transition.
    async fn publish_outcome(
        &self,
        before: &ApprovalRequest,
        after: &ApprovalRequest,
        actions: &[ApprovalAction],
    ) {
        match after.status {
            RequestStatus::Approved => {
                counter!("vg_requests_approved_total").increment(1);
                info!(request_id = %after.id, "Request approved");
                self.events
                    .publish(ApprovalEvent::RequestApproved {
                        request_id: after.id,
                    })
                    .await;
            }
            RequestStatus::Rejected => {
                counter!("vg_requests_rejected_total").increment(1);
                let rejected_by = actions
                    .iter()
                    .filter(|a| a.action_type == ActionType::Reject)
                    .min_by_key(|a| a.created_at)
                    .map(|a| a.approver.clone())
                    .unwrap_or_default();
                info!(
                    request_id = %after.id,
                    step = before.current_step,
                    rejected_by = %rejected_by,
                    "Request rejected"
                );
                self.events
                    .publish(ApprovalEvent::RequestRejected {
                        request_id: after.id,
                        step_order: before.current_step,
                        rejected_by,
                        reason: after.rejection_reason.clone(),
                    })
                    .await;
            }
            RequestStatus::Pending => {
                info!(
                    request_id = %after.id,
                    from_step = before.current_step,
                    to_step = after.current_step,
                    timeout_at = %after.timeout_at,
                    "Step advanced"
                );
                self.events
                    .publish(ApprovalEvent::StepAdvanced {
                        request_id: after.id,
                        from_step: before.current_step,
                        to_step: after.current_step,
                    })
                    .await;
            }
            // Cancel and expire transitions are published by their own paths.
            RequestStatus::Cancelled | RequestStatus::Expired => {}
        }
    }

    /// Cancels a pending request. Uses the same compare-and-swap discipline
    /// as `record_action`; terminal requests fail `InvalidTransition`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, request_id: Uuid, by: &str) -> Result<ApprovalRequest, EngineError> {
        for _attempt in 0..=self.config.max_cas_retries {
            let fresh = self.get(request_id).await?;

            if fresh.is_terminal() {
                return Err(EngineError::InvalidTransition(format!(
                    "request {} is already {}",
                    request_id, fresh.status
                )));
            }

            let mut updated = fresh.clone();
            updated.status = RequestStatus::Cancelled;
            updated.completed_at = Some(Utc::now());

            let guard = RequestGuard::from_observed(&fresh);
            match self.requests.update_if(request_id, &guard, &updated).await {
                Ok(()) => {
                    counter!("vg_requests_cancelled_total").increment(1);
                    info!(request_id = %request_id, cancelled_by = %by, "Request cancelled");
                    self.events
                        .publish(ApprovalEvent::RequestCancelled {
                            request_id,
                            cancelled_by: by.to_string(),
                        })
                        .await;
                    return Ok(updated);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Conflict(request_id.to_string()))
    }
}
