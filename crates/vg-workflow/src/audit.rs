//! Audit trail over the action and escalation stores.
//!
//! The recorder is the engine's only write path for actions and escalation
//! logs, and the read path for the per-request trail. Both stores are
//! append-only; everything here besides the two append methods is a
//! projection computed at read time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use vg_core::{
    ActionStore, ApprovalAction, ApprovalRequest, EscalationLog, EscalationStore, StoreError,
};

/// One entry in a request's merged, chronological audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntry {
    Action(ApprovalAction),
    Escalation(EscalationLog),
}

impl AuditEntry {
    /// Timestamp used for chronological ordering.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEntry::Action(a) => a.created_at,
            AuditEntry::Escalation(e) => e.created_at,
        }
    }
}

/// Read-side summary of one request. Computed, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub request_id: Uuid,
    /// Number of recorded actions across all steps.
    pub actions_count: usize,
    /// Number of escalation events across all steps.
    pub escalation_count: usize,
    /// Whole days since the request was created.
    pub days_since_created: i64,
    /// Whether the current step's timeout has elapsed.
    pub is_timed_out: bool,
}

/// Append-only recorder for actions and escalation events.
#[derive(Clone)]
pub struct AuditRecorder {
    actions: Arc<dyn ActionStore>,
    escalations: Arc<dyn EscalationStore>,
}

impl AuditRecorder {
    /// Creates a recorder over the given stores.
    pub fn new(actions: Arc<dyn ActionStore>, escalations: Arc<dyn EscalationStore>) -> Self {
        Self {
            actions,
            escalations,
        }
    }

    /// Appends an approver action.
    pub async fn record_action(&self, action: &ApprovalAction) -> Result<(), StoreError> {
        self.actions.append(action).await
    }

    /// Appends an escalation event.
    pub async fn record_escalation(&self, log: &EscalationLog) -> Result<(), StoreError> {
        self.escalations.append(log).await
    }

    /// Actions for a request, ordered by timestamp.
    pub async fn actions_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ApprovalAction>, StoreError> {
        self.actions.for_request(request_id).await
    }

    /// Actions for one step of a request, ordered by timestamp.
    pub async fn actions_for_step(
        &self,
        request_id: Uuid,
        step_order: u32,
    ) -> Result<Vec<ApprovalAction>, StoreError> {
        self.actions.for_step(request_id, step_order).await
    }

    /// Escalations for a request, ordered by timestamp.
    pub async fn escalations_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<EscalationLog>, StoreError> {
        self.escalations.for_request(request_id).await
    }

    /// Highest escalation level recorded for a (request, step); 0 when none.
    pub async fn last_escalation_level(
        &self,
        request_id: Uuid,
        step_order: u32,
    ) -> Result<u32, StoreError> {
        self.escalations.last_level(request_id, step_order).await
    }

    /// Moves an escalation along its pending -> acknowledged -> resolved
    /// lifecycle, stamping the matching timestamp and actor.
    pub async fn update_escalation_status(
        &self,
        escalation_id: Uuid,
        allowed_from: &[vg_core::EscalationStatus],
        to: vg_core::EscalationStatus,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<EscalationLog, StoreError> {
        self.escalations
            .update_status(escalation_id, allowed_from, to, by, at)
            .await
    }

    /// Merged chronological trail of actions and escalations for a request.
    pub async fn trail(&self, request_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let mut entries: Vec<AuditEntry> = self
            .actions
            .for_request(request_id)
            .await?
            .into_iter()
            .map(AuditEntry::Action)
            .collect();
        entries.extend(
            self.escalations
                .for_request(request_id)
                .await?
                .into_iter()
                .map(AuditEntry::Escalation),
        );
        entries.sort_by_key(|e| e.timestamp());
        Ok(entries)
    }

    /// Builds the read-side summary for a request.
    pub async fn summary(
        &self,
        request: &ApprovalRequest,
        now: DateTime<Utc>,
    ) -> Result<RequestSummary, StoreError> {
        let actions = self.actions.for_request(request.id).await?;
        let escalations = self.escalations.for_request(request.id).await?;

        Ok(RequestSummary {
            request_id: request.id,
            actions_count: actions.len(),
            escalation_count: escalations.len(),
            days_since_created: request.days_since_created(now),
            is_timed_out: request.is_timed_out(now),
        })
    }
}
