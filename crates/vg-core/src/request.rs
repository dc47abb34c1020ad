//! Approval request lifecycle data.
//!
//! A request is a live instance of a workflow progressing toward approval of
//! one concrete resource. Actions and escalation logs are append-only records
//! hanging off a request; the request row itself is the only mutable entity,
//! and only until it reaches a terminal state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::Workflow;

/// Status of an approval request.
///
/// `Pending` is the only non-terminal state; the four others are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting sign-off on the current step.
    Pending,
    /// Every step approved.
    Approved,
    /// Rejected on some step.
    Rejected,
    /// Escalation ceiling reached without a decision.
    Expired,
    /// Withdrawn by the requester or an administrator.
    Cancelled,
}

impl RequestStatus {
    /// Returns true for the four absorbing states.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Expired => "expired",
            RequestStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A live instance of a workflow gating one concrete resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique identifier.
    pub id: Uuid,
    /// The workflow this request is bound to.
    pub workflow_id: Uuid,
    /// Who invoked the protected action.
    pub requester: String,
    /// Identifier of the resource awaiting approval, owned by the caller.
    pub resource_id: String,
    /// Opaque snapshot of the resource, write-once at creation.
    pub resource_data: serde_json::Value,
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// 1-based index into the workflow's steps. Meaningful while pending.
    pub current_step: u32,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the current step times out.
    pub timeout_at: DateTime<Utc>,
    /// When the request reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Approver comment captured on rejection.
    pub rejection_reason: Option<String>,
}

impl ApprovalRequest {
    /// Creates a pending request positioned on the first step of `workflow`.
    ///
    /// The caller is responsible for validating `resource_data`; this
    /// constructor only wires the lifecycle fields.
    pub fn new(
        workflow: &Workflow,
        requester: &str,
        resource_id: &str,
        resource_data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        let first_timeout = workflow
            .step(1)
            .map(|s| s.timeout_hours)
            .unwrap_or(0);
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            requester: requester.to_string(),
            resource_id: resource_id.to_string(),
            resource_data,
            status: RequestStatus::Pending,
            current_step: 1,
            created_at: now,
            timeout_at: now + Duration::hours(first_timeout),
            completed_at: None,
            rejection_reason: None,
        }
    }

    /// Returns true once the request has reached an absorbing state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Computed, never persisted: whether the current step has timed out.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending && now > self.timeout_at
    }

    /// Whole days elapsed since the request was created.
    pub fn days_since_created(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

/// Kind of action an approver records against a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Approve,
    Reject,
    Delegate,
    Comment,
}

impl ActionType {
    /// Approve and reject count toward quorum; delegate and comment do not.
    pub fn is_decisive(&self) -> bool {
        matches!(self, ActionType::Approve | ActionType::Reject)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::Approve => "approve",
            ActionType::Reject => "reject",
            ActionType::Delegate => "delegate",
            ActionType::Comment => "comment",
        };
        write!(f, "{}", s)
    }
}

/// An approver's recorded action on one step of a request. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalAction {
    /// Unique identifier.
    pub id: Uuid,
    /// Request this action belongs to.
    pub request_id: Uuid,
    /// 1-based step the action targets.
    pub step_order: u32,
    /// Who acted.
    pub approver: String,
    /// What they did.
    pub action_type: ActionType,
    /// Free-form comment; doubles as the rejection reason on reject.
    pub comment: Option<String>,
    /// When the action was recorded.
    pub created_at: DateTime<Utc>,
    /// Opaque origin metadata (client, channel, request trace).
    pub origin: Option<serde_json::Value>,
}

impl ApprovalAction {
    /// Creates an action stamped with the current time.
    pub fn new(
        request_id: Uuid,
        step_order: u32,
        approver: &str,
        action_type: ActionType,
        comment: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            step_order,
            approver: approver.to_string(),
            action_type,
            comment: comment.map(String::from),
            created_at: Utc::now(),
            origin: None,
        }
    }

    /// Attaches origin metadata.
    pub fn with_origin(mut self, origin: serde_json::Value) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Why an escalation was raised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Timeout,
    Rejection,
    Manual,
}

/// Lifecycle of an escalation log entry: pending -> acknowledged -> resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    Resolved,
}

/// Record of one escalation event on a request step. Created once; only the
/// status timestamps may change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationLog {
    /// Unique identifier.
    pub id: Uuid,
    /// Request being escalated.
    pub request_id: Uuid,
    /// Step the escalation applies to.
    pub step_order: u32,
    /// Who or what held the approval before the escalation.
    pub escalated_from: Option<String>,
    /// Who is now expected to act.
    pub escalated_to: String,
    /// Why the escalation was raised.
    pub reason: EscalationReason,
    /// 1-based escalation level, scoped per (request, step).
    pub level: u32,
    /// Handling status of this escalation.
    pub status: EscalationStatus,
    /// When the escalation was raised.
    pub created_at: DateTime<Utc>,
    /// When it was acknowledged, and by whom.
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    /// When it was resolved, and by whom.
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl EscalationLog {
    /// Creates a pending escalation entry stamped with the current time.
    pub fn new(
        request_id: Uuid,
        step_order: u32,
        escalated_from: Option<&str>,
        escalated_to: &str,
        reason: EscalationReason,
        level: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            step_order,
            escalated_from: escalated_from.map(String::from),
            escalated_to: escalated_to.to_string(),
            reason,
            level,
            status: EscalationStatus::Pending,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
        }
    }
}
