//! Persistence layer for the approval engine.
//!
//! The engine is a stateless logic layer over these stores; any durable
//! backend that honors the conditional-write contract on
//! [`RequestStore::update_if`] can host it. [`memory`] provides the
//! in-process implementation used in tests and single-node deployments;
//! the `database` feature adds SQLite-backed stores via SQLx.

mod error;
pub mod memory;

#[cfg(feature = "database")]
pub mod schema;
#[cfg(feature = "database")]
pub mod sqlite;

pub use error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::request::{
    ApprovalAction, ApprovalRequest, EscalationLog, EscalationStatus, RequestStatus,
};
use crate::workflow::{Workflow, WorkflowTemplate};

/// The observed state a conditional request write is predicated on.
///
/// A write only lands if the stored row still matches every populated field;
/// `timeout_at: None` skips the timeout check (used by writes that do not
/// race the escalation sweep).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestGuard {
    /// Expected current step.
    pub current_step: u32,
    /// Expected status.
    pub status: RequestStatus,
    /// Expected timeout, when the caller must not race a sweep lease.
    pub timeout_at: Option<DateTime<Utc>>,
}

impl RequestGuard {
    /// Guard capturing the full observed row, including its timeout.
    pub fn from_observed(request: &ApprovalRequest) -> Self {
        Self {
            current_step: request.current_step,
            status: request.status,
            timeout_at: Some(request.timeout_at),
        }
    }

    /// Whether a stored row still satisfies this guard.
    pub fn matches(&self, stored: &ApprovalRequest) -> bool {
        stored.current_step == self.current_step
            && stored.status == self.status
            && self
                .timeout_at
                .map(|t| stored.timeout_at == t)
                .unwrap_or(true)
    }
}

/// Store for workflow definitions and templates.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts a workflow; fails `Duplicate` if an active workflow already
    /// exists for the same (module, action_type, department) tuple.
    async fn insert(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Fetches a workflow by id.
    async fn get(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    /// Finds the active workflow for an exact (module, action_type, department).
    async fn find(
        &self,
        module: &str,
        action_type: &str,
        department: Option<&str>,
    ) -> Result<Option<Workflow>, StoreError>;

    /// Lists workflows, optionally scoped to a module.
    async fn list(&self, module: Option<&str>) -> Result<Vec<Workflow>, StoreError>;

    /// Activates or deactivates a workflow.
    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;

    /// Inserts a template.
    async fn insert_template(&self, template: &WorkflowTemplate) -> Result<(), StoreError>;

    /// Fetches a template by id.
    async fn get_template(&self, id: Uuid) -> Result<Option<WorkflowTemplate>, StoreError>;

    /// Flags a template as its department default. Fails `Conflict` if the
    /// template is already a default (defaults are immutable).
    async fn mark_template_default(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Store for approval requests, with conditional writes.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Inserts a new request.
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), StoreError>;

    /// Fetches a request by id.
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError>;

    /// Conditionally replaces a request row.
    ///
    /// The write only lands if the stored row still matches `guard`;
    /// otherwise `Conflict` is returned and nothing changes. This is the
    /// compare-and-swap every state transition is serialized through.
    async fn update_if(
        &self,
        id: Uuid,
        guard: &RequestGuard,
        updated: &ApprovalRequest,
    ) -> Result<(), StoreError>;

    /// Pending requests whose timeout has elapsed as of `now`.
    async fn list_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// All pending requests.
    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError>;
}

/// Append-only store for approver actions.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Appends an action. Fails `Duplicate` if a decisive (approve/reject)
    /// action already exists for the same (request, step, approver).
    async fn append(&self, action: &ApprovalAction) -> Result<(), StoreError>;

    /// All actions for a request, ordered by timestamp.
    async fn for_request(&self, request_id: Uuid) -> Result<Vec<ApprovalAction>, StoreError>;

    /// Actions for one step of a request, ordered by timestamp.
    async fn for_step(
        &self,
        request_id: Uuid,
        step_order: u32,
    ) -> Result<Vec<ApprovalAction>, StoreError>;
}

/// Append-only store for escalation logs; only status timestamps mutate.
#[async_trait]
pub trait EscalationStore: Send + Sync {
    /// Appends an escalation log entry.
    async fn append(&self, log: &EscalationLog) -> Result<(), StoreError>;

    /// Fetches an escalation entry by id.
    async fn get(&self, id: Uuid) -> Result<Option<EscalationLog>, StoreError>;

    /// All escalations for a request, ordered by timestamp.
    async fn for_request(&self, request_id: Uuid) -> Result<Vec<EscalationLog>, StoreError>;

    /// Highest recorded level for a (request, step); 0 when none.
    async fn last_level(&self, request_id: Uuid, step_order: u32) -> Result<u32, StoreError>;

    /// Moves an escalation to `to` if its current status is in `allowed_from`,
    /// stamping the matching timestamp and actor. Fails `Conflict` otherwise.
    async fn update_status(
        &self,
        id: Uuid,
        allowed_from: &[EscalationStatus],
        to: EscalationStatus,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<EscalationLog, StoreError>;
}
