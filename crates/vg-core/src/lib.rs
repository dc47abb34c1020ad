//! # vg-core
//!
//! Core entities, domain events, and collaborator seams for the Vendorgate
//! approval workflow engine.
//!
//! This crate defines the data model (workflows, requests, actions,
//! escalation logs), the event bus the engine publishes lifecycle events on,
//! the authorization collaborator trait, and the persistence traits with
//! in-memory and (feature-gated) SQLite implementations.

pub mod authz;
pub mod events;
pub mod request;
pub mod store;
pub mod workflow;

pub use authz::{Authorizer, RoleDirectory};
pub use events::{ApprovalEvent, EventBus, EventBusError};
pub use request::{
    ActionType, ApprovalAction, ApprovalRequest, EscalationLog, EscalationReason,
    EscalationStatus, RequestStatus,
};
pub use store::{
    ActionStore, EscalationStore, RequestGuard, RequestStore, StoreError, WorkflowStore,
};
pub use workflow::{
    validate_steps, ApprovalType, ApproverRef, Workflow, WorkflowDefinitionError, WorkflowStep,
    WorkflowTemplate,
};
