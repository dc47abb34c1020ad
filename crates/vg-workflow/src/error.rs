//! Engine error taxonomy.

use thiserror::Error;
use vg_core::StoreError;

/// Errors surfaced by the approval workflow engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed workflow/step configuration or empty resource data.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No matching workflow, request, step, or escalation.
    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    /// Approver is not eligible for the step's role or department.
    #[error("Approver '{approver}' is not eligible for step {step}")]
    Forbidden { approver: String, step: u32 },

    /// The approver already recorded a decisive action on this step.
    #[error("Duplicate action by '{approver}' on step {step}")]
    DuplicateAction { approver: String, step: u32 },

    /// The action targeted a step that is not the request's current step.
    #[error("Step mismatch: expected step {expected}, got {got}")]
    StepMismatch { expected: u32, got: u32 },

    /// Compare-and-swap race lost after the configured retries.
    #[error("Concurrent modification conflict on request {0}")]
    Conflict(String),

    /// Action or status change attempted on a terminal/closed entity.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A workflow already exists for the (module, action_type, department) tuple.
    #[error("Workflow already registered for {0}")]
    DuplicateWorkflow(String),

    /// Underlying store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Convenience constructor for missing entities.
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<vg_core::WorkflowDefinitionError> for EngineError {
    fn from(err: vg_core::WorkflowDefinitionError) -> Self {
        EngineError::Validation(err.to_string())
    }
}
