//! Workflow and step definitions for the approval engine.
//!
//! A workflow is a reusable, ordered chain of approval steps bound to a
//! (module, action_type, department) tuple. Templates carry default step
//! configurations that can be stamped out per department.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while validating workflow definitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowDefinitionError {
    /// A workflow must contain at least one step.
    #[error("Workflow has no steps")]
    EmptySteps,

    /// Step order must be a contiguous sequence starting at 1.
    #[error("Step order must be contiguous from 1, found {found} at position {position}")]
    NonContiguousOrder { position: usize, found: u32 },

    /// Step timeout must be a positive number of hours.
    #[error("Step '{step}' has non-positive timeout_hours {timeout_hours}")]
    NonPositiveTimeout { step: String, timeout_hours: i64 },
}

/// Quorum rule governing when a step is considered decided.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// The first recorded approve or reject is decisive.
    Single,
    /// Every eligible approver must approve; a single reject is decisive.
    Multiple,
    /// The first approve is decisive; reject only once everyone rejected.
    Any,
}

impl std::fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalType::Single => write!(f, "single"),
            ApprovalType::Multiple => write!(f, "multiple"),
            ApprovalType::Any => write!(f, "any"),
        }
    }
}

/// Reference to the population expected to sign off a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApproverRef {
    /// Any holder of the named role.
    Role(String),
    /// Any member of the named department.
    Department(String),
}

impl std::fmt::Display for ApproverRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApproverRef::Role(role) => write!(f, "role:{}", role),
            ApproverRef::Department(dept) => write!(f, "department:{}", dept),
        }
    }
}

/// One stage of a workflow requiring sign-off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowStep {
    /// 1-based position within the workflow.
    pub order: u32,
    /// Human-readable step name.
    pub name: String,
    /// Who is expected to act on this step.
    pub approver: ApproverRef,
    /// Quorum rule for this step.
    pub approval_type: ApprovalType,
    /// Reserved: whether the step may be skipped. Every step currently blocks.
    pub is_required: bool,
    /// Hours before the step times out and escalates.
    pub timeout_hours: i64,
}

impl WorkflowStep {
    /// Creates a required step with the given position and quorum rule.
    pub fn new(
        order: u32,
        name: &str,
        approver: ApproverRef,
        approval_type: ApprovalType,
        timeout_hours: i64,
    ) -> Self {
        Self {
            order,
            name: name.to_string(),
            approver,
            approval_type,
            is_required: true,
            timeout_hours,
        }
    }
}

/// A reusable approval chain bound to a (module, action_type, department) tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning module (e.g. "user_management", "procurement").
    pub module: String,
    /// Action gated by this workflow (e.g. "create_user").
    pub action_type: String,
    /// Optional department scope; `None` is the department-less fallback.
    pub department: Option<String>,
    /// Ordered approval steps.
    pub steps: Vec<WorkflowStep>,
    /// Whether the workflow is available for new requests.
    pub active: bool,
    /// When the workflow was registered.
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Creates a new workflow after validating its step sequence.
    pub fn new(
        module: &str,
        action_type: &str,
        department: Option<&str>,
        steps: Vec<WorkflowStep>,
    ) -> Result<Self, WorkflowDefinitionError> {
        validate_steps(&steps)?;
        Ok(Self {
            id: Uuid::new_v4(),
            module: module.to_string(),
            action_type: action_type.to_string(),
            department: department.map(String::from),
            steps,
            active: true,
            created_at: Utc::now(),
        })
    }

    /// Gets the step at the given 1-based order, if present.
    pub fn step(&self, order: u32) -> Option<&WorkflowStep> {
        if order == 0 {
            return None;
        }
        self.steps.get((order - 1) as usize)
    }

    /// Returns true if the given order is the last step of the chain.
    pub fn is_last_step(&self, order: u32) -> bool {
        order as usize == self.steps.len()
    }

    /// The (module, action_type, department) tuple as a display string.
    pub fn selector(&self) -> String {
        match &self.department {
            Some(dept) => format!("{}/{}@{}", self.module, self.action_type, dept),
            None => format!("{}/{}", self.module, self.action_type),
        }
    }
}

/// Validates that steps form a contiguous 1-based sequence with positive timeouts.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), WorkflowDefinitionError> {
    if steps.is_empty() {
        return Err(WorkflowDefinitionError::EmptySteps);
    }

    for (position, step) in steps.iter().enumerate() {
        let expected = (position + 1) as u32;
        if step.order != expected {
            return Err(WorkflowDefinitionError::NonContiguousOrder {
                position,
                found: step.order,
            });
        }
        if step.timeout_hours <= 0 {
            return Err(WorkflowDefinitionError::NonPositiveTimeout {
                step: step.name.clone(),
                timeout_hours: step.timeout_hours,
            });
        }
    }

    Ok(())
}

/// Reusable default step configuration for stamping out department workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Unique identifier.
    pub id: Uuid,
    /// Template name.
    pub name: String,
    /// Module whose workflows this template seeds.
    pub module: String,
    /// Action type whose workflows this template seeds.
    pub action_type: String,
    /// Default step configuration copied into instantiated workflows.
    pub steps: Vec<WorkflowStep>,
    /// Whether this is the department default. Immutable once set.
    pub is_default: bool,
    /// When the template was created.
    pub created_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    /// Creates a new template after validating its step sequence.
    pub fn new(
        name: &str,
        module: &str,
        action_type: &str,
        steps: Vec<WorkflowStep>,
    ) -> Result<Self, WorkflowDefinitionError> {
        validate_steps(&steps)?;
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            module: module.to_string(),
            action_type: action_type.to_string(),
            steps,
            is_default: false,
            created_at: Utc::now(),
        })
    }
}
