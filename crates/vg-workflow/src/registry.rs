//! Workflow registry.
//!
//! Stores and resolves reusable workflow definitions. Resolution prefers an
//! exact department-scoped workflow and falls back to the department-less
//! one for the same (module, action_type).

use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use vg_core::{
    validate_steps, StoreError, Workflow, WorkflowStep, WorkflowStore, WorkflowTemplate,
};

use crate::error::EngineError;

/// Registry of workflow definitions and templates.
pub struct WorkflowRegistry {
    workflows: Arc<dyn WorkflowStore>,
}

impl WorkflowRegistry {
    /// Creates a registry over the given store.
    pub fn new(workflows: Arc<dyn WorkflowStore>) -> Self {
        Self { workflows }
    }

    /// Registers a new workflow for a (module, action_type, department) tuple.
    ///
    /// Fails `Validation` on a malformed step sequence and
    /// `DuplicateWorkflow` if an active workflow already covers the tuple.
    #[instrument(skip(self, steps))]
    pub async fn register(
        &self,
        module: &str,
        action_type: &str,
        department: Option<&str>,
        steps: Vec<WorkflowStep>,
    ) -> Result<Workflow, EngineError> {
        let workflow = Workflow::new(module, action_type, department, steps)?;

        match self.workflows.insert(&workflow).await {
            Ok(()) => {
                info!(
                    workflow_id = %workflow.id,
                    selector = %workflow.selector(),
                    steps = workflow.steps.len(),
                    "Workflow registered"
                );
                Ok(workflow)
            }
            Err(StoreError::Duplicate(_)) => {
                Err(EngineError::DuplicateWorkflow(workflow.selector()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves the workflow gating (module, action_type) for a department.
    ///
    /// Returns the department-scoped workflow when one exists, otherwise the
    /// department-less fallback; `NotFound` when neither does.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        module: &str,
        action_type: &str,
        department: Option<&str>,
    ) -> Result<Workflow, EngineError> {
        if let Some(dept) = department {
            if let Some(workflow) = self.workflows.find(module, action_type, Some(dept)).await? {
                debug!(workflow_id = %workflow.id, "Resolved department-scoped workflow");
                return Ok(workflow);
            }
        }

        if let Some(workflow) = self.workflows.find(module, action_type, None).await? {
            debug!(workflow_id = %workflow.id, "Resolved department-less fallback workflow");
            return Ok(workflow);
        }

        Err(EngineError::not_found(
            "workflow",
            format!("{}/{}", module, action_type),
        ))
    }

    /// Fetches a workflow by id.
    pub async fn get(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.workflows
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow", id))
    }

    /// Lists workflows, optionally scoped to a module.
    pub async fn list(&self, module: Option<&str>) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.workflows.list(module).await?)
    }

    /// Deactivates a workflow; existing requests keep running against it,
    /// but `resolve` stops returning it.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, id: Uuid) -> Result<(), EngineError> {
        match self.workflows.set_active(id, false).await {
            Ok(()) => {
                info!(workflow_id = %id, "Workflow deactivated");
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => Err(EngineError::not_found("workflow", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Registers a reusable template.
    pub async fn register_template(
        &self,
        name: &str,
        module: &str,
        action_type: &str,
        steps: Vec<WorkflowStep>,
    ) -> Result<WorkflowTemplate, EngineError> {
        let template = WorkflowTemplate::new(name, module, action_type, steps)?;
        self.workflows.insert_template(&template).await?;
        info!(template_id = %template.id, name = %template.name, "Template registered");
        Ok(template)
    }

    /// Flags a template as its department default. Defaults are immutable:
    /// flagging an already-default template fails `InvalidTransition`.
    pub async fn mark_template_default(&self, id: Uuid) -> Result<(), EngineError> {
        match self.workflows.mark_template_default(id).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(msg)) => Err(EngineError::InvalidTransition(msg)),
            Err(StoreError::NotFound { .. }) => Err(EngineError::not_found("template", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies a template's step configuration into a new workflow scoped to
    /// `department`.
    #[instrument(skip(self))]
    pub async fn instantiate_from_template(
        &self,
        template_id: Uuid,
        department: &str,
    ) -> Result<Workflow, EngineError> {
        let template = self
            .workflows
            .get_template(template_id)
            .await?
            .ok_or_else(|| EngineError::not_found("template", template_id))?;

        // Templates were validated on creation; re-validate anyway so a
        // hand-edited store row cannot mint a broken workflow.
        validate_steps(&template.steps).map_err(|e| EngineError::Validation(e.to_string()))?;

        self.register(
            &template.module,
            &template.action_type,
            Some(department),
            template.steps.clone(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vg_core::store::memory::MemoryWorkflowStore;
    use vg_core::{ApprovalType, ApproverRef};

    fn registry() -> WorkflowRegistry {
        WorkflowRegistry::new(Arc::new(MemoryWorkflowStore::new()))
    }

    fn steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::new(
                1,
                "manager-review",
                ApproverRef::Role("manager".to_string()),
                ApprovalType::Single,
                24,
            ),
            WorkflowStep::new(
                2,
                "admin-review",
                ApproverRef::Role("admin".to_string()),
                ApprovalType::Single,
                48,
            ),
        ]
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = registry();
        let workflow = registry
            .register("user_management", "create_user", None, steps())
            .await
            .unwrap();

        let resolved = registry
            .resolve("user_management", "create_user", None)
            .await
            .unwrap();
        assert_eq!(resolved.id, workflow.id);
    }

    #[tokio::test]
    async fn test_duplicate_tuple_rejected() {
        let registry = registry();
        registry
            .register("user_management", "create_user", Some("finance"), steps())
            .await
            .unwrap();

        let result = registry
            .register("user_management", "create_user", Some("finance"), steps())
            .await;
        assert!(matches!(result, Err(EngineError::DuplicateWorkflow(_))));

        // Department-less and differently scoped registrations still work.
        registry
            .register("user_management", "create_user", None, steps())
            .await
            .unwrap();
        registry
            .register("user_management", "create_user", Some("legal"), steps())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_steps_rejected() {
        let registry = registry();
        let mut broken = steps();
        broken[1].order = 7;

        let result = registry
            .register("user_management", "create_user", None, broken)
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_resolve_prefers_department_scope() {
        let registry = registry();
        let fallback = registry
            .register("procurement", "award_contract", None, steps())
            .await
            .unwrap();
        let scoped = registry
            .register("procurement", "award_contract", Some("finance"), steps())
            .await
            .unwrap();

        let resolved = registry
            .resolve("procurement", "award_contract", Some("finance"))
            .await
            .unwrap();
        assert_eq!(resolved.id, scoped.id);

        // Unknown department falls back to the department-less workflow.
        let resolved = registry
            .resolve("procurement", "award_contract", Some("warehouse"))
            .await
            .unwrap();
        assert_eq!(resolved.id, fallback.id);
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let registry = registry();
        let result = registry.resolve("procurement", "award_contract", None).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_deactivated_workflow_not_resolved() {
        let registry = registry();
        let workflow = registry
            .register("procurement", "award_contract", None, steps())
            .await
            .unwrap();

        registry.deactivate(workflow.id).await.unwrap();

        let result = registry.resolve("procurement", "award_contract", None).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_instantiate_from_template() {
        let registry = registry();
        let template = registry
            .register_template("standard-chain", "procurement", "award_contract", steps())
            .await
            .unwrap();

        let workflow = registry
            .instantiate_from_template(template.id, "finance")
            .await
            .unwrap();

        assert_eq!(workflow.department.as_deref(), Some("finance"));
        assert_eq!(workflow.steps, template.steps);

        // A second instantiation for the same department collides.
        let result = registry
            .instantiate_from_template(template.id, "finance")
            .await;
        assert!(matches!(result, Err(EngineError::DuplicateWorkflow(_))));
    }

    #[tokio::test]
    async fn test_template_default_immutable() {
        let registry = registry();
        let template = registry
            .register_template("standard-chain", "procurement", "award_contract", steps())
            .await
            .unwrap();

        registry.mark_template_default(template.id).await.unwrap();
        let result = registry.mark_template_default(template.id).await;
        assert!(matches!(result, Err(EngineError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_instantiate_missing_template() {
        let registry = registry();
        let result = registry
            .instantiate_from_template(Uuid::new_v4(), "finance")
            .await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }
}
