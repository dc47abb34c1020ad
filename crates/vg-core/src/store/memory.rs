//! In-memory store implementations.
//!
//! Used as test doubles and for single-node deployments. All guard checks
//! happen under the write lock, so the conditional-write contract holds
//! under concurrent callers exactly as it would against a durable backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ActionStore, EscalationStore, RequestGuard, RequestStore, StoreError, WorkflowStore,
};
use crate::request::{
    ApprovalAction, ApprovalRequest, EscalationLog, EscalationStatus, RequestStatus,
};
use crate::workflow::{Workflow, WorkflowTemplate};

/// In-memory [`WorkflowStore`].
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: Arc<RwLock<HashMap<Uuid, Workflow>>>,
    templates: Arc<RwLock<HashMap<Uuid, WorkflowTemplate>>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;

        let collision = workflows.values().any(|w| {
            w.active
                && w.module == workflow.module
                && w.action_type == workflow.action_type
                && w.department == workflow.department
        });
        if collision {
            return Err(StoreError::Duplicate(workflow.selector()));
        }

        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn find(
        &self,
        module: &str,
        action_type: &str,
        department: Option<&str>,
    ) -> Result<Option<Workflow>, StoreError> {
        let workflows = self.workflows.read().await;
        Ok(workflows
            .values()
            .find(|w| {
                w.active
                    && w.module == module
                    && w.action_type == action_type
                    && w.department.as_deref() == department
            })
            .cloned())
    }

    async fn list(&self, module: Option<&str>) -> Result<Vec<Workflow>, StoreError> {
        let workflows = self.workflows.read().await;
        let mut result: Vec<Workflow> = workflows
            .values()
            .filter(|w| module.map(|m| w.module == m).unwrap_or(true))
            .cloned()
            .collect();
        result.sort_by_key(|w| w.created_at);
        Ok(result)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("workflow", id))?;
        workflow.active = active;
        Ok(())
    }

    async fn insert_template(&self, template: &WorkflowTemplate) -> Result<(), StoreError> {
        let mut templates = self.templates.write().await;
        if templates.contains_key(&template.id) {
            return Err(StoreError::Duplicate(template.name.clone()));
        }
        templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<WorkflowTemplate>, StoreError> {
        Ok(self.templates.read().await.get(&id).cloned())
    }

    async fn mark_template_default(&self, id: Uuid) -> Result<(), StoreError> {
        let mut templates = self.templates.write().await;
        let template = templates
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("template", id))?;
        if template.is_default {
            return Err(StoreError::Conflict(format!(
                "template {} is already a default and immutable",
                template.name
            )));
        }
        template.is_default = true;
        Ok(())
    }
}

/// In-memory [`RequestStore`].
#[derive(Default)]
pub struct MemoryRequestStore {
    requests: Arc<RwLock<HashMap<Uuid, ApprovalRequest>>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: rewrites a request's timeout so a sweep sees it as stale.
    pub async fn backdate_timeout(&self, id: Uuid, timeout_at: DateTime<Utc>) {
        if let Some(request) = self.requests.write().await.get_mut(&id) {
            request.timeout_at = timeout_at;
        }
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(StoreError::Duplicate(request.id.to_string()));
        }
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.requests.read().await.get(&id).cloned())
    }

    async fn update_if(
        &self,
        id: Uuid,
        guard: &RequestGuard,
        updated: &ApprovalRequest,
    ) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        let stored = requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("request", id))?;

        if !guard.matches(stored) {
            return Err(StoreError::Conflict(format!(
                "request {} changed underneath the caller (step {}, status {})",
                id, stored.current_step, stored.status
            )));
        }

        *stored = updated.clone();
        Ok(())
    }

    async fn list_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        let mut result: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending && now > r.timeout_at)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.timeout_at);
        Ok(result)
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        let mut result: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }
}

/// In-memory [`ActionStore`].
#[derive(Default)]
pub struct MemoryActionStore {
    actions: Arc<RwLock<Vec<ApprovalAction>>>,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn append(&self, action: &ApprovalAction) -> Result<(), StoreError> {
        let mut actions = self.actions.write().await;

        if action.action_type.is_decisive() {
            let duplicate = actions.iter().any(|a| {
                a.request_id == action.request_id
                    && a.step_order == action.step_order
                    && a.approver == action.approver
                    && a.action_type.is_decisive()
            });
            if duplicate {
                return Err(StoreError::Duplicate(format!(
                    "decisive action by {} on request {} step {}",
                    action.approver, action.request_id, action.step_order
                )));
            }
        }

        actions.push(action.clone());
        Ok(())
    }

    async fn for_request(&self, request_id: Uuid) -> Result<Vec<ApprovalAction>, StoreError> {
        let actions = self.actions.read().await;
        let mut result: Vec<ApprovalAction> = actions
            .iter()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect();
        result.sort_by_key(|a| a.created_at);
        Ok(result)
    }

    async fn for_step(
        &self,
        request_id: Uuid,
        step_order: u32,
    ) -> Result<Vec<ApprovalAction>, StoreError> {
        let actions = self.actions.read().await;
        let mut result: Vec<ApprovalAction> = actions
            .iter()
            .filter(|a| a.request_id == request_id && a.step_order == step_order)
            .cloned()
            .collect();
        result.sort_by_key(|a| a.created_at);
        Ok(result)
    }
}

/// In-memory [`EscalationStore`].
#[derive(Default)]
pub struct MemoryEscalationStore {
    escalations: Arc<RwLock<Vec<EscalationLog>>>,
}

impl MemoryEscalationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscalationStore for MemoryEscalationStore {
    async fn append(&self, log: &EscalationLog) -> Result<(), StoreError> {
        self.escalations.write().await.push(log.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EscalationLog>, StoreError> {
        let escalations = self.escalations.read().await;
        Ok(escalations.iter().find(|e| e.id == id).cloned())
    }

    async fn for_request(&self, request_id: Uuid) -> Result<Vec<EscalationLog>, StoreError> {
        let escalations = self.escalations.read().await;
        let mut result: Vec<EscalationLog> = escalations
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.created_at);
        Ok(result)
    }

    async fn last_level(&self, request_id: Uuid, step_order: u32) -> Result<u32, StoreError> {
        let escalations = self.escalations.read().await;
        Ok(escalations
            .iter()
            .filter(|e| e.request_id == request_id && e.step_order == step_order)
            .map(|e| e.level)
            .max()
            .unwrap_or(0))
    }

    async fn update_status(
        &self,
        id: Uuid,
        allowed_from: &[EscalationStatus],
        to: EscalationStatus,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<EscalationLog, StoreError> {
        let mut escalations = self.escalations.write().await;
        let log = escalations
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::not_found("escalation", id))?;

        if !allowed_from.contains(&log.status) {
            return Err(StoreError::Conflict(format!(
                "escalation {} cannot move to {:?} from {:?}",
                id, to, log.status
            )));
        }

        log.status = to;
        match to {
            EscalationStatus::Acknowledged => {
                log.acknowledged_at = Some(at);
                log.acknowledged_by = Some(by.to_string());
            }
            EscalationStatus::Resolved => {
                log.resolved_at = Some(at);
                log.resolved_by = Some(by.to_string());
            }
            EscalationStatus::Pending => {}
        }

        Ok(log.clone())
    }
}
