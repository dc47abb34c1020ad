//! SQLite implementations of the approval engine stores.
//!
//! Conditional writes are plain `UPDATE ... WHERE` statements predicated on
//! the observed row, so the compare-and-swap contract holds across any
//! number of engine or scheduler processes sharing the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    ActionStore, EscalationStore, RequestGuard, RequestStore, StoreError, WorkflowStore,
};
use crate::request::{
    ActionType, ApprovalAction, ApprovalRequest, EscalationLog, EscalationReason,
    EscalationStatus, RequestStatus,
};
use crate::workflow::{Workflow, WorkflowStep, WorkflowTemplate};

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_request_status(value: &str) -> Result<RequestStatus, StoreError> {
    match value {
        "pending" => Ok(RequestStatus::Pending),
        "approved" => Ok(RequestStatus::Approved),
        "rejected" => Ok(RequestStatus::Rejected),
        "expired" => Ok(RequestStatus::Expired),
        "cancelled" => Ok(RequestStatus::Cancelled),
        other => Err(StoreError::Serialization(format!(
            "unknown request status '{}'",
            other
        ))),
    }
}

fn parse_action_type(value: &str) -> Result<ActionType, StoreError> {
    match value {
        "approve" => Ok(ActionType::Approve),
        "reject" => Ok(ActionType::Reject),
        "delegate" => Ok(ActionType::Delegate),
        "comment" => Ok(ActionType::Comment),
        other => Err(StoreError::Serialization(format!(
            "unknown action type '{}'",
            other
        ))),
    }
}

fn parse_escalation_reason(value: &str) -> Result<EscalationReason, StoreError> {
    match value {
        "timeout" => Ok(EscalationReason::Timeout),
        "rejection" => Ok(EscalationReason::Rejection),
        "manual" => Ok(EscalationReason::Manual),
        other => Err(StoreError::Serialization(format!(
            "unknown escalation reason '{}'",
            other
        ))),
    }
}

fn escalation_reason_str(reason: EscalationReason) -> &'static str {
    match reason {
        EscalationReason::Timeout => "timeout",
        EscalationReason::Rejection => "rejection",
        EscalationReason::Manual => "manual",
    }
}

fn parse_escalation_status(value: &str) -> Result<EscalationStatus, StoreError> {
    match value {
        "pending" => Ok(EscalationStatus::Pending),
        "acknowledged" => Ok(EscalationStatus::Acknowledged),
        "resolved" => Ok(EscalationStatus::Resolved),
        other => Err(StoreError::Serialization(format!(
            "unknown escalation status '{}'",
            other
        ))),
    }
}

fn escalation_status_str(status: EscalationStatus) -> &'static str {
    match status {
        EscalationStatus::Pending => "pending",
        EscalationStatus::Acknowledged => "acknowledged",
        EscalationStatus::Resolved => "resolved",
    }
}

/// SQLite implementation of [`WorkflowStore`].
pub struct SqliteWorkflowStore {
    pool: sqlx::SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    module: String,
    action_type: String,
    department: Option<String>,
    steps: String,
    active: i64,
    created_at: String,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let steps: Vec<WorkflowStep> = serde_json::from_str(&row.steps)?;
        Ok(Workflow {
            id: parse_uuid(&row.id)?,
            module: row.module,
            action_type: row.action_type,
            department: row.department,
            steps,
            active: row.active != 0,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    module: String,
    action_type: String,
    steps: String,
    is_default: i64,
    created_at: String,
}

impl TryFrom<TemplateRow> for WorkflowTemplate {
    type Error = StoreError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        let steps: Vec<WorkflowStep> = serde_json::from_str(&row.steps)?;
        Ok(WorkflowTemplate {
            id: parse_uuid(&row.id)?,
            name: row.name,
            module: row.module,
            action_type: row.action_type,
            steps,
            is_default: row.is_default != 0,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let steps = serde_json::to_string(&workflow.steps)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (id, module, action_type, department, steps, active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.module)
        .bind(&workflow.action_type)
        .bind(&workflow.department)
        .bind(&steps)
        .bind(workflow.active as i64)
        .bind(workflow.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            "SELECT id, module, action_type, department, steps, active, created_at
             FROM workflows WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Workflow::try_from).transpose()
    }

    async fn find(
        &self,
        module: &str,
        action_type: &str,
        department: Option<&str>,
    ) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            "SELECT id, module, action_type, department, steps, active, created_at
             FROM workflows
             WHERE module = ? AND action_type = ?
               AND COALESCE(department, '') = COALESCE(?, '')
               AND active = 1",
        )
        .bind(module)
        .bind(action_type)
        .bind(department)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Workflow::try_from).transpose()
    }

    async fn list(&self, module: Option<&str>) -> Result<Vec<Workflow>, StoreError> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(
            "SELECT id, module, action_type, department, steps, active, created_at
             FROM workflows
             WHERE (? IS NULL OR module = ?)
             ORDER BY created_at ASC",
        )
        .bind(module)
        .bind(module)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Workflow::try_from).collect()
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workflows SET active = ? WHERE id = ?")
            .bind(active as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("workflow", id));
        }
        Ok(())
    }

    async fn insert_template(&self, template: &WorkflowTemplate) -> Result<(), StoreError> {
        let steps = serde_json::to_string(&template.steps)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_templates (id, name, module, action_type, steps, is_default, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.module)
        .bind(&template.action_type)
        .bind(&steps)
        .bind(template.is_default as i64)
        .bind(template.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<WorkflowTemplate>, StoreError> {
        let row: Option<TemplateRow> = sqlx::query_as(
            "SELECT id, name, module, action_type, steps, is_default, created_at
             FROM workflow_templates WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkflowTemplate::try_from).transpose()
    }

    async fn mark_template_default(&self, id: Uuid) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE workflow_templates SET is_default = 1 WHERE id = ? AND is_default = 0")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM workflow_templates WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some(_) => Err(StoreError::Conflict(format!(
                    "template {} is already a default and immutable",
                    id
                ))),
                None => Err(StoreError::not_found("template", id)),
            };
        }
        Ok(())
    }
}

/// SQLite implementation of [`RequestStore`].
pub struct SqliteRequestStore {
    pool: sqlx::SqlitePool,
}

impl SqliteRequestStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    workflow_id: String,
    requester: String,
    resource_id: String,
    resource_data: String,
    status: String,
    current_step: i64,
    created_at: String,
    timeout_at: String,
    completed_at: Option<String>,
    rejection_reason: Option<String>,
}

impl TryFrom<RequestRow> for ApprovalRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        Ok(ApprovalRequest {
            id: parse_uuid(&row.id)?,
            workflow_id: parse_uuid(&row.workflow_id)?,
            requester: row.requester,
            resource_id: row.resource_id,
            resource_data: serde_json::from_str(&row.resource_data)?,
            status: parse_request_status(&row.status)?,
            current_step: row.current_step as u32,
            created_at: parse_timestamp(&row.created_at)?,
            timeout_at: parse_timestamp(&row.timeout_at)?,
            completed_at: parse_optional_timestamp(row.completed_at)?,
            rejection_reason: row.rejection_reason,
        })
    }
}

const REQUEST_COLUMNS: &str = "id, workflow_id, requester, resource_id, resource_data, status, \
                               current_step, created_at, timeout_at, completed_at, rejection_reason";

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let resource_data = serde_json::to_string(&request.resource_data)?;
        sqlx::query(
            r#"
            INSERT INTO approval_requests
                (id, workflow_id, requester, resource_id, resource_data, status,
                 current_step, created_at, timeout_at, completed_at, rejection_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.to_string())
        .bind(request.workflow_id.to_string())
        .bind(&request.requester)
        .bind(&request.resource_id)
        .bind(&resource_data)
        .bind(request.status.to_string())
        .bind(request.current_step as i64)
        .bind(request.created_at.to_rfc3339())
        .bind(request.timeout_at.to_rfc3339())
        .bind(request.completed_at.map(|t| t.to_rfc3339()))
        .bind(&request.rejection_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM approval_requests WHERE id = ?",
            REQUEST_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ApprovalRequest::try_from).transpose()
    }

    async fn update_if(
        &self,
        id: Uuid,
        guard: &RequestGuard,
        updated: &ApprovalRequest,
    ) -> Result<(), StoreError> {
        // resource_data is write-once; deliberately not part of the UPDATE.
        let result = sqlx::query(
            r#"
            UPDATE approval_requests
            SET status = ?, current_step = ?, timeout_at = ?, completed_at = ?, rejection_reason = ?
            WHERE id = ? AND current_step = ? AND status = ?
              AND (? IS NULL OR timeout_at = ?)
            "#,
        )
        .bind(updated.status.to_string())
        .bind(updated.current_step as i64)
        .bind(updated.timeout_at.to_rfc3339())
        .bind(updated.completed_at.map(|t| t.to_rfc3339()))
        .bind(&updated.rejection_reason)
        .bind(id.to_string())
        .bind(guard.current_step as i64)
        .bind(guard.status.to_string())
        .bind(guard.timeout_at.map(|t| t.to_rfc3339()))
        .bind(guard.timeout_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM approval_requests WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some(_) => Err(StoreError::Conflict(format!(
                    "request {} changed underneath the caller",
                    id
                ))),
                None => Err(StoreError::not_found("request", id)),
            };
        }
        Ok(())
    }

    async fn list_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM approval_requests
             WHERE status = 'pending' AND timeout_at < ?
             ORDER BY timeout_at ASC",
            REQUEST_COLUMNS
        ))
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ApprovalRequest::try_from).collect()
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM approval_requests
             WHERE status = 'pending'
             ORDER BY created_at ASC",
            REQUEST_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ApprovalRequest::try_from).collect()
    }
}

/// SQLite implementation of [`ActionStore`].
pub struct SqliteActionStore {
    pool: sqlx::SqlitePool,
}

impl SqliteActionStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: String,
    request_id: String,
    step_order: i64,
    approver: String,
    action_type: String,
    comment: Option<String>,
    created_at: String,
    origin: Option<String>,
}

impl TryFrom<ActionRow> for ApprovalAction {
    type Error = StoreError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        Ok(ApprovalAction {
            id: parse_uuid(&row.id)?,
            request_id: parse_uuid(&row.request_id)?,
            step_order: row.step_order as u32,
            approver: row.approver,
            action_type: parse_action_type(&row.action_type)?,
            comment: row.comment,
            created_at: parse_timestamp(&row.created_at)?,
            origin: row
                .origin
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

#[async_trait]
impl ActionStore for SqliteActionStore {
    async fn append(&self, action: &ApprovalAction) -> Result<(), StoreError> {
        // The partial unique index enforces at most one decisive action per
        // (request, step, approver); violations surface as Duplicate.
        let origin = action
            .origin
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO approval_actions
                (id, request_id, step_order, approver, action_type, comment, created_at, origin)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(action.id.to_string())
        .bind(action.request_id.to_string())
        .bind(action.step_order as i64)
        .bind(&action.approver)
        .bind(action.action_type.to_string())
        .bind(&action.comment)
        .bind(action.created_at.to_rfc3339())
        .bind(&origin)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_request(&self, request_id: Uuid) -> Result<Vec<ApprovalAction>, StoreError> {
        let rows: Vec<ActionRow> = sqlx::query_as(
            "SELECT id, request_id, step_order, approver, action_type, comment, created_at, origin
             FROM approval_actions
             WHERE request_id = ?
             ORDER BY created_at ASC",
        )
        .bind(request_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ApprovalAction::try_from).collect()
    }

    async fn for_step(
        &self,
        request_id: Uuid,
        step_order: u32,
    ) -> Result<Vec<ApprovalAction>, StoreError> {
        let rows: Vec<ActionRow> = sqlx::query_as(
            "SELECT id, request_id, step_order, approver, action_type, comment, created_at, origin
             FROM approval_actions
             WHERE request_id = ? AND step_order = ?
             ORDER BY created_at ASC",
        )
        .bind(request_id.to_string())
        .bind(step_order as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ApprovalAction::try_from).collect()
    }
}

/// SQLite implementation of [`EscalationStore`].
pub struct SqliteEscalationStore {
    pool: sqlx::SqlitePool,
}

impl SqliteEscalationStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EscalationRow {
    id: String,
    request_id: String,
    step_order: i64,
    escalated_from: Option<String>,
    escalated_to: String,
    reason: String,
    level: i64,
    status: String,
    created_at: String,
    acknowledged_at: Option<String>,
    acknowledged_by: Option<String>,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
}

impl TryFrom<EscalationRow> for EscalationLog {
    type Error = StoreError;

    fn try_from(row: EscalationRow) -> Result<Self, Self::Error> {
        Ok(EscalationLog {
            id: parse_uuid(&row.id)?,
            request_id: parse_uuid(&row.request_id)?,
            step_order: row.step_order as u32,
            escalated_from: row.escalated_from,
            escalated_to: row.escalated_to,
            reason: parse_escalation_reason(&row.reason)?,
            level: row.level as u32,
            status: parse_escalation_status(&row.status)?,
            created_at: parse_timestamp(&row.created_at)?,
            acknowledged_at: parse_optional_timestamp(row.acknowledged_at)?,
            acknowledged_by: row.acknowledged_by,
            resolved_at: parse_optional_timestamp(row.resolved_at)?,
            resolved_by: row.resolved_by,
        })
    }
}

const ESCALATION_COLUMNS: &str = "id, request_id, step_order, escalated_from, escalated_to, \
                                  reason, level, status, created_at, acknowledged_at, \
                                  acknowledged_by, resolved_at, resolved_by";

#[async_trait]
impl EscalationStore for SqliteEscalationStore {
    async fn append(&self, log: &EscalationLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO escalation_logs
                (id, request_id, step_order, escalated_from, escalated_to, reason, level,
                 status, created_at, acknowledged_at, acknowledged_by, resolved_at, resolved_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.request_id.to_string())
        .bind(log.step_order as i64)
        .bind(&log.escalated_from)
        .bind(&log.escalated_to)
        .bind(escalation_reason_str(log.reason))
        .bind(log.level as i64)
        .bind(escalation_status_str(log.status))
        .bind(log.created_at.to_rfc3339())
        .bind(log.acknowledged_at.map(|t| t.to_rfc3339()))
        .bind(&log.acknowledged_by)
        .bind(log.resolved_at.map(|t| t.to_rfc3339()))
        .bind(&log.resolved_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EscalationLog>, StoreError> {
        let row: Option<EscalationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM escalation_logs WHERE id = ?",
            ESCALATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(EscalationLog::try_from).transpose()
    }

    async fn for_request(&self, request_id: Uuid) -> Result<Vec<EscalationLog>, StoreError> {
        let rows: Vec<EscalationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM escalation_logs WHERE request_id = ? ORDER BY created_at ASC",
            ESCALATION_COLUMNS
        ))
        .bind(request_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EscalationLog::try_from).collect()
    }

    async fn last_level(&self, request_id: Uuid, step_order: u32) -> Result<u32, StoreError> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(level) FROM escalation_logs WHERE request_id = ? AND step_order = ?",
        )
        .bind(request_id.to_string())
        .bind(step_order as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.map(|level| level as u32).unwrap_or(0))
    }

    async fn update_status(
        &self,
        id: Uuid,
        allowed_from: &[EscalationStatus],
        to: EscalationStatus,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<EscalationLog, StoreError> {
        let allowed: Vec<&'static str> = allowed_from
            .iter()
            .map(|s| escalation_status_str(*s))
            .collect();
        // allowed_from is at most the two non-terminal statuses.
        let placeholder_a = allowed.first().copied().unwrap_or("");
        let placeholder_b = allowed.get(1).copied().unwrap_or(placeholder_a);

        let (column_at, column_by) = match to {
            EscalationStatus::Acknowledged => ("acknowledged_at", "acknowledged_by"),
            EscalationStatus::Resolved => ("resolved_at", "resolved_by"),
            EscalationStatus::Pending => {
                return Err(StoreError::Conflict(
                    "escalations cannot be moved back to pending".to_string(),
                ))
            }
        };

        let result = sqlx::query(&format!(
            "UPDATE escalation_logs
             SET status = ?, {} = ?, {} = ?
             WHERE id = ? AND status IN (?, ?)",
            column_at, column_by
        ))
        .bind(escalation_status_str(to))
        .bind(at.to_rfc3339())
        .bind(by)
        .bind(id.to_string())
        .bind(placeholder_a)
        .bind(placeholder_b)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(log) => Err(StoreError::Conflict(format!(
                    "escalation {} cannot move to {:?} from {:?}",
                    id, to, log.status
                ))),
                None => Err(StoreError::not_found("escalation", id)),
            };
        }

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found("escalation", id))
    }
}
