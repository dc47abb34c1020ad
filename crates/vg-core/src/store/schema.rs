//! Database schema for the approval engine stores.

use super::StoreError;

/// Statements executed in order by [`run_migrations`].
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        module TEXT NOT NULL,
        action_type TEXT NOT NULL,
        department TEXT,
        steps TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )
    "#,
    // Tuple uniqueness only applies to active workflows; deactivated rows
    // stay behind for audit without blocking re-registration.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_workflows_selector
    ON workflows(module, action_type, COALESCE(department, ''))
    WHERE active = 1
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_templates (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        module TEXT NOT NULL,
        action_type TEXT NOT NULL,
        steps TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS approval_requests (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        requester TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        resource_data TEXT NOT NULL,
        status TEXT NOT NULL,
        current_step INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        timeout_at TEXT NOT NULL,
        completed_at TEXT,
        rejection_reason TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_requests_pending_timeout
    ON approval_requests(timeout_at)
    WHERE status = 'pending'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS approval_actions (
        id TEXT PRIMARY KEY,
        request_id TEXT NOT NULL,
        step_order INTEGER NOT NULL,
        approver TEXT NOT NULL,
        action_type TEXT NOT NULL,
        comment TEXT,
        created_at TEXT NOT NULL,
        origin TEXT
    )
    "#,
    // At most one decisive action per (request, step, approver).
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_decisive
    ON approval_actions(request_id, step_order, approver)
    WHERE action_type IN ('approve', 'reject')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS escalation_logs (
        id TEXT PRIMARY KEY,
        request_id TEXT NOT NULL,
        step_order INTEGER NOT NULL,
        escalated_from TEXT,
        escalated_to TEXT NOT NULL,
        reason TEXT NOT NULL,
        level INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        acknowledged_at TEXT,
        acknowledged_by TEXT,
        resolved_at TEXT,
        resolved_by TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_escalations_request_step
    ON escalation_logs(request_id, step_order)
    "#,
];

/// Creates all tables and indexes if they do not exist.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<(), StoreError> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
