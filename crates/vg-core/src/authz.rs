//! Authorization collaborator for approver eligibility and escalation targets.
//!
//! The engine never queries role or department membership itself; it asks an
//! injected [`Authorizer`]. [`RoleDirectory`] is the shipped implementation:
//! an in-memory registry with an ordered role hierarchy, suitable for tests
//! and for hosts that sync membership from an external identity system.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::workflow::{ApproverRef, WorkflowStep};

/// Resolves who may act on a step and where timeouts escalate to.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `user` may sign off a step assigned to `approver`.
    async fn is_eligible(&self, approver: &ApproverRef, user: &str) -> bool;

    /// Everyone currently eligible for a step assigned to `approver`.
    ///
    /// Quorum rules `multiple` and `any` need the full set, not just a
    /// membership check.
    async fn eligible_approvers(&self, approver: &ApproverRef) -> Vec<String>;

    /// Who should take over after `level` consecutive escalations of `step`.
    ///
    /// Implementations walk their role hierarchy upward and fall back to the
    /// top-level role; `None` means the directory has nobody to hand to.
    async fn resolve_escalation_target(&self, step: &WorkflowStep, level: u32) -> Option<String>;
}

/// In-memory role and department registry with an ordered hierarchy.
pub struct RoleDirectory {
    /// Role hierarchy, lowest authority first.
    hierarchy: Vec<String>,
    /// Members by role name.
    role_members: Arc<RwLock<HashMap<String, Vec<String>>>>,
    /// Members by department name.
    department_members: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl RoleDirectory {
    /// Creates a directory with the given role hierarchy (lowest first).
    pub fn new(hierarchy: Vec<String>) -> Self {
        Self {
            hierarchy,
            role_members: Arc::new(RwLock::new(HashMap::new())),
            department_members: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a user as a member of a role.
    pub async fn add_role_member(&self, role: &str, user: &str) {
        let mut members = self.role_members.write().await;
        let list = members.entry(role.to_string()).or_default();
        if !list.iter().any(|m| m == user) {
            list.push(user.to_string());
            info!(role = %role, user = %user, "Registered role member");
        }
    }

    /// Registers a user as a member of a department.
    pub async fn add_department_member(&self, department: &str, user: &str) {
        let mut members = self.department_members.write().await;
        let list = members.entry(department.to_string()).or_default();
        if !list.iter().any(|m| m == user) {
            list.push(user.to_string());
            info!(department = %department, user = %user, "Registered department member");
        }
    }

    /// Position of a role in the hierarchy, if it participates in it.
    fn hierarchy_index(&self, role: &str) -> Option<usize> {
        self.hierarchy.iter().position(|r| r == role)
    }
}

#[async_trait]
impl Authorizer for RoleDirectory {
    async fn is_eligible(&self, approver: &ApproverRef, user: &str) -> bool {
        match approver {
            ApproverRef::Role(role) => self
                .role_members
                .read()
                .await
                .get(role)
                .map(|m| m.iter().any(|u| u == user))
                .unwrap_or(false),
            ApproverRef::Department(dept) => self
                .department_members
                .read()
                .await
                .get(dept)
                .map(|m| m.iter().any(|u| u == user))
                .unwrap_or(false),
        }
    }

    async fn eligible_approvers(&self, approver: &ApproverRef) -> Vec<String> {
        match approver {
            ApproverRef::Role(role) => self
                .role_members
                .read()
                .await
                .get(role)
                .cloned()
                .unwrap_or_default(),
            ApproverRef::Department(dept) => self
                .department_members
                .read()
                .await
                .get(dept)
                .cloned()
                .unwrap_or_default(),
        }
    }

    async fn resolve_escalation_target(&self, step: &WorkflowStep, level: u32) -> Option<String> {
        let base = match &step.approver {
            ApproverRef::Role(role) => self.hierarchy_index(role).unwrap_or(0),
            // Department steps escalate through the hierarchy from the bottom.
            ApproverRef::Department(_) => 0,
        };

        if self.hierarchy.is_empty() {
            return None;
        }

        // Walk up one rank per level, clamped to the top-level role.
        let target_index = (base + level as usize).min(self.hierarchy.len() - 1);
        let members = self.role_members.read().await;

        // Prefer the target rank; keep climbing if it has no members.
        for role in &self.hierarchy[target_index..] {
            if let Some(first) = members.get(role).and_then(|l| l.first()) {
                return Some(first.clone());
            }
        }

        // Top-level fallback: highest populated role anywhere in the ladder.
        for role in self.hierarchy.iter().rev() {
            if let Some(first) = members.get(role).and_then(|l| l.first()) {
                return Some(first.clone());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ApprovalType;

    fn directory() -> RoleDirectory {
        RoleDirectory::new(vec![
            "manager".to_string(),
            "director".to_string(),
            "executive".to_string(),
        ])
    }

    fn manager_step() -> WorkflowStep {
        WorkflowStep::new(
            1,
            "manager-review",
            ApproverRef::Role("manager".to_string()),
            ApprovalType::Single,
            24,
        )
    }

    #[tokio::test]
    async fn test_role_eligibility() {
        let dir = directory();
        dir.add_role_member("manager", "mallory").await;

        let manager = ApproverRef::Role("manager".to_string());
        assert!(dir.is_eligible(&manager, "mallory").await);
        assert!(!dir.is_eligible(&manager, "eve").await);
    }

    #[tokio::test]
    async fn test_department_eligibility() {
        let dir = directory();
        dir.add_department_member("finance", "frank").await;

        let finance = ApproverRef::Department("finance".to_string());
        assert!(dir.is_eligible(&finance, "frank").await);
        assert!(!dir.is_eligible(&finance, "mallory").await);
    }

    #[tokio::test]
    async fn test_eligible_approvers_set() {
        let dir = directory();
        dir.add_role_member("manager", "m1").await;
        dir.add_role_member("manager", "m2").await;
        dir.add_role_member("manager", "m2").await; // idempotent

        let manager = ApproverRef::Role("manager".to_string());
        let eligible = dir.eligible_approvers(&manager).await;
        assert_eq!(eligible, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn test_escalation_walks_hierarchy() {
        let dir = directory();
        dir.add_role_member("manager", "mallory").await;
        dir.add_role_member("director", "dana").await;
        dir.add_role_member("executive", "erin").await;

        let step = manager_step();
        assert_eq!(
            dir.resolve_escalation_target(&step, 1).await,
            Some("dana".to_string())
        );
        assert_eq!(
            dir.resolve_escalation_target(&step, 2).await,
            Some("erin".to_string())
        );
        // Past the top of the hierarchy, clamps to the top-level role.
        assert_eq!(
            dir.resolve_escalation_target(&step, 7).await,
            Some("erin".to_string())
        );
    }

    #[tokio::test]
    async fn test_escalation_empty_directory() {
        let dir = directory();
        let step = manager_step();
        assert_eq!(dir.resolve_escalation_target(&step, 1).await, None);
    }

    #[tokio::test]
    async fn test_escalation_department_step_starts_at_bottom() {
        let dir = directory();
        dir.add_role_member("director", "dana").await;

        let step = WorkflowStep::new(
            1,
            "finance-review",
            ApproverRef::Department("finance".to_string()),
            ApprovalType::Any,
            24,
        );
        assert_eq!(
            dir.resolve_escalation_target(&step, 1).await,
            Some("dana".to_string())
        );
    }
}
