//! Step quorum evaluation.
//!
//! Pure decision logic: given a step's quorum rule, the actions recorded so
//! far, and the set of eligible approvers, decide whether the step is still
//! pending, advances, or rejects the request. No storage, no clocks.

use vg_core::{ActionType, ApprovalAction, ApprovalType, WorkflowStep};

/// Outcome of evaluating a step against its recorded actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Quorum not reached; the step keeps waiting.
    Pending,
    /// The step is approved; the request moves to the next step or completes.
    Advance,
    /// The step is rejected; the request terminates.
    Reject,
}

/// Evaluates a step's quorum rule.
///
/// `actions` are the actions recorded for this (request, step); `eligible`
/// is the full set of approvers currently allowed to act on it. Delegate
/// and comment actions never count toward quorum.
pub fn evaluate(
    step: &WorkflowStep,
    actions: &[ApprovalAction],
    eligible: &[String],
) -> StepOutcome {
    let approvals: Vec<&ApprovalAction> = actions
        .iter()
        .filter(|a| a.action_type == ActionType::Approve)
        .collect();
    let rejections: Vec<&ApprovalAction> = actions
        .iter()
        .filter(|a| a.action_type == ActionType::Reject)
        .collect();

    match step.approval_type {
        ApprovalType::Single => {
            // Earliest decisive action wins, whatever order the slice is in.
            let first_decisive = actions
                .iter()
                .filter(|a| a.action_type.is_decisive())
                .min_by_key(|a| a.created_at);
            match first_decisive.map(|a| a.action_type) {
                Some(ActionType::Approve) => StepOutcome::Advance,
                Some(ActionType::Reject) => StepOutcome::Reject,
                _ => StepOutcome::Pending,
            }
        }

        ApprovalType::Multiple => {
            // Fail-closed: one rejection sinks the step regardless of count.
            if !rejections.is_empty() {
                return StepOutcome::Reject;
            }
            if eligible.is_empty() {
                // Nobody can complete the quorum; escalation is the way out.
                return StepOutcome::Pending;
            }
            let all_approved = eligible
                .iter()
                .all(|user| approvals.iter().any(|a| &a.approver == user));
            if all_approved {
                StepOutcome::Advance
            } else {
                StepOutcome::Pending
            }
        }

        ApprovalType::Any => {
            if !approvals.is_empty() {
                return StepOutcome::Advance;
            }
            if eligible.is_empty() {
                return StepOutcome::Pending;
            }
            let all_rejected = eligible
                .iter()
                .all(|user| rejections.iter().any(|a| &a.approver == user));
            if all_rejected {
                StepOutcome::Reject
            } else {
                StepOutcome::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vg_core::ApproverRef;

    fn step(approval_type: ApprovalType) -> WorkflowStep {
        WorkflowStep::new(
            1,
            "review",
            ApproverRef::Role("manager".to_string()),
            approval_type,
            24,
        )
    }

    fn action(approver: &str, action_type: ActionType) -> ApprovalAction {
        ApprovalAction::new(Uuid::new_v4(), 1, approver, action_type, None)
    }

    fn eligible(users: &[&str]) -> Vec<String> {
        users.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_single_no_actions_pending() {
        let outcome = evaluate(&step(ApprovalType::Single), &[], &eligible(&["m1"]));
        assert_eq!(outcome, StepOutcome::Pending);
    }

    #[test]
    fn test_single_first_approve_advances() {
        let actions = vec![action("m1", ActionType::Approve)];
        let outcome = evaluate(&step(ApprovalType::Single), &actions, &eligible(&["m1", "m2"]));
        assert_eq!(outcome, StepOutcome::Advance);
    }

    #[test]
    fn test_single_first_reject_rejects() {
        let actions = vec![action("m1", ActionType::Reject)];
        let outcome = evaluate(&step(ApprovalType::Single), &actions, &eligible(&["m1", "m2"]));
        assert_eq!(outcome, StepOutcome::Reject);
    }

    #[test]
    fn test_single_earliest_decisive_wins() {
        let approve = action("m2", ActionType::Approve);
        let mut reject = action("m1", ActionType::Reject);
        reject.created_at = approve.created_at - chrono::Duration::seconds(5);

        // Slice order deliberately reversed from arrival order.
        let outcome = evaluate(
            &step(ApprovalType::Single),
            &[approve.clone(), reject.clone()],
            &eligible(&["m1", "m2"]),
        );
        assert_eq!(outcome, StepOutcome::Reject);
    }

    #[test]
    fn test_comments_and_delegations_never_decide() {
        let actions = vec![
            action("m1", ActionType::Comment),
            action("m2", ActionType::Delegate),
        ];
        for approval_type in [ApprovalType::Single, ApprovalType::Multiple, ApprovalType::Any] {
            let outcome = evaluate(&step(approval_type), &actions, &eligible(&["m1", "m2"]));
            assert_eq!(outcome, StepOutcome::Pending);
        }
    }

    #[test]
    fn test_multiple_waits_for_all_eligible() {
        let actions = vec![action("m1", ActionType::Approve)];
        let outcome = evaluate(
            &step(ApprovalType::Multiple),
            &actions,
            &eligible(&["m1", "m2", "m3"]),
        );
        assert_eq!(outcome, StepOutcome::Pending);
    }

    #[test]
    fn test_multiple_all_approved_advances() {
        let actions = vec![
            action("m1", ActionType::Approve),
            action("m2", ActionType::Approve),
            action("m3", ActionType::Approve),
        ];
        let outcome = evaluate(
            &step(ApprovalType::Multiple),
            &actions,
            &eligible(&["m1", "m2", "m3"]),
        );
        assert_eq!(outcome, StepOutcome::Advance);
    }

    #[test]
    fn test_multiple_single_reject_is_fail_closed() {
        // Two approvals and one rejection: the rejection wins.
        let actions = vec![
            action("m1", ActionType::Approve),
            action("m2", ActionType::Approve),
            action("m3", ActionType::Reject),
        ];
        let outcome = evaluate(
            &step(ApprovalType::Multiple),
            &actions,
            &eligible(&["m1", "m2", "m3"]),
        );
        assert_eq!(outcome, StepOutcome::Reject);
    }

    #[test]
    fn test_multiple_zero_eligible_stays_pending() {
        let actions = vec![action("m1", ActionType::Approve)];
        let outcome = evaluate(&step(ApprovalType::Multiple), &actions, &[]);
        assert_eq!(outcome, StepOutcome::Pending);
    }

    #[test]
    fn test_any_first_approve_advances() {
        let actions = vec![
            action("m1", ActionType::Reject),
            action("m2", ActionType::Approve),
        ];
        let outcome = evaluate(
            &step(ApprovalType::Any),
            &actions,
            &eligible(&["m1", "m2", "m3"]),
        );
        assert_eq!(outcome, StepOutcome::Advance);
    }

    #[test]
    fn test_any_partial_rejections_stay_pending() {
        let actions = vec![
            action("m1", ActionType::Reject),
            action("m2", ActionType::Reject),
        ];
        let outcome = evaluate(
            &step(ApprovalType::Any),
            &actions,
            &eligible(&["m1", "m2", "m3"]),
        );
        assert_eq!(outcome, StepOutcome::Pending);
    }

    #[test]
    fn test_any_all_rejected_rejects() {
        let actions = vec![
            action("m1", ActionType::Reject),
            action("m2", ActionType::Reject),
            action("m3", ActionType::Reject),
        ];
        let outcome = evaluate(
            &step(ApprovalType::Any),
            &actions,
            &eligible(&["m1", "m2", "m3"]),
        );
        assert_eq!(outcome, StepOutcome::Reject);
    }

    #[test]
    fn test_any_zero_eligible_stays_pending() {
        let outcome = evaluate(&step(ApprovalType::Any), &[], &[]);
        assert_eq!(outcome, StepOutcome::Pending);
    }
}
