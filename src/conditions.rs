//! Kubernetes-standard status condition helpers
//!
//! Constants and builders for the conditions the controller publishes on
//! NatsCluster status, plus the CRD condition types the registrar inspects.

use crate::crd::ClusterCondition;
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

// NatsCluster condition types
pub const CLUSTER_CONDITION_READY: &str = "Ready";
pub const CLUSTER_CONDITION_PROGRESSING: &str = "Progressing";

// CustomResourceDefinition condition types
pub const CRD_CONDITION_ESTABLISHED: &str = "Established";
pub const CRD_CONDITION_NAMES_ACCEPTED: &str = "NamesAccepted";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ClusterCondition {
    ClusterCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ClusterCondition>, new: ClusterCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// True when both lists carry the same type/status/reason for every condition,
/// ignoring timestamps and messages.
pub fn same_conditions(a: &[ClusterCondition], b: &[ClusterCondition]) -> bool {
    a.len() == b.len()
        && a.iter().all(|x| {
            b.iter()
                .any(|y| y.r#type == x.r#type && y.status == x.status && y.reason == x.reason)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_condition() {
        let cond = build_condition(CLUSTER_CONDITION_READY, CONDITION_TRUE, "AllReady", "All servers ready");
        assert_eq!(cond.r#type, "Ready");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("AllReady"));
        assert_eq!(cond.message.as_deref(), Some("All servers ready"));
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "OK", "ok"));
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = vec![ClusterCondition {
            r#type: "Ready".to_string(),
            status: CONDITION_TRUE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("First".to_string()),
            message: Some("first".to_string()),
        }];

        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "Second", "second"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].reason.as_deref(), Some("Second"));
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_status_change() {
        let mut conditions = vec![ClusterCondition {
            r#type: "Ready".to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("NotReady".to_string()),
            message: Some("not ready".to_string()),
        }];

        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "AllReady", "all ready"));

        assert_eq!(conditions.len(), 1);
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_same_conditions_ignores_timestamps() {
        let a = vec![build_condition("Ready", CONDITION_TRUE, "AllReady", "3/3")];
        let mut b = a.clone();
        b[0].last_transition_time = Some("2024-01-01T00:00:00Z".to_string());
        b[0].message = Some("three of three".to_string());
        assert!(same_conditions(&a, &b));

        b[0].status = CONDITION_FALSE.to_string();
        assert!(!same_conditions(&a, &b));
    }
}
