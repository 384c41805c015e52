//! Tests for status condition bookkeeping

use chrono::{Duration, Utc};
use lightspeed_operator::crd::Condition;
use lightspeed_operator::reconcilers::status::{conditions_equivalent, set_condition};

fn condition(type_: &str, status: &str, reason: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: Utc::now(),
        reason: reason.to_string(),
        message: String::new(),
        observed_generation: Some(1),
    }
}

#[test]
fn new_condition_is_appended() {
    let mut conditions = vec![condition("ApiReady", "True", "DeploymentAvailable")];
    set_condition(&mut conditions, condition("Reconciled", "True", "ReconcileSucceeded"));
    assert_eq!(conditions.len(), 2);
}

#[test]
fn same_status_keeps_transition_time() {
    let mut old = condition("ApiReady", "False", "DeploymentNotAvailable");
    old.last_transition_time = Utc::now() - Duration::hours(2);
    let since = old.last_transition_time;
    let mut conditions = vec![old];

    let mut update = condition("ApiReady", "False", "DeploymentNotFound");
    update.message = "app server deployment does not exist".to_string();
    set_condition(&mut conditions, update);

    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].last_transition_time, since);
    assert_eq!(conditions[0].reason, "DeploymentNotFound");
}

#[test]
fn status_flip_moves_transition_time() {
    let mut old = condition("ApiReady", "False", "DeploymentNotAvailable");
    old.last_transition_time = Utc::now() - Duration::hours(2);
    let since = old.last_transition_time;
    let mut conditions = vec![old];

    set_condition(&mut conditions, condition("ApiReady", "True", "DeploymentAvailable"));

    assert!(conditions[0].last_transition_time > since);
    assert_eq!(conditions[0].status, "True");
}

#[test]
fn equivalence_ignores_order_and_times() {
    let a = vec![
        condition("ApiReady", "True", "DeploymentAvailable"),
        condition("Reconciled", "True", "ReconcileSucceeded"),
    ];
    let mut b: Vec<_> = a.iter().rev().cloned().collect();
    for c in &mut b {
        c.last_transition_time = Utc::now() - Duration::minutes(5);
        c.observed_generation = Some(7);
    }
    assert!(conditions_equivalent(&a, &b));

    b[0].message = "changed".to_string();
    assert!(!conditions_equivalent(&a, &b));
    assert!(!conditions_equivalent(&a, &a[..1]));
}
