use super::*;

fn plan(send: usize, expect_received: usize) -> DriverPlan {
    DriverPlan {
        conversation: "abc123".to_owned(),
        send,
        expect_received,
        expect_ackd: send,
    }
}

#[test]
fn group_plan_expects_the_whole_conversation() {
    let plan = DriverPlan::for_group("abc123", 5, 4);
    assert_eq!(plan, DriverPlan::new("abc123", 5, 15));
    assert_eq!(plan.send, 5);
    assert_eq!(plan.expect_received, 20);
    assert_eq!(plan.expect_ackd, 20);

    let solo = DriverPlan::for_group("abc123", 5, 1);
    assert_eq!(solo.expect_received, 5);
    assert_eq!(solo.expect_ackd, 5);
}

#[test]
fn group_plan_succeeds_on_full_fan_out() {
    let mut state = DriverState::new("carol", DriverPlan::for_group("c", 1, 2));
    let text = state.message_text(0);
    state.mark_sending(&text);
    state.mark_sent();
    for _ in 0..2 {
        state.on_received();
    }
    state.on_ackd(Some(&text));
    assert!(!state.finished());

    state.on_ackd(Some("This is Message 0 from dave"));
    assert!(state.finished());
    assert!(state.succeeded());
    assert_eq!(state.report.latencies.len(), 1);
}

#[test]
fn message_texts_are_numbered_per_user() {
    let state = DriverState::new("alice", plan(2, 0));
    assert_eq!(state.message_text(0), "This is Message 0 from alice");
    assert_eq!(state.message_text(1), "This is Message 1 from alice");
}

#[test]
fn finishes_once_all_totals_are_reached() {
    let mut state = DriverState::new("alice", plan(2, 1));
    assert!(!state.finished());

    for index in 0..2 {
        let text = state.message_text(index);
        state.mark_sending(&text);
        state.mark_sent();
    }
    assert!(!state.finished());

    state.on_ackd(Some("This is Message 0 from alice"));
    state.on_ackd(Some("This is Message 1 from alice"));
    assert!(!state.finished());

    state.on_received();
    assert!(state.finished());
    assert!(state.succeeded());
    assert_eq!(state.report.latencies.len(), 2);
}

#[test]
fn ack_for_unknown_text_counts_without_latency() {
    let mut state = DriverState::new("alice", plan(1, 0));
    state.on_ackd(Some("sent by another client"));
    state.on_ackd(None);
    assert_eq!(state.report.ackd, 2);
    assert!(state.report.latencies.is_empty());
}

#[test]
fn surplus_events_finish_but_do_not_succeed() {
    let mut state = DriverState::new("alice", plan(0, 1));
    state.on_received();
    state.on_received();
    assert!(state.finished());
    assert!(!state.succeeded());
}

#[test]
fn empty_plan_is_finished_immediately() {
    let state = DriverState::new("alice", plan(0, 0));
    assert!(state.finished());
    assert!(state.succeeded());
}
