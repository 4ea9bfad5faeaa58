use super::*;
use chrono::TimeZone;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).single().expect("valid timestamp")
}

fn timeline() -> RoomTimeline {
    RoomTimeline::new(RoomId::from("R1"), Duration::from_secs(120))
}

fn server_message(id: &str, sender: &str, content: &str, seconds: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        room_id: RoomId::from("R1"),
        sender_id: UserId::from(sender),
        kind: MessageKind::Text,
        content: content.into(),
        created_at: at(seconds),
        client_message_id: None,
    }
}

fn contents(timeline: &RoomTimeline) -> Vec<String> {
    timeline
        .entries()
        .iter()
        .map(|entry| entry.message.content.clone())
        .collect()
}

#[test]
fn echo_without_key_confirms_the_optimistic_entry() {
    let mut timeline = timeline();
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(0));
    assert!(local.id.is_temporary());

    let outcome = timeline.append_incoming(server_message("m1", "A", "hello", 1));

    assert_eq!(outcome, IncomingOutcome::Confirmed { temp_id: local.id.clone() });
    assert_eq!(timeline.len(), 1);
    let entry = &timeline.entries()[0];
    assert_eq!(entry.message.id, MessageId::from("m1"));
    assert_eq!(entry.delivery, DeliveryState::Confirmed);
    assert_eq!(entry.message.client_message_id, local.client_message_id);
}

#[test]
fn echo_with_key_confirms_exactly_that_entry() {
    let mut timeline = timeline();
    let first = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "ok".into(), at(0));
    let second = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "ok".into(), at(0));

    let mut echo = server_message("m2", "A", "ok", 1);
    echo.client_message_id = second.client_message_id.clone();
    assert_eq!(
        timeline.append_incoming(echo),
        IncomingOutcome::Confirmed { temp_id: second.id.clone() }
    );

    assert_eq!(timeline.get(&first.id).expect("first").delivery, DeliveryState::Pending);
    assert_eq!(timeline.len(), 2);
}

#[test]
fn same_echo_twice_is_a_duplicate() {
    let mut timeline = timeline();
    timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(0));
    timeline.append_incoming(server_message("m1", "A", "hello", 1));

    assert_eq!(
        timeline.append_incoming(server_message("m1", "A", "hello", 1)),
        IncomingOutcome::Duplicate
    );
    assert_eq!(timeline.len(), 1);
}

#[test]
fn confirmed_local_entry_absorbs_one_echo_under_another_id() {
    let mut timeline = timeline();
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hi".into(), at(0));
    timeline.confirm(&local.id, server_message("gql-1", "A", "hi", 1));

    assert_eq!(
        timeline.append_incoming(server_message("ws-1", "A", "hi", 1)),
        IncomingOutcome::Duplicate
    );
    assert_eq!(
        timeline.append_incoming(server_message("ws-1", "A", "hi", 1)),
        IncomingOutcome::Duplicate
    );
    assert_eq!(timeline.len(), 1);
    assert!(timeline.get(&MessageId::from("ws-1")).is_some());
}

#[test]
fn history_copy_of_live_message_under_other_id_is_absorbed() {
    let mut timeline = timeline();
    timeline.append_incoming(server_message("live-1", "B", "hi", 0));

    let merge = timeline.load_history(vec![server_message("B-1700000000000", "B", "hi", 0)]);

    assert_eq!(merge.duplicates, 1);
    assert_eq!(merge.appended, 0);
    assert_eq!(timeline.len(), 1);
}

#[test]
fn same_body_outside_window_is_kept() {
    let mut timeline = timeline();
    timeline.append_incoming(server_message("m1", "B", "ok", 0));
    timeline.append_incoming(server_message("m2", "B", "ok", 300));
    timeline.append_incoming(server_message("m3", "C", "ok", 301));

    assert_eq!(contents(&timeline), vec!["ok", "ok", "ok"]);
}

#[test]
fn each_entry_absorbs_at_most_one_copy() {
    let mut timeline = timeline();
    timeline.append_incoming(server_message("m1", "B", "ok", 0));

    let merge = timeline.load_history(vec![
        server_message("h1", "B", "ok", 1),
        server_message("h2", "B", "ok", 2),
    ]);

    assert_eq!(merge.duplicates, 1);
    assert_eq!(merge.appended, 1);
    assert_eq!(timeline.len(), 2);
}

#[test]
fn history_after_live_messages_resorts_without_duplicates() {
    let mut timeline = timeline();
    timeline.append_incoming(server_message("m3", "B", "third", 30));
    timeline.append_incoming(server_message("m4", "B", "fourth", 40));

    let merge = timeline.load_history(vec![
        server_message("m3", "B", "third", 30),
        server_message("m2", "A", "second", 20),
        server_message("m1", "B", "first", 10),
    ]);

    assert_eq!(merge.appended, 2);
    assert_eq!(merge.duplicates, 1);
    assert_eq!(contents(&timeline), vec!["first", "second", "third", "fourth"]);
}

#[test]
fn equal_timestamps_keep_arrival_order() {
    let mut timeline = timeline();
    timeline.append_incoming(server_message("m1", "B", "one", 5));
    timeline.append_incoming(server_message("m2", "C", "two", 5));
    timeline.load_history(vec![server_message("m0", "B", "zero", 5)]);

    assert_eq!(contents(&timeline), vec!["one", "two", "zero"]);
}

#[test]
fn history_confirms_pending_send() {
    let mut timeline = timeline();
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(50));

    let merge = timeline.load_history(vec![
        server_message("m1", "B", "earlier", 10),
        server_message("m9", "A", "hello", 51),
    ]);

    assert_eq!(merge.confirmed, vec![local.id]);
    assert_eq!(contents(&timeline), vec!["earlier", "hello"]);
}

#[test]
fn optimistic_entry_goes_to_the_end_even_with_a_lagging_clock() {
    let mut timeline = timeline();
    timeline.append_incoming(server_message("m1", "B", "from server", 100));
    timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "mine".into(), at(90));

    assert_eq!(contents(&timeline), vec!["from server", "mine"]);
}

#[tokio::test(start_paused = true)]
async fn dispatched_entry_fails_after_timeout_and_can_be_retried() {
    let mut timeline = timeline();
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(0));
    let undispatched = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "queued".into(), at(0));
    timeline.mark_dispatched(&local.id, Instant::now());

    tokio::time::advance(Duration::from_secs(11)).await;
    let expired = timeline.expire_pending(Instant::now(), Duration::from_secs(10));

    assert_eq!(expired, vec![local.id.clone()]);
    assert!(matches!(
        timeline.get(&local.id).expect("entry").delivery,
        DeliveryState::Failed { .. }
    ));
    assert_eq!(
        timeline.get(&undispatched.id).expect("entry").delivery,
        DeliveryState::Pending
    );

    let retried = timeline.retry(&local.id).expect("retry");
    assert_eq!(retried.client_message_id, local.client_message_id);
    assert_eq!(timeline.pending_outbound().len(), 2);
}

#[test]
fn retry_of_unknown_or_pending_entry_is_rejected() {
    let mut timeline = timeline();
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(0));

    assert_eq!(
        timeline.retry(&local.id),
        Err(SendError::UnknownMessage(local.id.clone()))
    );
    assert!(timeline.retry(&MessageId::from("nope")).is_err());
}

#[test]
fn late_echo_confirms_a_failed_entry() {
    let mut timeline = timeline();
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(0));
    timeline.mark_failed(&local.id, "not confirmed in time");

    assert_eq!(
        timeline.append_incoming(server_message("m1", "A", "hello", 2)),
        IncomingOutcome::Confirmed { temp_id: local.id }
    );
    assert!(timeline.pending_outbound().is_empty());
}

#[test]
fn server_rejection_fails_entry_by_client_id() {
    let mut timeline = timeline();
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(0));
    let client_id = local.client_message_id.clone().expect("client id");

    assert_eq!(
        timeline.fail_by_client_id(&client_id, "room closed"),
        Some(local.id.clone())
    );
    assert_eq!(
        timeline.get(&local.id).expect("entry").delivery,
        DeliveryState::Failed {
            reason: "room closed".into()
        }
    );
}

#[test]
fn collaborator_confirmation_after_live_push_drops_the_local_copy() {
    let mut timeline = timeline();
    let mut echo = server_message("m1", "A", "hello", 1);
    let local = timeline.append_optimistic(UserId::from("A"), MessageKind::Text, "hello".into(), at(0));
    echo.client_message_id = local.client_message_id.clone();
    timeline.append_incoming(echo.clone());

    assert!(!timeline.confirm(&local.id, echo));
    assert_eq!(timeline.len(), 1);
}
