use super::*;

use chrono::TimeZone;
use shared::domain::{AttachmentId, MediaType, UserId};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn message(id: &str, seconds: i64, body: &str) -> Message {
    Message {
        id: MessageId::from(id),
        author_id: UserId(1),
        author_display_name: "alice".to_string(),
        body: Some(body.to_string()),
        attachments: Vec::new(),
        sent_at: at(seconds),
        edited_at: None,
        deleted: false,
    }
}

fn created(message: &Message) -> ServerEvent {
    ServerEvent::MessageCreated {
        message: message.clone(),
    }
}

fn ids(timeline: &Timeline) -> Vec<&str> {
    timeline.visible().iter().map(|m| m.id.as_str()).collect()
}

fn page(messages: Vec<Message>, has_more: bool) -> MessagePage {
    MessagePage { messages, has_more }
}

#[test]
fn duplicate_delivery_shows_message_once() {
    let mut timeline = Timeline::new();
    let m1 = message("m1", 1, "hi");

    assert_eq!(timeline.ingest(&created(&m1)), Ingested::Inserted);
    assert_eq!(timeline.ingest(&created(&m1)), Ingested::Duplicate);
    assert_eq!(timeline.merge_page(&page(vec![m1.clone()], false)), 0);

    assert_eq!(ids(&timeline), vec!["m1"]);
}

#[test]
fn visible_order_uses_sent_at_then_id() {
    let mut timeline = Timeline::new();
    for m in [message("b", 5, "x"), message("c", 1, "x"), message("a", 5, "x")] {
        timeline.ingest(&created(&m));
    }
    assert_eq!(ids(&timeline), vec!["c", "a", "b"]);
}

#[test]
fn optimistic_echo_is_dropped_and_ack_rekeys() {
    let mut timeline = Timeline::new();
    let local = message("m1", 100, "hi");
    timeline.insert_optimistic(local.clone());
    timeline.ingest(&created(&message("older", 50, "x")));
    assert!(timeline.is_pending(&local.id));

    let server_copy = message("m1", 60, "hi");
    assert_eq!(timeline.ingest(&created(&server_copy)), Ingested::Duplicate);
    assert_eq!(ids(&timeline), vec!["older", "m1"]);

    timeline.ack(server_copy.clone());
    assert!(!timeline.is_pending(&local.id));
    assert_eq!(timeline.get(&local.id).map(|m| m.sent_at), Some(at(60)));
    assert_eq!(timeline.len(), 2);
}

#[test]
fn edit_replaces_content_in_place() {
    let mut timeline = Timeline::new();
    for m in [message("m1", 1, "helo"), message("m2", 2, "next")] {
        timeline.ingest(&created(&m));
    }

    let mut edited = message("m1", 1, "hello");
    edited.edited_at = Some(at(10));
    assert_eq!(
        timeline.ingest(&ServerEvent::MessageEdited {
            message: edited
        }),
        Ingested::Updated
    );

    assert_eq!(ids(&timeline), vec!["m1", "m2"]);
    let m1 = timeline.get(&MessageId::from("m1")).expect("m1");
    assert_eq!(m1.body.as_deref(), Some("hello"));
    assert_eq!(m1.edited_at, Some(at(10)));
}

#[test]
fn edit_for_unknown_message_is_ignored() {
    let mut timeline = Timeline::new();
    let event = ServerEvent::MessageEdited {
        message: message("ghost", 1, "boo"),
    };
    assert_eq!(timeline.ingest(&event), Ingested::Ignored);
    assert!(timeline.is_empty());
}

#[test]
fn deleted_message_is_not_resurrected() {
    let mut timeline = Timeline::new();
    let m1 = message("m1", 1, "oops");
    timeline.ingest(&created(&m1));

    let delete = ServerEvent::MessageDeleted { id: m1.id.clone() };
    assert_eq!(timeline.ingest(&delete), Ingested::Removed);
    assert!(timeline.has_seen(&m1.id));

    assert_eq!(timeline.ingest(&created(&m1)), Ingested::Duplicate);
    assert_eq!(timeline.merge_page(&page(vec![m1.clone()], false)), 0);
    timeline.reset();
    assert_eq!(timeline.merge_page(&page(vec![m1], false)), 0);
    assert!(timeline.is_empty());
}

#[test]
fn delete_before_create_still_hides_the_message() {
    let mut timeline = Timeline::new();
    let m1 = message("m1", 1, "racing");
    let delete = ServerEvent::MessageDeleted { id: m1.id.clone() };
    assert_eq!(timeline.ingest(&delete), Ingested::Ignored);
    assert_ne!(timeline.ingest(&created(&m1)), Ingested::Inserted);
    assert!(timeline.is_empty());
}

#[test]
fn merge_page_prepends_history_and_tracks_has_more() {
    let mut timeline = Timeline::new();
    timeline.ingest(&created(&message("m3", 3, "live")));

    let older = page(vec![message("m3", 3, "live"), message("m2", 2, "x")], true);
    assert_eq!(timeline.merge_page(&older), 1);
    assert!(timeline.has_more());

    let oldest = page(vec![message("m1", 1, "x")], false);
    assert_eq!(timeline.merge_page(&oldest), 1);
    assert!(!timeline.has_more());
    assert_eq!(ids(&timeline), vec!["m1", "m2", "m3"]);
}

#[test]
fn reset_keeps_unacknowledged_sends() {
    let mut timeline = Timeline::new();
    timeline.ingest(&created(&message("old", 1, "x")));
    timeline.insert_optimistic(message("mine", 9, "sending"));

    let latest = page(vec![message("new", 5, "x")], false);
    timeline.reset_with_latest(&latest);

    assert_eq!(ids(&timeline), vec!["new", "mine"]);
    assert!(timeline.is_pending(&MessageId::from("mine")));
    assert!(!timeline.has_seen(&MessageId::from("old")));
}

#[test]
fn oldest_cursor_skips_pending_messages() {
    let mut timeline = Timeline::new();
    assert!(timeline.oldest_cursor().is_none());

    timeline.insert_optimistic(message("a-local", 0, "x"));
    timeline.ingest(&created(&message("m5", 5, "x")));
    timeline.ingest(&created(&message("m7", 7, "x")));

    let cursor = timeline.oldest_cursor().expect("cursor");
    assert_eq!(cursor.id.as_str(), "m5");
    assert_eq!(cursor.sent_at, at(5));
}

#[test]
fn failed_send_is_withdrawn() {
    let mut timeline = Timeline::new();
    let local = message("m1", 1, "lost");
    timeline.insert_optimistic(local.clone());

    let Withdrawal::Withdrawn(withdrawn) = timeline.fail_pending(&local.id) else {
        panic!("expected the send to be withdrawn");
    };
    assert_eq!(withdrawn.body.as_deref(), Some("lost"));
    assert!(timeline.is_empty());
    assert!(!timeline.has_seen(&local.id));
    assert!(matches!(timeline.fail_pending(&local.id), Withdrawal::NotPending));
}

#[test]
fn echoed_send_survives_a_lost_response() {
    let mut timeline = Timeline::new();
    let local = message("m1", 1, "made it");
    timeline.insert_optimistic(local.clone());

    let mut committed = local.clone();
    committed.sent_at = at(3);
    assert_eq!(timeline.ingest(&created(&committed)), Ingested::Duplicate);

    let Withdrawal::Confirmed(kept) = timeline.fail_pending(&local.id) else {
        panic!("a send the server echoed must not be withdrawn");
    };
    assert_eq!(kept.sent_at, at(3));
    assert_eq!(ids(&timeline), vec!["m1"]);
    assert!(!timeline.is_pending(&local.id));
    assert!(timeline.has_seen(&local.id));
}

#[test]
fn send_found_in_history_page_is_confirmed_on_failure() {
    let mut timeline = Timeline::new();
    let local = message("m1", 1, "made it");
    timeline.insert_optimistic(local.clone());

    assert_eq!(timeline.reset_with_latest(&page(vec![local.clone()], false)), 0);

    assert!(matches!(
        timeline.fail_pending(&local.id),
        Withdrawal::Confirmed(_)
    ));
    assert_eq!(ids(&timeline), vec!["m1"]);
}

#[test]
fn older_page_requested_before_a_reset_is_dropped() {
    let mut timeline = Timeline::new();
    let history: Vec<Message> = (2..=5).rev().map(|n| message(&format!("m{n}"), n, "x")).collect();
    timeline.reset_with_latest(&page(history, true));

    let cursor = timeline.oldest_cursor().expect("cursor");
    assert_eq!(cursor.id.as_str(), "m2");
    let generation = timeline.generation();

    timeline.reset_with_latest(&page(vec![message("m5", 5, "x"), message("m4", 4, "x")], true));
    let stale = page(vec![message("m1", 1, "x"), message("m0", 0, "x")], false);

    assert_eq!(timeline.merge_older(&stale, generation), None);
    assert_eq!(ids(&timeline), vec!["m4", "m5"]);
    assert!(timeline.has_more());

    let fresh = timeline.generation();
    let next = page(vec![message("m3", 3, "x"), message("m2", 2, "x")], true);
    assert_eq!(timeline.merge_older(&next, fresh), Some(2));
    assert_eq!(ids(&timeline), vec!["m2", "m3", "m4", "m5"]);
}

#[test]
fn uploaded_attachments_merge_without_duplicates() {
    let mut timeline = Timeline::new();
    let local = message("m1", 1, "see file");
    timeline.insert_optimistic(local.clone());

    let attachment = Attachment {
        id: AttachmentId(4),
        filename: "a.png".to_string(),
        url: "/attachments/4".to_string(),
        media_type: MediaType::Image,
        size_bytes: 10,
    };
    assert!(timeline.merge_attachments(&local.id, &[attachment.clone()]));
    assert!(!timeline.merge_attachments(&local.id, &[attachment.clone()]));

    // A text-only ack that raced the upload keeps the merged file.
    timeline.ack(message("m1", 2, "see file"));
    assert_eq!(
        timeline.get(&local.id).expect("m1").attachments,
        vec![attachment]
    );
}
