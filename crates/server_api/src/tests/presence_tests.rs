use super::*;

use chrono::TimeZone;

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
        .single()
        .expect("timestamp")
}

fn tracker() -> (PresenceTracker, crate::bus::Connection) {
    let bus = Arc::new(EventBus::new(64));
    let connection = bus.subscribe(UserId(100));
    let tracker = PresenceTracker::new(
        bus,
        PresenceConfig {
            heartbeat_interval: Duration::from_secs(20),
            typing_timeout: Duration::from_secs(2),
        },
    );
    (tracker, connection)
}

fn drain(connection: &mut crate::bus::Connection) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Some(event) = connection.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn first_heartbeat_brings_user_online_once() {
    let (tracker, mut events) = tracker();
    let alice = UserId(1);

    tracker.heartbeat(alice, at(0));
    tracker.heartbeat(alice, at(1_000));

    let published = drain(&mut events);
    assert_eq!(published.len(), 1);
    assert!(matches!(
        &published[0],
        ServerEvent::PresenceChanged { presence } if presence.is_online && presence.user_id == alice
    ));
    assert_eq!(tracker.get(alice).expect("record").last_seen_at, at(1_000));
}

#[tokio::test]
async fn silent_user_goes_offline_within_two_intervals() {
    let (tracker, mut events) = tracker();
    let alice = UserId(1);
    tracker.heartbeat(alice, at(0));
    drain(&mut events);

    assert_eq!(tracker.sweep(at(39_000)), 0);
    assert!(tracker.is_online(alice));

    assert_eq!(tracker.sweep(at(40_000)), 1);
    assert!(!tracker.is_online(alice));
    let published = drain(&mut events);
    assert!(matches!(
        &published[..],
        [ServerEvent::PresenceChanged { presence }] if !presence.is_online
    ));
}

#[tokio::test]
async fn stale_typing_reverts_to_idle_on_sweep() {
    let (tracker, mut events) = tracker();
    let alice = UserId(1);
    tracker.set_typing(alice, true, at(0));
    let published = drain(&mut events);
    assert_eq!(published.len(), 2, "online then typing: {published:?}");

    assert_eq!(tracker.sweep(at(1_500)), 0);
    assert_eq!(tracker.sweep(at(2_000)), 1);
    assert_eq!(
        tracker.get(alice).expect("record").typing_state,
        TypingState::Idle
    );
    assert_eq!(
        drain(&mut events),
        vec![ServerEvent::TypingChanged {
            user_id: alice,
            typing_state: TypingState::Idle
        }]
    );
}

#[tokio::test]
async fn repeated_typing_signals_publish_one_change() {
    let (tracker, mut events) = tracker();
    let alice = UserId(1);
    tracker.heartbeat(alice, at(0));
    drain(&mut events);

    tracker.set_typing(alice, true, at(100));
    tracker.set_typing(alice, true, at(600));
    assert_eq!(drain(&mut events).len(), 1);

    // Refreshed at 600ms, so not stale at 2.1s.
    assert_eq!(tracker.sweep(at(2_100)), 0);
    tracker.set_typing(alice, false, at(2_200));
    assert_eq!(drain(&mut events).len(), 1);
}

#[tokio::test]
async fn going_offline_forces_typing_idle_first() {
    let (tracker, mut events) = tracker();
    let alice = UserId(1);
    tracker.set_typing(alice, true, at(0));
    drain(&mut events);

    tracker.go_offline(alice, at(500));
    let record = tracker.get(alice).expect("record");
    assert!(!record.is_online);
    assert_eq!(record.typing_state, TypingState::Idle);

    let published = drain(&mut events);
    assert!(matches!(
        &published[..],
        [
            ServerEvent::TypingChanged { typing_state: TypingState::Idle, .. },
            ServerEvent::PresenceChanged { presence },
        ] if !presence.is_online
    ));
}

#[tokio::test]
async fn stop_typing_for_offline_user_is_ignored() {
    let (tracker, mut events) = tracker();
    tracker.set_typing(UserId(5), false, at(0));
    tracker.go_offline(UserId(5), at(0));
    assert!(drain(&mut events).is_empty());
    assert!(tracker.get(UserId(5)).is_none());
}

#[tokio::test]
async fn offline_users_are_never_typing() {
    let (tracker, _events) = tracker();
    for user in 1..=5 {
        tracker.set_typing(UserId(user), true, at(user * 100));
    }
    tracker.go_offline(UserId(2), at(1_000));
    tracker.sweep(at(50_000));

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.len(), 5);
    assert!(snapshot.windows(2).all(|w| w[0].user_id.0 < w[1].user_id.0));
    for record in snapshot {
        assert!(record.is_online || record.typing_state == TypingState::Idle);
    }
}
