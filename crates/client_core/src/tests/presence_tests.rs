use super::*;

use std::sync::Mutex as StdMutex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Signal {
    Presence(PresenceStatus),
    Typing(bool),
}

#[derive(Default)]
struct RecordingSignals {
    sent: StdMutex<Vec<Signal>>,
}

impl RecordingSignals {
    fn sent(&self) -> Vec<Signal> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PresenceSignals for RecordingSignals {
    async fn send_presence(&self, status: PresenceStatus) -> ClientResult<()> {
        self.sent.lock().expect("lock").push(Signal::Presence(status));
        Ok(())
    }

    async fn send_typing(&self, typing: bool) -> ClientResult<()> {
        self.sent.lock().expect("lock").push(Signal::Typing(typing));
        Ok(())
    }
}

fn controller(signals: &Arc<RecordingSignals>) -> TypingController {
    TypingController::new(
        signals.clone(),
        DEFAULT_TYPING_DEBOUNCE,
        DEFAULT_TYPING_TIMEOUT,
    )
}

#[tokio::test(start_paused = true)]
async fn keystrokes_within_debounce_send_one_start() {
    let signals = Arc::new(RecordingSignals::default());
    let typing = controller(&signals);

    typing.keystroke().await;
    time::sleep(Duration::from_millis(100)).await;
    typing.keystroke().await;
    time::sleep(Duration::from_millis(100)).await;
    typing.keystroke().await;

    assert_eq!(signals.sent(), vec![Signal::Typing(true)]);
    assert!(typing.is_typing().await);
}

#[tokio::test(start_paused = true)]
async fn typing_stops_two_seconds_after_last_keystroke() {
    let signals = Arc::new(RecordingSignals::default());
    let typing = controller(&signals);

    typing.keystroke().await;
    time::sleep(Duration::from_millis(1_500)).await;
    typing.keystroke().await;

    // 1.9s after the last keystroke: still typing.
    time::sleep(Duration::from_millis(1_900)).await;
    assert!(typing.is_typing().await);

    time::sleep(Duration::from_millis(200)).await;
    assert!(!typing.is_typing().await);
    assert_eq!(
        signals.sent(),
        vec![Signal::Typing(true), Signal::Typing(true), Signal::Typing(false)]
    );
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_cancels_the_timer() {
    let signals = Arc::new(RecordingSignals::default());
    let typing = controller(&signals);

    typing.keystroke().await;
    typing.stop().await;
    time::sleep(Duration::from_secs(5)).await;
    typing.stop().await;

    assert_eq!(
        signals.sent(),
        vec![Signal::Typing(true), Signal::Typing(false)]
    );
}

#[tokio::test(start_paused = true)]
async fn heartbeat_fires_immediately_and_on_each_interval() {
    let signals = Arc::new(RecordingSignals::default());
    let task = spawn_heartbeat(signals.clone(), Duration::from_secs(20));

    time::sleep(Duration::from_secs(41)).await;
    task.abort();
    time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        signals.sent(),
        vec![Signal::Presence(PresenceStatus::Online); 3]
    );
}

fn record(user: i64, is_online: bool, typing_state: TypingState) -> PresenceRecord {
    PresenceRecord {
        user_id: UserId(user),
        is_online,
        last_seen_at: Utc::now(),
        typing_state,
    }
}

#[test]
fn view_tracks_presence_and_typing_events() {
    let mut view = PresenceView::default();
    view.seed(vec![record(1, true, TypingState::Idle), record(2, false, TypingState::Idle)]);
    assert_eq!(view.online_users(), vec![UserId(1)]);

    assert!(view.apply(&ServerEvent::TypingChanged {
        user_id: UserId(1),
        typing_state: TypingState::Typing,
    }));
    assert_eq!(view.typing_users(None), vec![UserId(1)]);
    assert!(view.typing_users(Some(UserId(1))).is_empty());

    assert!(view.apply(&ServerEvent::PresenceChanged {
        presence: record(1, false, TypingState::Typing),
    }));
    let alice = view.get(UserId(1)).expect("record");
    assert!(!alice.is_online);
    assert_eq!(alice.typing_state, TypingState::Idle);
    assert!(view.online_users().is_empty());
}
