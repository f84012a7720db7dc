use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::domain::MessageId;
use storage::{NewMessage, Storage};

#[tokio::test]
async fn walking_pages_yields_every_live_message_once_in_decreasing_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let author = storage.create_user("pager").await.expect("user");

    // Three messages share every timestamp to exercise the id tie-break.
    let mut live = HashSet::new();
    for i in 0..45 {
        let id = MessageId(format!("msg-{i:03}"));
        let sent_at = DateTime::<Utc>::from_timestamp(1_700_000_000 + i / 3, 0).expect("ts");
        storage
            .insert_message(&NewMessage {
                id: &id,
                author_id: author,
                body: Some("x"),
                sent_at,
            })
            .await
            .expect("insert");
        if i % 7 == 0 {
            storage.tombstone_message(&id).await.expect("tombstone");
        } else {
            live.insert(id);
        }
    }

    let mut seen = Vec::new();
    let mut cursor: Option<(DateTime<Utc>, MessageId)> = None;
    loop {
        let before = cursor.as_ref().map(|(sent_at, id)| (*sent_at, id));
        let page = storage.page_messages(before, 4).await.expect("page");
        let Some(oldest) = page.last() else {
            break;
        };
        cursor = Some((oldest.sent_at, oldest.id.clone()));
        let short = page.len() < 4;
        seen.extend(page.into_iter().map(|m| (m.sent_at, m.id)));
        if short {
            break;
        }
    }

    for pair in seen.windows(2) {
        assert!(pair[0] > pair[1], "pages must be strictly decreasing");
    }
    let ids: HashSet<_> = seen.into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, live);
}
