mod common;

use std::time::Duration;

use common::*;
use room_sync::{LoadState, SyncClient, SyncConfig};

#[tokio::test(start_paused = true)]
async fn switching_rooms_tears_the_previous_room_down_first() {
    let transport = FakeTransport::new();
    let backend = FakeBackend::new();
    backend.seed(room(1), classmate(1), "first room");
    backend.seed(room(2), classmate(2), "second room");
    let mut client = SyncClient::new(
        SyncConfig::default(),
        me(),
        transport.clone(),
        backend.clone(),
    );

    let first = client.enter_room(room(1)).await;
    let view = view_until(first, |v| v.is_connected() && v.load_state == LoadState::Ready).await;
    assert_eq!(view.messages.len(), 1);
    let first_subscription = transport.latest();

    let second = client.enter_room(room(2)).await;
    assert!(first_subscription.is_closed());
    let view = view_until(second, |v| v.is_connected() && v.load_state == LoadState::Ready).await;
    assert_eq!(view.room_id, room(2));
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].body(), Some("second room"));
    assert_eq!(transport.channel_count(), 2);

    // A late row on the old room's channel never reaches the new room.
    transport.emit_to(0, {
        let record = message(99, room(1), classmate(1), "late");
        shared::protocol::RawChannelEvent::PostgresChanges {
            event_type: "INSERT".into(),
            table: shared::protocol::MESSAGES_TABLE.into(),
            new: serde_json::to_value(&record).expect("serialize"),
            old: serde_json::Value::Null,
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let active = client.room().expect("active room");
    assert_eq!(active.room_id(), room(2));
    assert_eq!(active.view().messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reentering_the_same_room_keeps_the_session() {
    let transport = FakeTransport::new();
    let backend = FakeBackend::new();
    let mut client = SyncClient::new(
        SyncConfig::default(),
        me(),
        transport.clone(),
        backend.clone(),
    );

    let handle = client.enter_room(room(1)).await;
    view_until(handle, |v| v.is_connected()).await;
    client.enter_room(room(1)).await;
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn leaving_closes_the_room_and_its_handle() {
    let transport = FakeTransport::new();
    let backend = FakeBackend::new();
    let mut client = SyncClient::new(
        SyncConfig::default(),
        me(),
        transport.clone(),
        backend.clone(),
    );

    backend.seed(room(1), classmate(1), "bye");

    let handle = client.enter_room(room(1)).await;
    view_until(handle, |v| v.messages.len() == 1).await;
    let mut view = handle.watch_view();

    client.leave_room().await;
    assert!(client.room().is_none());
    assert!(transport.latest().is_closed());
    // The session is gone once every published update has drained.
    while view.changed().await.is_ok() {}
    assert!(view.borrow().messages.is_empty());
}
