//! In-memory collaborators and helpers shared by the session tests.

#![allow(dead_code)]

pub mod fake_backend;
pub mod fake_transport;

use std::{future::Future, time::Duration};

use room_sync::{LocalUser, RoomEvent, RoomHandle, RoomView};
use shared::domain::{RoomId, UserId};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use fake_backend::*;
pub use fake_transport::*;

pub fn me() -> LocalUser {
    LocalUser {
        user_id: UserId(Uuid::from_u128(1)),
        display_name: "Me".to_string(),
    }
}

pub fn classmate(n: u128) -> UserId {
    UserId(Uuid::from_u128(100 + n))
}

pub fn room(n: u128) -> RoomId {
    RoomId(Uuid::from_u128(1000 + n))
}

/// Waits until the published view satisfies `predicate`.
pub async fn view_until(handle: &RoomHandle, predicate: impl Fn(&RoomView) -> bool) -> RoomView {
    let mut view = handle.watch_view();
    let matched = tokio::time::timeout(Duration::from_secs(600), view.wait_for(|v| predicate(v)))
        .await
        .expect("view predicate timed out")
        .expect("room closed")
        .clone();
    matched
}

/// Polls `condition` while letting the runtime make progress.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

/// Drains every event currently buffered for a subscriber.
pub fn drain(events: &mut broadcast::Receiver<RoomEvent>) -> Vec<RoomEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub async fn with_timeout<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(600), future)
        .await
        .expect("operation timed out")
}
