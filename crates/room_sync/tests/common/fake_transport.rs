use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use room_sync::{RealtimeSubscription, RealtimeTransport, SubscriptionHandle};
use serde_json::{json, Value};
use shared::protocol::{MessageRecord, PresenceRecord, RawChannelEvent, TableFilter};
use tokio::sync::broadcast;

/// How the next `open` call behaves.
#[derive(Debug, Clone)]
pub enum OpenScript {
    /// Opens and reports `SUBSCRIBED` right away.
    Subscribe,
    /// Opens but never reports a status.
    Silent,
    /// `open` itself fails.
    Fail(String),
}

#[derive(Default)]
pub struct FakeSubscription {
    pub topic: String,
    pub filters: Vec<TableFilter>,
    tracked: Mutex<Vec<PresenceRecord>>,
    closed: AtomicBool,
}

impl FakeSubscription {
    pub fn tracked(&self) -> Vec<PresenceRecord> {
        self.tracked.lock().expect("tracked lock").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeSubscription for FakeSubscription {
    async fn track(&self, presence: PresenceRecord) -> anyhow::Result<()> {
        self.tracked.lock().expect("tracked lock").push(presence);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeChannel {
    events: broadcast::Sender<RawChannelEvent>,
    subscription: Arc<FakeSubscription>,
}

#[derive(Default)]
struct TransportState {
    script: VecDeque<OpenScript>,
    opens: usize,
    channels: Vec<FakeChannel>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<TransportState>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, steps: impl IntoIterator<Item = OpenScript>) {
        self.state.lock().expect("transport lock").script.extend(steps);
    }

    /// Number of `open` calls, failed ones included.
    pub fn opens(&self) -> usize {
        self.state.lock().expect("transport lock").opens
    }

    pub fn subscription(&self, index: usize) -> Arc<FakeSubscription> {
        let state = self.state.lock().expect("transport lock");
        Arc::clone(&state.channels[index].subscription)
    }

    pub fn latest(&self) -> Arc<FakeSubscription> {
        let state = self.state.lock().expect("transport lock");
        Arc::clone(&state.channels.last().expect("no channel opened").subscription)
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().expect("transport lock").channels.len()
    }

    /// Pushes a raw payload into the most recently opened channel.
    pub fn emit(&self, event: RawChannelEvent) {
        let state = self.state.lock().expect("transport lock");
        let channel = state.channels.last().expect("no channel opened");
        let _ = channel.events.send(event);
    }

    pub fn emit_to(&self, index: usize, event: RawChannelEvent) {
        let state = self.state.lock().expect("transport lock");
        let _ = state.channels[index].events.send(event);
    }

    pub fn emit_status(&self, status: &str) {
        self.emit(RawChannelEvent::System {
            status: status.to_string(),
            message: Some(format!("{status} injected by test")),
        });
    }

    pub fn emit_row(&self, event_type: &str, table: &str, new: Value, old: Value) {
        self.emit(RawChannelEvent::PostgresChanges {
            event_type: event_type.to_string(),
            table: table.to_string(),
            new,
            old,
        });
    }

    pub fn emit_message_insert(&self, record: &MessageRecord) {
        self.emit_row(
            "INSERT",
            shared::protocol::MESSAGES_TABLE,
            serde_json::to_value(record).expect("serialize message"),
            Value::Null,
        );
    }

    pub fn emit_presence(&self, records: &[PresenceRecord]) {
        let state = records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                (
                    format!("presence-{i}"),
                    vec![serde_json::to_value(record).expect("serialize presence")],
                )
            })
            .collect();
        self.emit(RawChannelEvent::PresenceSync { state });
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn open(
        &self,
        topic: &str,
        filters: Vec<TableFilter>,
    ) -> anyhow::Result<SubscriptionHandle> {
        let mut state = self.state.lock().expect("transport lock");
        state.opens += 1;
        let step = state.script.pop_front().unwrap_or(OpenScript::Subscribe);

        let announce = match step {
            OpenScript::Fail(reason) => return Err(anyhow!(reason)),
            OpenScript::Subscribe => true,
            OpenScript::Silent => false,
        };

        let (events, receiver) = broadcast::channel(64);
        if announce {
            let _ = events.send(RawChannelEvent::System {
                status: "SUBSCRIBED".to_string(),
                message: None,
            });
        }
        let subscription = Arc::new(FakeSubscription {
            topic: topic.to_string(),
            filters,
            ..FakeSubscription::default()
        });
        state.channels.push(FakeChannel {
            events,
            subscription: Arc::clone(&subscription),
        });

        Ok(SubscriptionHandle {
            control: subscription,
            events: receiver,
        })
    }
}

pub fn presence(user_id: shared::domain::UserId, typing: bool) -> PresenceRecord {
    PresenceRecord {
        user_id,
        display_name: format!("user-{user_id}"),
        typing,
        last_seen: chrono::Utc::now(),
    }
}

pub fn reaction_row(message_id: i64, user_id: shared::domain::UserId, emoji: &str) -> Value {
    json!({
        "message_id": message_id,
        "user_id": user_id,
        "emoji": emoji,
        "created_at": chrono::Utc::now(),
    })
}
