use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{room_topic, MessageId, RoomId, UserId},
    protocol::{
        MessageRecord, PresenceRecord, RawChannelEvent, ReactionKey, ReactionRecord, ReadReceipt,
        TableFilter, MESSAGES_TABLE, REACTIONS_TABLE, READ_RECEIPTS_TABLE,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Message(MessageRecord),
    Reaction(ReactionRecord),
    Receipt(ReadReceipt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    Message(MessageId),
    Reaction(ReactionKey),
    Receipt {
        message_id: MessageId,
        reader_id: UserId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Error(String),
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Inserted(RowChange),
    Updated(RowChange),
    Deleted(RowKey),
    PresenceSync(Vec<PresenceRecord>),
    StatusChanged(ChannelStatus),
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unrecognized change type {0:?}")]
    UnknownEventType(String),
    #[error("change on unsubscribed table {0:?}")]
    UnknownTable(String),
    #[error("malformed {table} row: {source}")]
    MalformedRow {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{table} row belongs to another room")]
    OtherRoom { table: String },
    #[error("unrecognized channel status {0:?}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(serde::Deserialize)]
struct MessageKeyRow {
    id: MessageId,
}

#[derive(serde::Deserialize)]
struct ReceiptKeyRow {
    message_id: MessageId,
    #[serde(alias = "user_id")]
    reader_id: UserId,
}

pub fn decode_event(raw: RawChannelEvent, room_id: RoomId) -> Result<ChannelEvent, EventDecodeError> {
    match raw {
        RawChannelEvent::PostgresChanges {
            event_type,
            table,
            new,
            old,
        } => {
            let kind = match event_type.to_ascii_uppercase().as_str() {
                "INSERT" => ChangeKind::Insert,
                "UPDATE" => ChangeKind::Update,
                "DELETE" => ChangeKind::Delete,
                _ => return Err(EventDecodeError::UnknownEventType(event_type)),
            };
            decode_change(kind, &table, new, old, room_id)
        }
        RawChannelEvent::PresenceSync { state } => {
            let records = state
                .into_values()
                .flatten()
                .filter_map(|meta| match serde_json::from_value::<PresenceRecord>(meta) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        debug!(%err, "channel: skipping malformed presence meta");
                        None
                    }
                })
                .collect();
            Ok(ChannelEvent::PresenceSync(records))
        }
        RawChannelEvent::System { status, message } => {
            let status = match status.to_ascii_uppercase().as_str() {
                "SUBSCRIBED" => ChannelStatus::Subscribed,
                "CHANNEL_ERROR" => {
                    ChannelStatus::Error(message.unwrap_or_else(|| "channel error".to_string()))
                }
                "TIMED_OUT" => ChannelStatus::TimedOut,
                "CLOSED" => ChannelStatus::Closed,
                _ => return Err(EventDecodeError::UnknownStatus(status)),
            };
            Ok(ChannelEvent::StatusChanged(status))
        }
    }
}

fn decode_change(
    kind: ChangeKind,
    table: &str,
    new: Value,
    old: Value,
    room_id: RoomId,
) -> Result<ChannelEvent, EventDecodeError> {
    let row = if kind == ChangeKind::Delete { old } else { new };
    ensure_room(table, &row, room_id)?;

    match (table, kind) {
        (MESSAGES_TABLE, ChangeKind::Delete) => {
            let key: MessageKeyRow = parse_row(table, row)?;
            Ok(ChannelEvent::Deleted(RowKey::Message(key.id)))
        }
        (MESSAGES_TABLE, _) => {
            let record: MessageRecord = parse_row(table, row)?;
            if record.room_id != room_id {
                return Err(EventDecodeError::OtherRoom {
                    table: table.to_string(),
                });
            }
            Ok(changed(kind, RowChange::Message(record)))
        }
        (REACTIONS_TABLE, ChangeKind::Delete) => {
            let key: ReactionKey = parse_row(table, row)?;
            Ok(ChannelEvent::Deleted(RowKey::Reaction(key)))
        }
        (REACTIONS_TABLE, _) => Ok(changed(kind, RowChange::Reaction(parse_row(table, row)?))),
        (READ_RECEIPTS_TABLE, ChangeKind::Delete) => {
            let key: ReceiptKeyRow = parse_row(table, row)?;
            Ok(ChannelEvent::Deleted(RowKey::Receipt {
                message_id: key.message_id,
                reader_id: key.reader_id,
            }))
        }
        (READ_RECEIPTS_TABLE, _) => Ok(changed(kind, RowChange::Receipt(parse_row(table, row)?))),
        _ => Err(EventDecodeError::UnknownTable(table.to_string())),
    }
}

fn changed(kind: ChangeKind, change: RowChange) -> ChannelEvent {
    match kind {
        ChangeKind::Update => ChannelEvent::Updated(change),
        _ => ChannelEvent::Inserted(change),
    }
}

fn parse_row<T: DeserializeOwned>(table: &str, row: Value) -> Result<T, EventDecodeError> {
    serde_json::from_value(row).map_err(|source| EventDecodeError::MalformedRow {
        table: table.to_string(),
        source,
    })
}

/// Rows that carry a `room_id` column must match the subscribed room.
fn ensure_room(table: &str, row: &Value, room_id: RoomId) -> Result<(), EventDecodeError> {
    match row.get("room_id").and_then(Value::as_str) {
        Some(raw) if raw != room_id.to_string() => Err(EventDecodeError::OtherRoom {
            table: table.to_string(),
        }),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait RealtimeSubscription: Send + Sync {
    async fn track(&self, presence: PresenceRecord) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

pub struct SubscriptionHandle {
    pub control: Arc<dyn RealtimeSubscription>,
    pub events: broadcast::Receiver<RawChannelEvent>,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open(&self, topic: &str, filters: Vec<TableFilter>)
        -> anyhow::Result<SubscriptionHandle>;
}

#[derive(Clone)]
pub struct ChannelClient {
    transport: Arc<dyn RealtimeTransport>,
}

impl ChannelClient {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self { transport }
    }

    pub async fn subscribe(&self, room_id: RoomId) -> anyhow::Result<ChannelHandle> {
        let topic = room_topic(room_id);
        let filters = [MESSAGES_TABLE, REACTIONS_TABLE, READ_RECEIPTS_TABLE]
            .into_iter()
            .map(|table| TableFilter::room_scoped(table, room_id))
            .collect();
        let handle = self.transport.open(&topic, filters).await?;
        debug!(%room_id, topic, "channel: subscription opened");
        Ok(ChannelHandle {
            room_id,
            control: handle.control,
            events: Some(handle.events),
            forwarder: None,
        })
    }
}

pub struct ChannelHandle {
    room_id: RoomId,
    control: Arc<dyn RealtimeSubscription>,
    events: Option<broadcast::Receiver<RawChannelEvent>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn control(&self) -> Arc<dyn RealtimeSubscription> {
        Arc::clone(&self.control)
    }

    pub fn start<M, F>(&mut self, sink: mpsc::UnboundedSender<M>, wrap: F)
    where
        M: Send + 'static,
        F: Fn(ChannelEvent) -> M + Send + 'static,
    {
        let Some(events) = self.events.take() else {
            return;
        };
        let room_id = self.room_id;
        self.forwarder = Some(tokio::spawn(async move {
            let mut stream = BroadcastStream::new(events);
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(raw) => match decode_event(raw, room_id) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(%room_id, %err, "channel: dropping undecodable event");
                            continue;
                        }
                    },
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(%room_id, missed, "channel: event stream lagged");
                        ChannelEvent::StatusChanged(ChannelStatus::Error(format!(
                            "lagged by {missed} events"
                        )))
                    }
                };
                if sink.send(wrap(event)).is_err() {
                    return;
                }
            }
            let _ = sink.send(wrap(ChannelEvent::StatusChanged(ChannelStatus::Closed)));
        }));
    }

    pub async fn unsubscribe(mut self) -> anyhow::Result<()> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.control.close().await
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
