use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use room_sync::{Backend, Fields, RowMatch};
use serde_json::{json, Value};
use shared::{
    domain::{MessageId, RoomId, UserId},
    error::BackendError,
    protocol::{
        AuthorProfile, MessageRecord, Metadata, MESSAGES_TABLE, PROFILES_TABLE, REACTIONS_TABLE,
        READ_RECEIPTS_TABLE,
    },
};

/// Operation names failures can be scripted against.
pub const FETCH_PAGE: &str = "fetch_page";
pub const UPLOAD: &str = "upload";

#[derive(Default)]
struct BackendState {
    messages: Vec<MessageRecord>,
    next_id: i64,
    reactions: Vec<Value>,
    profiles: Vec<AuthorProfile>,
    receipt_batches: Vec<Vec<i64>>,
    updates: Vec<(i64, Fields)>,
    uploads: Vec<String>,
    latest_fetches: usize,
    failures: HashMap<String, VecDeque<BackendError>>,
}

impl BackendState {
    fn scripted_failure(&mut self, op: &str) -> Result<(), BackendError> {
        match self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

pub fn message(id: i64, room_id: RoomId, author: UserId, body: &str) -> MessageRecord {
    MessageRecord {
        id: MessageId(id),
        room_id,
        author_id: author,
        body: Some(body.to_string()),
        image_url: None,
        created_at: Utc::now(),
        edited_at: None,
        deleted_at: None,
        metadata: Metadata::new(),
        author: None,
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores a confirmed row as if another client had written it.
    pub fn seed(&self, room_id: RoomId, author: UserId, body: &str) -> MessageRecord {
        let mut state = self.state.lock().expect("backend lock");
        state.next_id += 1;
        let record = message(state.next_id, room_id, author, body);
        state.messages.push(record.clone());
        record
    }

    pub fn seed_profile(&self, user_id: UserId, display_name: &str) {
        self.state
            .lock()
            .expect("backend lock")
            .profiles
            .push(AuthorProfile {
                user_id,
                display_name: display_name.to_string(),
                avatar_url: None,
            });
    }

    pub fn seed_reaction(&self, room_id: RoomId, message_id: i64, user_id: UserId, emoji: &str) {
        let mut row = super::reaction_row(message_id, user_id, emoji);
        row["room_id"] = json!(room_id);
        self.state.lock().expect("backend lock").reactions.push(row);
    }

    /// Queues `err` for the next call of `op` (a table name, `FETCH_PAGE` or `UPLOAD`).
    pub fn fail_next(&self, op: &str, err: BackendError) {
        self.state
            .lock()
            .expect("backend lock")
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.state.lock().expect("backend lock").messages.clone()
    }

    pub fn last_message(&self) -> MessageRecord {
        self.messages().last().cloned().expect("no message stored")
    }

    pub fn reactions(&self) -> Vec<Value> {
        self.state.lock().expect("backend lock").reactions.clone()
    }

    pub fn receipt_batches(&self) -> Vec<Vec<i64>> {
        self.state.lock().expect("backend lock").receipt_batches.clone()
    }

    pub fn updates(&self) -> Vec<(i64, Fields)> {
        self.state.lock().expect("backend lock").updates.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().expect("backend lock").uploads.clone()
    }

    /// Number of newest-page fetches (initial loads and resyncs).
    pub fn latest_fetches(&self) -> usize {
        self.state.lock().expect("backend lock").latest_fetches
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn fetch_page(
        &self,
        room_id: RoomId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        let mut state = self.state.lock().expect("backend lock");
        if before.is_none() {
            state.latest_fetches += 1;
        }
        state.scripted_failure(FETCH_PAGE)?;
        let mut page: Vec<MessageRecord> = state
            .messages
            .iter()
            .filter(|m| m.room_id == room_id && before.map_or(true, |b| m.id < b))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn select_rows(&self, table: &str, filter: RowMatch) -> Result<Vec<Value>, BackendError> {
        let mut state = self.state.lock().expect("backend lock");
        state.scripted_failure(table)?;
        let rows = match table {
            REACTIONS_TABLE => state.reactions.clone(),
            PROFILES_TABLE => state
                .profiles
                .iter()
                .map(|profile| json!({ "id": profile.user_id, "display_name": profile.display_name }))
                .collect(),
            _ => Vec::new(),
        };
        Ok(rows
            .into_iter()
            .filter(|row| {
                row.get(&filter.column)
                    .map_or(true, |value| filter.any_of.contains(value))
            })
            .collect())
    }

    async fn insert_rows(&self, table: &str, rows: Vec<Fields>) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("backend lock");
        state.scripted_failure(table)?;
        match table {
            MESSAGES_TABLE => {
                for mut row in rows {
                    state.next_id += 1;
                    row.insert("id".into(), json!(state.next_id));
                    row.insert("created_at".into(), json!(Utc::now()));
                    let record: MessageRecord = serde_json::from_value(Value::Object(row))?;
                    state.messages.push(record);
                }
            }
            REACTIONS_TABLE => {
                for mut row in rows {
                    row.insert("created_at".into(), json!(Utc::now()));
                    state.reactions.push(Value::Object(row));
                }
            }
            READ_RECEIPTS_TABLE => {
                let batch = rows
                    .iter()
                    .filter_map(|row| row.get("message_id").and_then(Value::as_i64))
                    .collect();
                state.receipt_batches.push(batch);
            }
            _ => {}
        }
        Ok(())
    }

    async fn delete_rows(&self, table: &str, matching: Fields) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("backend lock");
        state.scripted_failure(table)?;
        if table == REACTIONS_TABLE {
            state
                .reactions
                .retain(|row| !matching.iter().all(|(k, v)| row.get(k) == Some(v)));
        }
        Ok(())
    }

    async fn update_row(&self, table: &str, id: i64, patch: Fields) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("backend lock");
        state.scripted_failure(table)?;
        state.updates.push((id, patch));
        Ok(())
    }

    async fn upload_media(&self, room_id: RoomId, local_ref: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock().expect("backend lock");
        state.scripted_failure(UPLOAD)?;
        state.uploads.push(local_ref.to_string());
        Ok(format!("https://media.example/{room_id}/{local_ref}"))
    }
}
