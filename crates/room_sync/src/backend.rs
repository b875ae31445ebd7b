use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use shared::{
    domain::{MessageId, RoomId, UserId},
    error::{BackendError, ErrorCode},
    protocol::{
        AuthorProfile, MessageRecord, ReactionKey, ReactionRecord, MESSAGES_TABLE,
        PROFILES_TABLE, REACTIONS_TABLE, READ_RECEIPTS_TABLE,
    },
};

use crate::optimistic::MessageDraft;

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct RowMatch {
    pub column: String,
    pub any_of: Vec<Value>,
}

impl RowMatch {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            any_of: vec![value.into()],
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_page(
        &self,
        room_id: RoomId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, BackendError>;
    async fn select_rows(&self, table: &str, filter: RowMatch) -> Result<Vec<Value>, BackendError>;
    async fn insert_rows(&self, table: &str, rows: Vec<Fields>) -> Result<(), BackendError>;
    async fn delete_rows(&self, table: &str, matching: Fields) -> Result<(), BackendError>;
    async fn update_row(&self, table: &str, id: i64, patch: Fields) -> Result<(), BackendError>;
    async fn upload_media(&self, room_id: RoomId, local_ref: &str) -> Result<String, BackendError>;
}

#[derive(Clone)]
pub struct RoomStore {
    backend: Arc<dyn Backend>,
    room_id: RoomId,
    user_id: UserId,
}

impl RoomStore {
    pub fn new(backend: Arc<dyn Backend>, room_id: RoomId, user_id: UserId) -> Self {
        Self {
            backend,
            room_id,
            user_id,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub async fn fetch_latest(&self, limit: u32) -> Result<Vec<MessageRecord>, BackendError> {
        self.backend.fetch_page(self.room_id, None, limit).await
    }

    pub async fn fetch_before(
        &self,
        before: MessageId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        self.backend
            .fetch_page(self.room_id, Some(before), limit)
            .await
    }

    pub async fn send_message(&self, draft: &MessageDraft) -> Result<(), BackendError> {
        let mut row = fields(json!({
            "room_id": self.room_id,
            "user_id": draft.author_id,
            "content": draft.body,
            "image_url": draft.image_url,
        }));
        if !draft.metadata.is_empty() {
            row.insert("metadata".into(), json!(draft.metadata));
        }
        self.backend.insert_rows(MESSAGES_TABLE, vec![row]).await
    }

    pub async fn upload_media(&self, local_ref: &str) -> Result<String, BackendError> {
        self.backend.upload_media(self.room_id, local_ref).await
    }

    pub async fn edit_message(&self, message_id: MessageId, body: &str) -> Result<(), BackendError> {
        let patch = fields(json!({ "content": body, "edited_at": Utc::now() }));
        self.backend
            .update_row(MESSAGES_TABLE, message_id.0, patch)
            .await
    }

    pub async fn soft_delete_message(&self, message_id: MessageId) -> Result<(), BackendError> {
        let patch = fields(json!({ "deleted_at": Utc::now() }));
        self.backend
            .update_row(MESSAGES_TABLE, message_id.0, patch)
            .await
    }

    pub async fn add_reaction(&self, record: &ReactionRecord) -> Result<(), BackendError> {
        let row = fields(json!({
            "room_id": self.room_id,
            "message_id": record.message_id,
            "user_id": record.user_id,
            "emoji": record.emoji,
        }));
        match self.backend.insert_rows(REACTIONS_TABLE, vec![row]).await {
            Err(err) if err.code == ErrorCode::Conflict => Ok(()),
            other => other,
        }
    }

    pub async fn remove_reaction(&self, key: &ReactionKey) -> Result<(), BackendError> {
        let matching = fields(json!({
            "message_id": key.message_id,
            "user_id": key.user_id,
            "emoji": key.emoji,
        }));
        match self.backend.delete_rows(REACTIONS_TABLE, matching).await {
            Err(err) if err.code == ErrorCode::NotFound => Ok(()),
            other => other,
        }
    }

    pub async fn fetch_reactions(&self) -> Result<Vec<ReactionRecord>, BackendError> {
        let rows = self
            .backend
            .select_rows(REACTIONS_TABLE, RowMatch::eq("room_id", json!(self.room_id)))
            .await?;
        parse_rows(rows)
    }

    pub async fn fetch_profiles(
        &self,
        user_ids: &[UserId],
    ) -> Result<Vec<AuthorProfile>, BackendError> {
        let filter = RowMatch {
            column: "id".to_string(),
            any_of: user_ids.iter().map(|id| json!(id)).collect(),
        };
        let rows = self.backend.select_rows(PROFILES_TABLE, filter).await?;
        parse_rows(rows)
    }

    pub async fn mark_read(&self, message_ids: &[MessageId]) -> Result<(), BackendError> {
        let read_at = Utc::now();
        let rows = message_ids
            .iter()
            .map(|message_id| {
                fields(json!({
                    "message_id": message_id,
                    "user_id": self.user_id,
                    "read_at": read_at,
                }))
            })
            .collect();
        match self.backend.insert_rows(READ_RECEIPTS_TABLE, rows).await {
            Err(err) if err.code == ErrorCode::Conflict => Ok(()),
            other => other,
        }
    }
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

fn parse_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(BackendError::from))
        .collect()
}
