use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{MessageId, RoomId, UserId};

pub const MESSAGES_TABLE: &str = "messages";
pub const REACTIONS_TABLE: &str = "message_reactions";
pub const READ_RECEIPTS_TABLE: &str = "message_reads";
pub const PROFILES_TABLE: &str = "profiles";

pub type Metadata = BTreeMap<String, Value>;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    #[serde(alias = "id")]
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    #[serde(alias = "user_id")]
    pub author_id: UserId,
    #[serde(default, alias = "content", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default, alias = "profiles", skip_serializing_if = "Option::is_none")]
    pub author: Option<AuthorProfile>,
}

impl MessageRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReactionKey {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl ReactionRecord {
    pub fn key(&self) -> ReactionKey {
        ReactionKey {
            message_id: self.message_id,
            user_id: self.user_id,
            emoji: self.emoji.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    #[serde(alias = "user_id")]
    pub reader_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub typing: bool,
    #[serde(alias = "online_at")]
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RawChannelEvent {
    PostgresChanges {
        event_type: String,
        table: String,
        #[serde(default)]
        new: Value,
        #[serde(default)]
        old: Value,
    },
    PresenceSync {
        state: BTreeMap<String, Vec<Value>>,
    },
    System {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilter {
    pub table: String,
    pub column: String,
    pub equals: String,
}

impl TableFilter {
    pub fn room_scoped(table: &str, room_id: RoomId) -> Self {
        Self {
            table: table.to_string(),
            column: "room_id".to_string(),
            equals: room_id.to_string(),
        }
    }
}
