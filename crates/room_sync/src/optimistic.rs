use std::{fmt, future::Future, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, RoomId, UserId},
    error::BackendError,
    protocol::{MessageRecord, Metadata},
};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(Uuid);

impl TempId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub room_id: RoomId,
    pub author_id: UserId,
    pub body: Option<String>,
    pub image_url: Option<String>,
    pub local_image: Option<String>,
    pub metadata: Metadata,
}

impl MessageDraft {
    pub fn text(room_id: RoomId, author_id: UserId, body: impl Into<String>) -> Self {
        Self {
            room_id,
            author_id,
            body: Some(body.into()),
            image_url: None,
            local_image: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_local_image(mut self, local_ref: impl Into<String>) -> Self {
        self.local_image = Some(local_ref.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        is_blank(self.body.as_deref())
            && is_blank(self.image_url.as_deref())
            && is_blank(self.local_image.as_deref())
    }

    fn normalized(mut self) -> Self {
        self.body = self
            .body
            .map(|body| body.trim().to_string())
            .filter(|body| !body.is_empty());
        self
    }

    pub fn needs_upload(&self) -> bool {
        self.local_image.is_some() && self.image_url.is_none()
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |value| value.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Pending,
    UploadingMedia,
    Confirmed { message_id: MessageId },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct OptimisticEnvelope {
    pub temp_id: TempId,
    pub draft: MessageDraft,
    pub status: SendStatus,
    pub created_at: DateTime<Utc>,
    pub queued_at: Instant,
}

impl OptimisticEnvelope {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, SendStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub status: Option<SendStatus>,
    pub image_url: Option<String>,
}

impl StatusPatch {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(SendStatus::Failed {
                reason: reason.into(),
            }),
            image_url: None,
        }
    }

    pub fn uploaded(image_url: impl Into<String>) -> Self {
        Self {
            status: Some(SendStatus::Pending),
            image_url: Some(image_url.into()),
        }
    }
}

/// Content heuristic deciding whether a confirmed row supersedes a pending draft.
/// The temporary id never reaches the server, so two identical messages sent
/// back to back by the same author cannot be told apart.
pub fn supersedes(record: &MessageRecord, draft: &MessageDraft) -> bool {
    if record.author_id != draft.author_id {
        return false;
    }
    same_content(record.body.as_deref(), draft.body.as_deref())
        || same_content(record.image_url.as_deref(), draft.image_url.as_deref())
}

// Absent or empty content never matches, so two image-only sends stay apart
// until each has its uploaded URL.
fn same_content(confirmed: Option<&str>, pending: Option<&str>) -> bool {
    match (confirmed, pending) {
        (Some(confirmed), Some(pending)) => !confirmed.is_empty() && confirmed == pending,
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Vec<OptimisticEnvelope>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, draft: MessageDraft) -> TempId {
        let draft = draft.normalized();
        let status = if draft.needs_upload() {
            SendStatus::UploadingMedia
        } else {
            SendStatus::Pending
        };
        let temp_id = TempId::generate();
        self.entries.push(OptimisticEnvelope {
            temp_id,
            draft,
            status,
            created_at: Utc::now(),
            queued_at: Instant::now(),
        });
        temp_id
    }

    pub fn update(&mut self, temp_id: TempId, patch: StatusPatch) -> bool {
        let Some(envelope) = self.entries.iter_mut().find(|e| e.temp_id == temp_id) else {
            return false;
        };
        if let Some(image_url) = patch.image_url {
            envelope.draft.image_url = Some(image_url);
        }
        if let Some(status) = patch.status {
            envelope.status = status;
        }
        true
    }

    pub fn retire(&mut self, temp_id: TempId) -> Option<OptimisticEnvelope> {
        let index = self.entries.iter().position(|e| e.temp_id == temp_id)?;
        Some(self.entries.remove(index))
    }

    pub fn reconcile(&mut self, record: &MessageRecord) -> Option<OptimisticEnvelope> {
        let index = self
            .entries
            .iter()
            .position(|envelope| supersedes(record, &envelope.draft))?;
        let mut envelope = self.entries.remove(index);
        envelope.status = SendStatus::Confirmed {
            message_id: record.id,
        };
        Some(envelope)
    }

    pub fn get(&self, temp_id: TempId) -> Option<&OptimisticEnvelope> {
        self.entries.iter().find(|e| e.temp_id == temp_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptimisticEnvelope> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRetryPolicy {
    pub attempts: u32,
    pub base: Duration,
}

impl WriteRetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.write_retry_attempts.max(1),
            base: Duration::from_millis(config.write_retry_base_ms),
        }
    }

    pub fn single_attempt() -> Self {
        Self {
            attempts: 1,
            base: Duration::ZERO,
        }
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_recoverable() && attempt + 1 < self.attempts => {
                    let delay = self.base * 2u32.saturating_pow(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "sync: recoverable write failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
