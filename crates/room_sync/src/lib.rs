pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod optimistic;
pub mod presence;
pub mod reactions;
pub mod receipts;
pub mod session;
pub mod supervisor;
pub mod timeline;
pub mod timer;

use std::sync::Arc;

use shared::domain::RoomId;
use tracing::info;

pub use backend::{Backend, Fields, RoomStore, RowMatch};
pub use channel::{
    ChannelEvent, ChannelStatus, RealtimeSubscription, RealtimeTransport, SubscriptionHandle,
};
pub use config::{load_config, SyncConfig};
pub use error::{ErrorCategory, SyncError, SyncResult};
pub use optimistic::{MessageDraft, OptimisticEnvelope, SendStatus, TempId};
pub use reactions::ReactionGroup;
pub use session::{LocalUser, RoomEvent, RoomHandle, RoomView};
pub use supervisor::ConnectionState;
pub use timeline::{LoadState, PageInfo, TimelineEntry};

/// Holds at most one open room; entering another waits for the old one's teardown.
pub struct SyncClient {
    config: SyncConfig,
    user: LocalUser,
    transport: Arc<dyn RealtimeTransport>,
    backend: Arc<dyn Backend>,
    active: Option<RoomHandle>,
}

impl SyncClient {
    pub fn new(
        config: SyncConfig,
        user: LocalUser,
        transport: Arc<dyn RealtimeTransport>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            config: config.validate(),
            user,
            transport,
            backend,
            active: None,
        }
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    pub fn room(&self) -> Option<&RoomHandle> {
        self.active.as_ref()
    }

    pub async fn enter_room(&mut self, room_id: RoomId) -> &RoomHandle {
        if let Some(current) = self.active.take() {
            if current.room_id() == room_id {
                return self.active.insert(current);
            }
            current.close().await;
        }
        info!(%room_id, user_id = %self.user.user_id, "sync: entering room");
        self.active.insert(RoomHandle::open(
            room_id,
            self.user.clone(),
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.backend),
        ))
    }

    pub async fn leave_room(&mut self) {
        if let Some(current) = self.active.take() {
            current.close().await;
        }
    }
}
