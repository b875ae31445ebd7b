//! Per-room actor: one task owns every aggregator and publishes the view after each input.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};

use chrono::Utc;
use shared::{
    domain::{MessageId, RoomId, UserId},
    error::BackendError,
    protocol::{AuthorProfile, MessageRecord, PresenceRecord, ReactionRecord},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, RoomStore},
    channel::{
        ChannelClient, ChannelEvent, ChannelHandle, ChannelStatus, RealtimeTransport, RowChange,
        RowKey,
    },
    config::SyncConfig,
    error::{SyncError, SyncResult},
    optimistic::{MessageDraft, SendStatus, StatusPatch, TempId, WriteRetryPolicy},
    presence::{PresenceAggregator, TypingDebouncer},
    reactions::{ReactionAggregator, ReactionGroup, ReactionIntent},
    receipts::ReadReceiptBatcher,
    supervisor::{ChannelFailure, ConnectionState, ReconnectSupervisor, SupervisorAction},
    timeline::{InsertOutcome, LoadState, MessageTimeline, PageInfo, TimelineEntry},
    timer::{TimerFired, TimerSet},
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct RoomView {
    pub room_id: RoomId,
    pub messages: Vec<TimelineEntry>,
    pub has_more: bool,
    pub oldest_loaded: Option<MessageId>,
    pub load_state: LoadState,
    pub online_users: Vec<UserId>,
    pub typing_users: Vec<UserId>,
    pub reactions: HashMap<MessageId, Vec<ReactionGroup>>,
    pub connection: ConnectionState,
}

impl RoomView {
    fn empty(room_id: RoomId) -> Self {
        Self {
            room_id,
            messages: Vec::new(),
            has_more: false,
            oldest_loaded: None,
            load_state: LoadState::Idle,
            online_users: Vec::new(),
            typing_users: Vec::new(),
            reactions: HashMap::new(),
            connection: ConnectionState::Idle,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.connection.is_reconnecting()
    }

    pub fn reaction_groups(&self, message_id: MessageId) -> &[ReactionGroup] {
        self.reactions
            .get(&message_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    SendConfirmed {
        temp_id: TempId,
        message_id: MessageId,
    },
    SendFailed {
        temp_id: TempId,
        error: SyncError,
    },
    ReactionRolledBack {
        message_id: MessageId,
        emoji: String,
        error: SyncError,
    },
    LoadFailed {
        error: SyncError,
    },
    ConnectionChanged(ConnectionState),
    Resynced,
    ConnectionLost {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    Reconnect,
    SubscribeTimeout,
    TypingIdle,
    ReceiptFlush,
}

enum Command {
    Send {
        draft: MessageDraft,
        reply: oneshot::Sender<SyncResult<TempId>>,
    },
    Retry {
        temp_id: TempId,
        reply: oneshot::Sender<SyncResult<TempId>>,
    },
    Discard {
        temp_id: TempId,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    ToggleReaction {
        message_id: MessageId,
        emoji: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    SetTyping(bool),
    MarkVisible(Vec<MessageId>),
    LoadOlder {
        reply: oneshot::Sender<SyncResult<PageInfo>>,
    },
    SetForeground(bool),
    Reconnect {
        reply: oneshot::Sender<bool>,
    },
    Edit {
        message_id: MessageId,
        body: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Delete {
        message_id: MessageId,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

enum LoadPurpose {
    Initial,
    Resync,
}

struct Snapshot {
    page: Vec<MessageRecord>,
    reactions: Vec<ReactionRecord>,
}

enum Internal {
    Opened {
        epoch: u64,
        result: Result<ChannelHandle, String>,
    },
    Channel {
        epoch: u64,
        event: ChannelEvent,
    },
    Timer(TimerFired<TimerKey>),
    SnapshotLoaded {
        generation: u64,
        purpose: LoadPurpose,
        result: Result<Snapshot, BackendError>,
    },
    OlderLoaded {
        generation: u64,
        result: Result<Vec<MessageRecord>, BackendError>,
        reply: oneshot::Sender<SyncResult<PageInfo>>,
    },
    ReactionsFetched {
        generation: u64,
        result: Result<Vec<ReactionRecord>, BackendError>,
    },
    ProfilesFetched {
        requested: Vec<UserId>,
        result: Result<Vec<AuthorProfile>, BackendError>,
    },
    MediaUploaded {
        temp_id: TempId,
        policy: WriteRetryPolicy,
        result: Result<String, BackendError>,
    },
    SendFinished {
        temp_id: TempId,
        result: Result<(), BackendError>,
    },
    ReactionWritten {
        intent: ReactionIntent,
        result: Result<(), BackendError>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    ReceiptsFlushed {
        batch: Vec<MessageId>,
        result: Result<(), BackendError>,
    },
}

pub struct RoomHandle {
    room_id: RoomId,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<RoomView>,
    events: broadcast::Sender<RoomEvent>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub fn open(
        room_id: RoomId,
        user: LocalUser,
        config: SyncConfig,
        transport: Arc<dyn RealtimeTransport>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(RoomView::empty(room_id));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let session = RoomSession {
            room_id,
            store: RoomStore::new(backend, room_id, user.user_id),
            channel_client: ChannelClient::new(transport),
            timeline: MessageTimeline::new(room_id),
            presence: PresenceAggregator::new(user.user_id),
            reactions: ReactionAggregator::new(user.user_id),
            receipts: ReadReceiptBatcher::new(user.user_id),
            supervisor: ReconnectSupervisor::new(&config),
            typing: TypingDebouncer::new(config.typing_republish()),
            timers: TimerSet::new(internal_tx.clone(), Internal::Timer),
            tasks: JoinSet::new(),
            internal_tx,
            channel: None,
            connection_epoch: 0,
            data_generation: 0,
            older_in_flight: false,
            profiles_requested: HashSet::new(),
            write_policy: WriteRetryPolicy::from_config(&config),
            view_tx,
            events: events.clone(),
            last_connection: ConnectionState::Idle,
            user,
            config,
        };
        let task = tokio::spawn(session.run(commands_rx, internal_rx));

        Self {
            room_id,
            commands: commands_tx,
            view: view_rx,
            events,
            task,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn view(&self) -> RoomView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<RoomView> {
        self.view.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub async fn send_optimistic(&self, draft: MessageDraft) -> SyncResult<TempId> {
        self.request(|reply| Command::Send { draft, reply }).await?
    }

    pub async fn retry_send(&self, temp_id: TempId) -> SyncResult<TempId> {
        self.request(|reply| Command::Retry { temp_id, reply }).await?
    }

    pub async fn discard_send(&self, temp_id: TempId) -> SyncResult<()> {
        self.request(|reply| Command::Discard { temp_id, reply })
            .await?
    }

    /// Resolves once the remote write settled; a failure has already been rolled back locally.
    pub async fn toggle_reaction(&self, message_id: MessageId, emoji: &str) -> SyncResult<()> {
        let emoji = emoji.to_string();
        self.request(|reply| Command::ToggleReaction {
            message_id,
            emoji,
            reply,
        })
        .await?
    }

    pub fn set_typing(&self, typing: bool) -> SyncResult<()> {
        self.push(Command::SetTyping(typing))
    }

    pub fn mark_visible(&self, ids: impl IntoIterator<Item = MessageId>) -> SyncResult<()> {
        self.push(Command::MarkVisible(ids.into_iter().collect()))
    }

    pub async fn load_older(&self) -> SyncResult<PageInfo> {
        self.request(|reply| Command::LoadOlder { reply }).await?
    }

    pub fn set_foreground(&self, foreground: bool) -> SyncResult<()> {
        self.push(Command::SetForeground(foreground))
    }

    /// Leaves the terminal failed state. Returns `false` if the room was not failed.
    pub async fn reconnect(&self) -> SyncResult<bool> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    pub async fn edit_message(&self, message_id: MessageId, body: &str) -> SyncResult<()> {
        let body = body.to_string();
        self.request(|reply| Command::Edit {
            message_id,
            body,
            reply,
        })
        .await?
    }

    pub async fn delete_message(&self, message_id: MessageId) -> SyncResult<()> {
        self.request(|reply| Command::Delete { message_id, reply })
            .await?
    }

    /// Tears the room down and waits until nothing of it is left running.
    pub async fn close(self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = wait.await;
        }
        let _ = self.task.await;
    }

    fn push(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::SessionClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.push(command(reply))?;
        response.await.map_err(|_| SyncError::SessionClosed)
    }
}

struct RoomSession {
    room_id: RoomId,
    user: LocalUser,
    config: SyncConfig,
    store: RoomStore,
    channel_client: ChannelClient,
    timeline: MessageTimeline,
    presence: PresenceAggregator,
    reactions: ReactionAggregator,
    receipts: ReadReceiptBatcher,
    supervisor: ReconnectSupervisor,
    typing: TypingDebouncer,
    timers: TimerSet<TimerKey, Internal>,
    tasks: JoinSet<()>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    channel: Option<ChannelHandle>,
    connection_epoch: u64,
    data_generation: u64,
    older_in_flight: bool,
    profiles_requested: HashSet<UserId>,
    write_policy: WriteRetryPolicy,
    view_tx: watch::Sender<RoomView>,
    events: broadcast::Sender<RoomEvent>,
    last_connection: ConnectionState,
}

impl RoomSession {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!(room_id = %self.room_id, "sync: opening room");
        self.supervisor.start();
        self.open_channel();
        self.start_snapshot(LoadPurpose::Initial);
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { done }) => {
                        self.teardown().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                Some(input) = internal.recv() => self.handle_internal(input),
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => continue,
            }
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { draft, reply } => {
                let _ = reply.send(self.send_optimistic(draft));
            }
            Command::Retry { temp_id, reply } => {
                let _ = reply.send(self.retry_send(temp_id));
            }
            Command::Discard { temp_id, reply } => {
                let result = self
                    .timeline
                    .pending_mut()
                    .retire(temp_id)
                    .map(|_| ())
                    .ok_or(SyncError::UnknownSend(temp_id));
                let _ = reply.send(result);
            }
            Command::ToggleReaction {
                message_id,
                emoji,
                reply,
            } => self.toggle_reaction(message_id, &emoji, reply),
            Command::SetTyping(typing) => self.set_typing(typing),
            Command::MarkVisible(ids) => self.mark_visible(ids),
            Command::LoadOlder { reply } => self.load_older(reply),
            Command::SetForeground(foreground) => {
                self.receipts.set_foreground(foreground);
                if !foreground {
                    self.timers.cancel(TimerKey::ReceiptFlush);
                }
            }
            Command::Reconnect { reply } => {
                let restarted = self.supervisor.restart();
                if restarted {
                    self.open_channel();
                }
                let _ = reply.send(restarted);
            }
            Command::Edit {
                message_id,
                body,
                reply,
            } => {
                let store = self.store.clone();
                self.tasks.spawn(async move {
                    let result = store.edit_message(message_id, &body).await;
                    let _ = reply.send(result.map_err(SyncError::from));
                });
            }
            Command::Delete { message_id, reply } => {
                let store = self.store.clone();
                self.tasks.spawn(async move {
                    let result = store.soft_delete_message(message_id).await;
                    let _ = reply.send(result.map_err(SyncError::from));
                });
            }
            Command::Close { done } => {
                let _ = done.send(());
            }
        }
    }

    fn handle_internal(&mut self, input: Internal) {
        match input {
            Internal::Opened { epoch, result } => self.on_opened(epoch, result),
            Internal::Channel { epoch, event } => {
                if epoch == self.connection_epoch {
                    self.on_channel_event(event);
                }
            }
            Internal::Timer(fired) => {
                if self.timers.accept(&fired) {
                    self.on_timer(fired.key);
                }
            }
            Internal::SnapshotLoaded {
                generation,
                purpose,
                result,
            } => {
                if generation == self.data_generation {
                    self.on_snapshot(purpose, result);
                }
            }
            Internal::OlderLoaded {
                generation,
                result,
                reply,
            } => self.on_older_loaded(generation, result, reply),
            Internal::ReactionsFetched { generation, result } => {
                if generation != self.data_generation {
                    return;
                }
                match result {
                    Ok(records) => self.reactions.replace_all(records),
                    Err(err) => warn!(room_id = %self.room_id, %err, "sync: reaction refetch failed"),
                }
            }
            Internal::ProfilesFetched { requested, result } => match result {
                Ok(profiles) => {
                    self.timeline.attach_profiles(profiles);
                }
                Err(err) => {
                    warn!(room_id = %self.room_id, %err, "sync: profile lookup failed");
                    for user_id in requested {
                        self.profiles_requested.remove(&user_id);
                    }
                }
            },
            Internal::MediaUploaded {
                temp_id,
                policy,
                result,
            } => match result {
                Ok(url) => {
                    if self
                        .timeline
                        .pending_mut()
                        .update(temp_id, StatusPatch::uploaded(url))
                    {
                        self.start_insert(temp_id, policy);
                    }
                }
                Err(err) => self.fail_send(temp_id, err),
            },
            Internal::SendFinished { temp_id, result } => match result {
                Ok(()) => debug!(%temp_id, "sync: send accepted; awaiting echo"),
                Err(err) => self.fail_send(temp_id, err),
            },
            Internal::ReactionWritten {
                intent,
                result,
                reply,
            } => self.on_reaction_written(intent, result, reply),
            Internal::ReceiptsFlushed { batch, result } => match result {
                Ok(()) => self.receipts.on_flush_succeeded(&batch),
                Err(err) => {
                    warn!(room_id = %self.room_id, count = batch.len(), %err, "sync: read receipt flush failed");
                    self.receipts.on_flush_failed(&batch);
                }
            },
        }
    }

    fn spawn<F>(&mut self, work: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        self.tasks.spawn(async move {
            let _ = tx.send(work.await);
        });
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        let connection = self.supervisor.state();
        if connection != self.last_connection {
            self.last_connection = connection;
            self.emit(RoomEvent::ConnectionChanged(connection));
        }
        let info = self.timeline.page_info(0);
        self.view_tx.send_replace(RoomView {
            room_id: self.room_id,
            messages: self.timeline.merged(),
            has_more: info.has_more,
            oldest_loaded: info.oldest_id,
            load_state: self.timeline.load_state().clone(),
            online_users: self.presence.online_users(),
            typing_users: self.presence.typing_users(),
            reactions: self.reactions.all_groups(),
            connection,
        });
    }

    // Connection lifecycle.

    fn open_channel(&mut self) {
        self.connection_epoch += 1;
        let epoch = self.connection_epoch;
        let client = self.channel_client.clone();
        let room_id = self.room_id;
        self.timers
            .arm(TimerKey::SubscribeTimeout, self.config.subscribe_timeout());
        debug!(%room_id, epoch, "channel: opening subscription");
        self.spawn(async move {
            let result = client
                .subscribe(room_id)
                .await
                .map_err(|err| format!("{err:#}"));
            Internal::Opened { epoch, result }
        });
    }

    fn on_opened(&mut self, epoch: u64, result: Result<ChannelHandle, String>) {
        match result {
            Ok(handle) if epoch != self.connection_epoch => {
                self.tasks.spawn(release_channel(handle));
            }
            Ok(mut handle) => {
                let sink = self.internal_tx.clone();
                handle.start(sink, move |event| Internal::Channel { epoch, event });
                if let Some(previous) = self.channel.replace(handle) {
                    self.tasks.spawn(release_channel(previous));
                }
            }
            Err(_) if epoch != self.connection_epoch => {}
            Err(reason) => {
                warn!(room_id = %self.room_id, %reason, "channel: open failed");
                self.on_channel_failure(ChannelFailure::Error(reason));
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StatusChanged(ChannelStatus::Subscribed) => {
                self.timers.cancel(TimerKey::SubscribeTimeout);
                let action = self.supervisor.on_subscribed();
                self.track_presence();
                if action == SupervisorAction::Nothing
                    && matches!(self.timeline.load_state(), LoadState::Failed(_))
                {
                    self.start_snapshot(LoadPurpose::Initial);
                }
                self.apply_supervisor_action(action);
            }
            ChannelEvent::StatusChanged(ChannelStatus::Error(reason)) => {
                self.on_channel_failure(ChannelFailure::Error(reason));
            }
            ChannelEvent::StatusChanged(ChannelStatus::TimedOut) => {
                self.on_channel_failure(ChannelFailure::TimedOut);
            }
            ChannelEvent::StatusChanged(ChannelStatus::Closed) => {
                self.on_channel_failure(ChannelFailure::Closed);
            }
            ChannelEvent::Inserted(RowChange::Message(record)) => {
                if let InsertOutcome::Appended {
                    reconciled: Some(envelope),
                } = self.timeline.apply_insert(record.clone())
                {
                    self.emit(RoomEvent::SendConfirmed {
                        temp_id: envelope.temp_id,
                        message_id: record.id,
                    });
                }
                self.request_profiles();
            }
            ChannelEvent::Updated(RowChange::Message(record)) => {
                self.timeline.apply_update(record);
            }
            ChannelEvent::Deleted(RowKey::Message(message_id)) => {
                self.timeline.apply_delete(message_id);
            }
            ChannelEvent::Inserted(RowChange::Reaction(record))
            | ChannelEvent::Updated(RowChange::Reaction(record)) => {
                self.reactions.apply_insert(record);
            }
            ChannelEvent::Deleted(RowKey::Reaction(key)) => {
                self.reactions.apply_delete(&key);
            }
            ChannelEvent::Inserted(RowChange::Receipt(receipt))
            | ChannelEvent::Updated(RowChange::Receipt(receipt)) => {
                self.receipts.apply_remote(&receipt);
            }
            ChannelEvent::Deleted(RowKey::Receipt { .. }) => {}
            ChannelEvent::PresenceSync(records) => self.presence.apply_snapshot(records),
        }
    }

    fn on_channel_failure(&mut self, failure: ChannelFailure) {
        self.timers.cancel(TimerKey::SubscribeTimeout);
        let action = self.supervisor.on_failure(failure);
        self.apply_supervisor_action(action);
    }

    fn apply_supervisor_action(&mut self, action: SupervisorAction) {
        match action {
            SupervisorAction::Nothing => {}
            SupervisorAction::Resync => self.start_snapshot(LoadPurpose::Resync),
            SupervisorAction::ScheduleReconnect { attempt, delay } => {
                self.drop_channel();
                debug!(room_id = %self.room_id, attempt, delay_ms = delay.as_millis() as u64, "sync: reconnect armed");
                self.timers.arm(TimerKey::Reconnect, delay);
            }
            SupervisorAction::GiveUp { attempts } => {
                self.drop_channel();
                self.timers.cancel(TimerKey::Reconnect);
                self.emit(RoomEvent::ConnectionLost { attempts });
            }
        }
    }

    fn drop_channel(&mut self) {
        self.connection_epoch += 1;
        self.presence.clear();
        if let Some(handle) = self.channel.take() {
            self.tasks.spawn(release_channel(handle));
        }
    }

    fn track_presence(&mut self) {
        let Some(handle) = &self.channel else {
            return;
        };
        let control = handle.control();
        let record = PresenceRecord {
            user_id: self.user.user_id,
            display_name: self.user.display_name.clone(),
            typing: self.typing.is_typing(),
            last_seen: Utc::now(),
        };
        let room_id = self.room_id;
        self.tasks.spawn(async move {
            if let Err(err) = control.track(record).await {
                warn!(%room_id, error = %err, "channel: presence track failed");
            }
        });
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Reconnect => {
                if self.supervisor.state().is_reconnecting() {
                    self.open_channel();
                }
            }
            TimerKey::SubscribeTimeout => self.on_channel_failure(ChannelFailure::TimedOut),
            TimerKey::TypingIdle => {
                if self.typing.stop() {
                    self.track_presence();
                }
            }
            TimerKey::ReceiptFlush => self.flush_receipts(),
        }
    }

    // Loading.

    fn start_snapshot(&mut self, purpose: LoadPurpose) {
        self.data_generation += 1;
        self.older_in_flight = false;
        let generation = self.data_generation;
        self.timeline.begin_load();
        let store = self.store.clone();
        let limit = self.config.page_size;
        self.spawn(async move {
            let (page, reactions) = tokio::join!(store.fetch_latest(limit), store.fetch_reactions());
            let result = match (page, reactions) {
                (Ok(page), Ok(reactions)) => Ok(Snapshot { page, reactions }),
                (Err(err), _) | (_, Err(err)) => Err(err),
            };
            Internal::SnapshotLoaded {
                generation,
                purpose,
                result,
            }
        });
    }

    fn on_snapshot(&mut self, purpose: LoadPurpose, result: Result<Snapshot, BackendError>) {
        match result {
            Ok(Snapshot { page, reactions }) => {
                let (info, reconciled) = self.timeline.replace_with_page(page, self.config.page_size);
                self.reactions.replace_all(reactions);
                for envelope in reconciled {
                    if let SendStatus::Confirmed { message_id } = envelope.status {
                        self.emit(RoomEvent::SendConfirmed {
                            temp_id: envelope.temp_id,
                            message_id,
                        });
                    }
                }
                self.request_profiles();
                // A failure may have raced the fetch; only a live resync resets the counter.
                if matches!(purpose, LoadPurpose::Resync)
                    && self.supervisor.resync_pending()
                    && self.supervisor.state().is_connected()
                {
                    self.supervisor.on_resync_succeeded();
                    info!(room_id = %self.room_id, loaded = info.fetched, "sync: resynchronized");
                    self.emit(RoomEvent::Resynced);
                }
            }
            Err(err) => {
                warn!(room_id = %self.room_id, %err, "sync: timeline load failed");
                self.timeline.load_failed(err.to_string());
                self.emit(RoomEvent::LoadFailed {
                    error: SyncError::Backend(err.clone()),
                });
                if matches!(purpose, LoadPurpose::Resync) && self.supervisor.resync_pending() {
                    let action = self.supervisor.on_resync_failed(err.to_string());
                    self.apply_supervisor_action(action);
                }
            }
        }
    }

    fn load_older(&mut self, reply: oneshot::Sender<SyncResult<PageInfo>>) {
        if self.older_in_flight || *self.timeline.load_state() == LoadState::Loading {
            let _ = reply.send(Err(SyncError::LoadInFlight));
            return;
        }
        let Some(oldest) = self.timeline.oldest_id().filter(|_| self.timeline.has_more()) else {
            let _ = reply.send(Ok(self.timeline.page_info(0)));
            return;
        };
        self.older_in_flight = true;
        let generation = self.data_generation;
        let store = self.store.clone();
        let limit = self.config.page_size;
        self.spawn(async move {
            let result = store.fetch_before(oldest, limit).await;
            Internal::OlderLoaded {
                generation,
                result,
                reply,
            }
        });
    }

    fn on_older_loaded(
        &mut self,
        generation: u64,
        result: Result<Vec<MessageRecord>, BackendError>,
        reply: oneshot::Sender<SyncResult<PageInfo>>,
    ) {
        if generation != self.data_generation {
            // A reload replaced the timeline underneath this page.
            let _ = reply.send(Ok(self.timeline.page_info(0)));
            return;
        }
        self.older_in_flight = false;
        let result = match result {
            Ok(page) => {
                let info = self.timeline.prepend_page(page, self.config.page_size);
                self.request_profiles();
                Ok(info)
            }
            Err(err) => {
                warn!(room_id = %self.room_id, %err, "sync: older page failed");
                Err(SyncError::Backend(err))
            }
        };
        let _ = reply.send(result);
    }

    fn request_profiles(&mut self) {
        let missing: Vec<UserId> = self
            .timeline
            .unresolved_authors()
            .into_iter()
            .filter(|user_id| self.profiles_requested.insert(*user_id))
            .collect();
        if missing.is_empty() {
            return;
        }
        let store = self.store.clone();
        self.spawn(async move {
            let result = store.fetch_profiles(&missing).await;
            Internal::ProfilesFetched {
                requested: missing,
                result,
            }
        });
    }

    // Writes.

    fn send_optimistic(&mut self, mut draft: MessageDraft) -> SyncResult<TempId> {
        if draft.room_id != self.room_id {
            return Err(SyncError::WrongRoom {
                draft: draft.room_id.to_string(),
                session: self.room_id.to_string(),
            });
        }
        if draft.is_empty() {
            return Err(SyncError::EmptyDraft);
        }
        draft.author_id = self.user.user_id;
        let temp_id = self.timeline.pending_mut().begin(draft);
        self.start_write(temp_id, self.write_policy);
        Ok(temp_id)
    }

    fn retry_send(&mut self, temp_id: TempId) -> SyncResult<TempId> {
        let envelope = self
            .timeline
            .pending()
            .get(temp_id)
            .ok_or(SyncError::UnknownSend(temp_id))?;
        if !envelope.is_failed() {
            return Err(SyncError::NotRetryable(temp_id));
        }
        let draft = envelope.draft.clone();
        self.timeline.pending_mut().retire(temp_id);
        let retried = self.timeline.pending_mut().begin(draft);
        info!(%temp_id, retried = %retried, "sync: retrying failed send");
        self.start_write(retried, WriteRetryPolicy::single_attempt());
        Ok(retried)
    }

    fn start_write(&mut self, temp_id: TempId, policy: WriteRetryPolicy) {
        let Some(envelope) = self.timeline.pending().get(temp_id) else {
            return;
        };
        let upload = envelope
            .draft
            .local_image
            .clone()
            .filter(|_| envelope.draft.needs_upload());
        let Some(local_ref) = upload else {
            self.start_insert(temp_id, policy);
            return;
        };
        let store = self.store.clone();
        self.spawn(async move {
            let result = policy.run(|| store.upload_media(&local_ref)).await;
            Internal::MediaUploaded {
                temp_id,
                policy,
                result,
            }
        });
    }

    fn start_insert(&mut self, temp_id: TempId, policy: WriteRetryPolicy) {
        let Some(envelope) = self.timeline.pending().get(temp_id) else {
            return;
        };
        let draft = envelope.draft.clone();
        let store = self.store.clone();
        self.spawn(async move {
            let result = policy.run(|| store.send_message(&draft)).await;
            Internal::SendFinished { temp_id, result }
        });
    }

    fn fail_send(&mut self, temp_id: TempId, err: BackendError) {
        if !self
            .timeline
            .pending_mut()
            .update(temp_id, StatusPatch::failed(err.to_string()))
        {
            return;
        }
        warn!(room_id = %self.room_id, %temp_id, %err, "sync: send failed");
        self.emit(RoomEvent::SendFailed {
            temp_id,
            error: SyncError::Backend(err),
        });
    }

    fn toggle_reaction(
        &mut self,
        message_id: MessageId,
        emoji: &str,
        reply: oneshot::Sender<SyncResult<()>>,
    ) {
        let intent = match self.reactions.begin_toggle(message_id, emoji, Utc::now()) {
            Ok(intent) => intent,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let store = self.store.clone();
        self.spawn(async move {
            let result = match &intent {
                ReactionIntent::Add(record) => store.add_reaction(record).await,
                ReactionIntent::Remove(record) => store.remove_reaction(&record.key()).await,
            };
            Internal::ReactionWritten {
                intent,
                result,
                reply,
            }
        });
    }

    fn on_reaction_written(
        &mut self,
        intent: ReactionIntent,
        result: Result<(), BackendError>,
        reply: oneshot::Sender<SyncResult<()>>,
    ) {
        self.reactions.finish_toggle(&intent, result.is_ok());
        let Err(err) = result else {
            let _ = reply.send(Ok(()));
            return;
        };

        let record = intent.record();
        warn!(
            room_id = %self.room_id,
            message_id = record.message_id.0,
            emoji = %record.emoji,
            %err,
            "sync: reaction write failed; rolled back"
        );
        let error = SyncError::ReactionRolledBack(err);
        self.emit(RoomEvent::ReactionRolledBack {
            message_id: record.message_id,
            emoji: record.emoji.clone(),
            error: error.clone(),
        });
        let _ = reply.send(Err(error));

        let generation = self.data_generation;
        let store = self.store.clone();
        self.spawn(async move {
            let result = store.fetch_reactions().await;
            Internal::ReactionsFetched { generation, result }
        });
    }

    // Typing and receipts.

    fn set_typing(&mut self, typing: bool) {
        if typing {
            if self.typing.on_keystroke(Instant::now()) {
                self.track_presence();
            }
            self.timers
                .arm(TimerKey::TypingIdle, self.config.typing_idle());
        } else {
            self.timers.cancel(TimerKey::TypingIdle);
            if self.typing.stop() {
                self.track_presence();
            }
        }
    }

    fn mark_visible(&mut self, ids: Vec<MessageId>) {
        let timeline = &self.timeline;
        if self
            .receipts
            .mark_visible(ids, |id| timeline.author_of(id))
        {
            self.timers
                .arm(TimerKey::ReceiptFlush, self.config.read_receipt_debounce());
        }
    }

    fn flush_receipts(&mut self) {
        let Some(batch) = self.receipts.take_batch() else {
            return;
        };
        debug!(room_id = %self.room_id, count = batch.len(), "sync: flushing read receipts");
        let store = self.store.clone();
        self.spawn(async move {
            let result = store.mark_read(&batch).await;
            Internal::ReceiptsFlushed { batch, result }
        });
    }

    async fn teardown(&mut self) {
        info!(room_id = %self.room_id, "sync: closing room");
        self.timers.cancel_all();
        self.tasks.abort_all();
        self.connection_epoch += 1;
        self.data_generation += 1;
        if let Some(handle) = self.channel.take() {
            if let Err(err) = handle.unsubscribe().await {
                warn!(room_id = %self.room_id, error = %err, "channel: unsubscribe failed");
            }
        }
        self.supervisor.shutdown();
        self.timeline = MessageTimeline::new(self.room_id);
        self.presence.clear();
        self.reactions.clear();
        self.receipts.clear();
        self.profiles_requested.clear();
        self.publish();
    }
}

async fn release_channel(handle: ChannelHandle) {
    let room_id = handle.room_id();
    if let Err(err) = handle.unsubscribe().await {
        debug!(%room_id, error = %err, "channel: releasing stale subscription failed");
    }
}
