use std::collections::{BTreeMap, HashMap, HashSet};

use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{AuthorProfile, MessageRecord},
};
use tracing::debug;

use crate::optimistic::{OptimisticEnvelope, PendingQueue};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Confirmed(MessageRecord),
    Pending(OptimisticEnvelope),
}

impl TimelineEntry {
    pub fn author_id(&self) -> UserId {
        match self {
            Self::Confirmed(record) => record.author_id,
            Self::Pending(envelope) => envelope.draft.author_id,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Confirmed(record) => record.body.as_deref(),
            Self::Pending(envelope) => envelope.draft.body.as_deref(),
        }
    }

    pub fn confirmed_id(&self) -> Option<MessageId> {
        match self {
            Self::Confirmed(record) => Some(record.id),
            Self::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageInfo {
    pub has_more: bool,
    pub oldest_id: Option<MessageId>,
    pub fetched: usize,
}

#[derive(Debug)]
pub enum InsertOutcome {
    Ignored,
    Appended {
        reconciled: Option<OptimisticEnvelope>,
    },
}

#[derive(Debug)]
pub struct MessageTimeline {
    room_id: RoomId,
    confirmed: BTreeMap<MessageId, MessageRecord>,
    tombstones: HashSet<MessageId>,
    live_during_load: HashSet<MessageId>,
    pending: PendingQueue,
    profiles: HashMap<UserId, AuthorProfile>,
    has_more: bool,
    load_state: LoadState,
}

impl MessageTimeline {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            confirmed: BTreeMap::new(),
            tombstones: HashSet::new(),
            live_during_load: HashSet::new(),
            pending: PendingQueue::new(),
            profiles: HashMap::new(),
            has_more: false,
            load_state: LoadState::Idle,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn begin_load(&mut self) {
        self.live_during_load.clear();
        self.load_state = LoadState::Loading;
    }

    pub fn load_failed(&mut self, reason: impl Into<String>) {
        self.live_during_load.clear();
        self.load_state = LoadState::Failed(reason.into());
    }

    /// Discards every confirmed row and installs `page`, keeping rows that
    /// were inserted or edited live while the fetch was in flight.
    pub fn replace_with_page(
        &mut self,
        page: Vec<MessageRecord>,
        limit: u32,
    ) -> (PageInfo, Vec<OptimisticEnvelope>) {
        let fetched = page.len();
        let mut live: BTreeMap<MessageId, MessageRecord> = std::mem::take(&mut self.confirmed)
            .into_iter()
            .filter(|(id, _)| self.live_during_load.contains(id))
            .collect();
        self.live_during_load.clear();

        let mut reconciled = Vec::new();
        let mut incoming: Vec<MessageRecord> = page
            .into_iter()
            .filter(|record| record.room_id == self.room_id)
            .collect();
        incoming.sort_by_key(|record| record.id);
        for record in incoming {
            if live.contains_key(&record.id) {
                continue;
            }
            if let Some(record) = self.admit(record) {
                if let Some(envelope) = self.pending.reconcile(&record) {
                    reconciled.push(envelope);
                }
                live.insert(record.id, record);
            }
        }
        self.confirmed = live;
        self.has_more = fetched >= limit as usize;
        self.load_state = LoadState::Ready;

        (self.page_info(fetched), reconciled)
    }

    pub fn prepend_page(&mut self, page: Vec<MessageRecord>, limit: u32) -> PageInfo {
        let fetched = page.len();
        for record in page {
            if record.room_id != self.room_id || self.confirmed.contains_key(&record.id) {
                continue;
            }
            if let Some(record) = self.admit(record) {
                self.confirmed.insert(record.id, record);
            }
        }
        self.has_more = fetched >= limit as usize;
        self.page_info(fetched)
    }

    pub fn apply_insert(&mut self, record: MessageRecord) -> InsertOutcome {
        if record.room_id != self.room_id || self.confirmed.contains_key(&record.id) {
            return InsertOutcome::Ignored;
        }
        let Some(record) = self.admit(record) else {
            return InsertOutcome::Ignored;
        };
        if self.load_state == LoadState::Loading {
            self.live_during_load.insert(record.id);
        }
        let reconciled = self.pending.reconcile(&record);
        if let Some(envelope) = &reconciled {
            debug!(
                temp_id = %envelope.temp_id,
                message_id = record.id.0,
                "sync: optimistic send reconciled"
            );
        }
        self.confirmed.insert(record.id, record);
        InsertOutcome::Appended { reconciled }
    }

    pub fn apply_update(&mut self, record: MessageRecord) -> bool {
        if record.room_id != self.room_id {
            return false;
        }
        if record.is_deleted() {
            return self.apply_delete(record.id);
        }
        let Some(existing) = self.confirmed.get_mut(&record.id) else {
            return false;
        };
        let message_id = record.id;
        let author = record.author.clone().or_else(|| existing.author.take());
        *existing = MessageRecord { author, ..record };
        if self.load_state == LoadState::Loading {
            self.live_during_load.insert(message_id);
        }
        true
    }

    pub fn apply_delete(&mut self, message_id: MessageId) -> bool {
        self.tombstones.insert(message_id);
        self.live_during_load.remove(&message_id);
        self.confirmed.remove(&message_id).is_some()
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingQueue {
        &mut self.pending
    }

    pub fn attach_profiles(&mut self, profiles: Vec<AuthorProfile>) {
        for profile in profiles {
            self.profiles.insert(profile.user_id, profile);
        }
        for record in self.confirmed.values_mut() {
            if record.author.is_none() {
                record.author = self.profiles.get(&record.author_id).cloned();
            }
        }
    }

    pub fn unresolved_authors(&self) -> Vec<UserId> {
        let mut authors: Vec<UserId> = self
            .confirmed
            .values()
            .filter(|record| record.author.is_none())
            .map(|record| record.author_id)
            .filter(|author| !self.profiles.contains_key(author))
            .collect();
        authors.sort();
        authors.dedup();
        authors
    }

    pub fn author_of(&self, message_id: MessageId) -> Option<UserId> {
        self.confirmed
            .get(&message_id)
            .map(|record| record.author_id)
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.confirmed.keys().next().copied()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn page_info(&self, fetched: usize) -> PageInfo {
        PageInfo {
            has_more: self.has_more,
            oldest_id: self.oldest_id(),
            fetched,
        }
    }

    pub fn merged(&self) -> Vec<TimelineEntry> {
        self.confirmed
            .values()
            .cloned()
            .map(TimelineEntry::Confirmed)
            .chain(self.pending.iter().cloned().map(TimelineEntry::Pending))
            .collect()
    }

    fn admit(&mut self, mut record: MessageRecord) -> Option<MessageRecord> {
        if self.tombstones.contains(&record.id) {
            return None;
        }
        if record.is_deleted() {
            self.tombstones.insert(record.id);
            return None;
        }
        if record.author.is_none() {
            record.author = self.profiles.get(&record.author_id).cloned();
        }
        Some(record)
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
