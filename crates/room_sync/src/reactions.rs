use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{ReactionKey, ReactionRecord},
};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub reactors: Vec<UserId>,
    pub includes_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionIntent {
    Add(ReactionRecord),
    Remove(ReactionRecord),
}

impl ReactionIntent {
    pub fn record(&self) -> &ReactionRecord {
        match self {
            Self::Add(record) | Self::Remove(record) => record,
        }
    }
}

#[derive(Debug)]
pub struct ReactionAggregator {
    self_id: UserId,
    by_message: HashMap<MessageId, Vec<ReactionRecord>>,
    in_flight: HashMap<(MessageId, String), ReactionIntent>,
}

impl ReactionAggregator {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            by_message: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn apply_insert(&mut self, record: ReactionRecord) -> bool {
        let records = self.by_message.entry(record.message_id).or_default();
        if records
            .iter()
            .any(|existing| existing.user_id == record.user_id && existing.emoji == record.emoji)
        {
            return false;
        }
        records.push(record);
        records.sort_by_key(|r| r.created_at);
        true
    }

    pub fn apply_delete(&mut self, key: &ReactionKey) -> bool {
        let Some(records) = self.by_message.get_mut(&key.message_id) else {
            return false;
        };
        let before = records.len();
        records.retain(|r| !(r.user_id == key.user_id && r.emoji == key.emoji));
        let removed = records.len() != before;
        if records.is_empty() {
            self.by_message.remove(&key.message_id);
        }
        removed
    }

    /// Installs a refetched room-wide reaction set. Toggles whose writes are
    /// still in flight are re-applied on top of it.
    pub fn replace_all(&mut self, records: Vec<ReactionRecord>) {
        self.by_message.clear();
        for record in records {
            self.apply_insert(record);
        }
        let pending: Vec<ReactionIntent> = self.in_flight.values().cloned().collect();
        for intent in pending {
            match intent {
                ReactionIntent::Add(record) => {
                    self.apply_insert(record);
                }
                ReactionIntent::Remove(record) => {
                    self.apply_delete(&record.key());
                }
            }
        }
    }

    pub fn has_reacted(&self, message_id: MessageId, emoji: &str) -> bool {
        self.by_message.get(&message_id).is_some_and(|records| {
            records
                .iter()
                .any(|r| r.user_id == self.self_id && r.emoji == emoji)
        })
    }

    pub fn begin_toggle(
        &mut self,
        message_id: MessageId,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<ReactionIntent> {
        let flight_key = (message_id, emoji.to_string());
        if self.in_flight.contains_key(&flight_key) {
            return Err(SyncError::ReactionInFlight {
                message_id,
                emoji: emoji.to_string(),
            });
        }

        let existing = self.by_message.get(&message_id).and_then(|records| {
            records
                .iter()
                .find(|r| r.user_id == self.self_id && r.emoji == emoji)
                .cloned()
        });
        let intent = match existing {
            Some(record) => {
                self.apply_delete(&record.key());
                ReactionIntent::Remove(record)
            }
            None => {
                let record = ReactionRecord {
                    message_id,
                    user_id: self.self_id,
                    emoji: emoji.to_string(),
                    created_at: now,
                };
                self.apply_insert(record.clone());
                ReactionIntent::Add(record)
            }
        };
        self.in_flight.insert(flight_key, intent.clone());
        Ok(intent)
    }

    pub fn finish_toggle(&mut self, intent: &ReactionIntent, succeeded: bool) {
        let record = intent.record();
        self.in_flight
            .remove(&(record.message_id, record.emoji.clone()));
        if succeeded {
            return;
        }
        match intent {
            ReactionIntent::Add(record) => {
                self.apply_delete(&record.key());
            }
            ReactionIntent::Remove(record) => {
                self.apply_insert(record.clone());
            }
        }
    }

    pub fn groups_for(&self, message_id: MessageId) -> Vec<ReactionGroup> {
        let Some(records) = self.by_message.get(&message_id) else {
            return Vec::new();
        };

        let mut groups: Vec<ReactionGroup> = Vec::new();
        for record in records {
            match groups.iter_mut().find(|g| g.emoji == record.emoji) {
                Some(group) => group.reactors.push(record.user_id),
                None => groups.push(ReactionGroup {
                    emoji: record.emoji.clone(),
                    count: 0,
                    reactors: vec![record.user_id],
                    includes_self: false,
                }),
            }
        }
        for group in &mut groups {
            group.count = group.reactors.len();
            group.includes_self = group.reactors.contains(&self.self_id);
        }
        groups.sort_by(|a, b| b.count.cmp(&a.count));
        groups
    }

    pub fn all_groups(&self) -> HashMap<MessageId, Vec<ReactionGroup>> {
        self.by_message
            .keys()
            .map(|message_id| (*message_id, self.groups_for(*message_id)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.by_message.clear();
        self.in_flight.clear();
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
