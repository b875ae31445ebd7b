use std::{collections::HashSet, time::Duration};

use shared::{domain::UserId, protocol::PresenceRecord};
use tokio::time::Instant;

#[derive(Debug)]
pub struct PresenceAggregator {
    self_id: UserId,
    records: Vec<PresenceRecord>,
}

impl PresenceAggregator {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            records: Vec::new(),
        }
    }

    pub fn apply_snapshot(&mut self, records: Vec<PresenceRecord>) {
        self.records = records;
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.distinct_others(|_| true)
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.distinct_others(|record| record.typing)
    }

    pub fn display_name(&self, user_id: UserId) -> Option<&str> {
        self.records
            .iter()
            .find(|record| record.user_id == user_id && !record.display_name.is_empty())
            .map(|record| record.display_name.as_str())
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn distinct_others(&self, keep: impl Fn(&PresenceRecord) -> bool) -> Vec<UserId> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|record| record.user_id != self.self_id && keep(record))
            .map(|record| record.user_id)
            .filter(|user_id| seen.insert(*user_id))
            .collect()
    }
}

#[derive(Debug)]
pub struct TypingDebouncer {
    republish_after: Duration,
    last_published: Option<Instant>,
    typing: bool,
}

impl TypingDebouncer {
    pub fn new(republish_after: Duration) -> Self {
        Self {
            republish_after,
            last_published: None,
            typing: false,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn on_keystroke(&mut self, now: Instant) -> bool {
        let due = match self.last_published {
            _ if !self.typing => true,
            Some(at) => now.saturating_duration_since(at) > self.republish_after,
            None => true,
        };
        if due {
            self.typing = true;
            self.last_published = Some(now);
        }
        due
    }

    pub fn stop(&mut self) -> bool {
        if !self.typing {
            return false;
        }
        self.typing = false;
        self.last_published = None;
        true
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
