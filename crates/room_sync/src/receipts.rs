use std::collections::{BTreeSet, HashSet};

use shared::{
    domain::{MessageId, UserId},
    protocol::ReadReceipt,
};
use tracing::debug;

#[derive(Debug)]
pub struct ReadReceiptBatcher {
    self_id: UserId,
    foreground: bool,
    queued: BTreeSet<MessageId>,
    in_flight: HashSet<MessageId>,
    acknowledged: HashSet<MessageId>,
}

impl ReadReceiptBatcher {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            foreground: true,
            queued: BTreeSet::new(),
            in_flight: HashSet::new(),
            acknowledged: HashSet::new(),
        }
    }

    /// Returns `false` when the call must not (re)arm the debounce window.
    pub fn mark_visible(
        &mut self,
        ids: impl IntoIterator<Item = MessageId>,
        author_of: impl Fn(MessageId) -> Option<UserId>,
    ) -> bool {
        if !self.foreground {
            return false;
        }
        for id in ids {
            if self.acknowledged.contains(&id) || self.in_flight.contains(&id) {
                continue;
            }
            match author_of(id) {
                Some(author) if author != self.self_id => {
                    self.queued.insert(id);
                }
                _ => {}
            }
        }
        !self.queued.is_empty()
    }

    pub fn take_batch(&mut self) -> Option<Vec<MessageId>> {
        if !self.foreground || self.queued.is_empty() {
            return None;
        }
        let batch: Vec<MessageId> = std::mem::take(&mut self.queued).into_iter().collect();
        self.in_flight.extend(batch.iter().copied());
        Some(batch)
    }

    pub fn on_flush_succeeded(&mut self, batch: &[MessageId]) {
        for id in batch {
            self.in_flight.remove(id);
            self.acknowledged.insert(*id);
        }
    }

    pub fn on_flush_failed(&mut self, batch: &[MessageId]) {
        for id in batch {
            self.in_flight.remove(id);
        }
    }

    pub fn apply_remote(&mut self, receipt: &ReadReceipt) {
        if receipt.reader_id == self.self_id {
            self.queued.remove(&receipt.message_id);
            self.acknowledged.insert(receipt.message_id);
        }
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        if self.foreground == foreground {
            return;
        }
        self.foreground = foreground;
        if !foreground && !self.queued.is_empty() {
            debug!(dropped = self.queued.len(), "sync: backgrounded; dropping queued receipts");
            self.queued.clear();
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
        self.acknowledged.clear();
    }
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
