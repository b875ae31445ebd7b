use std::{collections::HashMap, hash::Hash, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired<K> {
    pub key: K,
    pub generation: u64,
}

struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct TimerSet<K, M> {
    sink: mpsc::UnboundedSender<M>,
    wrap: fn(TimerFired<K>) -> M,
    armed: HashMap<K, ArmedTimer>,
    next_generation: u64,
}

impl<K, M> TimerSet<K, M>
where
    K: Copy + Eq + Hash + Send + 'static,
    M: Send + 'static,
{
    pub fn new(sink: mpsc::UnboundedSender<M>, wrap: fn(TimerFired<K>) -> M) -> Self {
        Self {
            sink,
            wrap,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn arm(&mut self, key: K, delay: Duration) {
        self.cancel(key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = self.sink.clone();
        let message = (self.wrap)(TimerFired { key, generation });
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink.send(message);
        });
        self.armed.insert(key, ArmedTimer { generation, task });
    }

    pub fn cancel(&mut self, key: K) {
        if let Some(timer) = self.armed.remove(&key) {
            timer.task.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.task.abort();
        }
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.armed.contains_key(&key)
    }

    /// Accepts a firing only if it belongs to the current arming of its key.
    pub fn accept(&mut self, fired: &TimerFired<K>) -> bool {
        match self.armed.get(&fired.key) {
            Some(timer) if timer.generation == fired.generation => {
                self.armed.remove(&fired.key);
                true
            }
            _ => false,
        }
    }
}

impl<K, M> Drop for TimerSet<K, M> {
    fn drop(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/timer_tests.rs"]
mod tests;
