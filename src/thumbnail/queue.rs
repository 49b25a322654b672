//! Two-tier FIFO queue with strict priority.

use std::collections::VecDeque;

use super::Priority;

/// Pending job keys split by priority.
///
/// `pop` drains the interactive tier completely before touching the
/// background tier. Within a tier, order is submission order.
#[derive(Debug)]
pub struct JobQueue<K> {
    interactive: VecDeque<K>,
    background: VecDeque<K>,
}

impl<K> Default for JobQueue<K> {
    fn default() -> Self {
        Self {
            interactive: VecDeque::with_capacity(32),
            background: VecDeque::with_capacity(256),
        }
    }
}

impl<K: PartialEq> JobQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: K, priority: Priority) {
        match priority {
            Priority::Interactive => self.interactive.push_back(key),
            Priority::Background => self.background.push_back(key),
        }
    }

    /// Take the next key to run
    pub fn pop(&mut self) -> Option<(K, Priority)> {
        if let Some(key) = self.interactive.pop_front() {
            return Some((key, Priority::Interactive));
        }
        self.background
            .pop_front()
            .map(|key| (key, Priority::Background))
    }

    /// Move a queued background key to the tail of the interactive tier.
    /// Returns false if the key was not waiting in the background tier.
    pub fn escalate(&mut self, key: &K) -> bool {
        let Some(position) = self.background.iter().position(|queued| queued == key) else {
            return false;
        };
        if let Some(key) = self.background.remove(position) {
            self.interactive.push_back(key);
            return true;
        }
        false
    }

    /// Drop every background key matching `predicate`, returning them in
    /// queue order. The interactive tier is never touched.
    pub fn remove_background_where<F>(&mut self, mut predicate: F) -> Vec<K>
    where
        F: FnMut(&K) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.background.len());
        for key in self.background.drain(..) {
            if predicate(&key) {
                removed.push(key);
            } else {
                kept.push_back(key);
            }
        }
        self.background = kept;
        removed
    }

    pub fn len(&self, priority: Priority) -> usize {
        match priority {
            Priority::Interactive => self.interactive.len(),
            Priority::Background => self.background.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interactive.is_empty() && self.background.is_empty()
    }

    /// Remove everything, interactive first
    pub fn drain_all(&mut self) -> Vec<K> {
        self.interactive
            .drain(..)
            .chain(self.background.drain(..))
            .collect()
    }
}
