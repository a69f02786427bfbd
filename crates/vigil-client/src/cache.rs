//! Local cache of conversations, kept in step with socket pushes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use vigil_shared::types::{ConversationSummary, Message, MessageId, UserId};

pub type SharedCache = Arc<Mutex<MessageCache>>;

/// Lock a shared cache, recovering from a poisoned lock. The cache holds no
/// invariants a panicking writer could break halfway.
pub fn lock(cache: &SharedCache) -> MutexGuard<'_, MessageCache> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct MessageCache {
    me: UserId,
    conversations: HashMap<UserId, Vec<Message>>,
    summaries: Option<Vec<ConversationSummary>>,
}

impl MessageCache {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            conversations: HashMap::new(),
            summaries: None,
        }
    }

    pub fn shared(me: UserId) -> SharedCache {
        Arc::new(Mutex::new(Self::new(me)))
    }

    pub fn conversation(&self, other: UserId) -> Option<&[Message]> {
        self.conversations.get(&other).map(Vec::as_slice)
    }

    pub fn store_conversation(&mut self, other: UserId, messages: Vec<Message>) {
        self.conversations.insert(other, messages);
    }

    pub fn summaries(&self) -> Option<&[ConversationSummary]> {
        self.summaries.as_deref()
    }

    pub fn store_summaries(&mut self, summaries: Vec<ConversationSummary>) {
        self.summaries = Some(summaries);
    }

    /// Drop the cached thread with `other` and the summary list, so both are
    /// refetched on next access.
    pub fn invalidate_conversation(&mut self, other: UserId) {
        self.conversations.remove(&other);
        self.summaries = None;
    }

    /// A pushed message: append it to its thread when that thread is cached.
    pub fn apply_incoming(&mut self, message: &Message) {
        let other = if message.sender_id == self.me {
            message.receiver_id
        } else {
            message.sender_id
        };
        if let Some(thread) = self.conversations.get_mut(&other) {
            if !thread.iter().any(|m| m.id == message.id) {
                thread.push(message.clone());
            }
        }
        self.summaries = None;
    }

    /// Set the read flag on the given messages wherever they are cached.
    /// Returns how many cached entries changed.
    pub fn apply_read(&mut self, ids: &[MessageId]) -> usize {
        let mut changed = 0;
        for message in self.conversations.values_mut().flatten() {
            if !message.read && ids.contains(&message.id) {
                message.read = true;
                changed += 1;
            }
        }
        if changed > 0 {
            self.summaries = None;
        }
        changed
    }

    /// `read_by` read everything this user sent them.
    pub fn apply_all_read(&mut self, read_by: UserId) -> usize {
        let me = self.me;
        let mut changed = 0;
        if let Some(thread) = self.conversations.get_mut(&read_by) {
            for message in thread.iter_mut() {
                if !message.read && message.sender_id == me && message.receiver_id == read_by {
                    message.read = true;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// This user read everything `sender` sent them.
    pub fn apply_all_read_from(&mut self, sender: UserId) -> usize {
        let me = self.me;
        let mut changed = 0;
        if let Some(thread) = self.conversations.get_mut(&sender) {
            for message in thread.iter_mut() {
                if !message.read && message.sender_id == sender && message.receiver_id == me {
                    message.read = true;
                    changed += 1;
                }
            }
        }
        self.summaries = None;
        changed
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.summaries = None;
    }
}
