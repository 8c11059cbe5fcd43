//! Swappable substores backing the cabinet.
//!
//! Each entity kind is cached behind a small capability trait so a store can
//! be replaced independently, e.g. messages by a bounded ring while presences
//! live in external storage. [`NoopStore`] satisfies every trait by caching
//! nothing, turning the cabinet into a pure API wrapper.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use crate::model::{ChannelId, Message, MessageId};

/// A keyed substore capability.
///
/// Getters clone out of the store; no lock is exposed to callers.
pub trait Store<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    fn insert(&self, key: K, value: V);

    fn remove(&self, key: &K) -> Option<V>;

    /// Read-modify-write in place. Returns false when the key is absent.
    fn update(&self, key: &K, f: &mut dyn FnMut(&mut V)) -> bool;

    /// Snapshot of every value. Order is unspecified.
    fn values(&self) -> Vec<V>;
}

/// The default in-memory store: a hash map behind its own lock.
pub struct MemoryStore<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        MemoryStore {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Store<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.map.read().expect("store lock poisoned").get(key).cloned()
    }

    fn insert(&self, key: K, value: V) {
        self.map
            .write()
            .expect("store lock poisoned")
            .insert(key, value);
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.map.write().expect("store lock poisoned").remove(key)
    }

    fn update(&self, key: &K, f: &mut dyn FnMut(&mut V)) -> bool {
        match self.map.write().expect("store lock poisoned").get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    fn values(&self) -> Vec<V> {
        self.map
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// The bounded per-channel message cache capability.
///
/// Messages are held newest-first, capped per channel. A channel observed to
/// hold its complete (shorter than the cap) history is marked "few" so
/// getters can skip API pagination for it.
pub trait MessageStore: Send + Sync {
    /// The per-channel cap.
    fn cap(&self) -> usize;

    /// Cached messages of a channel, newest first.
    fn messages(&self, channel: ChannelId) -> Vec<Message>;

    /// Record a freshly created message as the channel's newest.
    fn push(&self, message: Message);

    /// Extend a channel's history with older messages from pagination.
    fn extend_older(&self, channel: ChannelId, messages: Vec<Message>);

    /// Read-modify-write one cached message. False when absent.
    fn update(&self, channel: ChannelId, id: MessageId, f: &mut dyn FnMut(&mut Message)) -> bool;

    fn remove(&self, channel: ChannelId, id: MessageId);

    fn mark_few(&self, channel: ChannelId);

    fn is_few(&self, channel: ChannelId) -> bool;
}

#[derive(Default)]
struct ChannelMessages {
    /// Newest first.
    list: Vec<Message>,
    few: bool,
}

/// The default in-memory message ring.
pub struct MemoryMessages {
    cap: usize,
    map: RwLock<HashMap<ChannelId, ChannelMessages>>,
}

/// Default number of messages retained per channel.
pub const DEFAULT_MESSAGE_CAP: usize = 64;

impl MemoryMessages {
    pub fn new(cap: usize) -> Self {
        MemoryMessages {
            cap,
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryMessages {
    fn default() -> Self {
        MemoryMessages::new(DEFAULT_MESSAGE_CAP)
    }
}

impl MessageStore for MemoryMessages {
    fn cap(&self) -> usize {
        self.cap
    }

    fn messages(&self, channel: ChannelId) -> Vec<Message> {
        self.map
            .read()
            .expect("store lock poisoned")
            .get(&channel)
            .map(|entry| entry.list.clone())
            .unwrap_or_default()
    }

    fn push(&self, message: Message) {
        let mut map = self.map.write().expect("store lock poisoned");
        let entry = map.entry(message.channel_id).or_default();
        // Replaying the same event must not duplicate the message.
        if let Some(existing) = entry.list.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
            return;
        }
        entry.list.insert(0, message);
        entry.list.truncate(self.cap);
    }

    fn extend_older(&self, channel: ChannelId, messages: Vec<Message>) {
        let mut map = self.map.write().expect("store lock poisoned");
        let entry = map.entry(channel).or_default();
        for message in messages {
            if entry.list.len() >= self.cap {
                break;
            }
            if entry.list.iter().any(|m| m.id == message.id) {
                continue;
            }
            entry.list.push(message);
        }
    }

    fn update(&self, channel: ChannelId, id: MessageId, f: &mut dyn FnMut(&mut Message)) -> bool {
        let mut map = self.map.write().expect("store lock poisoned");
        match map
            .get_mut(&channel)
            .and_then(|entry| entry.list.iter_mut().find(|m| m.id == id))
        {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }

    fn remove(&self, channel: ChannelId, id: MessageId) {
        let mut map = self.map.write().expect("store lock poisoned");
        if let Some(entry) = map.get_mut(&channel) {
            entry.list.retain(|m| m.id != id);
        }
    }

    fn mark_few(&self, channel: ChannelId) {
        let mut map = self.map.write().expect("store lock poisoned");
        map.entry(channel).or_default().few = true;
    }

    fn is_few(&self, channel: ChannelId) -> bool {
        self.map
            .read()
            .expect("store lock poisoned")
            .get(&channel)
            .map(|entry| entry.few)
            .unwrap_or(false)
    }
}

/// Caches nothing: getters report absence, mutations are accepted silently.
pub struct NoopStore;

impl<K, V> Store<K, V> for NoopStore
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn get(&self, _key: &K) -> Option<V> {
        None
    }

    fn insert(&self, _key: K, _value: V) {}

    fn remove(&self, _key: &K) -> Option<V> {
        None
    }

    fn update(&self, _key: &K, _f: &mut dyn FnMut(&mut V)) -> bool {
        false
    }

    fn values(&self) -> Vec<V> {
        Vec::new()
    }
}

impl MessageStore for NoopStore {
    fn cap(&self) -> usize {
        0
    }

    fn messages(&self, _channel: ChannelId) -> Vec<Message> {
        Vec::new()
    }

    fn push(&self, _message: Message) {}

    fn extend_older(&self, _channel: ChannelId, _messages: Vec<Message>) {}

    fn update(
        &self,
        _channel: ChannelId,
        _id: MessageId,
        _f: &mut dyn FnMut(&mut Message),
    ) -> bool {
        false
    }

    fn remove(&self, _channel: ChannelId, _id: MessageId) {}

    fn mark_few(&self, _channel: ChannelId) {}

    fn is_few(&self, _channel: ChannelId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: u64, id: u64) -> Message {
        serde_json::from_value(serde_json::json!({
            "id": id.to_string(),
            "channel_id": channel.to_string(),
            "author": {"id": "1", "username": "u"},
            "content": format!("m{}", id),
            "timestamp": "2020-01-01T00:00:00+00:00"
        }))
        .unwrap()
    }

    #[test]
    fn push_keeps_newest_first_and_caps() {
        let store = MemoryMessages::new(3);
        for id in 1..=5 {
            store.push(message(7, id));
        }
        let cached = store.messages(ChannelId(7));
        let ids: Vec<u64> = cached.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn push_is_idempotent() {
        let store = MemoryMessages::new(3);
        store.push(message(7, 1));
        store.push(message(7, 1));
        assert_eq!(store.messages(ChannelId(7)).len(), 1);
    }

    #[test]
    fn extend_older_skips_known_and_respects_cap() {
        let store = MemoryMessages::new(3);
        store.push(message(7, 9));
        store.extend_older(ChannelId(7), vec![message(7, 9), message(7, 8), message(7, 7), message(7, 6)]);
        let ids: Vec<u64> = store.messages(ChannelId(7)).iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![9, 8, 7]);
    }

    #[test]
    fn noop_accepts_everything_and_returns_nothing() {
        let store = NoopStore;
        Store::<u64, u64>::insert(&store, 1, 2);
        assert_eq!(Store::<u64, u64>::get(&store, &1), None);
        store.push(message(7, 1));
        assert!(store.messages(ChannelId(7)).is_empty());
    }
}
