// ── Last-value cache ──
//
// One entry per topic, holding the raw payload of the last delivery (or
// local write). Bounded: least recently used topics are evicted first.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::payload::MessageKind;

/// Cached last value of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
    pub payload: Bytes,
    pub cached_at: DateTime<Utc>,
    pub kind: MessageKind,
}

/// LRU map of topic → last payload. Capacity `0` disables caching.
#[derive(Debug, Default)]
pub struct PayloadCache {
    entries: IndexMap<String, CachedPayload>,
    capacity: usize,
}

impl PayloadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, topic: &str, payload: Bytes, kind: MessageKind) {
        if self.capacity == 0 {
            return;
        }

        let entry = CachedPayload {
            payload,
            cached_at: Utc::now(),
            kind,
        };
        let (index, _) = self.entries.insert_full(topic.to_owned(), entry);
        self.touch(index);

        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    /// Look up and mark as recently used.
    pub fn get(&mut self, topic: &str) -> Option<&CachedPayload> {
        let index = self.entries.get_index_of(topic)?;
        let last = self.touch(index);
        self.entries.get_index(last).map(|(_, entry)| entry)
    }

    /// Look up without affecting eviction order.
    #[cfg(test)]
    pub fn peek(&self, topic: &str) -> Option<&CachedPayload> {
        self.entries.get(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, index: usize) -> usize {
        let last = self.entries.len().saturating_sub(1);
        self.entries.move_index(index, last);
        last
    }
}
