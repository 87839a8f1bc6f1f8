// ── Subscription table ──
//
// topic → ordered entries of (subscriber, optional JSON-path filter).
// A topic is present iff it has at least one entry; callers subscribe
// at the transport when a topic is first added and unsubscribe when it
// is emptied.

use indexmap::IndexMap;

use crate::jsonpath::JsonPathExpr;
use crate::payload::Handler;

/// Who receives deliveries for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Subscriber {
    /// Caller-supplied callback.
    Handler(Handler),
    /// One-shot `get` waiter.
    Waiter(u64),
    /// Pending patch operation.
    Patch(u64),
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub subscriber: Subscriber,
    pub path: Option<JsonPathExpr>,
}

impl Entry {
    fn matches(&self, subscriber: &Subscriber, path: Option<&str>) -> bool {
        self.subscriber == *subscriber && self.path.as_ref().map(JsonPathExpr::as_str) == path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Added {
    /// The topic had no entries before.
    First,
    Appended,
    /// Same subscriber and path already registered; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removed {
    NotFound,
    Remaining,
    /// That was the last entry; the topic is gone.
    Emptied,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    topics: IndexMap<String, Vec<Entry>>,
}

impl SubscriptionTable {
    pub fn insert(&mut self, topic: &str, entry: Entry) -> Added {
        match self.topics.get_mut(topic) {
            Some(entries) => {
                let path = entry.path.as_ref().map(JsonPathExpr::as_str);
                if entries.iter().any(|e| e.matches(&entry.subscriber, path)) {
                    return Added::Duplicate;
                }
                entries.push(entry);
                Added::Appended
            }
            None => {
                self.topics.insert(topic.to_owned(), vec![entry]);
                Added::First
            }
        }
    }

    pub fn remove(&mut self, topic: &str, subscriber: &Subscriber, path: Option<&str>) -> Removed {
        let Some(entries) = self.topics.get_mut(topic) else {
            return Removed::NotFound;
        };
        let Some(index) = entries.iter().position(|e| e.matches(subscriber, path)) else {
            return Removed::NotFound;
        };

        entries.remove(index);
        if entries.is_empty() {
            self.topics.shift_remove(topic);
            Removed::Emptied
        } else {
            Removed::Remaining
        }
    }

    /// Snapshot of the entries for `topic`, in registration order.
    pub fn entries(&self, topic: &str) -> Vec<Entry> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(subscriber: Subscriber, path: Option<&str>) -> Entry {
        Entry {
            subscriber,
            path: path.map(|p| JsonPathExpr::parse(p).unwrap()),
        }
    }

    #[test]
    fn first_insert_is_reported() {
        let mut table = SubscriptionTable::default();
        assert_eq!(table.insert("t", entry(Subscriber::Waiter(1), None)), Added::First);
        assert_eq!(
            table.insert("t", entry(Subscriber::Waiter(2), None)),
            Added::Appended
        );
        assert_eq!(table.entries("t").len(), 2);
    }

    #[test]
    fn duplicates_are_rejected_per_handler_and_path() {
        let mut table = SubscriptionTable::default();
        let handler = Handler::new(|_| {});

        table.insert("t", entry(Subscriber::Handler(handler.clone()), None));
        assert_eq!(
            table.insert("t", entry(Subscriber::Handler(handler.clone()), None)),
            Added::Duplicate
        );
        // Same handler with a different filter is a separate entry.
        assert_eq!(
            table.insert("t", entry(Subscriber::Handler(handler), Some("$.a"))),
            Added::Appended
        );
    }

    #[test]
    fn removing_last_entry_empties_topic() {
        let mut table = SubscriptionTable::default();
        table.insert("t", entry(Subscriber::Patch(1), None));
        table.insert("t", entry(Subscriber::Patch(2), None));

        assert_eq!(
            table.remove("t", &Subscriber::Patch(1), None),
            Removed::Remaining
        );
        assert_eq!(
            table.remove("t", &Subscriber::Patch(1), None),
            Removed::NotFound
        );
        assert_eq!(table.remove("t", &Subscriber::Patch(2), None), Removed::Emptied);
        assert!(!table.contains("t"));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn removal_requires_matching_path() {
        let mut table = SubscriptionTable::default();
        table.insert("t", entry(Subscriber::Waiter(1), Some("$.a")));
        assert_eq!(table.remove("t", &Subscriber::Waiter(1), None), Removed::NotFound);
        assert_eq!(
            table.remove("t", &Subscriber::Waiter(1), Some("$.a")),
            Removed::Emptied
        );
    }
}
