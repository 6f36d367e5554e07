//! Live-connection registry.
//!
//! The table is the single source of truth for "what is currently open".
//! It is written by exactly two parties: the poller inserts on dial
//! success, and the multiplexer removes on EOF, read error, or closure
//! signal. Workers only read it to resolve topics and to reach the
//! per-connection accumulation buffer.

use crate::source::SourceUrl;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// State shared for one open source connection.
///
/// The socket itself lives inside the multiplexer's watch set; this entry
/// carries everything the other components need. The accumulation buffer
/// belongs here rather than to any worker because completing one frame
/// can span several reads.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub source_id: i64,
    pub url: SourceUrl,
    pub base_topic: String,
    /// Bytes read but not yet resolved into complete frames (demux mode).
    pub buffer: Mutex<BytesMut>,
}

impl ConnectionEntry {
    pub fn new(source_id: i64, url: SourceUrl, base_topic: String) -> Self {
        Self {
            source_id,
            url,
            base_topic,
            buffer: Mutex::new(BytesMut::new()),
        }
    }
}

/// Mapping from source id to its live connection. At most one entry per
/// source id exists at any time.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: DashMap<i64, Arc<ConnectionEntry>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<ConnectionEntry>) {
        self.entries.insert(entry.source_id, entry);
    }

    /// Remove an entry. Idempotent: removing an absent id returns `None`.
    pub fn remove(&self, source_id: i64) -> Option<Arc<ConnectionEntry>> {
        self.entries.remove(&source_id).map(|(_, entry)| entry)
    }

    pub fn get(&self, source_id: i64) -> Option<Arc<ConnectionEntry>> {
        self.entries.get(&source_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, source_id: i64) -> bool {
        self.entries.contains_key(&source_id)
    }

    pub fn source_ids(&self) -> Vec<i64> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64) -> Arc<ConnectionEntry> {
        let url = SourceUrl::parse(&format!("ntrip://caster:2101/M{}", id)).unwrap();
        let topic = url.topic("s2d/osr");
        Arc::new(ConnectionEntry::new(id, url, topic))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let table = ConnectionTable::new();
        table.insert(entry(7));
        assert!(table.contains(7));
        assert_eq!(table.get(7).unwrap().base_topic, "s2d/osr/M7/rtcm");

        assert!(table.remove(7).is_some());
        assert!(table.remove(7).is_none()); // idempotent
        assert!(table.is_empty());
    }

    #[test]
    fn test_source_ids_snapshot() {
        let table = ConnectionTable::new();
        table.insert(entry(1));
        table.insert(entry(2));
        let mut ids = table.source_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}
