//! Append-only, replayable stream for analytics consumers.
//!
//! Unlike the bus, the stream retains every entry: each reader keeps its own
//! cursor, readers never interfere with one another, and a fresh reader (or a
//! rewound one) replays from the first entry.

use std::sync::{Arc, RwLock};

use crate::notice::ProvenanceNotice;

/// Stream of finalized supply-chain notices consumed by analytics.
pub type AnalyticsStream = AppendOnlyStream<ProvenanceNotice>;

/// Shared append-only log. Clones share the same underlying entries.
#[derive(Debug)]
pub struct AppendOnlyStream<T> {
    entries: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for AppendOnlyStream<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for AppendOnlyStream<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<T: Clone> AppendOnlyStream<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its offset.
    pub fn append(&self, entry: T) -> u64 {
        // Appends only push, so a poisoned lock still holds a consistent log.
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.push(entry);
        (entries.len() - 1) as u64
    }

    pub fn len(&self) -> u64 {
        self.entries.read().map(|e| e.len() as u64).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy up to `limit` entries starting at `offset`.
    pub fn read_from(&self, offset: u64, limit: usize) -> Vec<T> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// A reader positioned at the beginning of the stream.
    pub fn reader(&self) -> StreamReader<T> {
        StreamReader {
            stream: self.clone(),
            cursor: 0,
        }
    }
}

/// Independent cursor over an [`AppendOnlyStream`].
#[derive(Debug, Clone)]
pub struct StreamReader<T> {
    stream: AppendOnlyStream<T>,
    cursor: u64,
}

impl<T: Clone> StreamReader<T> {
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Next batch of at most `max` entries; empty when caught up.
    pub fn next_batch(&mut self, max: usize) -> Vec<T> {
        let batch = self.stream.read_from(self.cursor, max);
        self.cursor += batch.len() as u64;
        batch
    }

    pub fn seek(&mut self, offset: u64) {
        self.cursor = offset;
    }

    pub fn rewind(&mut self) {
        self.seek(0);
    }
}

impl<T: Clone> Iterator for StreamReader<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.next_batch(1).into_iter().next()
    }
}
