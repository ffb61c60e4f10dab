//! Per-file chunk ring buffer
//!
//! A `FileMeta` keeps the last `capacity` chunk placements of a file.
//! Appending past capacity overwrites the oldest entry. Readers walk the
//! ring newest-first so that later writes shadow earlier ones.

use crate::types::{ChunkMeta, File};
use serde::{Deserialize, Serialize};

/// Placement history of one logical file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file: File,
    chunks: Vec<ChunkMeta>,
    capacity: usize,
    current_index: usize,
    count: usize,
    /// Bumped on every mutation so compare-and-swap never sees ABA
    version: u64,
}

impl FileMeta {
    pub fn new(file: File, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            file,
            chunks: Vec::new(),
            capacity,
            current_index: 0,
            count: 0,
            version: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slot the next append will use
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Append a placement, returning the entry it evicted
    pub fn append(&mut self, chunk: ChunkMeta) -> Option<ChunkMeta> {
        let evicted = if self.chunks.len() < self.capacity {
            self.chunks.push(chunk);
            None
        } else {
            Some(std::mem::replace(&mut self.chunks[self.current_index], chunk))
        };

        self.current_index = (self.current_index + 1) % self.capacity;
        self.count = (self.count + 1).min(self.capacity);
        self.version += 1;
        evicted
    }

    fn slot(&self, age: usize) -> usize {
        (self.current_index + self.capacity - 1 - age) % self.capacity
    }

    /// Entries from most to least recently appended
    pub fn newest_first(&self) -> impl Iterator<Item = &ChunkMeta> + '_ {
        (0..self.count).map(move |age| &self.chunks[self.slot(age)])
    }

    /// Replace the newest entry matching `pred` with `f(entry)`.
    /// Returns false when no entry matches.
    pub fn update_newest<P, F>(&mut self, pred: P, f: F) -> bool
    where
        P: Fn(&ChunkMeta) -> bool,
        F: FnOnce(&mut ChunkMeta),
    {
        let found = (0..self.count)
            .map(|age| self.slot(age))
            .find(|&slot| pred(&self.chunks[slot]));

        match found {
            Some(slot) => {
                f(&mut self.chunks[slot]);
                self.version += 1;
                true
            }
            None => false,
        }
    }

    /// Remove every entry, returning them oldest first
    pub fn drain(&mut self) -> Vec<ChunkMeta> {
        let mut out: Vec<ChunkMeta> = self.newest_first().cloned().collect();
        out.reverse();
        self.chunks.clear();
        self.current_index = 0;
        self.count = 0;
        self.version += 1;
        out
    }
}
