//! # log
//!
//! why: manage the append-biased log of commands that raft replicates
//! relations: owned by node.rs, persisted through HardState via raft-storage
//! what: LogEntry struct, RaftLog with a snapshot boundary and logical indexing

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed, global across snapshots)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// The retained suffix of the log plus the snapshot boundary it follows.
///
/// Every public method takes logical (global) indices; the offset into
/// `entries` is derived internally from `snapshot_index`. Index 0 with term 0
/// is the implicit empty prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// rebuild a log from persisted parts, checking that it is gap-free
    pub fn from_parts(
        snapshot_index: u64,
        snapshot_term: u64,
        entries: Vec<LogEntry>,
    ) -> Result<Self, CoreError> {
        for (offset, entry) in entries.iter().enumerate() {
            let expected = snapshot_index + 1 + offset as u64;
            if entry.index != expected {
                return Err(CoreError::CorruptLog { expected, found: entry.index });
            }
        }
        Ok(Self { entries, snapshot_index, snapshot_term })
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    /// number of retained entries (not counting the snapshot)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// retained entries, oldest first
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index || index > self.last_index() {
            return None;
        }
        Some((index - self.snapshot_index - 1) as usize)
    }

    /// entry at a logical index, if it is still retained
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|i| &self.entries[i])
    }

    /// term at a logical index; known for retained entries and the snapshot boundary
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// true if the log holds `index` with `term` (the AppendEntries consistency check)
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// election restriction: is a log ending at (last_index, last_term) at least as up-to-date as ours
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// clone every retained entry from `from` (inclusive) to the end
    pub fn entries_from(&self, from: u64) -> Vec<LogEntry> {
        let start = from.max(self.snapshot_index + 1);
        match self.offset(start) {
            Some(i) => self.entries[i..].to_vec(),
            None => Vec::new(),
        }
    }

    /// clone the entries in `(after, through]`
    pub fn entries_between(&self, after: u64, through: u64) -> Vec<LogEntry> {
        let through = through.min(self.last_index());
        (after + 1..=through).filter_map(|i| self.get(i).cloned()).collect()
    }

    /// append a new command at the end and return its index
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(term, index, command));
        index
    }

    /// push an entry that must land exactly at `last_index() + 1`
    pub fn push(&mut self, entry: LogEntry) {
        assert_eq!(
            entry.index,
            self.last_index() + 1,
            "log gap: pushing index {} after {}",
            entry.index,
            self.last_index()
        );
        self.entries.push(entry);
    }

    /// drop `index` and every entry after it
    pub fn truncate_from(&mut self, index: u64) {
        assert!(
            index > self.snapshot_index,
            "cannot truncate into the snapshot (index {index}, boundary {})",
            self.snapshot_index
        );
        if let Some(i) = self.offset(index) {
            self.entries.truncate(i);
        }
    }

    /// first index of the run of entries sharing the term at `index`,
    /// never reaching below the snapshot boundary. used as a retry hint
    /// so a leader skips a whole mismatched term in one round trip.
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        if index <= self.snapshot_index {
            return self.snapshot_index + 1;
        }
        let term = self.term_at(index);
        let mut first = index;
        while first - 1 > self.snapshot_index && self.term_at(first - 1) == term {
            first -= 1;
        }
        first.max(self.snapshot_index + 1)
    }

    /// compact everything up to and including `index` into the snapshot boundary.
    /// returns false if `index` is not a retained entry.
    pub fn compact_to(&mut self, index: u64) -> bool {
        let Some(term) = self.get(index).map(|e| e.term) else {
            return false;
        };
        let keep = self.entries.split_off((index - self.snapshot_index) as usize);
        self.entries = keep;
        self.snapshot_index = index;
        self.snapshot_term = term;
        true
    }

    /// move the boundary to a snapshot received from the leader. the suffix
    /// after `index` is kept only if our entry at `index` carries the same term,
    /// otherwise the whole log is discarded.
    pub fn install_snapshot(&mut self, index: u64, term: u64) {
        if self.get(index).map(|e| e.term) == Some(term) {
            let keep = self.entries.split_off((index - self.snapshot_index) as usize);
            self.entries = keep;
        } else {
            self.entries.clear();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }
}
