//! The replicated log: an ordered, 1-indexed sequence of term-stamped command entries.
//!
//! The log is a plain value. Durability is the node layer's concern: the whole triple
//! `(current_term, voted_for, log)` is snapshotted to stable storage whenever any of it changes,
//! so the log needs no storage trait of its own.

use alloc::vec::Vec;

use crate::message::{LogEntry, LogIndex, Term};

/// An ordered sequence of [`LogEntry`] values indexed `1..=len`.
///
/// Index 0 is the sentinel before the first entry and carries implicit term 0. Terms across the
/// sequence are non-decreasing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    /// Constructs an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a log from recovered entries, in index order starting at 1.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        debug_assert!(entries.windows(2).all(|pair| pair[0].term <= pair[1].term));
        Self { entries }
    }

    /// The number of entries, which is also the index of the last entry.
    pub fn len(&self) -> LogIndex {
        LogIndex(self.entries.len() as u64)
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry at `index`, or `None` at the sentinel and past the end.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        let offset = index.checked_sub(1)?;
        self.entries.get(offset.0 as usize)
    }

    /// The term of the entry at `index`. `Some(Term(0))` at the sentinel, `None` past the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex(0) {
            Some(Term(0))
        } else {
            self.get(index).map(|entry| entry.term)
        }
    }

    /// The index of the last entry, or the sentinel if empty.
    pub fn last_index(&self) -> LogIndex {
        self.len()
    }

    /// The term of the last entry, or term 0 if empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|entry| entry.term).unwrap_or_default()
    }

    /// Appends an entry at index `len + 1`.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert!(entry.term >= self.last_term());
        self.entries.push(entry);
    }

    /// Removes the entry at `from` and everything after it, returning the number removed.
    ///
    /// `from` must be at least 1; truncating past the end removes nothing.
    pub fn truncate_from(&mut self, from: LogIndex) -> usize {
        assert!(from >= LogIndex(1));
        let keep = (from.0 - 1) as usize;
        let removed = self.entries.len().saturating_sub(keep);
        self.entries.truncate(keep);
        removed
    }

    /// The entries at `from` and after it, in index order. Empty past the end.
    ///
    /// `from` must be at least 1.
    pub fn entries_from(&self, from: LogIndex) -> &[LogEntry] {
        assert!(from >= LogIndex(1));
        let offset = ((from.0 - 1) as usize).min(self.entries.len());
        &self.entries[offset..]
    }

    /// All entries paired with their indices `1..=len`.
    pub fn iter(&self) -> impl Iterator<Item = (LogIndex, &LogEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(offset, entry)| (LogIndex(offset as u64 + 1), entry))
    }

    /// A view of the raw entries, first to last.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
