//! Log store with snapshot-boundary bookkeeping.
//!
//! Position 0 always holds a sentinel entry whose index and term describe
//! the last entry covered by the current snapshot (`0/0` before any
//! compaction). Real entries follow it with consecutive absolute indices,
//! so `entries.len() == last_index - snapshot_index + 1`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub command: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLog {
    entries: Vec<Entry>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry {
                index: 0,
                term: 0,
                command: Bytes::new(),
            }],
        }
    }

    /// Rebuilds a log from persisted entries, rejecting gaps or a missing
    /// sentinel.
    pub fn from_entries(entries: Vec<Entry>) -> Option<Self> {
        let first = entries.first()?.index;
        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(offset, e)| e.index == first + offset as u64);
        contiguous.then_some(Self { entries })
    }

    pub fn snapshot_index(&self) -> u64 {
        self.entries[0].index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.entries[0].term
    }

    pub fn last_index(&self) -> u64 {
        self.entries[self.entries.len() - 1].index
    }

    pub fn last_term(&self) -> u64 {
        self.entries[self.entries.len() - 1].term
    }

    /// Number of entries stored after the snapshot boundary.
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index < self.snapshot_index() || index > self.last_index() {
            return None;
        }
        Some((index - self.snapshot_index()) as usize)
    }

    /// Term of the entry at `index`, including the snapshot boundary itself.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.position(index).map(|pos| self.entries[pos].term)
    }

    /// Entry at `index`; entries folded into the snapshot are gone.
    pub fn get(&self, index: u64) -> Option<&Entry> {
        match self.position(index) {
            Some(0) | None => None,
            Some(pos) => Some(&self.entries[pos]),
        }
    }

    /// Up to `limit` entries starting at `index`.
    pub fn entries_from(&self, index: u64, limit: usize) -> Vec<Entry> {
        let start = index.max(self.snapshot_index() + 1);
        match self.position(start) {
            Some(pos) => self.entries[pos..].iter().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn append(&mut self, term: u64, command: Bytes) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(Entry {
            index,
            term,
            command,
        });
        index
    }

    pub fn push(&mut self, entry: Entry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drops `index` and everything after it. The sentinel is never removed.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.saturating_sub(self.snapshot_index()).max(1) as usize;
        self.entries.truncate(keep);
    }

    /// First index of the run of entries sharing the term found at `index`,
    /// never reaching back into the snapshot.
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut first = index;
        while first > self.snapshot_index() + 1
            && self.term_at(first - 1) == Some(term)
        {
            first -= 1;
        }
        first
    }

    /// Highest index holding an entry of `term`, the boundary included.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.term >= term)
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Moves the snapshot boundary to `index`/`term`.
    ///
    /// When the log holds a matching entry at `index`, the suffix after it
    /// survives; otherwise the whole log is discarded.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        let sentinel = Entry {
            index,
            term,
            command: Bytes::new(),
        };
        if self.term_at(index) == Some(term) {
            if let Some(pos) = self.position(index) {
                self.entries.drain(..pos);
                self.entries[0] = sentinel;
                return;
            }
        }
        self.entries = vec![sentinel];
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().skip(1)
    }

    pub(crate) fn raw(&self) -> &[Entry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(*term, Bytes::from(format!("cmd-{}", i + 1)));
        }
        log
    }

    #[test]
    fn empty_log_has_zero_boundary() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert!(log.get(0).is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn append_assigns_consecutive_indices() {
        let log = log_with_terms(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(2).map(|e| e.term), Some(1));
        assert_eq!(log.term_at(4), None);
    }

    #[test]
    fn truncate_keeps_prefix_and_sentinel() {
        let mut log = log_with_terms(&[1, 1, 2, 3]);
        log.truncate_from(3);
        assert_eq!(log.last_index(), 2);
        log.truncate_from(0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.term_at(0), Some(0));
    }

    #[test]
    fn compact_retains_matching_suffix() {
        let mut log = log_with_terms(&[1, 1, 2, 2, 3]);
        log.compact_to(3, 2);
        assert_eq!(log.snapshot_index(), 3);
        assert_eq!(log.snapshot_term(), 2);
        assert_eq!(log.last_index(), 5);
        assert!(log.get(3).is_none());
        assert_eq!(log.get(4).map(|e| e.term), Some(2));
        assert_eq!(log.entries_from(1, 10).len(), 2);
    }

    #[test]
    fn compact_discards_divergent_log() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.compact_to(3, 5);
        assert_eq!(log.snapshot_index(), 3);
        assert_eq!(log.last_index(), 3);
        assert!(log.is_empty());

        let mut log = log_with_terms(&[1]);
        log.compact_to(10, 4);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
    }

    #[test]
    fn term_lookups_for_conflict_hints() {
        let log = log_with_terms(&[1, 2, 2, 2, 4]);
        assert_eq!(log.first_index_of_term(4), 2);
        assert_eq!(log.first_index_of_term(5), 5);
        assert_eq!(log.last_index_of_term(2), Some(4));
        assert_eq!(log.last_index_of_term(3), None);
        assert_eq!(log.last_index_of_term(0), Some(0));
    }

    #[test]
    fn entries_from_respects_limit() {
        let log = log_with_terms(&[1, 1, 1, 1]);
        let batch = log.entries_from(2, 2);
        assert_eq!(
            batch.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(log.entries_from(5, 2).is_empty());
    }

    #[test]
    fn from_entries_rejects_gaps() {
        let log = log_with_terms(&[1, 2]);
        let mut raw = log.raw().to_vec();
        assert!(RaftLog::from_entries(raw.clone()).is_some());
        raw.remove(1);
        assert!(RaftLog::from_entries(raw).is_none());
        assert!(RaftLog::from_entries(Vec::new()).is_none());
    }
}
