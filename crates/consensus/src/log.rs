//! The replicated log.

use crate::LogError;
use consortium_types::LogEntry;

/// Ordered log entries with a commit index.
///
/// Indices start at 1 and are contiguous. Entries at or below the commit
/// index are final; the uncommitted tail may be replaced by a leader of a
/// newer term.
#[derive(Debug, Clone, Default)]
pub struct ReplicationLog {
    entries: Vec<LogEntry>,
    commit_index: u64,
}

impl ReplicationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`. Index 0 has term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) - 1;
        self.entries
            .iter()
            .skip(start as usize)
            .take(max)
            .cloned()
            .collect()
    }

    /// Committed entries with index in `from..=commit_index`, at most `max`.
    pub fn committed_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.entries_from(from, max)
            .into_iter()
            .take_while(|e| e.index <= self.commit_index)
            .collect()
    }

    /// Append one entry at the next index.
    pub fn append(&mut self, entry: LogEntry) -> Result<(), LogError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(LogError::IndexGap {
                expected,
                got: entry.index,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Drop every entry at or after `index`. Committed entries cannot be
    /// dropped.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), LogError> {
        if index <= self.commit_index {
            return Err(LogError::IndexRegression {
                index,
                commit_index: self.commit_index,
            });
        }
        self.entries.truncate((index - 1) as usize);
        Ok(())
    }

    /// Advance the commit index to `index`, returning the newly committed
    /// entries. Never moves backwards: an `index` at or below the current
    /// commit index is a no-op.
    pub fn commit_to(&mut self, index: u64) -> Result<Vec<LogEntry>, LogError> {
        if index <= self.commit_index {
            return Ok(Vec::new());
        }
        if index > self.last_index() {
            return Err(LogError::UnknownIndex(index));
        }
        let newly = self.entries[self.commit_index as usize..index as usize].to_vec();
        self.commit_index = index;
        Ok(newly)
    }
}
