use crate::core::{Result, SessionId};
use crate::operations::SessionOperation;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A session release that could not reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrphanedDeletion {
    pub session_id: SessionId,
    pub owner_id: String,
    pub invalidate: bool,
}

impl OrphanedDeletion {
    pub fn operation(&self) -> SessionOperation {
        SessionOperation::DeleteSession {
            owner_id: self.owner_id.clone(),
            invalidate: self.invalidate,
        }
    }
}

/// FIFO of deletions waiting for the store to come back.
///
/// Entries are de-duplicated: queueing a deletion that is already waiting is
/// a no-op. The queue lives in memory only; losing it on a crash leaves
/// garbage behind until the store expires it, never live data.
#[derive(Debug, Default)]
pub struct OrphanQueue {
    entries: Mutex<VecDeque<OrphanedDeletion>>,
}

impl OrphanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `deletion`. Returns false if an identical one is already queued.
    pub fn push(&self, deletion: OrphanedDeletion) -> Result<bool> {
        let mut entries = self.entries.lock()?;
        if entries.contains(&deletion) {
            return Ok(false);
        }
        entries.push_back(deletion);
        Ok(true)
    }

    /// Oldest queued deletion, left in place until [`OrphanQueue::complete`].
    pub fn front(&self) -> Result<Option<OrphanedDeletion>> {
        Ok(self.entries.lock()?.front().cloned())
    }

    /// Removes `deletion` once it reached the store.
    pub fn complete(&self, deletion: &OrphanedDeletion) -> Result<bool> {
        let mut entries = self.entries.lock()?;
        match entries.iter().position(|queued| queued == deletion) {
            Some(index) => {
                entries.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries.lock()?.is_empty())
    }

    pub fn snapshot(&self) -> Result<Vec<OrphanedDeletion>> {
        Ok(self.entries.lock()?.iter().cloned().collect())
    }
}
