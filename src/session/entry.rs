use crate::core::{AttributeValue, Result};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Locally cached attribute of one session.
///
/// Lifecycle: clean -> dirty on write -> clean once flushed; a delete makes
/// the entry removed+dirty and a successful flush evicts it. Transient entries
/// never become dirty.
///
/// The value lock also guards the version bump and the dirty flag, so a flush
/// can only clear `dirty` for the exact version it sent.
#[derive(Debug)]
pub struct LocalCacheEntry {
    value: RwLock<Option<AttributeValue>>,
    dirty: AtomicBool,
    removed: AtomicBool,
    reload: AtomicBool,
    transient: bool,
    version: AtomicU64,
}

/// What a flush sends for one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    /// `None` for a removed entry (sent as a tombstone).
    pub value: Option<AttributeValue>,
    pub removed: bool,
    pub version: u64,
}

impl LocalCacheEntry {
    /// Entry holding a value read from the store.
    pub fn loaded(value: AttributeValue, transient: bool) -> Self {
        Self {
            value: RwLock::new(Some(value)),
            dirty: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            reload: AtomicBool::new(false),
            transient,
            version: AtomicU64::new(0),
        }
    }

    /// Empty placeholder, about to be written or removed.
    pub fn empty(transient: bool) -> Self {
        Self {
            value: RwLock::new(None),
            dirty: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            reload: AtomicBool::new(false),
            transient,
            version: AtomicU64::new(0),
        }
    }

    pub fn value(&self) -> Result<Option<AttributeValue>> {
        if self.is_removed() {
            return Ok(None);
        }
        Ok(self.value.read()?.clone())
    }

    /// Stores a local write and returns its version.
    pub fn write(&self, value: AttributeValue) -> Result<u64> {
        let mut slot = self.value.write()?;
        *slot = Some(value);
        self.removed.store(false, Ordering::Release);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        // Flag last: a reader that sees dirty also sees the new value.
        self.dirty.store(!self.transient, Ordering::Release);
        Ok(version)
    }

    /// Records a local delete and returns its version.
    pub fn remove(&self) -> Result<u64> {
        let mut slot = self.value.write()?;
        *slot = None;
        self.removed.store(true, Ordering::Release);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.dirty.store(!self.transient, Ordering::Release);
        Ok(version)
    }

    /// Replaces the value with a fresh read from the store unless a local
    /// write is pending. Clears the reload mark either way.
    pub fn refresh(&self, value: Option<AttributeValue>) -> Result<()> {
        let mut slot = self.value.write()?;
        if !self.dirty.load(Ordering::Acquire) {
            *slot = value;
            self.removed.store(false, Ordering::Release);
        }
        self.reload.store(false, Ordering::Release);
        Ok(())
    }

    /// Snapshot of a dirty entry, or `None` when there is nothing to send.
    pub fn pending(&self) -> Result<Option<EntrySnapshot>> {
        let slot = self.value.read()?;
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(None);
        }
        let removed = self.removed.load(Ordering::Acquire);
        Ok(Some(EntrySnapshot {
            value: if removed { None } else { slot.clone() },
            removed,
            version: self.version.load(Ordering::Acquire),
        }))
    }

    /// Clears `dirty` if nothing was written since `version` was sent.
    /// Returns true when the entry is now clean.
    pub fn mark_clean(&self, version: u64) -> Result<bool> {
        let _slot = self.value.write()?;
        if self.version.load(Ordering::Acquire) != version {
            return Ok(false);
        }
        self.dirty.store(false, Ordering::Release);
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn needs_reload(&self) -> bool {
        self.reload.load(Ordering::Acquire)
    }

    pub fn mark_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}
