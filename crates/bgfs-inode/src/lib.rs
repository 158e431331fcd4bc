#![forbid(unsafe_code)]
//! File block trees and truncation.
//!
//! An inode maps logical blocks through 15 slots: 12 direct pointers, then
//! the roots of a single, double and triple indirect tree. Address blocks
//! hold `block_size / 4` little-endian `u32` pointers; `0` is a hole.
//!
//! [`BlockMapper`] resolves (and, when asked, grows) the tree.
//! [`TruncationEngine`] shrinks it.

pub mod map;
pub mod truncate;

pub use map::BlockMapper;
pub use truncate::{PassOutcome, PassReport, RetryPolicy, TruncateReport, TruncationEngine};

use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::InodeRecord;
use bgfs_types::{BlockNumber, DIND_SLOT, IND_SLOT, InodeNumber, N_BLOCK_SLOTS, N_DIRECT, TIND_SLOT};
use serde::{Deserialize, Serialize};

// ── Block tree ──────────────────────────────────────────────────────────────

/// The 15 block slots of an inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlockTree {
    slots: [u32; N_BLOCK_SLOTS],
}

impl FileBlockTree {
    #[must_use]
    pub fn from_slots(slots: [u32; N_BLOCK_SLOTS]) -> Self {
        Self { slots }
    }

    #[must_use]
    pub fn slots(&self) -> &[u32; N_BLOCK_SLOTS] {
        &self.slots
    }

    /// Raw pointer in `slot`, `0` for a hole. Out-of-range slots read as holes.
    #[must_use]
    pub fn get(&self, slot: usize) -> u32 {
        self.slots.get(slot).copied().unwrap_or(0)
    }

    pub fn set(&mut self, slot: usize, block: BlockNumber) -> Result<()> {
        let ptr = block
            .to_pointer()
            .map_err(|e| BgfsError::Parse(e.to_string()))?;
        match self.slots.get_mut(slot) {
            Some(entry) => {
                *entry = ptr;
                Ok(())
            }
            None => Err(BgfsError::Format(format!(
                "block slot {slot} out of range"
            ))),
        }
    }

    /// Sever `slot` and return what it pointed to.
    ///
    /// The returned block is still allocated; releasing it is the second step.
    pub fn clear_slot(&mut self, slot: usize) -> Option<BlockNumber> {
        let entry = self.slots.get_mut(slot)?;
        let old = std::mem::take(entry);
        BlockNumber::from_pointer(old)
    }

    #[must_use]
    pub fn direct(&self) -> &[u32] {
        &self.slots[..N_DIRECT]
    }

    #[must_use]
    pub fn indirect_root(&self) -> Option<BlockNumber> {
        BlockNumber::from_pointer(self.slots[IND_SLOT])
    }

    #[must_use]
    pub fn double_indirect_root(&self) -> Option<BlockNumber> {
        BlockNumber::from_pointer(self.slots[DIND_SLOT])
    }

    #[must_use]
    pub fn triple_indirect_root(&self) -> Option<BlockNumber> {
        BlockNumber::from_pointer(self.slots[TIND_SLOT])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| *s == 0)
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// In-memory inode: the fields truncation and block mapping touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub ino: InodeNumber,
    pub mode: u16,
    pub links_count: u16,
    pub size: u64,
    /// Blocks in use, data and address blocks alike.
    pub blocks: u32,
    pub mtime: u32,
    pub tree: FileBlockTree,
    dirty: bool,
}

impl Inode {
    #[must_use]
    pub fn new(ino: InodeNumber, mode: u16) -> Self {
        Self {
            ino,
            mode,
            links_count: 1,
            size: 0,
            blocks: 0,
            mtime: 0,
            tree: FileBlockTree::default(),
            dirty: false,
        }
    }

    #[must_use]
    pub fn from_record(ino: InodeNumber, record: &InodeRecord) -> Self {
        Self {
            ino,
            mode: record.mode,
            links_count: record.links_count,
            size: record.size,
            blocks: record.blocks,
            mtime: record.mtime,
            tree: FileBlockTree::from_slots(record.block),
            dirty: false,
        }
    }

    #[must_use]
    pub fn to_record(&self) -> InodeRecord {
        InodeRecord {
            mode: self.mode,
            links_count: self.links_count,
            size: self.size,
            mtime: self.mtime,
            blocks: self.blocks,
            block: *self.tree.slots(),
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Called once the inode has been written back.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn add_usage(&mut self, n: u32) {
        self.blocks = self.blocks.saturating_add(n);
    }

    pub(crate) fn drop_usage(&mut self, n: u32) {
        self.blocks = self.blocks.saturating_sub(n);
    }
}
