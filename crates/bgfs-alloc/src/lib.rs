#![forbid(unsafe_code)]
//! Block allocation and deallocation.
//!
//! ## Design
//!
//! The free-space engine is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on block bitmaps.
//! 2. **GroupDescriptorTable**: per-group bitmap location and free count.
//! 3. **BlockBitmapCache**: bounded cache of loaded bitmap buffers.
//! 4. **FilesystemState**: allocate/free under the counters it owns.
//! 5. **Filesystem**: the super lock serialising every mutation.
//!
//! All bitmap and counter mutation happens while holding the single
//! filesystem-wide lock. There is no per-group locking.

pub mod bitmap_cache;
pub mod group;
pub mod mkfs;
pub mod state;

pub use bitmap_cache::{BitmapCacheStats, BlockBitmapCache, DEFAULT_BITMAP_CACHE_CAPACITY};
pub use group::GroupDescriptorTable;
pub use mkfs::{FormatOptions, format_volume};
pub use state::{DoubleFreePolicy, Filesystem, FilesystemState, MountOptions};

use bgfs_ondisk::{Superblock, descs_per_block};
use bgfs_types::{BlockNumber, GroupNumber, SUPERBLOCK_OFFSET};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// First-fit: the lowest free (zero) bit among the first `count` bits.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    let full_bytes = ((count / 8) as usize).min(bitmap.len());
    // Skip fully allocated bytes eight bits at a time.
    let first = bitmap[..full_bytes].iter().position(|b| *b != 0xFF);
    let start = match first {
        Some(byte) => u32::try_from(byte).ok()? * 8,
        None => u32::try_from(full_bytes).ok()? * 8,
    };
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsGeometry {
    pub block_size: u32,
    pub total_blocks: u64,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub group_count: u32,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock.
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            block_size: sb.block_size,
            total_blocks: u64::from(sb.blocks_count),
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            group_count: sb.group_count(),
        }
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(group_start);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        let abs = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group)
            + u64::from(rel_block);
        BlockNumber(abs)
    }

    /// Convert an absolute block to `(group, relative_block)`.
    ///
    /// `None` when the block lies outside the data region.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn group_for(&self, block: BlockNumber) -> Option<(GroupNumber, u32)> {
        if !self.is_data_block(block) {
            return None;
        }
        let rel = block.0 - u64::from(self.first_data_block);
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        Some((GroupNumber(group), offset))
    }

    /// Whether `block` lies in `first_data_block..total_blocks`.
    #[must_use]
    pub fn is_data_block(&self, block: BlockNumber) -> bool {
        block.0 >= u64::from(self.first_data_block) && block.0 < self.total_blocks
    }

    /// Block holding the superblock, and the superblock's byte offset in it.
    #[must_use]
    pub fn superblock_location(&self) -> (BlockNumber, usize) {
        let bs = self.block_size as usize;
        (
            BlockNumber((SUPERBLOCK_OFFSET / bs) as u64),
            SUPERBLOCK_OFFSET % bs,
        )
    }

    #[must_use]
    pub fn superblock_block(&self) -> BlockNumber {
        self.superblock_location().0
    }

    /// First block of the group descriptor table.
    #[must_use]
    pub fn gdt_block(&self) -> BlockNumber {
        BlockNumber(self.superblock_block().0 + 1)
    }

    /// Number of blocks occupied by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        self.group_count
            .div_ceil(descs_per_block(self.block_size).max(1))
    }
}
