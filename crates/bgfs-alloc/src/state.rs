//! Whole-volume free-space state and the super lock.
//!
//! [`FilesystemState`] owns the counters, the descriptor table and the
//! bitmap cache. Its mutating methods take `&mut self`, so exclusive access
//! is the caller's problem; [`Filesystem`] solves it with one
//! `parking_lot::Mutex` around the whole state.

use crate::{
    BitmapCacheStats, BlockBitmapCache, DEFAULT_BITMAP_CACHE_CAPACITY, FsGeometry,
    GroupDescriptorTable, bitmap_clear, bitmap_count_free, bitmap_find_free, bitmap_get,
    bitmap_set,
};
use bgfs_block::{BufferCache, BufferHandle};
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::{FsState, Superblock};
use bgfs_types::{
    BlockNumber, BlockSize, GroupNumber, SUPERBLOCK_SIZE, write_le_u16, write_le_u32,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ── Options ─────────────────────────────────────────────────────────────────

/// What `free` does with a block whose bitmap bit is already clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoubleFreePolicy {
    /// Log a warning and leave the counters alone.
    #[default]
    Tolerate,
    /// Fail with [`BgfsError::DoubleFree`].
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Bitmap buffers kept loaded (K).
    pub bitmap_cache_capacity: usize,
    /// Buffers the block cache keeps before releasing clean ones.
    pub buffer_cache_capacity: usize,
    pub double_free: DoubleFreePolicy,
    /// Compare every group's free count against its bitmap while mounting.
    pub check_on_mount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            bitmap_cache_capacity: DEFAULT_BITMAP_CACHE_CAPACITY,
            buffer_cache_capacity: 4096,
            double_free: DoubleFreePolicy::Tolerate,
            check_on_mount: false,
        }
    }
}

// ── FilesystemState ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FilesystemState {
    geometry: FsGeometry,
    cache: Arc<BufferCache>,
    gdt: GroupDescriptorTable,
    bitmaps: BlockBitmapCache,
    free_blocks: u64,
    reserved_blocks: u64,
    options: MountOptions,
    halted: Option<String>,
}

impl FilesystemState {
    /// Read the superblock and descriptor table through `cache`.
    pub fn open(cache: Arc<BufferCache>, options: MountOptions) -> Result<Self> {
        BlockSize::new(cache.block_size())
            .map_err(|e| BgfsError::UnsupportedBlockSize(e.to_string()))?;
        let layout = FsGeometry {
            block_size: cache.block_size(),
            total_blocks: cache.block_count(),
            first_data_block: 0,
            blocks_per_group: 1,
            group_count: 0,
        };
        let (sb_block, sb_offset) = layout.superblock_location();
        let handle = cache.bread(sb_block)?;
        let sb = handle
            .with_data(|data| {
                Superblock::parse_superblock_region(&data[sb_offset..sb_offset + SUPERBLOCK_SIZE])
            })
            .map_err(|e| BgfsError::Parse(e.to_string()))?;
        drop(handle);

        sb.validate()
            .map_err(|e| BgfsError::InvalidGeometry(e.to_string()))?;
        if sb.block_size != cache.block_size() {
            return Err(BgfsError::UnsupportedBlockSize(format!(
                "superblock block_size {} but device block_size {}",
                sb.block_size,
                cache.block_size()
            )));
        }
        if u64::from(sb.blocks_count) > cache.block_count() {
            return Err(BgfsError::InvalidGeometry(format!(
                "superblock claims {} blocks, device has {}",
                sb.blocks_count,
                cache.block_count()
            )));
        }
        if sb.state == FsState::ErrorsDetected {
            warn!("mount: volume was marked with errors");
        }

        let geometry = FsGeometry::from_superblock(&sb);
        let gdt = GroupDescriptorTable::load(&cache, &geometry)?;
        let free_blocks = u64::from(sb.free_blocks_count);
        if gdt.total_free() != free_blocks {
            return Err(BgfsError::Corruption {
                block: sb_block.0,
                detail: format!(
                    "superblock free count {free_blocks} but groups sum to {}",
                    gdt.total_free()
                ),
            });
        }
        let bitmaps = BlockBitmapCache::new(geometry.group_count, options.bitmap_cache_capacity)?;

        let mut state = Self {
            geometry,
            cache,
            gdt,
            bitmaps,
            free_blocks,
            reserved_blocks: u64::from(sb.r_blocks_count),
            options,
            halted: None,
        };
        if state.options.check_on_mount {
            state.verify_free_counts()?;
        }
        info!(
            blocks = geometry.total_blocks,
            groups = geometry.group_count,
            block_size = geometry.block_size,
            free = state.free_blocks,
            "mount: free-space state loaded"
        );
        Ok(state)
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn buffer_cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn free_blocks_count(&self) -> u64 {
        self.free_blocks
    }

    #[must_use]
    pub fn reserved_blocks_count(&self) -> u64 {
        self.reserved_blocks
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.geometry.group_count
    }

    pub fn group_free_count(&self, group: GroupNumber) -> Result<u32> {
        self.gdt.free_count(group)
    }

    #[must_use]
    pub fn descriptor_table(&self) -> &GroupDescriptorTable {
        &self.gdt
    }

    #[must_use]
    pub fn bitmap_cache_stats(&self) -> BitmapCacheStats {
        self.bitmaps.stats()
    }

    /// Groups whose bitmaps are currently loaded.
    #[must_use]
    pub fn loaded_bitmap_groups(&self) -> Vec<GroupNumber> {
        self.bitmaps.loaded_groups()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    #[must_use]
    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Superblock, descriptor table and bitmap blocks.
    #[must_use]
    pub fn is_system_block(&self, block: BlockNumber) -> bool {
        let gdt_start = self.geometry.gdt_block().0;
        let gdt_end = gdt_start + u64::from(self.geometry.gdt_blocks());
        block == self.geometry.superblock_block()
            || (gdt_start..gdt_end).contains(&block.0)
            || self.gdt.is_bitmap_block(block)
    }

    fn ensure_live(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(BgfsError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Enter the halted mode and return the corruption error to surface.
    ///
    /// The on-disk superblock is flagged as having errors. Counters and
    /// bitmaps are left exactly as found.
    fn halt(&mut self, block: u64, detail: String) -> BgfsError {
        error!(block, detail = %detail, "corruption: halting free-space mutation");
        if self.halted.is_none() {
            self.halted = Some(format!("block {block}: {detail}"));
            if let Err(err) = self.write_superblock_state(FsState::ErrorsDetected) {
                error!(error = %err, "corruption: could not flag superblock");
            }
        }
        BgfsError::Corruption { block, detail }
    }

    /// Corruption reported by the descriptor table or the bitmap cache halts
    /// the state like any other.
    fn escalate(&mut self, err: BgfsError) -> BgfsError {
        match err {
            BgfsError::Corruption { block, detail } => self.halt(block, detail),
            other => other,
        }
    }

    fn group_bitmap(&mut self, group: GroupNumber) -> Result<BufferHandle> {
        let loaded = self.bitmaps.get(&self.cache, &self.gdt, group);
        loaded.map_err(|e| self.escalate(e))
    }

    fn group_free(&mut self, group: GroupNumber) -> Result<u32> {
        let count = self.gdt.free_count(group);
        count.map_err(|e| self.escalate(e))
    }

    fn set_group_free(&mut self, group: GroupNumber, count: u32) -> Result<()> {
        let stored = self.gdt.set_free_count(group, count);
        stored.map_err(|e| self.escalate(e))
    }

    fn write_superblock_state(&self, state: FsState) -> Result<()> {
        let (block, offset) = self.geometry.superblock_location();
        let handle = self.cache.bread(block)?;
        handle
            .with_data_mut(|data| {
                write_le_u16(data, offset + Superblock::STATE_OFFSET, state.to_raw())
            })
            .map_err(|e| BgfsError::Parse(e.to_string()))?;
        handle.mark_dirty();
        Ok(())
    }

    fn persist_counters(&self, group: GroupNumber) -> Result<()> {
        self.gdt.persist(&self.cache, group)?;
        let count = u32::try_from(self.free_blocks)
            .map_err(|_| BgfsError::InvalidGeometry("free count overflows u32".to_owned()))?;
        let (block, offset) = self.geometry.superblock_location();
        let handle = self.cache.bread(block)?;
        handle
            .with_data_mut(|data| {
                write_le_u32(data, offset + Superblock::FREE_BLOCKS_COUNT_OFFSET, count)
            })
            .map_err(|e| BgfsError::Parse(e.to_string()))?;
        handle.mark_dirty();
        Ok(())
    }

    // ── BlockAllocator ──────────────────────────────────────────────────

    /// Claim one free block and zero it.
    ///
    /// Unprivileged callers (`reserved_ok == false`) cannot dip into the
    /// reserved pool. Groups are scanned from group 0 every time.
    pub fn allocate_block(&mut self, reserved_ok: bool) -> Result<BlockNumber> {
        self.ensure_live()?;
        if self.free_blocks == 0 || (self.free_blocks <= self.reserved_blocks && !reserved_ok) {
            debug!(
                free = self.free_blocks,
                reserved = self.reserved_blocks,
                reserved_ok,
                "alloc: no space"
            );
            return Err(BgfsError::NoSpace);
        }

        let mut skipped = vec![false; self.geometry.group_count as usize];
        loop {
            let mut candidate = None;
            for g in 0..self.geometry.group_count {
                let group = GroupNumber(g);
                if !skipped[g as usize] && self.group_free(group)? > 0 {
                    candidate = Some(group);
                    break;
                }
            }
            let Some(group) = candidate else {
                warn!(free = self.free_blocks, "alloc: counters promise space no group has");
                return Err(BgfsError::NoSpace);
            };

            let bitmap = self.group_bitmap(group)?;
            let limit = self.geometry.blocks_in_group(group);
            let claimed = bitmap.with_data_mut(|bm| {
                let bit = bitmap_find_free(bm, limit)?;
                bitmap_set(bm, bit);
                Some(bit)
            });
            let Some(bit) = claimed else {
                error!(
                    group = group.0,
                    free = self.group_free(group)?,
                    "alloc: group bitmap full despite nonzero free count"
                );
                skipped[group.0 as usize] = true;
                continue;
            };
            bitmap.mark_dirty();

            let block = self.geometry.group_block_to_absolute(group, bit);
            if block.0 >= self.geometry.total_blocks || self.is_system_block(block) {
                return Err(self.halt(
                    block.0,
                    format!("group {group} bit {bit} maps to a non-data block"),
                ));
            }

            let data = self.cache.getblk(block)?;
            data.zero_fill();
            drop(data);

            let group_free = self.group_free(group)?;
            self.set_group_free(group, group_free - 1)?;
            self.free_blocks -= 1;
            self.persist_counters(group)?;
            debug!(block = block.0, group = group.0, "alloc: block allocated");
            return Ok(block);
        }
    }

    // ── BlockDeallocator ────────────────────────────────────────────────

    /// Return one block to its group.
    pub fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        self.free_blocks(block, 1).map(|_| ())
    }

    /// Free `count` contiguous blocks starting at `start`.
    ///
    /// The whole run is validated before anything changes. Each group the run
    /// touches has its bitmap loaded and its counters persisted once. Returns
    /// how many blocks actually went from allocated to free.
    pub fn free_blocks(&mut self, start: BlockNumber, count: u64) -> Result<u64> {
        self.ensure_live()?;
        if count == 0 {
            return Ok(0);
        }
        let end = start.0.checked_add(count).ok_or_else(|| BgfsError::InvalidBlock {
            block: start.0,
            detail: "run length overflows".to_owned(),
        })?;
        for b in start.0..end {
            let block = BlockNumber(b);
            if !self.geometry.is_data_block(block) {
                return Err(BgfsError::InvalidBlock {
                    block: b,
                    detail: "outside the data region".to_owned(),
                });
            }
            if self.is_system_block(block) {
                return Err(BgfsError::InvalidBlock {
                    block: b,
                    detail: "metadata block".to_owned(),
                });
            }
        }

        let mut freed = 0_u64;
        let mut cursor = start.0;
        while cursor < end {
            let Some((group, first_bit)) = self.geometry.group_for(BlockNumber(cursor)) else {
                return Err(BgfsError::InvalidBlock {
                    block: cursor,
                    detail: "outside the data region".to_owned(),
                });
            };
            let in_group = u64::from(self.geometry.blocks_in_group(group) - first_bit);
            let span = in_group.min(end - cursor);
            freed += self.free_in_group(group, cursor, first_bit, span)?;
            cursor += span;
        }
        Ok(freed)
    }

    #[expect(clippy::cast_possible_truncation)]
    fn free_in_group(
        &mut self,
        group: GroupNumber,
        first_block: u64,
        first_bit: u32,
        span: u64,
    ) -> Result<u64> {
        // `span` never exceeds the group size, which is a u32.
        let last_bit = first_bit + span as u32;

        let bitmap = self.group_bitmap(group)?;
        if self.options.double_free == DoubleFreePolicy::Reject {
            let already = bitmap.with_data(|bm| (first_bit..last_bit).find(|&bit| !bitmap_get(bm, bit)));
            if let Some(bit) = already {
                let block = self.geometry.group_block_to_absolute(group, bit);
                warn!(block = block.0, group = group.0, "free: double free rejected");
                return Err(BgfsError::DoubleFree { block: block.0 });
            }
        }
        // Cached contents of a block are only dropped once the free is certain.
        for b in first_block..first_block + span {
            self.cache.forget(BlockNumber(b));
        }

        let mut cleared = 0_u32;
        let mut doubles = Vec::new();
        bitmap.with_data_mut(|bm| {
            for bit in first_bit..last_bit {
                if bitmap_get(bm, bit) {
                    bitmap_clear(bm, bit);
                    cleared += 1;
                } else {
                    doubles.push(bit);
                }
            }
        });
        for bit in doubles {
            let block = self.geometry.group_block_to_absolute(group, bit);
            warn!(block = block.0, group = group.0, "free: block already free");
        }
        if cleared == 0 {
            return Ok(0);
        }
        bitmap.mark_dirty();

        let group_free = self.group_free(group)?;
        let updated = group_free + cleared;
        if updated > self.geometry.blocks_in_group(group) {
            return Err(self.halt(
                first_block,
                format!(
                    "group {group} free count {updated} exceeds group size {}",
                    self.geometry.blocks_in_group(group)
                ),
            ));
        }
        self.set_group_free(group, updated)?;
        self.free_blocks += u64::from(cleared);
        self.persist_counters(group)?;
        debug!(
            start = first_block,
            count = cleared,
            group = group.0,
            "free: blocks released"
        );
        Ok(u64::from(cleared))
    }

    // ── Verification ────────────────────────────────────────────────────

    /// Free bits in `group`'s bitmap.
    pub fn bitmap_free_count(&mut self, group: GroupNumber) -> Result<u32> {
        let bitmap = self.group_bitmap(group)?;
        let limit = self.geometry.blocks_in_group(group);
        Ok(bitmap.with_data(|bm| bitmap_count_free(bm, limit)))
    }

    /// Compare every group's free count with its bitmap, and the group sum
    /// with the volume counter. Any mismatch halts the state.
    pub fn verify_free_counts(&mut self) -> Result<()> {
        self.ensure_live()?;
        let mut sum = 0_u64;
        for g in 0..self.geometry.group_count {
            let group = GroupNumber(g);
            let counted = self.bitmap_free_count(group)?;
            let recorded = self.group_free(group)?;
            if counted != recorded {
                let block = self.gdt.bitmap_block(group)?.0;
                return Err(self.halt(
                    block,
                    format!("group {group} records {recorded} free blocks, bitmap has {counted}"),
                ));
            }
            sum += u64::from(counted);
        }
        if sum != self.free_blocks {
            let block = self.geometry.superblock_block().0;
            return Err(self.halt(
                block,
                format!(
                    "superblock records {} free blocks, groups sum to {sum}",
                    self.free_blocks
                ),
            ));
        }
        Ok(())
    }

    /// Write every dirty buffer back and flush the device.
    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }
}

// ── Filesystem (super lock) ─────────────────────────────────────────────────

/// Shared handle serialising every free-space mutation behind one lock.
#[derive(Debug)]
pub struct Filesystem {
    cache: Arc<BufferCache>,
    state: Mutex<FilesystemState>,
}

impl Filesystem {
    #[must_use]
    pub fn new(state: FilesystemState) -> Self {
        Self {
            cache: Arc::clone(state.buffer_cache()),
            state: Mutex::new(state),
        }
    }

    pub fn open(cache: Arc<BufferCache>, options: MountOptions) -> Result<Self> {
        Ok(Self::new(FilesystemState::open(cache, options)?))
    }

    /// Take the super lock.
    pub fn lock(&self) -> MutexGuard<'_, FilesystemState> {
        self.state.lock()
    }

    /// Buffer cache shared with the state, reachable without the super lock.
    #[must_use]
    pub fn buffer_cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn geometry(&self) -> FsGeometry {
        *self.state.lock().geometry()
    }

    pub fn allocate_block(&self, reserved_ok: bool) -> Result<BlockNumber> {
        self.state.lock().allocate_block(reserved_ok)
    }

    pub fn free_block(&self, block: BlockNumber) -> Result<()> {
        self.state.lock().free_block(block)
    }

    pub fn free_blocks(&self, start: BlockNumber, count: u64) -> Result<u64> {
        self.state.lock().free_blocks(start, count)
    }

    #[must_use]
    pub fn free_blocks_count(&self) -> u64 {
        self.state.lock().free_blocks_count()
    }

    pub fn verify_free_counts(&self) -> Result<()> {
        self.state.lock().verify_free_counts()
    }

    pub fn sync(&self) -> Result<()> {
        self.state.lock().sync()
    }

    #[must_use]
    pub fn is_system_block(&self, block: BlockNumber) -> bool {
        self.state.lock().is_system_block(block)
    }

    /// Why mutation was halted, if it was.
    #[must_use]
    pub fn halt_reason(&self) -> Option<String> {
        self.state.lock().halt_reason().map(str::to_owned)
    }
}
