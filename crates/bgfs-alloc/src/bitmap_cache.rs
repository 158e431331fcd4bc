//! Bounded cache of block bitmap buffers.
//!
//! Two modes, picked once from the group count:
//!
//! - **Direct-mapped** (`group_count <= capacity`): one slot per group,
//!   filled on first use and never evicted.
//! - **LRU** (`group_count > capacity`): at most `capacity` loaded bitmaps,
//!   most recently used at the front. A miss evicts the back entry.
//!
//! Evicting a slot only drops the cache's handle. A dirty bitmap stays in
//! the buffer cache until it is written back.

use crate::GroupDescriptorTable;
use bgfs_block::{BufferCache, BufferHandle};
use bgfs_error::{BgfsError, Result};
use bgfs_types::GroupNumber;
use std::collections::VecDeque;
use tracing::trace;

/// Default number of bitmap buffers kept loaded.
pub const DEFAULT_BITMAP_CACHE_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitmapCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
enum Slots {
    Direct(Vec<Option<BufferHandle>>),
    Lru(VecDeque<(GroupNumber, BufferHandle)>),
}

#[derive(Debug)]
pub struct BlockBitmapCache {
    capacity: usize,
    group_count: u32,
    slots: Slots,
    stats: BitmapCacheStats,
}

impl BlockBitmapCache {
    pub fn new(group_count: u32, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BgfsError::Format(
                "bitmap cache capacity must be > 0".to_owned(),
            ));
        }
        let slots = if group_count as usize <= capacity {
            Slots::Direct(vec![None; group_count as usize])
        } else {
            Slots::Lru(VecDeque::with_capacity(capacity))
        };
        Ok(Self {
            capacity,
            group_count,
            slots,
            stats: BitmapCacheStats::default(),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_direct_mapped(&self) -> bool {
        matches!(self.slots, Slots::Direct(_))
    }

    #[must_use]
    pub fn stats(&self) -> BitmapCacheStats {
        self.stats
    }

    /// Loaded groups. LRU mode lists them most recent first; direct-mapped
    /// mode lists them in group order.
    #[must_use]
    pub fn loaded_groups(&self) -> Vec<GroupNumber> {
        match &self.slots {
            Slots::Direct(slots) => slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.is_some())
                .filter_map(|(g, _)| u32::try_from(g).ok().map(GroupNumber))
                .collect(),
            Slots::Lru(list) => list.iter().map(|(g, _)| *g).collect(),
        }
    }

    /// Handle to `group`'s bitmap, loading it on a miss.
    ///
    /// Fails only when reading the bitmap block fails; the cache is left as
    /// it was before the call in that case.
    pub fn get(
        &mut self,
        cache: &BufferCache,
        gdt: &GroupDescriptorTable,
        group: GroupNumber,
    ) -> Result<BufferHandle> {
        if group.0 >= self.group_count {
            return Err(BgfsError::Corruption {
                block: 0,
                detail: format!(
                    "bitmap requested for group {group} of {}",
                    self.group_count
                ),
            });
        }

        match &mut self.slots {
            Slots::Direct(slots) => {
                let slot = &mut slots[group.0 as usize];
                if let Some(handle) = slot {
                    self.stats.hits += 1;
                    return Ok(handle.clone());
                }
                let handle = cache.bread(gdt.bitmap_block(group)?)?;
                self.stats.misses += 1;
                trace!(group = group.0, "bitmap_cache: pinned slot loaded");
                *slot = Some(handle.clone());
                Ok(handle)
            }
            Slots::Lru(list) => {
                if let Some((front, handle)) = list.front() {
                    if *front == group {
                        self.stats.hits += 1;
                        return Ok(handle.clone());
                    }
                }
                if let Some(pos) = list.iter().position(|(g, _)| *g == group) {
                    if let Some(entry) = list.remove(pos) {
                        self.stats.hits += 1;
                        let handle = entry.1.clone();
                        list.push_front(entry);
                        return Ok(handle);
                    }
                }

                let handle = cache.bread(gdt.bitmap_block(group)?)?;
                self.stats.misses += 1;
                if list.len() >= self.capacity {
                    if let Some((victim, _)) = list.pop_back() {
                        self.stats.evictions += 1;
                        trace!(
                            group = group.0,
                            evicted = victim.0,
                            "bitmap_cache: evicted least recently used"
                        );
                    }
                }
                list.push_front((group, handle.clone()));
                Ok(handle)
            }
        }
    }
}
