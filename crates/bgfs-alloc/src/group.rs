//! Group descriptor table.
//!
//! One [`GroupDesc`] per block group, loaded from the descriptor blocks at
//! mount and written back record-by-record whenever a counter changes.

use crate::FsGeometry;
use bgfs_block::BufferCache;
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::{GroupDesc, descs_per_block};
use bgfs_types::{BlockNumber, GROUP_DESC_SIZE, GroupNumber};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GroupDescriptorTable {
    geometry: FsGeometry,
    descs: Vec<GroupDesc>,
    /// Sorted bitmap block numbers, for system-zone checks.
    bitmap_blocks: Vec<u64>,
}

impl GroupDescriptorTable {
    /// Read every descriptor record from the table blocks.
    ///
    /// Descriptors whose bitmap lies outside the volume, or whose free count
    /// exceeds the group size, are rejected as corruption.
    pub fn load(cache: &BufferCache, geometry: &FsGeometry) -> Result<Self> {
        let per_block = descs_per_block(geometry.block_size);
        if per_block == 0 {
            return Err(BgfsError::InvalidGeometry(format!(
                "block_size {} holds no group descriptors",
                geometry.block_size
            )));
        }

        let mut descs = Vec::with_capacity(geometry.group_count as usize);
        for table_idx in 0..geometry.gdt_blocks() {
            let block = BlockNumber(geometry.gdt_block().0 + u64::from(table_idx));
            let handle = cache.bread(block)?;
            let first = table_idx * per_block;
            let last = (first + per_block).min(geometry.group_count);
            handle.with_data(|data| -> Result<()> {
                for g in first..last {
                    let offset = ((g - first) as usize) * GROUP_DESC_SIZE;
                    let desc = GroupDesc::parse_from_bytes(&data[offset..])
                        .map_err(|e| BgfsError::Corruption {
                            block: block.0,
                            detail: format!("group {g} descriptor: {e}"),
                        })?;
                    descs.push(desc);
                }
                Ok(())
            })?;
        }

        let mut bitmap_blocks = Vec::with_capacity(descs.len());
        for (g, desc) in descs.iter().enumerate() {
            let group = GroupNumber(u32::try_from(g).map_err(|_| {
                BgfsError::InvalidGeometry("group index does not fit u32".to_owned())
            })?);
            let bitmap = BlockNumber(u64::from(desc.block_bitmap));
            if !geometry.is_data_block(bitmap) {
                return Err(BgfsError::Corruption {
                    block: bitmap.0,
                    detail: format!("group {group} bitmap outside the data region"),
                });
            }
            if desc.free_blocks_count > geometry.blocks_in_group(group) {
                return Err(BgfsError::Corruption {
                    block: bitmap.0,
                    detail: format!(
                        "group {group} free count {} exceeds group size {}",
                        desc.free_blocks_count,
                        geometry.blocks_in_group(group)
                    ),
                });
            }
            bitmap_blocks.push(bitmap.0);
        }
        bitmap_blocks.sort_unstable();

        debug!(groups = descs.len(), "gdt: loaded group descriptors");
        Ok(Self {
            geometry: *geometry,
            descs,
            bitmap_blocks,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Group and bit index holding `block`, or `None` outside the data region.
    #[must_use]
    pub fn group_for(&self, block: BlockNumber) -> Option<(GroupNumber, u32)> {
        self.geometry.group_for(block)
    }

    fn desc(&self, group: GroupNumber) -> Result<&GroupDesc> {
        self.descs
            .get(group.0 as usize)
            .ok_or_else(|| self.out_of_range(group))
    }

    fn out_of_range(&self, group: GroupNumber) -> BgfsError {
        BgfsError::Corruption {
            block: self.geometry.gdt_block().0,
            detail: format!(
                "group {group} outside descriptor table of {} groups",
                self.descs.len()
            ),
        }
    }

    pub fn free_count(&self, group: GroupNumber) -> Result<u32> {
        Ok(self.desc(group)?.free_blocks_count)
    }

    pub fn set_free_count(&mut self, group: GroupNumber, count: u32) -> Result<()> {
        let err = self.out_of_range(group);
        let desc = self.descs.get_mut(group.0 as usize).ok_or(err)?;
        desc.free_blocks_count = count;
        Ok(())
    }

    pub fn bitmap_block(&self, group: GroupNumber) -> Result<BlockNumber> {
        Ok(BlockNumber(u64::from(self.desc(group)?.block_bitmap)))
    }

    /// Whether `block` holds some group's allocation bitmap.
    #[must_use]
    pub fn is_bitmap_block(&self, block: BlockNumber) -> bool {
        self.bitmap_blocks.binary_search(&block.0).is_ok()
    }

    /// Sum of every group's free count.
    #[must_use]
    pub fn total_free(&self) -> u64 {
        self.descs
            .iter()
            .map(|d| u64::from(d.free_blocks_count))
            .sum()
    }

    /// Write one group's record back into its descriptor block and mark the
    /// block dirty.
    pub fn persist(&self, cache: &BufferCache, group: GroupNumber) -> Result<()> {
        let desc = *self.desc(group)?;
        let per_block = descs_per_block(self.geometry.block_size);
        let block = BlockNumber(self.geometry.gdt_block().0 + u64::from(group.0 / per_block));
        let offset = ((group.0 % per_block) as usize) * GROUP_DESC_SIZE;

        let handle = cache.bread(block)?;
        handle
            .with_data_mut(|data| desc.write_to_bytes(&mut data[offset..]))
            .map_err(|e| BgfsError::Corruption {
                block: block.0,
                detail: format!("group {group} descriptor write: {e}"),
            })?;
        handle.mark_dirty();
        Ok(())
    }
}
