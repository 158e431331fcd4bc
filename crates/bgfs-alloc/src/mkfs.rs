//! Volume formatting.
//!
//! Lays out the superblock, the group descriptor table and one block bitmap
//! per group. Group 0's bitmap follows the descriptor table; every other
//! group's bitmap is the group's first block. Metadata blocks and the
//! bitmap bits past the end of a short last group are marked allocated.

use crate::{FsGeometry, bitmap_set};
use bgfs_block::BlockDevice;
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::{FsState, GroupDesc, Superblock, descs_per_block};
use bgfs_types::{BGFS_MAGIC, BlockNumber, BlockSize, GROUP_DESC_SIZE, GroupNumber, SUPERBLOCK_SIZE};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Blocks per group. `None` uses one full bitmap block (`8 * block_size`).
    pub blocks_per_group: Option<u32>,
    /// Blocks only privileged allocations may consume.
    pub reserved_blocks: u32,
}

fn geometry_error(detail: impl Into<String>) -> BgfsError {
    BgfsError::InvalidGeometry(detail.into())
}

/// Write a fresh, empty volume onto `dev`.
pub fn format_volume(dev: &dyn BlockDevice, opts: &FormatOptions) -> Result<Superblock> {
    let block_size = BlockSize::new(dev.block_size())
        .map_err(|e| BgfsError::UnsupportedBlockSize(e.to_string()))?;
    let bs = block_size.get();
    let blocks_count = u32::try_from(dev.block_count())
        .map_err(|_| geometry_error("device has more than u32::MAX blocks"))?;
    let first_data_block = u32::from(bs == 1024);
    let blocks_per_group = opts.blocks_per_group.unwrap_or(bs * 8);
    if blocks_per_group == 0 || blocks_per_group > bs * 8 {
        return Err(geometry_error(format!(
            "blocks_per_group {blocks_per_group} must be in 1..={}",
            bs * 8
        )));
    }
    if opts.reserved_blocks > blocks_count {
        return Err(geometry_error("reserved_blocks exceeds volume size"));
    }

    let mut sb = Superblock {
        blocks_count,
        r_blocks_count: opts.reserved_blocks,
        free_blocks_count: 0,
        first_data_block,
        log_block_size: block_size.shift() - 10,
        block_size: bs,
        blocks_per_group,
        mtime: 0,
        wtime: 0,
        magic: BGFS_MAGIC,
        state: FsState::Clean,
    };
    if blocks_count <= first_data_block {
        return Err(geometry_error("volume has no data blocks"));
    }
    let geo = FsGeometry::from_superblock(&sb);

    let gdt_start = geo.gdt_block().0;
    let group0_bitmap = gdt_start + u64::from(geo.gdt_blocks());
    let group0_end = u64::from(first_data_block) + u64::from(geo.blocks_in_group(GroupNumber(0)));
    if group0_bitmap >= group0_end {
        return Err(geometry_error(format!(
            "group 0 too small for its metadata: needs {} blocks",
            group0_bitmap + 1 - u64::from(first_data_block)
        )));
    }

    let bs_usize = bs as usize;
    let per_block = descs_per_block(bs);
    let mut gdt = vec![0_u8; bs_usize * geo.gdt_blocks() as usize];
    let mut total_free = 0_u64;

    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        let group_start = geo.group_block_to_absolute(group, 0).0;
        let in_group = geo.blocks_in_group(group);
        let bitmap_block = if g == 0 { group0_bitmap } else { group_start };

        let mut bitmap = vec![0_u8; bs_usize];
        // Padding past a short last group is never allocatable.
        for bit in in_group..bs * 8 {
            bitmap_set(&mut bitmap, bit);
        }
        let mut mark = |abs: u64| {
            if let Some((owner, rel)) = geo.group_for(BlockNumber(abs)) {
                if owner == group {
                    bitmap_set(&mut bitmap, rel);
                }
            }
        };
        mark(bitmap_block);
        if g == 0 {
            mark(geo.superblock_block().0);
            for b in gdt_start..group0_bitmap {
                mark(b);
            }
        }
        let free = crate::bitmap_count_free(&bitmap, in_group);
        total_free += u64::from(free);
        dev.write_block(BlockNumber(bitmap_block), &bitmap)?;

        let desc = GroupDesc {
            block_bitmap: u32::try_from(bitmap_block)
                .map_err(|_| geometry_error("bitmap block does not fit u32"))?,
            free_blocks_count: free,
            flags: 0,
        };
        let slot = (g / per_block) as usize * bs_usize + (g % per_block) as usize * GROUP_DESC_SIZE;
        desc.write_to_bytes(&mut gdt[slot..])
            .map_err(|e| BgfsError::Format(e.to_string()))?;
    }

    for (i, chunk) in gdt.chunks(bs_usize).enumerate() {
        dev.write_block(BlockNumber(gdt_start + i as u64), chunk)?;
    }

    sb.free_blocks_count = u32::try_from(total_free)
        .map_err(|_| geometry_error("free count does not fit u32"))?;
    let (sb_block, sb_offset) = geo.superblock_location();
    let mut raw = if sb_offset == 0 {
        vec![0_u8; bs_usize]
    } else {
        // Keep the boot area that shares the superblock's block.
        dev.read_block(sb_block)?.into_inner()
    };
    raw[sb_offset..sb_offset + SUPERBLOCK_SIZE].fill(0);
    sb.write_to_bytes(&mut raw[sb_offset..sb_offset + SUPERBLOCK_SIZE])
        .map_err(|e| BgfsError::Format(e.to_string()))?;
    dev.write_block(sb_block, &raw)?;
    dev.sync()?;

    info!(
        blocks = blocks_count,
        groups = geo.group_count,
        block_size = bs,
        free = total_free,
        "mkfs: volume formatted"
    );
    Ok(sb)
}
