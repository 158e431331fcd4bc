//! Logical-to-physical block mapping.

use crate::Inode;
use bgfs_alloc::Filesystem;
use bgfs_error::{BgfsError, Result};
use bgfs_types::{BlockNumber, BlockSize, DIND_SLOT, IND_SLOT, N_DIRECT, TIND_SLOT};
use tracing::trace;

/// Root slot plus the index to follow in each address block below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockPath {
    pub slot: usize,
    pub depth: usize,
    pub indices: [usize; 3],
}

/// Pointers held by one address block on `fs`.
fn addrs_per_block(fs: &Filesystem) -> Result<u64> {
    BlockSize::new(fs.buffer_cache().block_size())
        .map(|bs| u64::from(bs.addrs_per_block()))
        .map_err(|e| BgfsError::UnsupportedBlockSize(e.to_string()))
}

#[expect(clippy::cast_possible_truncation)]
pub(crate) fn block_path(logical: u64, apb: u64) -> Result<BlockPath> {
    let direct = N_DIRECT as u64;
    if logical < direct {
        return Ok(BlockPath {
            slot: logical as usize,
            depth: 0,
            indices: [0; 3],
        });
    }
    let mut rel = logical - direct;
    if rel < apb {
        return Ok(BlockPath {
            slot: IND_SLOT,
            depth: 1,
            indices: [rel as usize, 0, 0],
        });
    }
    rel -= apb;
    if rel < apb * apb {
        return Ok(BlockPath {
            slot: DIND_SLOT,
            depth: 2,
            indices: [(rel / apb) as usize, (rel % apb) as usize, 0],
        });
    }
    rel -= apb * apb;
    if rel < apb * apb * apb {
        return Ok(BlockPath {
            slot: TIND_SLOT,
            depth: 3,
            indices: [
                (rel / (apb * apb)) as usize,
                ((rel / apb) % apb) as usize,
                (rel % apb) as usize,
            ],
        });
    }
    Err(BgfsError::Format(format!(
        "logical block {logical} beyond triple-indirect reach"
    )))
}

/// Walks (and optionally grows) an inode's block tree.
#[derive(Debug)]
pub struct BlockMapper<'a> {
    fs: &'a Filesystem,
    reserved_ok: bool,
}

impl<'a> BlockMapper<'a> {
    #[must_use]
    pub fn new(fs: &'a Filesystem) -> Self {
        Self {
            fs,
            reserved_ok: false,
        }
    }

    /// Let growth consume reserved blocks.
    #[must_use]
    pub fn with_reserved(mut self, reserved_ok: bool) -> Self {
        self.reserved_ok = reserved_ok;
        self
    }

    /// Physical block backing `logical`, or `None` for a hole.
    pub fn lookup(&self, inode: &Inode, logical: u64) -> Result<Option<BlockNumber>> {
        let path = block_path(logical, addrs_per_block(self.fs)?)?;
        let mut cur = inode.tree.get(path.slot);
        for &index in &path.indices[..path.depth] {
            let Some(node) = BlockNumber::from_pointer(cur) else {
                return Ok(None);
            };
            cur = self.fs.buffer_cache().bread(node)?.read_u32(index)?;
        }
        Ok(BlockNumber::from_pointer(cur))
    }

    /// Resolve `logical`; with `create`, allocate every missing address and
    /// data block on the way. New blocks come back zeroed from the allocator
    /// and are added to the inode's usage counter.
    pub fn map(&self, inode: &mut Inode, logical: u64, create: bool) -> Result<Option<BlockNumber>> {
        if !create {
            return self.lookup(inode, logical);
        }
        let cache = self.fs.buffer_cache();
        let path = block_path(logical, addrs_per_block(self.fs)?)?;

        let mut cur = match BlockNumber::from_pointer(inode.tree.get(path.slot)) {
            Some(b) => b,
            None => {
                let b = self.fs.allocate_block(self.reserved_ok)?;
                inode.tree.set(path.slot, b)?;
                inode.add_usage(1);
                inode.mark_dirty();
                b
            }
        };
        for &index in &path.indices[..path.depth] {
            let node = cache.bread(cur)?;
            cur = match BlockNumber::from_pointer(node.read_u32(index)?) {
                Some(b) => b,
                None => {
                    let b = self.fs.allocate_block(self.reserved_ok)?;
                    let ptr = b
                        .to_pointer()
                        .map_err(|e| BgfsError::Parse(e.to_string()))?;
                    node.write_u32(index, ptr)?;
                    inode.add_usage(1);
                    inode.mark_dirty();
                    b
                }
            };
        }
        trace!(ino = inode.ino.0, logical, block = cur.0, "map: block resolved");
        Ok(Some(cur))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_boundaries_for_1k_blocks() {
        let apb = 256;
        let p = block_path(11, apb).expect("direct");
        assert_eq!((p.slot, p.depth), (11, 0));

        let p = block_path(12, apb).expect("ind");
        assert_eq!((p.slot, p.depth, p.indices[0]), (IND_SLOT, 1, 0));
        let p = block_path(12 + 255, apb).expect("ind end");
        assert_eq!((p.slot, p.indices[0]), (IND_SLOT, 255));

        let p = block_path(12 + 256, apb).expect("dind");
        assert_eq!((p.slot, p.depth, p.indices), (DIND_SLOT, 2, [0, 0, 0]));
        let p = block_path(12 + 256 + 256 * 3 + 7, apb).expect("dind");
        assert_eq!(p.indices, [3, 7, 0]);

        let tind_start = 12 + 256 + 256 * 256;
        let p = block_path(tind_start, apb).expect("tind");
        assert_eq!((p.slot, p.depth, p.indices), (TIND_SLOT, 3, [0, 0, 0]));
        let p = block_path(tind_start + 256 * 256 * 2 + 256 * 5 + 9, apb).expect("tind");
        assert_eq!(p.indices, [2, 5, 9]);

        assert!(block_path(tind_start + 256 * 256 * 256, apb).is_err());
    }

    #[test]
    fn address_fanout_follows_block_size() {
        use bgfs_alloc::{FormatOptions, MountOptions, format_volume};
        use bgfs_block::{BufferCache, ByteBlockDevice, MemoryByteDevice};
        use bgfs_types::{InodeNumber, S_IFREG};
        use std::sync::Arc;

        let mem = MemoryByteDevice::new(4096 * 2048);
        let dev = ByteBlockDevice::new(mem, 4096).expect("device");
        format_volume(&dev, &FormatOptions::default()).expect("format");
        let cache = Arc::new(BufferCache::new(Arc::new(dev), 256).expect("cache"));
        let fs = Filesystem::open(cache, MountOptions::default()).expect("mount");
        let mapper = BlockMapper::new(&fs);
        let mut inode = Inode::new(InodeNumber(5), S_IFREG);

        // 4K address blocks hold 1024 pointers.
        let last_single = mapper.map(&mut inode, 12 + 1023, true).expect("map");
        assert!(last_single.is_some());
        assert_eq!(inode.tree.double_indirect_root(), None);
        assert_eq!(inode.blocks, 2);

        mapper.map(&mut inode, 12 + 1024, true).expect("map");
        assert!(inode.tree.double_indirect_root().is_some());
        assert_eq!(inode.blocks, 5);
        assert_eq!(mapper.lookup(&inode, 12 + 1023).expect("lookup"), last_single);
    }
}
