#![forbid(unsafe_code)]
//! bgfs public API facade.
//!
//! Block-group free-space management for a classic block-mapped volume:
//! format a device, mount it, allocate and free blocks, and truncate files
//! whose data is reached through 12 direct pointers and three indirect trees.
//!
//! ```text
//! let fs = bgfs::mount(dev, MountOptions::default())?;
//! let block = bgfs::allocate_block(&fs, false)?;
//! bgfs::free_block(&fs, block)?;
//! ```

pub use bgfs_alloc::{
    BitmapCacheStats, DEFAULT_BITMAP_CACHE_CAPACITY, DoubleFreePolicy, Filesystem,
    FilesystemState, FormatOptions, FsGeometry, MountOptions, format_volume,
};
pub use bgfs_block::{
    BlockBuf, BlockDevice, BufferCache, BufferCacheStats, BufferHandle, ByteBlockDevice,
    ByteDevice, FileByteDevice, MemoryByteDevice,
};
pub use bgfs_error::{BgfsError, Result};
pub use bgfs_inode::{
    BlockMapper, FileBlockTree, Inode, PassOutcome, PassReport, RetryPolicy, TruncateReport,
    TruncationEngine,
};
pub use bgfs_ondisk::{FsState, InodeRecord, Superblock};
pub use bgfs_types::{BlockNumber, BlockSize, GroupNumber, InodeNumber};

use bgfs_block::read_superblock_region;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mount the volume on `dev`.
///
/// The buffer cache is sized from `options.buffer_cache_capacity`.
pub fn mount(dev: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Filesystem> {
    let cache = Arc::new(BufferCache::new(dev, options.buffer_cache_capacity)?);
    let fs = Filesystem::open(cache, options)?;
    let geometry = fs.geometry();
    debug!(
        block_size = geometry.block_size,
        blocks = geometry.total_blocks,
        groups = geometry.group_count,
        free = fs.free_blocks_count(),
        "mount: volume ready"
    );
    Ok(fs)
}

/// Mount a volume image file. The block size comes from its superblock.
///
/// An image that can only be opened for reading still mounts; the first
/// write to it fails with [`BgfsError::ReadOnly`].
pub fn open_image(path: impl AsRef<Path>, options: MountOptions) -> Result<Filesystem> {
    let file = FileByteDevice::open(path.as_ref())?;
    if !file.is_writable() {
        warn!(path = %path.as_ref().display(), "mount: image opened read-only");
    }
    let region = read_superblock_region(&file)?;
    let sb = Superblock::parse_superblock_region(&region)
        .map_err(|e| BgfsError::Parse(e.to_string()))?;
    let dev = ByteBlockDevice::new(file, sb.block_size)?;
    mount(Arc::new(dev), options)
}

/// Allocate one zeroed block.
///
/// Without `reserved_ok` the allocation fails with [`BgfsError::NoSpace`]
/// once only reserved blocks remain.
pub fn allocate_block(fs: &Filesystem, reserved_ok: bool) -> Result<BlockNumber> {
    fs.allocate_block(reserved_ok)
}

pub fn free_block(fs: &Filesystem, block: BlockNumber) -> Result<()> {
    fs.free_block(block)
}

/// Shrink `inode` to `new_size` bytes with the default retry policy.
pub fn truncate(fs: &Filesystem, inode: &mut Inode, new_size: u64) -> Result<TruncateReport> {
    TruncationEngine::new(fs).truncate(inode, new_size)
}

#[must_use]
pub fn free_blocks_count(fs: &Filesystem) -> u64 {
    fs.free_blocks_count()
}
