//! Shared buffer cache.
//!
//! Every cached block has one [`BufferHead`] carrying its bytes and three
//! state bits: `locked` (device I/O in flight), `uptodate` (bytes reflect the
//! device or were fully initialised in memory) and `dirty` (must be written
//! back). Callers hold a [`BufferHandle`]; the head counts live handles so
//! other parties can ask whether a buffer is busy without blocking on it.

use crate::BlockDevice;
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::{read_address_slot, write_address_slot};
use bgfs_types::BlockNumber;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{error, trace};

/// In-memory state of one cached block.
pub struct BufferHead {
    block: BlockNumber,
    data: Mutex<Vec<u8>>,
    users: AtomicUsize,
    locked: AtomicBool,
    dirty: AtomicBool,
    uptodate: AtomicBool,
}

impl BufferHead {
    fn new(block: BlockNumber, block_size: usize) -> Self {
        Self {
            block,
            data: Mutex::new(vec![0_u8; block_size]),
            users: AtomicUsize::new(0),
            locked: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            uptodate: AtomicBool::new(false),
        }
    }

    fn is_idle(&self) -> bool {
        self.users.load(Ordering::Acquire) == 0
            && !self.locked.load(Ordering::Acquire)
            && !self.dirty.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BufferHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHead")
            .field("block", &self.block)
            .field("users", &self.users.load(Ordering::Relaxed))
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .field("uptodate", &self.uptodate.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Scoped reference to a cached buffer.
///
/// Cloning takes another reference; dropping releases it.
#[derive(Debug)]
pub struct BufferHandle {
    head: Arc<BufferHead>,
}

impl BufferHandle {
    fn acquire(head: Arc<BufferHead>) -> Self {
        head.users.fetch_add(1, Ordering::AcqRel);
        Self { head }
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.head.block
    }

    /// Number of live handles, this one included.
    #[must_use]
    pub fn users(&self) -> usize {
        self.head.users.load(Ordering::Acquire)
    }

    /// Locked for I/O, or referenced by anyone besides this handle.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.users() > 1 || self.is_locked()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.head.locked.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.head.dirty.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.head.uptodate.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.head.dirty.store(true, Ordering::Release);
    }

    /// Hold the buffer locked as if device I/O were in flight.
    ///
    /// Used by callers that stage the buffer contents themselves.
    #[must_use]
    pub fn lock(&self) -> BufferLockGuard {
        self.head.locked.store(true, Ordering::Release);
        BufferLockGuard {
            head: Arc::clone(&self.head),
        }
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.head.data.lock();
        f(&data)
    }

    /// Mutate the bytes. The caller decides whether to mark the buffer dirty.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.head.data.lock();
        f(&mut data)
    }

    /// Zero the whole block and mark it uptodate and dirty.
    pub fn zero_fill(&self) {
        self.head.data.lock().fill(0);
        self.head.uptodate.store(true, Ordering::Release);
        self.mark_dirty();
    }

    /// Read a `u32` address slot.
    pub fn read_u32(&self, index: usize) -> Result<u32> {
        self.with_data(|data| read_address_slot(data, index))
            .map_err(|e| BgfsError::Parse(e.to_string()))
    }

    /// Write a `u32` address slot and mark the buffer dirty.
    pub fn write_u32(&self, index: usize, value: u32) -> Result<()> {
        self.with_data_mut(|data| write_address_slot(data, index, value))
            .map_err(|e| BgfsError::Parse(e.to_string()))?;
        self.mark_dirty();
        Ok(())
    }

    /// True when every byte of the block is zero.
    #[must_use]
    pub fn is_all_zero(&self) -> bool {
        self.with_data(|data| data.iter().all(|b| *b == 0))
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        Self::acquire(Arc::clone(&self.head))
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.head.users.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Releases the I/O lock taken by [`BufferHandle::lock`].
#[derive(Debug)]
pub struct BufferLockGuard {
    head: Arc<BufferHead>,
}

impl Drop for BufferLockGuard {
    fn drop(&mut self) {
        self.head.locked.store(false, Ordering::Release);
    }
}

/// Snapshot of buffer cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCacheStats {
    /// Device reads issued by `bread`.
    pub reads: u64,
    /// Device writes issued by write-back.
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Clean, unreferenced buffers dropped to stay within capacity.
    pub released: u64,
    /// Buffers currently cached.
    pub cached: usize,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    released: AtomicU64,
}

/// Block buffer cache over a [`BlockDevice`].
///
/// Writes are deferred: dirty buffers reach the device on
/// [`BufferCache::sync_dirty`] or [`BufferCache::sync`]. Dirty buffers are
/// never released, so once they push the cache past twice its capacity a
/// new buffer triggers write-back of everything dirty.
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    capacity: usize,
    block_size: usize,
    heads: Mutex<HashMap<BlockNumber, Arc<BufferHead>>>,
    counters: Counters,
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.capacity)
            .field("block_size", &self.block_size)
            .field("cached", &self.heads.lock().len())
            .finish_non_exhaustive()
    }
}

impl BufferCache {
    pub fn new(dev: Arc<dyn BlockDevice>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BgfsError::Format(
                "BufferCache capacity must be > 0".to_owned(),
            ));
        }
        let block_size = usize::try_from(dev.block_size())
            .map_err(|_| BgfsError::Format("block_size does not fit usize".to_owned()))?;
        Ok(Self {
            dev,
            capacity,
            block_size,
            heads: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Get or create the buffer for `block` without reading the device.
    ///
    /// A freshly created buffer is zeroed and not uptodate.
    pub fn getblk(&self, block: BlockNumber) -> Result<BufferHandle> {
        if block.0 >= self.dev.block_count() {
            return Err(BgfsError::InvalidBlock {
                block: block.0,
                detail: format!("beyond device end ({} blocks)", self.dev.block_count()),
            });
        }
        let mut heads = self.heads.lock();
        if let Some(head) = heads.get(&block) {
            let handle = BufferHandle::acquire(Arc::clone(head));
            drop(heads);
            return Ok(handle);
        }
        let head = Arc::new(BufferHead::new(block, self.block_size));
        let handle = BufferHandle::acquire(Arc::clone(&head));
        heads.insert(block, head);
        self.shrink_locked(&mut heads);
        let over = heads.len() > self.capacity.saturating_mul(2);
        drop(heads);
        if over {
            self.write_back_excess();
        }
        Ok(handle)
    }

    fn write_back_excess(&self) {
        match self.sync_dirty() {
            Ok(written) => trace!(written, "buffer_cache_writeback"),
            Err(err) => error!(error = %err, "buffer_cache_writeback_failed"),
        }
    }

    /// Get the buffer for `block`, reading it from the device if needed.
    ///
    /// The buffer is locked while the device read is in flight. A failed
    /// read leaves it not uptodate and returns the error.
    pub fn bread(&self, block: BlockNumber) -> Result<BufferHandle> {
        let handle = self.getblk(block)?;
        if handle.is_uptodate() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle);
        }

        let mut data = handle.head.data.lock();
        // Another reader may have finished while we waited for the bytes.
        if handle.head.uptodate.load(Ordering::Acquire) {
            drop(data);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        handle.head.locked.store(true, Ordering::Release);
        let read = self.dev.read_block(block);
        handle.head.locked.store(false, Ordering::Release);
        match read {
            Ok(buf) => {
                data.copy_from_slice(buf.as_slice());
                drop(data);
                handle.head.uptodate.store(true, Ordering::Release);
                self.counters.reads.fetch_add(1, Ordering::Relaxed);
                trace!(block = block.0, "buffer_read");
                Ok(handle)
            }
            Err(err) => {
                drop(data);
                error!(block = block.0, error = %err, "buffer_read_failed");
                Err(err)
            }
        }
    }

    /// Look up an already cached buffer without touching the device.
    #[must_use]
    pub fn probe(&self, block: BlockNumber) -> Option<BufferHandle> {
        let heads = self.heads.lock();
        heads
            .get(&block)
            .map(|head| BufferHandle::acquire(Arc::clone(head)))
    }

    /// Drop the cached copy of `block` without writing it back.
    ///
    /// Outstanding handles keep their bytes but are detached from the cache.
    pub fn forget(&self, block: BlockNumber) {
        let removed = self.heads.lock().remove(&block);
        if let Some(head) = removed {
            head.dirty.store(false, Ordering::Release);
            head.uptodate.store(false, Ordering::Release);
            trace!(block = block.0, "buffer_forget");
        }
    }

    /// Write every dirty buffer back to the device. Returns how many were
    /// written.
    pub fn sync_dirty(&self) -> Result<usize> {
        let mut dirty: Vec<Arc<BufferHead>> = self
            .heads
            .lock()
            .values()
            .filter(|head| head.dirty.load(Ordering::Acquire))
            .cloned()
            .collect();
        dirty.sort_by_key(|head| head.block);

        let mut written = 0_usize;
        for head in dirty {
            let data = head.data.lock();
            if !head.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }
            if let Err(err) = self.dev.write_block(head.block, &data) {
                head.dirty.store(true, Ordering::Release);
                error!(block = head.block.0, error = %err, "buffer_writeback_failed");
                return Err(err);
            }
            drop(data);
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
            written += 1;
        }

        let mut heads = self.heads.lock();
        self.shrink_locked(&mut heads);
        drop(heads);
        Ok(written)
    }

    /// Write back dirty buffers and flush the device.
    pub fn sync(&self) -> Result<()> {
        let written = self.sync_dirty()?;
        trace!(written, "buffer_cache_sync");
        self.dev.sync()
    }

    #[must_use]
    pub fn stats(&self) -> BufferCacheStats {
        BufferCacheStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            cached: self.heads.lock().len(),
        }
    }

    fn shrink_locked(&self, heads: &mut HashMap<BlockNumber, Arc<BufferHead>>) {
        if heads.len() <= self.capacity {
            return;
        }
        let mut idle: Vec<BlockNumber> = heads
            .iter()
            .filter(|(_, head)| head.is_idle())
            .map(|(block, _)| *block)
            .collect();
        idle.sort_unstable();
        let excess = heads.len() - self.capacity;
        for block in idle.into_iter().take(excess) {
            heads.remove(&block);
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockBuf, ByteBlockDevice, ByteDevice, MemoryByteDevice};
    use std::collections::HashSet;

    fn mem_cache(blocks: usize, capacity: usize) -> (MemoryByteDevice, BufferCache) {
        let mem = MemoryByteDevice::new(1024 * blocks);
        let dev = ByteBlockDevice::new(mem.clone(), 1024).expect("device");
        let cache = BufferCache::new(Arc::new(dev), capacity).expect("cache");
        (mem, cache)
    }

    struct FailingDevice {
        inner: ByteBlockDevice<MemoryByteDevice>,
        bad: Mutex<HashSet<u64>>,
    }

    impl BlockDevice for FailingDevice {
        fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
            if self.bad.lock().contains(&block.0) {
                return Err(BgfsError::Io(std::io::Error::other("injected read failure")));
            }
            self.inner.read_block(block)
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            self.inner.write_block(block, data)
        }

        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn bread_reads_once_then_hits() {
        let (mem, cache) = mem_cache(8, 16);
        mem.write_all_at(bgfs_types::ByteOffset(3 * 1024), &[0xAB; 4])
            .expect("seed");

        let first = cache.bread(BlockNumber(3)).expect("bread");
        assert!(first.is_uptodate());
        assert_eq!(first.with_data(|d| d[0]), 0xAB);
        drop(first);
        let _again = cache.bread(BlockNumber(3)).expect("bread");

        let stats = cache.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn handles_track_users_and_busy_state() {
        let (_mem, cache) = mem_cache(4, 16);
        let a = cache.bread(BlockNumber(1)).expect("bread");
        assert_eq!(a.users(), 1);
        assert!(!a.is_busy());

        let b = a.clone();
        assert_eq!(a.users(), 2);
        assert!(a.is_busy());
        drop(b);
        assert!(!a.is_busy());

        let guard = a.lock();
        assert!(a.is_busy());
        drop(guard);
        assert!(!a.is_busy());
    }

    #[test]
    fn probe_never_reads_device() {
        let (_mem, cache) = mem_cache(4, 16);
        assert!(cache.probe(BlockNumber(2)).is_none());
        let held = cache.bread(BlockNumber(2)).expect("bread");
        let probed = cache.probe(BlockNumber(2)).expect("cached");
        assert!(probed.is_busy());
        drop(held);
        assert!(!probed.is_busy());
        assert_eq!(cache.stats().reads, 1);
    }

    #[test]
    fn dirty_buffers_reach_device_on_sync() {
        let (mem, cache) = mem_cache(4, 16);
        let h = cache.getblk(BlockNumber(2)).expect("getblk");
        h.zero_fill();
        h.write_u32(0, 0xDEAD_BEEF).expect("write slot");
        assert!(h.is_dirty());
        drop(h);

        cache.sync().expect("sync");
        let image = mem.snapshot();
        assert_eq!(&image[2048..2052], &0xDEAD_BEEF_u32.to_le_bytes());
        assert_eq!(cache.stats().writes, 1);
        assert!(!cache.probe(BlockNumber(2)).expect("cached").is_dirty());
    }

    #[test]
    fn forget_discards_without_writeback() {
        let (mem, cache) = mem_cache(4, 16);
        let h = cache.getblk(BlockNumber(1)).expect("getblk");
        h.with_data_mut(|d| d.fill(0x11));
        h.mark_dirty();
        drop(h);

        cache.forget(BlockNumber(1));
        assert!(cache.probe(BlockNumber(1)).is_none());
        assert_eq!(cache.sync_dirty().expect("sync"), 0);
        assert!(mem.snapshot()[1024..2048].iter().all(|b| *b == 0));
    }

    #[test]
    fn failed_read_is_reported_and_not_uptodate() {
        let mem = MemoryByteDevice::new(1024 * 4);
        let dev = FailingDevice {
            inner: ByteBlockDevice::new(mem, 1024).expect("device"),
            bad: Mutex::new(HashSet::from([2])),
        };
        let cache = BufferCache::new(Arc::new(dev), 8).expect("cache");

        let err = cache.bread(BlockNumber(2)).expect_err("read must fail");
        assert!(matches!(err, BgfsError::Io(_)));
        let probed = cache.probe(BlockNumber(2)).expect("head stays cached");
        assert!(!probed.is_uptodate());
        assert!(!probed.is_locked());
    }

    #[test]
    fn capacity_releases_only_idle_clean_buffers() {
        let (_mem, cache) = mem_cache(16, 2);
        let pinned = cache.bread(BlockNumber(0)).expect("bread");
        let dirty = cache.getblk(BlockNumber(1)).expect("getblk");
        dirty.zero_fill();
        drop(dirty);

        for b in 2..6 {
            drop(cache.bread(BlockNumber(b)).expect("bread"));
        }
        assert!(cache.probe(BlockNumber(0)).is_some());
        assert!(cache.probe(BlockNumber(1)).is_some());
        assert!(cache.stats().released >= 3);
        drop(pinned);
    }

    #[test]
    fn dirty_buffers_past_twice_capacity_are_written_back() {
        let (mem, cache) = mem_cache(32, 2);
        for b in 0..12_u8 {
            let h = cache.getblk(BlockNumber(u64::from(b))).expect("getblk");
            h.with_data_mut(|d| d.fill(b + 1));
            h.mark_dirty();
        }
        let stats = cache.stats();
        assert!(stats.cached <= 5, "cache grew to {}", stats.cached);
        assert!(stats.writes > 0);
        let image = mem.snapshot();
        assert!(image[..1024].iter().all(|x| *x == 1));
        assert!(image[2 * 1024..3 * 1024].iter().all(|x| *x == 3));
    }

    #[test]
    fn getblk_rejects_blocks_past_device_end() {
        let (_mem, cache) = mem_cache(4, 8);
        assert!(matches!(
            cache.getblk(BlockNumber(4)),
            Err(BgfsError::InvalidBlock { block: 4, .. })
        ));
    }

    #[test]
    fn concurrent_handles_on_threads() {
        let (_mem, cache) = mem_cache(4, 8);
        let cache = Arc::new(cache);
        let held = cache.bread(BlockNumber(3)).expect("bread");
        let worker = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let h = cache.probe(BlockNumber(3)).expect("cached");
                h.is_busy()
            })
        };
        assert!(worker.join().expect("join"));
        drop(held);
    }
}
