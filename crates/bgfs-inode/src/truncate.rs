//! Truncation engine.
//!
//! A pass visits the four levels of the block tree in order: direct,
//! indirect, double indirect, triple indirect. Within a level every entry
//! past the new end of file is a candidate. For each candidate:
//!
//! - holes are skipped;
//! - pointers outside the data region, at filesystem metadata, or at
//!   unreadable address blocks are cleared without releasing anything;
//! - a busy buffer (locked for I/O or referenced elsewhere) is left alone and
//!   the pass reports [`PassOutcome::RetryNeeded`];
//! - otherwise the parent's slot is cleared first, and only then is the
//!   block released. Address blocks are emptied recursively before their
//!   own storage is released.
//!
//! Severed blocks are released in runs of consecutive blocks of one group.
//! When the allocator refuses a run, every pointer in it is written back
//! and the pass fails, so no block is ever severed without being freed.
//!
//! [`TruncationEngine::truncate`] repeats passes until one finishes with no
//! busy buffer, yielding and then sleeping between passes.

use crate::map::BlockMapper;
use crate::Inode;
use bgfs_alloc::{Filesystem, FsGeometry};
use bgfs_block::{BufferCache, BufferHandle};
use bgfs_error::{BgfsError, Result};
use bgfs_types::{
    BlockNumber, BlockSize, DIND_SLOT, GroupNumber, IND_SLOT, InodeNumber, N_DIRECT, TIND_SLOT,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, trace};

// ── Policy and reports ──────────────────────────────────────────────────────

/// How [`TruncationEngine::truncate`] waits between passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Give up with [`BgfsError::RetryExhausted`] after this many passes.
    /// `None` retries until the tree is released.
    pub max_passes: Option<u32>,
    /// Passes that only yield the thread before sleeping starts.
    pub yield_passes: u32,
    /// First sleep; doubles every pass after that.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_passes: None,
            yield_passes: 3,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before the pass following pass number `pass` (1-based).
    /// `Duration::ZERO` means yield only.
    #[must_use]
    pub fn delay_after(&self, pass: u32) -> Duration {
        if pass <= self.yield_passes {
            return Duration::ZERO;
        }
        let doublings = (pass - self.yield_passes - 1).min(16);
        self.backoff
            .saturating_mul(1_u32 << doublings)
            .min(self.max_backoff)
    }

    fn pause(&self, pass: u32) {
        let delay = self.delay_after(pass);
        if delay.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(delay);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassOutcome {
    /// No level met a busy buffer.
    Done,
    /// Some branch was left in place because its buffer was busy.
    RetryNeeded,
}

/// What one pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub outcome: PassOutcome,
    pub freed_blocks: u64,
    /// Pointers dropped without releasing their block, because the block
    /// could not be read or lay outside the data region.
    pub unreadable_blocks: u64,
}

/// What a whole truncate did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateReport {
    pub passes: u32,
    pub freed_blocks: u64,
    pub unreadable_blocks: u64,
}

// ── Levels ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Direct,
    Indirect,
    DoubleIndirect,
    TripleIndirect,
}

impl Level {
    const ALL: [Self; 4] = [
        Self::Direct,
        Self::Indirect,
        Self::DoubleIndirect,
        Self::TripleIndirect,
    ];

    /// Root slot and indirection depth of an indirect level.
    fn root(self) -> Option<(usize, u32)> {
        match self {
            Self::Direct => None,
            Self::Indirect => Some((IND_SLOT, 1)),
            Self::DoubleIndirect => Some((DIND_SLOT, 2)),
            Self::TripleIndirect => Some((TIND_SLOT, 3)),
        }
    }

    /// First logical block mapped by this level.
    fn first_logical(self, apb: u64) -> u64 {
        let direct = N_DIRECT as u64;
        match self {
            Self::Direct => 0,
            Self::Indirect => direct,
            Self::DoubleIndirect => direct + apb,
            Self::TripleIndirect => direct + apb + apb * apb,
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TruncationEngine<'a> {
    fs: &'a Filesystem,
    policy: RetryPolicy,
}

impl<'a> TruncationEngine<'a> {
    #[must_use]
    pub fn new(fs: &'a Filesystem) -> Self {
        Self {
            fs,
            policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Shrink `inode` to `new_size` bytes.
    ///
    /// When `new_size` is not below the current size the block tree is not
    /// touched; only the size and timestamp change.
    pub fn truncate(&self, inode: &mut Inode, new_size: u64) -> Result<TruncateReport> {
        let mut report = TruncateReport::default();
        if new_size < inode.size {
            loop {
                report.passes += 1;
                let pass = self.run_pass(inode, new_size)?;
                report.freed_blocks += pass.freed_blocks;
                report.unreadable_blocks += pass.unreadable_blocks;
                if pass.outcome == PassOutcome::Done {
                    break;
                }
                if let Some(max) = self.policy.max_passes {
                    if report.passes >= max {
                        debug!(ino = inode.ino.0, passes = report.passes, "truncate: giving up");
                        return Err(BgfsError::RetryExhausted {
                            passes: report.passes,
                        });
                    }
                }
                debug!(
                    ino = inode.ino.0,
                    pass = report.passes,
                    "truncate: busy buffers, retrying"
                );
                self.policy.pause(report.passes);
            }
            self.zero_tail(inode, new_size);
        }

        inode.size = new_size;
        inode.mtime = now_secs();
        inode.mark_dirty();
        debug!(
            ino = inode.ino.0,
            new_size,
            passes = report.passes,
            freed = report.freed_blocks,
            "truncate: done"
        );
        Ok(report)
    }

    /// One sweep over all four levels.
    ///
    /// A halted filesystem is refused before any pointer is touched.
    pub fn run_pass(&self, inode: &mut Inode, new_size: u64) -> Result<PassReport> {
        if let Some(reason) = self.fs.halt_reason() {
            return Err(BgfsError::Halted(reason));
        }
        let cache = self.fs.buffer_cache();
        let geometry = self.fs.geometry();
        let block_size = BlockSize::new(geometry.block_size)
            .map_err(|e| BgfsError::UnsupportedBlockSize(e.to_string()))?;
        let mut pass = Pass {
            fs: self.fs,
            cache: cache.as_ref(),
            geometry,
            apb: u64::from(block_size.addrs_per_block()),
            keep: block_size.blocks_for_bytes(new_size),
            ino: inode.ino,
            run: FreeRun::default(),
            retry: false,
            freed: 0,
            unreadable: 0,
        };
        for level in Level::ALL {
            match level.root() {
                None => pass.direct(inode)?,
                Some((slot, depth)) => pass.indirect(inode, level, slot, depth)?,
            }
        }
        let outcome = if pass.retry {
            PassOutcome::RetryNeeded
        } else {
            PassOutcome::Done
        };
        trace!(
            ino = inode.ino.0,
            ?outcome,
            freed = pass.freed,
            "truncate: pass finished"
        );
        Ok(PassReport {
            outcome,
            freed_blocks: pass.freed,
            unreadable_blocks: pass.unreadable,
        })
    }

    /// Zero the bytes past `new_size` in the block that now ends the file.
    fn zero_tail(&self, inode: &Inode, new_size: u64) {
        let bs = u64::from(self.fs.buffer_cache().block_size());
        let tail = new_size % bs;
        if tail == 0 {
            return;
        }
        let logical = new_size / bs;
        let mapped = BlockMapper::new(self.fs).lookup(inode, logical);
        let block = match mapped {
            Ok(Some(block)) => block,
            Ok(None) => return,
            Err(err) => {
                error!(ino = inode.ino.0, logical, error = %err, "truncate: cannot map tail block");
                return;
            }
        };
        match self.fs.buffer_cache().bread(block) {
            Ok(handle) => {
                #[expect(clippy::cast_possible_truncation)]
                let from = tail as usize;
                handle.with_data_mut(|data| data[from..].fill(0));
                handle.mark_dirty();
            }
            Err(err) => {
                error!(ino = inode.ino.0, block = block.0, error = %err, "truncate: cannot zero tail");
            }
        }
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

// ── Pass state ──────────────────────────────────────────────────────────────

/// Where a severed pointer lived.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Slot(usize),
    Entry { parent: BlockNumber, index: usize },
}

#[derive(Debug, Clone, Copy)]
struct Severed {
    block: BlockNumber,
    origin: Origin,
}

/// Severed blocks of one group with consecutive numbers, released in one call.
#[derive(Debug, Default)]
struct FreeRun {
    group: Option<GroupNumber>,
    entries: Vec<Severed>,
}

impl FreeRun {
    fn extends(&self, group: Option<GroupNumber>, block: BlockNumber) -> bool {
        self.group == group
            && self
                .entries
                .last()
                .is_some_and(|last| last.block.0 + 1 == block.0)
    }
}

enum Node {
    Busy,
    Unreadable,
    Ready(BufferHandle),
}

struct Pass<'p> {
    fs: &'p Filesystem,
    cache: &'p BufferCache,
    geometry: FsGeometry,
    apb: u64,
    /// Logical blocks that survive the truncate.
    keep: u64,
    ino: InodeNumber,
    run: FreeRun,
    retry: bool,
    freed: u64,
    unreadable: u64,
}

impl Pass<'_> {
    fn is_busy(&self, block: BlockNumber) -> bool {
        self.cache.probe(block).is_some_and(|h| h.is_busy())
    }

    /// Why `block` can never be released through a file pointer.
    fn invalid_reason(&self, block: BlockNumber) -> Option<&'static str> {
        if !self.geometry.is_data_block(block) {
            Some("outside data region")
        } else if self.fs.is_system_block(block) {
            Some("metadata block")
        } else {
            None
        }
    }

    /// Queue a severed block for release.
    fn release(&mut self, inode: &mut Inode, block: BlockNumber, origin: Origin) -> Result<()> {
        let severed = Severed { block, origin };
        let group = self.geometry.group_for(block).map(|(g, _)| g);
        if !self.run.extends(group, block) {
            if let Err(err) = self.flush(inode) {
                self.restore(inode, &[severed]);
                return Err(err);
            }
            self.run.group = group;
        }
        self.run.entries.push(severed);
        Ok(())
    }

    fn flush(&mut self, inode: &mut Inode) -> Result<()> {
        let run = std::mem::take(&mut self.run);
        let Some(first) = run.entries.first() else {
            return Ok(());
        };
        let len = run.entries.len() as u64;
        match self.fs.free_blocks(first.block, len) {
            Ok(freed) => {
                trace!(start = first.block.0, len, freed, "truncate: released run");
                self.freed += freed;
                Ok(())
            }
            Err(err) => {
                error!(
                    ino = self.ino.0,
                    start = first.block.0,
                    len,
                    error = %err,
                    "truncate: release refused, restoring pointers"
                );
                self.restore(inode, &run.entries);
                Err(err)
            }
        }
    }

    /// Put severed pointers back and count them against the inode again.
    fn restore(&self, inode: &mut Inode, entries: &[Severed]) {
        for severed in entries {
            let put = match severed.origin {
                Origin::Slot(slot) => inode.tree.set(slot, severed.block),
                Origin::Entry { parent, index } => self.cache.bread(parent).and_then(|node| {
                    let ptr = severed
                        .block
                        .to_pointer()
                        .map_err(|e| BgfsError::Parse(e.to_string()))?;
                    node.write_u32(index, ptr)
                }),
            };
            match put {
                Ok(()) => inode.add_usage(1),
                Err(err) => error!(
                    ino = self.ino.0,
                    block = severed.block.0,
                    error = %err,
                    "truncate: cannot restore pointer"
                ),
            }
        }
        inode.mark_dirty();
    }

    fn drop_pointer(&mut self, block: BlockNumber, why: &str) {
        error!(ino = self.ino.0, block = block.0, reason = why, "truncate: dropping pointer");
        self.unreadable += 1;
    }

    /// Validity and busy checks, then read, for an address block.
    fn open_node(&mut self, block: BlockNumber) -> Node {
        if let Some(why) = self.invalid_reason(block) {
            self.drop_pointer(block, why);
            return Node::Unreadable;
        }
        if self.is_busy(block) {
            return Node::Busy;
        }
        match self.cache.bread(block) {
            Ok(handle) => Node::Ready(handle),
            Err(err) => {
                self.drop_pointer(block, &err.to_string());
                Node::Unreadable
            }
        }
    }

    fn direct(&mut self, inode: &mut Inode) -> Result<()> {
        let first = usize::try_from(self.keep).map_or(N_DIRECT, |k| k.min(N_DIRECT));
        for slot in first..N_DIRECT {
            let Some(block) = BlockNumber::from_pointer(inode.tree.get(slot)) else {
                continue;
            };
            if let Some(why) = self.invalid_reason(block) {
                inode.tree.clear_slot(slot);
                self.drop_pointer(block, why);
                continue;
            }
            if self.is_busy(block) {
                self.retry = true;
                continue;
            }
            inode.tree.clear_slot(slot);
            inode.drop_usage(1);
            self.release(inode, block, Origin::Slot(slot))?;
        }
        self.flush(inode)
    }

    fn indirect(&mut self, inode: &mut Inode, level: Level, slot: usize, depth: u32) -> Result<()> {
        let offset = level.first_logical(self.apb);
        let reach = self.apb.pow(depth);
        if self.keep >= offset + reach {
            return Ok(());
        }
        let Some(root) = BlockNumber::from_pointer(inode.tree.get(slot)) else {
            return Ok(());
        };

        match self.open_node(root) {
            Node::Busy => self.retry = true,
            Node::Unreadable => {
                inode.tree.clear_slot(slot);
            }
            Node::Ready(handle) => {
                if self.walk(inode, &handle, root, depth, offset)? {
                    if handle.is_busy() {
                        self.retry = true;
                    } else {
                        inode.tree.clear_slot(slot);
                        drop(handle);
                        inode.drop_usage(1);
                        self.release(inode, root, Origin::Slot(slot))?;
                    }
                }
            }
        }
        self.flush(inode)
    }

    /// Release everything past `keep` below `node` (block `at`), which maps
    /// logical blocks from `offset` on. Returns whether `node` ended up all
    /// holes.
    fn walk(
        &mut self,
        inode: &mut Inode,
        node: &BufferHandle,
        at: BlockNumber,
        depth: u32,
        offset: u64,
    ) -> Result<bool> {
        let span = self.apb.pow(depth - 1);
        let first = (self.keep.saturating_sub(offset) / span).min(self.apb);
        for i in first..self.apb {
            #[expect(clippy::cast_possible_truncation)]
            let index = i as usize;
            let Some(child) = BlockNumber::from_pointer(node.read_u32(index)?) else {
                continue;
            };
            let origin = Origin::Entry { parent: at, index };

            if depth == 1 {
                if let Some(why) = self.invalid_reason(child) {
                    node.write_u32(index, 0)?;
                    self.drop_pointer(child, why);
                    continue;
                }
                if self.is_busy(child) {
                    self.retry = true;
                    continue;
                }
                node.write_u32(index, 0)?;
                inode.drop_usage(1);
                self.release(inode, child, origin)?;
                continue;
            }

            match self.open_node(child) {
                Node::Busy => self.retry = true,
                Node::Unreadable => node.write_u32(index, 0)?,
                Node::Ready(handle) => {
                    if self.walk(inode, &handle, child, depth - 1, offset + i * span)? {
                        if handle.is_busy() {
                            self.retry = true;
                        } else {
                            node.write_u32(index, 0)?;
                            drop(handle);
                            inode.drop_usage(1);
                            self.release(inode, child, origin)?;
                        }
                    }
                }
            }
        }
        Ok(node.is_all_zero())
    }
}
