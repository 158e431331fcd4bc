#![forbid(unsafe_code)]

use bgfs::{
    BgfsError, BlockDevice, BlockMapper, BlockNumber, ByteBlockDevice, FileByteDevice,
    FormatOptions, Inode, InodeNumber, MemoryByteDevice, MountOptions, PassOutcome, RetryPolicy,
    TruncationEngine, allocate_block, format_volume, free_block, free_blocks_count, mount,
    open_image, truncate,
};
use bgfs_types::S_IFREG;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

/// 1K-block volume of `groups` groups of `bpg` blocks, plus the boot block.
fn volume(groups: usize, bpg: u32, reserved: u32) -> (MemoryByteDevice, Arc<dyn BlockDevice>) {
    let mem = MemoryByteDevice::new(1024 * (1 + groups * bpg as usize));
    let dev = ByteBlockDevice::new(mem.clone(), 1024).expect("device");
    format_volume(
        &dev,
        &FormatOptions {
            blocks_per_group: Some(bpg),
            reserved_blocks: reserved,
        },
    )
    .expect("format");
    (mem, Arc::new(dev))
}

fn grow(fs: &bgfs::Filesystem, ino: u64, nblocks: u64) -> Inode {
    let mut inode = Inode::new(InodeNumber(ino), S_IFREG | 0o600);
    let mapper = BlockMapper::new(fs);
    for logical in 0..nblocks {
        mapper.map(&mut inode, logical, true).expect("map");
    }
    inode.size = nblocks * 1024;
    inode
}

#[test]
fn allocate_free_truncate_round_trip() {
    let (_mem, dev) = volume(4, 1024, 0);
    let fs = mount(dev, MountOptions::default()).expect("mount");
    let empty = free_blocks_count(&fs);

    let b = allocate_block(&fs, false).expect("alloc");
    let handle = fs.buffer_cache().bread(b).expect("bread");
    assert!(handle.is_all_zero());
    handle.with_data_mut(|d| d.fill(0xEE));
    handle.mark_dirty();
    drop(handle);
    free_block(&fs, b).expect("free");

    // First fit hands the same block back, zeroed again.
    let again = allocate_block(&fs, false).expect("realloc");
    assert_eq!(again, b);
    assert!(fs.buffer_cache().bread(again).expect("bread").is_all_zero());
    free_block(&fs, again).expect("free");

    let mut inode = grow(&fs, 12, 12 + 256 + 700);
    assert!(free_blocks_count(&fs) < empty);
    let report = truncate(&fs, &mut inode, 0).expect("truncate");
    assert_eq!(report.passes, 1);
    assert_eq!(inode.blocks, 0);
    assert_eq!(free_blocks_count(&fs), empty);
    fs.verify_free_counts().expect("consistent");
}

#[test]
fn reserved_blocks_need_privilege() {
    let (_mem, dev) = volume(1, 64, 8);
    let fs = mount(dev, MountOptions::default()).expect("mount");
    let mut taken = Vec::new();
    loop {
        match allocate_block(&fs, false) {
            Ok(b) => taken.push(b),
            Err(BgfsError::NoSpace) => break,
            Err(other) => panic!("unexpected {other}"),
        }
    }
    assert_eq!(free_blocks_count(&fs), 8);
    let privileged = allocate_block(&fs, true).expect("reserved allocation");
    assert!(!taken.contains(&privileged));
}

#[test]
fn busy_indirect_block_released_by_other_thread() {
    let (_mem, dev) = volume(2, 2048, 0);
    let fs = mount(dev, MountOptions::default()).expect("mount");
    let empty = free_blocks_count(&fs);
    let mut inode = grow(&fs, 20, 12 + 100);
    let ind = inode.tree.indirect_root().expect("indirect root");
    let pin = fs.buffer_cache().bread(ind).expect("bread");

    let (held_tx, held_rx) = mpsc::channel();
    std::thread::scope(|s| {
        s.spawn(move || {
            held_tx.send(()).expect("signal");
            std::thread::sleep(Duration::from_millis(30));
            drop(pin);
        });
        held_rx.recv().expect("holder started");

        let engine = TruncationEngine::new(&fs);
        let report = engine.truncate(&mut inode, 0).expect("truncate");
        assert!(report.passes > 1, "first pass must see the pinned block");
        assert_eq!(report.freed_blocks, 12 + 100 + 1);
    });

    assert!(inode.tree.is_empty());
    assert_eq!(inode.blocks, 0);
    assert_eq!(free_blocks_count(&fs), empty);
}

#[test]
fn single_pass_reports_retry_until_buffer_released() {
    let (_mem, dev) = volume(2, 2048, 0);
    let fs = mount(dev, MountOptions::default()).expect("mount");
    let mut inode = grow(&fs, 21, 12 + 256 + 40);
    let dind = inode.tree.double_indirect_root().expect("dind");
    let pin = fs.buffer_cache().bread(dind).expect("bread");

    let engine = TruncationEngine::new(&fs).with_policy(RetryPolicy {
        max_passes: Some(1),
        ..RetryPolicy::default()
    });
    assert!(matches!(
        engine.truncate(&mut inode, 0),
        Err(BgfsError::RetryExhausted { passes: 1 })
    ));
    // Only the double indirect branch is left, untouched.
    assert_eq!(inode.tree.indirect_root(), None);
    assert_eq!(inode.tree.double_indirect_root(), Some(dind));
    assert_eq!(inode.blocks, 40 + 2);

    drop(pin);
    let pass = engine.run_pass(&mut inode, 0).expect("pass");
    assert_eq!(pass.outcome, PassOutcome::Done);
    assert_eq!(pass.freed_blocks, 42);
    assert!(inode.tree.is_empty());
}

#[test]
fn counters_survive_remount_of_image_file() {
    let image = tempfile::NamedTempFile::new().expect("tempfile");
    image.as_file().set_len(1024 * (1 + 3 * 512)).expect("size");
    {
        let file = FileByteDevice::open(image.path()).expect("open");
        let dev = ByteBlockDevice::new(file, 1024).expect("device");
        format_volume(
            &dev,
            &FormatOptions {
                blocks_per_group: Some(512),
                reserved_blocks: 16,
            },
        )
        .expect("format");
    }

    let (expected, held) = {
        let fs = open_image(image.path(), MountOptions::default()).expect("mount");
        let held: Vec<BlockNumber> = (0..700)
            .map(|_| allocate_block(&fs, false).expect("alloc"))
            .collect();
        for b in held.iter().step_by(3) {
            free_block(&fs, *b).expect("free");
        }
        fs.sync().expect("sync");
        (free_blocks_count(&fs), held)
    };

    let options = MountOptions {
        check_on_mount: true,
        ..MountOptions::default()
    };
    let fs = open_image(image.path(), options).expect("remount");
    assert_eq!(free_blocks_count(&fs), expected);
    // Still-allocated blocks are not handed out again.
    let next = allocate_block(&fs, false).expect("alloc");
    assert!(held.iter().step_by(3).any(|b| *b == next));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn truncate_to_any_size_keeps_free_space_consistent(
        nblocks in 1_u64..600,
        keep in 0_u64..700,
        tail in 0_u64..1024,
    ) {
        let (_mem, dev) = volume(2, 2048, 0);
        let fs = mount(dev, MountOptions::default()).expect("mount");
        let empty = free_blocks_count(&fs);
        let mut inode = grow(&fs, 30, nblocks);
        let used_before = u64::from(inode.blocks);

        let new_size = keep * 1024 + tail;
        let report = truncate(&fs, &mut inode, new_size).expect("truncate");
        prop_assert_eq!(inode.size, new_size);
        prop_assert_eq!(used_before - report.freed_blocks, u64::from(inode.blocks));
        prop_assert_eq!(empty - free_blocks_count(&fs), u64::from(inode.blocks));
        fs.verify_free_counts().expect("consistent");

        let mapper = BlockMapper::new(&fs);
        let surviving = new_size.div_ceil(1024).min(nblocks);
        for logical in 0..nblocks {
            let mapped = mapper.lookup(&inode, logical).expect("lookup").is_some();
            prop_assert_eq!(mapped, logical < surviving, "logical {}", logical);
        }

        truncate(&fs, &mut inode, 0).expect("truncate to zero");
        prop_assert_eq!(inode.blocks, 0);
        prop_assert_eq!(free_blocks_count(&fs), empty);
    }
}
