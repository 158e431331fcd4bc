//! Benchmark: bitmap scans and the bitmap cache hit/miss paths.

use bgfs_alloc::{
    FilesystemState, FormatOptions, MountOptions, bitmap_count_free, bitmap_find_free,
    format_volume,
};
use bgfs_block::{BufferCache, ByteBlockDevice, MemoryByteDevice};
use bgfs_types::GroupNumber;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

/// 4096-byte bitmap (32768 bits), ~5% free in clusters, the first free
/// cluster near the end so first-fit has to walk most of it.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 4096];
    let mut pos = 20_000_usize;
    while pos + 32 < 32768 {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

fn bench_count_free(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), 32768)));
    });
}

fn bench_find_free(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("find_free_first_fit", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), 32768)));
    });
}

fn mounted(capacity: usize) -> FilesystemState {
    let mem = MemoryByteDevice::new(1024 * (1 + 4 * 1024));
    let dev = ByteBlockDevice::new(mem, 1024).expect("device");
    format_volume(
        &dev,
        &FormatOptions {
            blocks_per_group: Some(1024),
            reserved_blocks: 0,
        },
    )
    .expect("format");
    let cache = Arc::new(BufferCache::new(Arc::new(dev), 64).expect("cache"));
    let options = MountOptions {
        bitmap_cache_capacity: capacity,
        ..MountOptions::default()
    };
    FilesystemState::open(cache, options).expect("open")
}

fn bench_bitmap_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitmap_cache");

    let mut direct = mounted(8);
    group.bench_function("hit_direct_mapped", |b| {
        b.iter(|| black_box(direct.bitmap_free_count(GroupNumber(3)).expect("count")));
    });

    let mut lru = mounted(2);
    let mut next = 0_u32;
    group.bench_function("lru_rotation", |b| {
        b.iter(|| {
            next = (next + 1) % 4;
            black_box(lru.bitmap_free_count(GroupNumber(next)).expect("count"))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_count_free,
    bench_find_free,
    bench_bitmap_cache
);
criterion_main!(benches);
