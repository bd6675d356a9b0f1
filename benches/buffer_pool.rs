//! Micro benchmarks for the buffer pool's claim/release hot path, isolated
//! from the B+-tree and journal so it measures frame lookup, claiming, and
//! eviction alone.
#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tempfile::TempDir;

use heartwood::buffer::{BufferPool, NullJournal};
use heartwood::types::PageId;
use heartwood::volume::spec::VolumeSpecification;
use heartwood::volume::{new_volume_id, Volume};

const PAGE_COUNT: u64 = 2_048;

struct Fixture {
    _dir: TempDir,
    volume: Arc<Volume>,
    pages: Vec<PageId>,
}

impl Fixture {
    fn new(pool_capacity: usize) -> (Self, BufferPool) {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bench.v01");
        let spec = VolumeSpecification::parse(&format!(
            "{},pageSize:4096,initialSize:16m,maximumSize:32m,create",
            path.display()
        ))
        .unwrap();
        let volume = Arc::new(Volume::open(&spec, new_volume_id(), 1).unwrap());

        let pool = BufferPool::new(pool_capacity, Arc::new(NullJournal), Duration::from_secs(5));
        pool.register_volume(volume.clone());

        let mut pages = Vec::with_capacity(PAGE_COUNT as usize);
        for _ in 0..PAGE_COUNT {
            let page = volume.alloc_new_page().unwrap();
            let buf = vec![0u8; volume.page_size() as usize];
            volume.write_page(page, &buf).unwrap();
            pages.push(page);
        }

        (Self { _dir: dir, volume, pages }, pool)
    }
}

fn buffer_pool_claims(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool/claims");
    group.throughput(Throughput::Elements(PAGE_COUNT));

    group.bench_function("shared_get_fully_cached", |b| {
        b.iter_batched(
            || {
                let (fixture, pool) = Fixture::new(PAGE_COUNT as usize * 2);
                for &page in &fixture.pages {
                    let _ = pool.get_shared(fixture.volume.id(), page).unwrap();
                }
                (fixture, pool)
            },
            |(fixture, pool)| {
                for &page in &fixture.pages {
                    let guard = pool.get_shared(fixture.volume.id(), page).unwrap();
                    black_box(&guard[..8]);
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("exclusive_get_with_eviction", |b| {
        b.iter_batched(
            || Fixture::new(PAGE_COUNT as usize / 4),
            |(fixture, pool)| {
                for &page in &fixture.pages {
                    let mut guard = pool.get_exclusive(fixture.volume.id(), page).unwrap();
                    guard[0] = guard[0].wrapping_add(1);
                    guard.mark_dirty(1);
                }
                black_box(pool.len());
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn buffer_pool_flush(c: &mut Criterion) {
    c.bench_function("buffer_pool/flush_all_dirty", |b| {
        b.iter_batched(
            || {
                let (fixture, pool) = Fixture::new(PAGE_COUNT as usize * 2);
                for &page in &fixture.pages {
                    let mut guard = pool.get_exclusive(fixture.volume.id(), page).unwrap();
                    guard.mark_dirty(1);
                }
                (fixture, pool)
            },
            |(_fixture, pool)| {
                black_box(pool.flush(u64::MAX).unwrap());
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, buffer_pool_claims, buffer_pool_flush);
criterion_main!(benches);
