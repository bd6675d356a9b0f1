//! Micro benchmarks for whole-tree insert/fetch through the public
//! transaction surface: sequential load (where the PACK split policy should
//! drive page utilization up) versus random load, plus point fetch.
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use heartwood::btree::{Key, Segment};
use heartwood::config::EngineConfig;
use heartwood::db::Engine;

const INSERT_COUNT: u64 = 8_192;

struct Fixture {
    _dir: TempDir,
    engine: Arc<Engine>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let volume_path = dir.path().join("bench.v01");
        let mut config = EngineConfig::benchmark();
        config.data_path = dir.path().to_path_buf();
        config.journal_path = dir.path().join("journal");
        config.volume_specs = vec![format!("{},create,pageSize:8192", volume_path.display())];
        let engine = Engine::open(config).expect("engine open");
        Self { _dir: dir, engine }
    }

    fn insert_keys(&self, keys: &[u64]) {
        let volume = self.engine.volume_ids()[0];
        let txn = self.engine.begin(volume).unwrap();
        let ex = txn.exchange("bench", true).unwrap();
        for &k in keys {
            ex.store(Key::encode(&[Segment::U64(k)]), k.to_be_bytes().to_vec()).unwrap();
        }
        txn.commit().unwrap();
    }
}

fn btree_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/insert");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential", |b| {
        b.iter_batched(
            Fixture::new,
            |fixture| {
                let keys: Vec<u64> = (0..INSERT_COUNT).collect();
                fixture.insert_keys(&keys);
                black_box(&fixture);
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xF00D_CAFE));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random", |b| {
        b.iter_batched(
            Fixture::new,
            |fixture| {
                fixture.insert_keys(&random_keys);
                black_box(&fixture);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn btree_fetch(c: &mut Criterion) {
    let fixture = Fixture::new();
    let keys: Vec<u64> = (0..INSERT_COUNT).collect();
    fixture.insert_keys(&keys);
    let volume = fixture.engine.volume_ids()[0];

    let mut group = c.benchmark_group("btree/fetch");
    group.throughput(Throughput::Elements(1));
    group.bench_function("point_fetch", |b| {
        b.iter(|| {
            let txn = fixture.engine.begin(volume).unwrap();
            let ex = txn.exchange("bench", false).unwrap();
            let value = ex.fetch(&Key::encode(&[Segment::U64(black_box(INSERT_COUNT / 2))])).unwrap();
            txn.commit().unwrap();
            black_box(value);
        });
    });
    group.finish();
}

criterion_group!(benches, btree_insert, btree_fetch);
criterion_main!(benches);
