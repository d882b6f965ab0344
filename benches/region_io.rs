use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pmem_mmio::{Access, Allocator, Config, MappedRegion, Policy};
use std::sync::Arc;
use std::time::Duration;

fn bench_config(dir: &std::path::Path, policy: Policy) -> Config {
    let mut config = Config::default();
    config.storage.pmem_path = dir.to_path_buf();
    config.engine.default_policy = policy;
    config.engine.hybrid_logging = false;
    config.engine.checkpoint_period = Duration::ZERO;
    config.allocator.skip_unit = 64;
    config.allocator.log_pool_bytes = 128 << 20;
    config.validate().unwrap();
    config
}

fn open_region(dir: &tempfile::TempDir, policy: Policy) -> Arc<MappedRegion> {
    let config = bench_config(dir.path(), policy);
    let alloc = Allocator::new(&config).unwrap();
    let file = tempfile::tempfile_in(dir.path()).unwrap();
    MappedRegion::open(alloc, &config.engine, file, Access::ReadWrite, 1, 0).unwrap()
}

fn write_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    for policy in [Policy::Undo, Policy::Redo] {
        for size in [256usize, 4096, 65536] {
            let dir = tempfile::tempdir().unwrap();
            let region = open_region(&dir, policy);
            let buf = vec![0xabu8; size];
            let mut off = 0u64;

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(policy.to_string(), size), &size, |b, _| {
                b.iter(|| {
                    region.write(off, black_box(&buf)).unwrap();
                    off = (off + size as u64) % (32 << 20);
                })
            });
            region.close().unwrap();
        }
    }
    group.finish();
}

fn read_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    for policy in [Policy::Undo, Policy::Redo] {
        let dir = tempfile::tempdir().unwrap();
        let region = open_region(&dir, policy);
        region.write(0, &vec![1u8; 8 << 20]).unwrap();
        let mut buf = vec![0u8; 4096];
        let mut off = 0u64;

        group.throughput(Throughput::Bytes(4096));
        group.bench_function(policy.to_string(), |b| {
            b.iter(|| {
                black_box(region.read(off, &mut buf).unwrap());
                off = (off + 4096) % (8 << 20);
            })
        });
        region.close().unwrap();
    }
    group.finish();
}

fn commit_and_checkpoint(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let region = open_region(&dir, Policy::Redo);
    let buf = vec![7u8; 4096];
    c.bench_function("commit_checkpoint_64_records", |b| {
        b.iter(|| {
            for i in 0..64u64 {
                region.write(i * 4096, &buf).unwrap();
            }
            region.commit().unwrap();
            black_box(region.checkpoint().unwrap());
        })
    });
    region.close().unwrap();
}

criterion_group!(benches, write_throughput, read_throughput, commit_and_checkpoint);
criterion_main!(benches);
