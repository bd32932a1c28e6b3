use criterion::{black_box, criterion_group, criterion_main, Criterion};
use seqdb_atlas::{Atlas, AtlasOptions, Lease, KIB, MIB};
use tempfile::TempDir;

fn setup(len: u64) -> (TempDir, std::path::PathBuf) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bench.psq");
    std::fs::write(&path, vec![7u8; len as usize]).unwrap();
    (temp, path)
}

fn bench_region_hit(c: &mut Criterion) {
    let (_temp, path) = setup(4 * MIB);
    let atlas = Atlas::new(AtlasOptions::default()).unwrap();

    c.bench_function("atlas_region_hit", |b| {
        b.iter(|| {
            let mut hold = atlas.hold();
            let bytes = atlas
                .get_region(&path, black_box(4096), black_box(8192), &mut hold)
                .unwrap();
            black_box(bytes[0]);
            atlas.ret_region(bytes, &mut hold).unwrap();
        })
    });
}

fn bench_region_miss(c: &mut Criterion) {
    let (_temp, path) = setup(16 * MIB);
    // Budget of one slice: every request in a new slice evicts the previous one
    let atlas = Atlas::new(AtlasOptions {
        large_slice: 64 * KIB,
        small_slice: 4 * KIB,
        memory_bound: 64 * KIB,
        ..AtlasOptions::default()
    })
    .unwrap();
    let mut slice = 0u64;

    c.bench_function("atlas_region_miss_64kb", |b| {
        b.iter(|| {
            slice = (slice + 1) % 256;
            let begin = slice * 64 * KIB;
            let mut hold = atlas.hold();
            let bytes = atlas.get_region(&path, begin, begin + 512, &mut hold).unwrap();
            black_box(bytes[0]);
            atlas.ret_region(bytes, &mut hold).unwrap();
        })
    });
}

fn bench_lease_retarget(c: &mut Criterion) {
    let (_temp, path) = setup(4 * MIB);
    let atlas = Atlas::new(AtlasOptions::default()).unwrap();
    let mut lease = Lease::new();
    let mut offset = 0u64;

    c.bench_function("atlas_lease_retarget", |b| {
        b.iter(|| {
            offset = (offset + 4_099) % (4 * MIB - 100);
            let mut hold = atlas.hold();
            atlas
                .lease_region(&mut lease, &path, offset, offset + 100, &mut hold)
                .unwrap();
            black_box(lease.bytes());
        })
    });

    lease.release();
}

fn bench_pool_alloc(c: &mut Criterion) {
    let atlas = Atlas::new(AtlasOptions::default()).unwrap();

    c.bench_function("atlas_pool_alloc_4kb", |b| {
        b.iter(|| {
            let mut hold = atlas.hold();
            let ptr = atlas.alloc(black_box(4096), &mut hold);
            atlas.free(ptr.as_ptr(), &mut hold).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_region_hit,
    bench_region_miss,
    bench_lease_retarget,
    bench_pool_alloc
);
criterion_main!(benches);
