use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use seqdb_atlas::{Atlas, AtlasOptions, Lease, KIB, MIB};
use tempfile::TempDir;

fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn create_volumes(temp: &TempDir, count: usize, len: u64) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = temp.path().join(format!("vol.{:02}.psq", i));
            let data: Vec<u8> = (0..len).map(pattern).collect();
            std::fs::write(&path, data).unwrap();
            path
        })
        .collect()
}

fn tight_options() -> AtlasOptions {
    AtlasOptions {
        large_slice: 64 * KIB,
        small_slice: 4 * KIB,
        block_size: 16 * KIB,
        memory_bound: 512 * KIB,
        ..AtlasOptions::default()
    }
}

#[test]
fn test_parallel_readers_share_regions() {
    let temp = TempDir::new().unwrap();
    let volumes = create_volumes(&temp, 4, MIB);
    let atlas = Atlas::new(tight_options()).unwrap();

    (0..2_000u64).into_par_iter().for_each(|i| {
        let path = &volumes[(i % 4) as usize];
        let begin = (i * 7_919) % (MIB - 1_000);
        let end = begin + 1 + (i % 900);

        let mut hold = atlas.hold();
        let bytes = atlas.get_region(path, begin, end, &mut hold).unwrap();
        let region = bytes.region_id();

        // A pinned region stays indexed while other threads sweep
        assert!(atlas.layout(&mut hold).iter().any(|r| r.id == region));
        hold.unlock();

        for (k, b) in bytes.iter().enumerate() {
            assert_eq!(*b, pattern(begin + k as u64));
        }

        atlas.ret_region(bytes, &mut hold).unwrap();
    });

    let mut hold = atlas.hold();
    let stats = atlas.stats(&mut hold);
    assert_eq!(stats.referenced_regions, 0);
    assert_eq!(stats.resident_bytes, stats.region_bytes);
    assert_eq!(stats.hits + stats.misses, 2_000);
    assert!(stats.evictions > 0);

    atlas.garbage_collect(&mut hold);
    assert_eq!(atlas.resident_bytes(&mut hold), 0);
}

#[test]
fn test_leases_dropped_on_worker_threads() {
    let temp = TempDir::new().unwrap();
    let volumes = create_volumes(&temp, 2, 512 * KIB);
    let atlas = Arc::new(Atlas::new(tight_options()).unwrap());

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let atlas = Arc::clone(&atlas);
            let path = volumes[(t % 2) as usize].clone();
            std::thread::spawn(move || {
                let mut lease = Lease::new();
                for i in 0..200u64 {
                    let begin = (t * 4_099 + i * 1_021) % (500 * KIB);
                    let mut hold = atlas.hold();
                    atlas
                        .lease_region(&mut lease, &path, begin, begin + 64, &mut hold)
                        .unwrap();
                    drop(hold);

                    assert_eq!(lease.slice(begin, begin + 1), Some(&[pattern(begin)][..]));
                }
                // Released without the lock
                drop(lease);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let mut hold = atlas.hold();
    assert_eq!(atlas.stats(&mut hold).referenced_regions, 0);
    atlas.garbage_collect(&mut hold);
    assert_eq!(atlas.resident_bytes(&mut hold), 0);
}

#[test]
fn test_pool_allocations_across_threads() {
    let atlas = Atlas::new(AtlasOptions::default()).unwrap();

    let ptrs: Vec<_> = (1..=64usize)
        .into_par_iter()
        .map(|len| {
            let mut hold = atlas.hold();
            let ptr = atlas.alloc(len * 100, &mut hold);
            atlas.pool_slice_mut(ptr, &mut hold).unwrap().fill(len as u8);
            ptr
        })
        .collect();

    let mut hold = atlas.hold();
    assert_eq!(atlas.stats(&mut hold).pool_allocations, 64);
    assert_eq!(atlas.resident_bytes(&mut hold), (1..=64u64).sum::<u64>() * 100);
    hold.unlock();

    ptrs.par_iter().for_each(|ptr| {
        let mut hold = atlas.hold();
        let fill = atlas.pool_slice(*ptr, &mut hold).unwrap()[0];
        assert_eq!(fill as usize * 100, ptr.len());
        atlas.ret_address(ptr.as_ptr(), &mut hold).unwrap();
    });

    let mut hold = atlas.hold();
    assert_eq!(atlas.resident_bytes(&mut hold), 0);
}
