use super::freelist::{Batch, FreeList};
use super::*;
use crate::core::error::Error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::thread;

#[test]
fn skip_directory_tracks_the_list() {
    // Goal: the skip directory always holds one entry per complete batch
    let mut list = FreeList::filled(100, 16);
    assert_eq!((list.len(), list.skip_len()), (100, 6));

    let mut held = Vec::new();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..2000 {
        match rng.random_range(0..4) {
            0 => {
                if let Some(batch) = list.detach() {
                    held.extend(batch.0);
                }
            }
            1 => held.extend(list.pop()),
            2 if !held.is_empty() => {
                let n = rng.random_range(1..=held.len().min(20));
                list.splice(Batch(held.split_off(held.len() - n)));
            }
            _ => {
                if let Some(h) = held.pop() {
                    list.push(h);
                }
            }
        }
        assert_eq!(list.len() + held.len(), 100);
        assert_eq!(list.skip_len(), list.len() / 16);
    }
}

#[test]
fn detach_prefers_whole_batches() {
    // Goal: a refill takes a full batch while one exists, then the remainder
    let mut list = FreeList::filled(40, 16);
    assert_eq!(list.detach().unwrap().len(), 16);
    assert_eq!(list.detach().unwrap().len(), 16);
    assert_eq!(list.detach().unwrap().len(), 8);
    assert!(list.detach().is_none());
    assert!(list.pop().is_none());
}

#[test]
fn exhaustion_is_an_error() {
    // Goal: a drained pool reports exhaustion instead of growing
    let pool = SlotPool::new(ObjectClass::Record, 64, 8, 2);
    let handles: Vec<_> = (0..64).map(|_| pool.acquire().unwrap()).collect();
    let distinct: HashSet<_> = handles.iter().map(Handle::index).collect();
    assert_eq!(distinct.len(), 64);
    assert!(matches!(pool.acquire(), Err(Error::PoolExhausted(ObjectClass::Record))));

    for h in handles {
        pool.release(h);
    }
    assert!(pool.acquire().is_ok());
}

#[test]
fn collector_spills_past_the_retention_cap() {
    // Goal: a thread keeps at most `retained` full batches and spills the rest
    let pool = SlotPool::new(ObjectClass::Node, 64, 8, 2);
    let handles: Vec<_> = (0..64).map(|_| pool.acquire().unwrap()).collect();
    assert_eq!(pool.available(), 0);

    for h in handles {
        pool.release(h);
    }
    assert_eq!(pool.cached_here(), 16);
    assert_eq!(pool.available(), 48);
    assert_eq!(pool.skip_len(), 6);

    pool.flush_local();
    assert_eq!(pool.cached_here(), 0);
    assert_eq!(pool.available(), 64);
}

#[test]
fn refill_reuses_own_returns_first() {
    // Goal: a thread with full collector batches refills without touching the pool
    let pool = SlotPool::new(ObjectClass::Node, 64, 8, 2);
    let first: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();
    let second: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();
    for h in first {
        pool.release(h);
    }
    assert_eq!(pool.available(), 48);

    // provider is empty; the next acquire must come from the returned batch
    let again = pool.acquire().unwrap();
    assert_eq!(pool.available(), 48);
    assert!(again.index() < 64);
    pool.release(again);
    for h in second {
        pool.release(h);
    }
}

#[test]
fn conservation_at_a_quiescent_point() {
    // Goal: global + cached + held equals capacity
    let pool = SlotPool::new(ObjectClass::Descriptor, 128, 16, 1);
    let mut held = Vec::new();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..1000 {
        if rng.random_bool(0.55) {
            if let Ok(h) = pool.acquire() {
                held.push(h);
            }
        } else if let Some(h) = held.pop() {
            pool.release(h);
        }
        assert_eq!(pool.available() + pool.cached_here() + held.len(), pool.capacity());
    }
}

#[test]
fn conservation_under_thread_stress() {
    // Goal: concurrent acquire/release never hands a slot to two owners and
    // every slot is back once the threads are gone
    let pool = Arc::new(SlotPool::new(ObjectClass::Record, 1024, 16, 2));
    let owned: Arc<Vec<AtomicBool>> = Arc::new((0..1024).map(|_| AtomicBool::new(false)).collect());

    let workers: Vec<_> = (0..8u64)
        .map(|t| {
            let pool = pool.clone();
            let owned = owned.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                let mut held = Vec::new();
                for _ in 0..5000 {
                    if held.len() < 64 && rng.random_bool(0.5) {
                        let h = pool.acquire().unwrap();
                        assert!(!owned[h.index()].swap(true, Ordering::AcqRel), "slot handed out twice");
                        held.push(h);
                    } else if !held.is_empty() {
                        let h = held.swap_remove(rng.random_range(0..held.len()));
                        assert!(owned[h.index()].swap(false, Ordering::AcqRel));
                        pool.release(h);
                    }
                }
                for h in held {
                    owned[h.index()].store(false, Ordering::Release);
                    pool.release(h);
                }
                pool.flush_local();
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(pool.available(), 1024);
    assert_eq!(pool.skip_len(), 64);
}

#[test]
fn scratch_directory_lives_with_the_allocator() {
    // Goal: backing files exist while the allocator lives and vanish with it
    let dir = tempfile::tempdir().unwrap();
    let alloc = Allocator::new(&Config::for_tests(dir.path())).unwrap();
    let scratch = alloc.scratch_dir().to_path_buf();

    assert!(scratch.starts_with(dir.path()));
    for name in ["mmio-0.log", "index-0.log", "logs-4K.log", "logs-2M.log"] {
        assert!(scratch.join(name).exists(), "{} missing", name);
    }
    let four_k = std::fs::metadata(scratch.join("logs-4K.log")).unwrap().len();
    assert_eq!(four_k, 32 << 20);

    drop(alloc);
    assert!(!scratch.exists());
}

#[test]
fn log_buffers_match_their_class() {
    // Goal: buffers come back sized by granule and tagged with their class
    let dir = tempfile::tempdir().unwrap();
    let alloc = Allocator::new(&Config::for_tests(dir.path())).unwrap();

    let mut buf = alloc.acquire_log(Granule::K16).unwrap();
    assert_eq!(buf.granule(), Granule::K16);
    assert_eq!(buf.as_slice().len(), 16 << 10);
    buf.as_mut_slice()[..5].copy_from_slice(b"hello");
    alloc.persist_log(&buf, 0, 5).unwrap();
    assert_eq!(&buf.as_slice()[..5], b"hello");
    alloc.release_log(buf);

    let stats = alloc.stats();
    assert_eq!(stats.len(), 3 + Granule::ALL.len());
    let m2 = stats.iter().find(|s| s.class == ObjectClass::Log(Granule::M2)).unwrap();
    assert_eq!(m2.capacity, 16);
    assert_eq!(alloc.cached_here(ObjectClass::Log(Granule::K16)), 16);
}

#[test]
fn descriptors_start_zeroed() {
    // Goal: a recycled descriptor carries nothing over from its last owner
    let dir = tempfile::tempdir().unwrap();
    let alloc = Allocator::new(&Config::for_tests(dir.path())).unwrap();

    let d = alloc.acquire_descriptor().unwrap();
    for w in alloc.descriptor_words(&d) {
        w.store(99, Ordering::Relaxed);
    }
    alloc.persist_descriptor(&d).unwrap();
    alloc.release_descriptor(d);

    // take every descriptor, the recycled one included
    let all: Vec<_> = (0..16).map(|_| alloc.acquire_descriptor().unwrap()).collect();
    for d in &all {
        assert!(alloc.descriptor_words(d).iter().all(|w| w.load(Ordering::Relaxed) == 0));
    }
}
