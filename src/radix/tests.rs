use super::*;
use crate::constants::LEAF_SPAN;
use crate::core::{Config, ObjectClass};
use std::collections::HashSet;
use std::thread;
use tempfile::TempDir;

fn allocator() -> (TempDir, Arc<Allocator>) {
    let dir = tempfile::tempdir().unwrap();
    let alloc = Allocator::new(&Config::for_tests(dir.path())).unwrap();
    (dir, alloc)
}

fn free_nodes(alloc: &Allocator) -> usize {
    alloc.flush_thread_caches();
    alloc
        .stats()
        .into_iter()
        .find(|s| s.class == ObjectClass::Node)
        .map(|s| s.available)
        .unwrap()
}

#[test]
fn root_level_follows_the_maximum_size() {
    // Goal: the root is the shallowest level spanning the region's maximum size
    assert_eq!(NodeKind::for_size(1 << 20), NodeKind::Leaf);
    assert_eq!(NodeKind::for_size(2 << 20), NodeKind::Leaf);
    assert_eq!(NodeKind::for_size((2 << 20) + 1), NodeKind::Middle);
    assert_eq!(NodeKind::for_size(64 << 30), NodeKind::Upper);
    assert_eq!(NodeKind::for_size(1 << 40), NodeKind::Global);

    let (_dir, alloc) = allocator();
    let index = RadixLog::new(alloc, 64 << 20).unwrap();
    assert_eq!(index.root_kind(), NodeKind::Middle);
    assert_eq!(index.span(), 1 << 30);
    assert!(matches!(index.locate_or_create(1 << 30), Err(Error::RegionFull { .. })));
}

#[test]
fn locate_is_deterministic() {
    // Goal: the same offset always resolves to the same leaf, through the cache or not
    let (_dir, alloc) = allocator();
    let index = RadixLog::new(alloc, 1 << 30).unwrap();

    let a = index.locate_or_create(5 << 20).unwrap().handle();
    let b = index.locate_or_create(100).unwrap().handle();
    assert_ne!(a, b);
    assert_eq!(index.locate_or_create((5 << 20) + 4095).unwrap().handle(), a);
    assert_eq!(index.locate_or_create(0).unwrap().handle(), b);
    assert_eq!(index.find(5 << 20).unwrap().handle(), a);
    assert_eq!(index.locate_or_create(4 << 20).unwrap().handle(), a);
}

#[test]
fn find_never_creates() {
    // Goal: lookups of untouched offsets allocate nothing
    let (_dir, alloc) = allocator();
    let index = RadixLog::new(alloc.clone(), 1 << 30).unwrap();
    let free = free_nodes(&alloc);

    assert!(index.find(3 << 20).is_none());
    assert_eq!(free_nodes(&alloc), free);

    index.locate_or_create(3 << 20).unwrap();
    assert_eq!(free_nodes(&alloc), free - 1);
    assert!(index.find(3 << 20).is_some());
    assert!(index.find(4 << 20).is_none());
}

#[test]
fn granule_is_fixed_by_first_access() {
    // Goal: a leaf's granule never changes after the first access sizes it
    let (_dir, alloc) = allocator();
    let index = RadixLog::new(alloc, 1 << 30).unwrap();
    let leaf = index.locate_or_create(0).unwrap();
    assert_eq!(leaf.node().granule(), None);

    assert_eq!(index.granule_size_for(&leaf, 100, 10_000), Granule::K16);
    assert_eq!(index.granule_size_for(&leaf, 0, 10), Granule::K16);
    assert_eq!(index.granule_size_for(&leaf, 0, 1 << 20), Granule::K16);
    assert_eq!(leaf.node().granule(), Some(Granule::K16));
}

#[test]
fn span_selects_the_smallest_aligned_granule() {
    // Goal: the chosen class is the smallest whose aligned block holds the span
    assert_eq!(Granule::for_span(0, 4096), Granule::K4);
    assert_eq!(Granule::for_span(0, 4097), Granule::K8);
    assert_eq!(Granule::for_span(4000, 200), Granule::K8);
    assert_eq!(Granule::for_span(8000, 200), Granule::K16);
    assert_eq!(Granule::for_span(0, 0), Granule::K4);
    assert_eq!(Granule::for_span(1 << 20, 1 << 20), Granule::M1);
    assert_eq!(Granule::for_span(10, 4 << 20), Granule::M2);

    let g = Granule::K8;
    assert_eq!(g.entries(), 256);
    assert_eq!(g.slot((2 << 20) + 3 * 8192 + 5), 3);
    assert_eq!(g.base(3 * 8192 + 5), 3 * 8192);
    assert_eq!(g.offset_in(3 * 8192 + 5), 5);
    assert_eq!(Granule::M2.to_string(), "2M");
    assert_eq!(Granule::K512.to_string(), "512K");
}

#[test]
fn racing_installs_agree_on_one_leaf() {
    // Goal: threads resolving the same fresh offset all see one winner and the
    // losers' nodes go back to the pool
    let (_dir, alloc) = allocator();
    let index = Arc::new(RadixLog::new(alloc.clone(), 1 << 30).unwrap());
    let free = free_nodes(&alloc);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let index = index.clone();
            thread::spawn(move || {
                let leaves: Vec<u32> = (0..16u64)
                    .map(|i| index.locate_or_create(i * LEAF_SPAN + 17).unwrap().handle())
                    .collect();
                index.alloc.flush_thread_caches();
                leaves
            })
        })
        .collect();
    let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for r in &results[1..] {
        assert_eq!(r, &results[0]);
    }
    let distinct: HashSet<_> = results[0].iter().collect();
    assert_eq!(distinct.len(), 16);
    // sixteen leaves under the existing root survive
    assert_eq!(free_nodes(&alloc), free - 16);
}

#[test]
fn dropping_the_index_returns_its_nodes() {
    // Goal: tearing down an index gives back every node and record it holds
    let (_dir, alloc) = allocator();
    let free = free_nodes(&alloc);
    {
        let index = RadixLog::new(alloc.clone(), 1 << 30).unwrap();
        for i in 0..10u64 {
            index.locate_or_create(i * (3 << 20)).unwrap();
        }
        let leaf = index.locate_or_create(0).unwrap();
        let granule = index.granule_size_for(&leaf, 0, 1);
        let record = alloc.acquire_record().unwrap();
        assert!(leaf.node().install(granule.slot(0), record).is_ok());
        assert!(free_nodes(&alloc) < free);
    }
    assert_eq!(free_nodes(&alloc), free);
    let records = alloc.stats().into_iter().find(|s| s.class == ObjectClass::Record).unwrap();
    assert_eq!(records.available, records.capacity);
}

#[test]
fn slot_install_is_once_only() {
    // Goal: a second install into an occupied slot hands the handle back
    let (_dir, alloc) = allocator();
    let index = RadixLog::new(alloc.clone(), 1 << 30).unwrap();
    let leaf = index.locate_or_create(0).unwrap();

    let first = alloc.acquire_record().unwrap();
    let first_raw = first.index() as u32;
    assert_eq!(leaf.node().install(3, first).ok(), Some(first_raw));

    let second = alloc.acquire_record().unwrap();
    let (loser, winner) = leaf.node().install(3, second).unwrap_err();
    assert_eq!(winner, first_raw);
    alloc.release_record(loser);

    assert!(leaf.node().remove(3, first_raw + 1).is_none());
    let back = leaf.node().remove(3, first_raw).unwrap();
    assert_eq!(leaf.node().child(3), None);
    alloc.release_record(back);
}
