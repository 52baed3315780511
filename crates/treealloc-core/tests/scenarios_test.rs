use std::ptr::{self, NonNull};

use treealloc_core::{
    ALIGN, Allocator, AllocatorConfig, FreeOutcome, MmapPageSource, PageEvent,
    RecordingPageSource,
};

type Recorded = Allocator<RecordingPageSource<MmapPageSource>>;

fn recorded(page_size: usize, arena_size: usize) -> Recorded {
    Allocator::new(
        AllocatorConfig::new(page_size, arena_size).expect("valid config"),
        RecordingPageSource::new(MmapPageSource::new()),
    )
}

fn write_pattern(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
    }
}

fn has_pattern(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
    (0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == seed.wrapping_add(i as u8))
}

#[test]
fn every_request_gets_aligned_usable_bytes() {
    let mut a = recorded(4096, 8192);
    let sizes = [1, 7, 15, 16, 17, 31, 100, 1000, 4000, 8100, 8200, 50_000];
    let mut live = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let p = a.allocate(size).expect("allocation");
        assert_eq!(p.as_ptr() as usize % ALIGN, 0, "size {size} misaligned");
        assert!(unsafe { a.usable_size(p) }.unwrap() >= size);
        write_pattern(p, size, i as u8);
        live.push((p, size, i as u8));
    }
    for &(p, size, seed) in &live {
        assert!(has_pattern(p, size, seed), "size {size} corrupted");
    }
    a.check_invariants().unwrap();
    for (p, _, _) in live {
        unsafe { a.free(p.as_ptr()) };
    }
    a.check_invariants().unwrap();
}

#[test]
fn zero_allocate_and_null_free_change_nothing() {
    let mut a = recorded(4096, 8192);
    let before = a.snapshot();
    assert!(a.allocate(0).is_none());
    unsafe { a.free(ptr::null_mut()) };
    assert_eq!(a.snapshot(), before);
    assert!(a.page_source().events().is_empty());
}

#[test]
fn freed_small_block_is_reused_without_new_region() {
    let mut a = recorded(4096, 8192);
    let first = a.allocate(100).unwrap();
    let second = a.allocate(5000).unwrap();
    write_pattern(second, 5000, 9);
    unsafe { a.free(first.as_ptr()) };

    let reused = a.allocate(90).unwrap();
    assert_eq!(reused, first);
    assert_eq!(a.page_source().acquire_count(), 1);
    assert!(has_pattern(second, 5000, 9));
    a.check_invariants().unwrap();
}

#[test]
fn reuse_never_overlaps_live_neighbors() {
    let mut a = recorded(4096, 8192);
    let p = a.allocate(200).unwrap();
    let q = a.allocate(200).unwrap();
    write_pattern(q, 200, 77);
    unsafe { a.free(p.as_ptr()) };
    let r = a.allocate(150).unwrap();
    write_pattern(r, 150, 3);
    assert!(has_pattern(q, 200, 77));
}

#[test]
fn large_region_is_released_and_reacquired() {
    let mut a = recorded(4096, 8192);
    let big = a.allocate(10_000).unwrap();
    write_pattern(big, 10_000, 1);
    assert_eq!(
        unsafe { a.try_free(big.as_ptr()) }.map(|o| matches!(o, FreeOutcome::ArenaReleased { .. })),
        Ok(true)
    );
    let _again = a.allocate(10_000).unwrap();

    let events = a.page_source().events();
    assert!(matches!(
        events,
        [
            PageEvent::Acquire { size: s1, .. },
            PageEvent::Release { size: s2, .. },
            PageEvent::Acquire { size: s3, .. },
        ] if s1 == s2 && s2 == s3
    ));
    a.check_invariants().unwrap();
}

#[test]
fn realloc_shrink_and_grow_preserve_content() {
    let mut a = recorded(4096, 8192);
    let p = a.allocate(100).unwrap();
    write_pattern(p, 100, 40);

    let same = unsafe { a.reallocate(p.as_ptr(), 50) }.unwrap();
    assert_eq!(same, p);
    assert!(has_pattern(same, 50, 40));

    let grown = unsafe { a.reallocate(same.as_ptr(), 3000) }.unwrap();
    assert_ne!(grown, p);
    assert!(has_pattern(grown, 100, 40));

    let huge = unsafe { a.reallocate(grown.as_ptr(), 20_000) }.unwrap();
    assert!(has_pattern(huge, 100, 40));
    assert_eq!(a.stats().live_allocations, 1);
    a.check_invariants().unwrap();
}

#[test]
fn equal_size_frees_leave_the_other_block_indexed() {
    let mut a = recorded(4096, 8192);
    let x = a.allocate(100).unwrap();
    let y = a.allocate(100).unwrap();
    let _z = a.allocate(100).unwrap();
    unsafe {
        a.free(x.as_ptr());
        a.free(y.as_ptr());
    }
    assert_eq!(a.free_index().count_key(128), 2);

    let handed = a.allocate(100).unwrap();
    assert!(handed == x || handed == y);
    let survivor = if handed == x { y } else { x };

    assert_eq!(a.free_index().count_key(128), 1);
    let indexed: Vec<NonNull<u8>> = a
        .free_index()
        .iter()
        .filter(|&(size, _)| size == 128)
        .map(|(_, block)| block.payload())
        .collect();
    assert_eq!(indexed, vec![survivor]);
    a.check_invariants().unwrap();
}

#[test]
fn demonstration_workload_stays_consistent() {
    let mut a = recorded(4096, 8192);
    let p1 = a.allocate(100).unwrap();
    let p2 = a.allocate(200).unwrap();
    let p3 = a.allocate(300).unwrap();
    let text = b"Hello, World!\0";
    unsafe { ptr::copy_nonoverlapping(text.as_ptr(), p1.as_ptr(), text.len()) };

    unsafe { a.free(p2.as_ptr()) };
    let p4 = a.allocate(150).unwrap();
    assert_eq!(p4, p2);
    let p1 = unsafe { a.reallocate(p1.as_ptr(), 50) }.unwrap();
    assert_eq!(
        unsafe { std::slice::from_raw_parts(p1.as_ptr(), text.len()) },
        text
    );

    let large: Vec<_> = [4000, 5000, 10_000]
        .into_iter()
        .map(|n| a.allocate(n).unwrap())
        .collect();
    let small: Vec<_> = (0..10).map(|_| a.allocate(32).unwrap()).collect();
    a.check_invariants().unwrap();
    assert!(a.dump_state().contains("large"));

    for p in [p1, p3, p4].into_iter().chain(large).chain(small) {
        unsafe { a.free(p.as_ptr()) };
    }
    a.check_invariants().unwrap();
    assert_eq!(a.stats().live_allocations, 0);
    assert_eq!(a.stats().large_arenas_live, 0);
}
