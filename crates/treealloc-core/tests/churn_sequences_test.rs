use std::ptr::NonNull;

use treealloc_core::{
    Allocator, AllocatorConfig, AllocatorLogLevel, MmapPageSource, RecordingPageSource,
};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy)]
struct Slot {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}

fn stamp(slot: &Slot) {
    unsafe { std::ptr::write_bytes(slot.ptr.as_ptr(), slot.tag, slot.len) };
}

fn intact(slot: &Slot) -> bool {
    unsafe { std::slice::from_raw_parts(slot.ptr.as_ptr(), slot.len) }
        .iter()
        .all(|&b| b == slot.tag)
}

#[test]
fn deterministic_churn_holds_structural_invariants() {
    const SEEDS: [u64; 4] = [1, 2, 3, 0xDEAD_BEEF];
    const STEPS: usize = 1_500;
    const SLOTS: usize = 48;

    for seed in SEEDS {
        let mut a = Allocator::new(
            AllocatorConfig::new(4096, 16_384).unwrap(),
            RecordingPageSource::new(MmapPageSource::new()),
        );
        let mut rng = XorShift64::new(seed);
        let mut slots: [Option<Slot>; SLOTS] = [None; SLOTS];

        for step in 0..STEPS {
            let i = rng.gen_range_usize(0, SLOTS - 1);
            let tag = (step % 251) as u8;
            match (slots[i], rng.gen_range_usize(0, 9)) {
                (None, _) => {
                    // Mostly small, sometimes large.
                    let len = if rng.gen_range_usize(0, 15) == 0 {
                        rng.gen_range_usize(16_384, 40_000)
                    } else {
                        rng.gen_range_usize(1, 2_000)
                    };
                    let ptr = a.allocate(len).expect("allocation");
                    let slot = Slot { ptr, len, tag };
                    stamp(&slot);
                    slots[i] = Some(slot);
                }
                (Some(slot), 0..=5) => {
                    assert!(intact(&slot), "seed {seed} step {step}: slot {i} corrupted");
                    unsafe { a.free(slot.ptr.as_ptr()) };
                    slots[i] = None;
                }
                (Some(slot), _) => {
                    assert!(intact(&slot), "seed {seed} step {step}: slot {i} corrupted");
                    let len = rng.gen_range_usize(1, 6_000);
                    let ptr = unsafe { a.reallocate(slot.ptr.as_ptr(), len) }.expect("realloc");
                    let kept = slot.len.min(len);
                    assert!(
                        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), kept) }
                            .iter()
                            .all(|&b| b == slot.tag),
                        "seed {seed} step {step}: realloc lost content"
                    );
                    let slot = Slot { ptr, len, tag };
                    stamp(&slot);
                    slots[i] = Some(slot);
                }
            }

            if let Err(violation) = a.check_invariants() {
                panic!("seed {seed} step {step}: {violation}");
            }
            let live = slots.iter().flatten().count();
            assert_eq!(a.stats().live_allocations, live);
        }

        for slot in slots.iter().flatten() {
            assert!(intact(slot));
            unsafe { a.free(slot.ptr.as_ptr()) };
        }
        a.check_invariants().unwrap();
        assert_eq!(a.stats().large_arenas_live, 0);
        assert!(
            a.lifecycle_logs()
                .iter()
                .all(|r| r.level < AllocatorLogLevel::Warn),
            "seed {seed}: unexpected warnings"
        );
        assert_eq!(
            a.page_source().mapped_bytes(),
            a.stats().bytes_mapped,
            "seed {seed}: mapping accounting drifted"
        );
    }
}
