//! Scripted and randomized allocator workloads.

use std::ptr::{self, NonNull};

use serde::Serialize;
use treealloc_core::{
    Allocator, AllocatorConfig, AllocatorLogRecord, AllocatorStats, MmapPageSource, PageEvent,
    RecordingPageSource, StateSnapshot,
};

use crate::HarnessError;

pub type HarnessAllocator = Allocator<RecordingPageSource<MmapPageSource>>;

fn harness_allocator(config: AllocatorConfig) -> HarnessAllocator {
    Allocator::new(config, RecordingPageSource::new(MmapPageSource::new()))
}

/// xorshift64* generator; deterministic per seed.
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift.
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive.saturating_sub(low).saturating_add(1);
        low + (self.next_u64() as usize % span)
    }
}

fn write_bytes(dst: NonNull<u8>, bytes: &[u8]) {
    // SAFETY: callers pass payloads with at least `bytes.len()` usable bytes.
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
}

fn holds_bytes(src: NonNull<u8>, bytes: &[u8]) -> bool {
    // SAFETY: as in `write_bytes`.
    let held = unsafe { std::slice::from_raw_parts(src.as_ptr(), bytes.len()) };
    held == bytes
}

// ---------------------------------------------------------------------------
// Demonstration
// ---------------------------------------------------------------------------

const GREETING: &[u8] = b"Hello, World!\0";
const SECOND_TEXT: &[u8] = b"Memory allocator test\0";

#[derive(Debug, Clone, Serialize)]
pub struct DemoStep {
    pub label: &'static str,
    pub notes: Vec<String>,
    pub state: StateSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub config: AllocatorConfig,
    pub steps: Vec<DemoStep>,
    pub page_events: Vec<PageEvent>,
    #[serde(skip)]
    pub logs: Vec<AllocatorLogRecord>,
}

fn demo_alloc(a: &mut HarnessAllocator, step: usize, size: usize) -> Result<NonNull<u8>, HarnessError> {
    a.try_allocate(size)?
        .ok_or(HarnessError::AllocationFailed { step, size })
}

fn demo_step(a: &HarnessAllocator, label: &'static str, notes: Vec<String>) -> DemoStep {
    DemoStep {
        label,
        notes,
        state: a.snapshot(),
    }
}

/// Runs the demonstration script: allocate, write, reallocate, reuse, large
/// allocation, cleanup. Each step captures the allocator state.
pub fn run_demo(config: AllocatorConfig) -> Result<DemoReport, HarnessError> {
    let mut a = harness_allocator(config);
    let mut steps = Vec::new();

    steps.push(demo_step(
        &a,
        "initialization",
        vec![format!(
            "page size {} bytes, default arena {} bytes",
            config.page_size, config.default_arena_size
        )],
    ));

    let buffer1 = demo_alloc(&mut a, 2, 256)?;
    let buffer2 = demo_alloc(&mut a, 2, 512)?;
    let buffer3 = demo_alloc(&mut a, 2, 1024)?;
    steps.push(demo_step(
        &a,
        "basic allocation",
        vec!["allocated 256, 512 and 1024 bytes".into()],
    ));

    write_bytes(buffer1, GREETING);
    write_bytes(buffer2, SECOND_TEXT);
    steps.push(demo_step(
        &a,
        "data manipulation",
        vec![
            format!("buffer1 at {:#x} holds {:?}", buffer1.as_ptr() as usize, "Hello, World!"),
            format!(
                "buffer2 at {:#x} holds {:?}",
                buffer2.as_ptr() as usize,
                "Memory allocator test"
            ),
        ],
    ));

    // SAFETY: buffer1 is live and owned by `a`.
    let buffer1 = unsafe { a.reallocate(buffer1.as_ptr(), 512) }
        .ok_or(HarnessError::AllocationFailed { step: 4, size: 512 })?;
    if !holds_bytes(buffer1, GREETING) {
        return Err(HarnessError::DemoCheck("reallocate did not preserve contents"));
    }
    steps.push(demo_step(
        &a,
        "reallocate",
        vec![format!(
            "buffer1 grown to 512 bytes at {:#x}, contents preserved",
            buffer1.as_ptr() as usize
        )],
    ));

    let acquires_before = a.page_source().acquire_count();
    // SAFETY: buffer2 is live and owned by `a`.
    unsafe { a.free(buffer2.as_ptr()) };
    let buffer4 = demo_alloc(&mut a, 5, 256)?;
    if a.page_source().acquire_count() != acquires_before {
        return Err(HarnessError::DemoCheck("freed space was not reused"));
    }
    steps.push(demo_step(
        &a,
        "memory reuse",
        vec![
            "freed buffer2 (512 bytes)".into(),
            format!(
                "new 256-byte block at {:#x} served without a new region",
                buffer4.as_ptr() as usize
            ),
        ],
    ));

    let medium = demo_alloc(&mut a, 6, 5000)?;
    let large = demo_alloc(&mut a, 6, 10_000)?;
    let large_arena = a
        .arenas()
        .find_owning(large.as_ptr() as usize)
        .is_some_and(|arena| arena.is_large());
    steps.push(demo_step(
        &a,
        "large allocation",
        vec![
            "allocated 5000 bytes".into(),
            format!("allocated 10000 bytes (dedicated arena: {large_arena})"),
        ],
    ));

    for ptr in [buffer1, buffer3, buffer4, medium, large] {
        // SAFETY: each pointer is live and owned by `a`.
        unsafe { a.free(ptr.as_ptr()) };
    }
    let stats = a.stats();
    if stats.live_allocations != 0 || stats.large_arenas_live != 0 {
        return Err(HarnessError::DemoCheck("cleanup left live allocations"));
    }
    if let Err(violation) = a.check_invariants() {
        return Err(HarnessError::Invariant { step: 7, violation });
    }
    steps.push(demo_step(
        &a,
        "cleanup",
        vec![format!(
            "freed every block; {} page releases so far",
            a.page_source().release_count()
        )],
    ));

    Ok(DemoReport {
        config,
        steps,
        page_events: a.page_source().events().to_vec(),
        logs: a.drain_lifecycle_logs(),
    })
}

// ---------------------------------------------------------------------------
// Churn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChurnConfig {
    pub seed: u64,
    pub ops: usize,
    /// Upper bound for small requests, in bytes.
    pub max_size: usize,
    /// Live-slot table size.
    pub slots: usize,
    /// One in this many fresh allocations is larger than a normal arena.
    /// Zero disables large requests.
    pub large_one_in: usize,
    /// Keep lifecycle records in the report.
    pub collect_logs: bool,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            seed: 0xDEAD_BEEF,
            ops: 10_000,
            max_size: 4096,
            slots: 64,
            large_one_in: 16,
            collect_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChurnReport {
    pub churn: ChurnConfig,
    pub config: AllocatorConfig,
    pub allocations: u64,
    pub large_allocations: u64,
    pub frees: u64,
    pub reallocs: u64,
    pub peak_live: usize,
    pub invariant_checks: u64,
    pub page_acquires: usize,
    pub page_releases: usize,
    /// Counters after the workload, before cleanup.
    pub stats_before_cleanup: AllocatorStats,
    pub final_stats: AllocatorStats,
    #[serde(skip)]
    pub logs: Vec<AllocatorLogRecord>,
}

#[derive(Clone, Copy)]
struct Slot {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}

fn stamp(slot: &Slot) {
    // SAFETY: slots only record live payloads of at least `len` bytes.
    unsafe { ptr::write_bytes(slot.ptr.as_ptr(), slot.tag, slot.len) };
}

fn prefix_intact(ptr: NonNull<u8>, len: usize, tag: u8) -> bool {
    // SAFETY: as in `stamp`.
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == tag)
}

/// Seeded random allocate/free/reallocate workload. Checks content and
/// structural invariants after every operation.
pub fn run_churn(config: AllocatorConfig, churn: ChurnConfig) -> Result<ChurnReport, HarnessError> {
    let mut a = harness_allocator(config);
    let mut rng = XorShift64::new(churn.seed);
    let mut slots: Vec<Option<Slot>> = vec![None; churn.slots.max(1)];
    let max_size = churn.max_size.max(1);
    let mut logs = Vec::new();

    let mut report = ChurnReport {
        churn,
        config,
        allocations: 0,
        large_allocations: 0,
        frees: 0,
        reallocs: 0,
        peak_live: 0,
        invariant_checks: 0,
        page_acquires: 0,
        page_releases: 0,
        stats_before_cleanup: AllocatorStats::default(),
        final_stats: AllocatorStats::default(),
        logs: Vec::new(),
    };

    for step in 0..churn.ops {
        let index = rng.gen_range_usize(0, slots.len() - 1);
        let tag = (step % 251) as u8;
        match slots[index] {
            None => {
                let large = churn.large_one_in > 0 && rng.gen_range_usize(1, churn.large_one_in) == 1;
                let len = if large {
                    config.default_arena_size + rng.gen_range_usize(0, max_size)
                } else {
                    rng.gen_range_usize(1, max_size)
                };
                let ptr = a
                    .try_allocate(len)?
                    .ok_or(HarnessError::AllocationFailed { step, size: len })?;
                let slot = Slot { ptr, len, tag };
                stamp(&slot);
                slots[index] = Some(slot);
                report.allocations += 1;
                report.large_allocations += u64::from(large);
            }
            Some(slot) => {
                if !prefix_intact(slot.ptr, slot.len, slot.tag) {
                    return Err(HarnessError::Corruption { step, slot: index });
                }
                if rng.gen_range_usize(0, 9) < 6 {
                    // SAFETY: the slot holds a live payload owned by `a`.
                    unsafe { a.try_free(slot.ptr.as_ptr()) }?;
                    slots[index] = None;
                    report.frees += 1;
                } else {
                    let len = rng.gen_range_usize(1, max_size.saturating_mul(2));
                    // SAFETY: the slot holds a live payload owned by `a`.
                    let ptr = unsafe { a.reallocate(slot.ptr.as_ptr(), len) }
                        .ok_or(HarnessError::AllocationFailed { step, size: len })?;
                    if !prefix_intact(ptr, slot.len.min(len), slot.tag) {
                        return Err(HarnessError::Corruption { step, slot: index });
                    }
                    let slot = Slot { ptr, len, tag };
                    stamp(&slot);
                    slots[index] = Some(slot);
                    report.reallocs += 1;
                }
            }
        }

        a.check_invariants()
            .map_err(|violation| HarnessError::Invariant { step, violation })?;
        report.invariant_checks += 1;
        report.peak_live = report.peak_live.max(a.stats().live_allocations);
        if churn.collect_logs {
            logs.extend(a.drain_lifecycle_logs());
        }
    }

    report.stats_before_cleanup = a.stats();
    for slot in slots.iter().flatten() {
        // SAFETY: every remaining slot holds a live payload owned by `a`.
        unsafe { a.try_free(slot.ptr.as_ptr()) }?;
    }
    a.check_invariants().map_err(|violation| HarnessError::Invariant {
        step: churn.ops,
        violation,
    })?;
    report.final_stats = a.stats();
    report.page_acquires = a.page_source().acquire_count();
    report.page_releases = a.page_source().release_count();
    if churn.collect_logs {
        logs.extend(a.drain_lifecycle_logs());
        report.logs = logs;
    }
    Ok(report)
}
