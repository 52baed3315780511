//! Allocation engine.
//!
//! Ties the block codec, the free index and the arena list together:
//! - allocate: best-fit lookup in the index, split when the leftover is worth
//!   keeping, otherwise map a fresh arena (large when the request cannot fit
//!   a normal one).
//! - free: large arenas go straight back to the page source; other blocks are
//!   re-indexed by size. Neighbors are never merged.
//! - reallocate: in place when the block already has room, otherwise
//!   allocate-copy-free.

use std::collections::VecDeque;
use std::ptr::{self, NonNull};

use serde::Serialize;

use crate::arena::{Arena, ArenaList};
use crate::block::{ALIGN, Block, HEADER_SIZE, MIN_BLOCK_SIZE, checked_align_up};
use crate::config::AllocatorConfig;
use crate::error::AllocError;
use crate::free_index::FreeIndex;
use crate::log::{
    AllocatorLogLevel, AllocatorLogRecord, LOG_CAPACITY, LifecycleLog, LogEvent, LogSnapshot,
};
use crate::page_source::{MmapPageSource, PageSource};

/// A free block is split only if the tail would exceed a header by this much.
pub const SPLIT_SLACK: usize = 16;

/// Running allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Blocks handed out and not yet freed.
    pub live_allocations: usize,
    pub arenas_created: u64,
    pub arenas_released: u64,
    /// Arenas currently mapped.
    pub arenas_live: usize,
    pub large_arenas_live: usize,
    /// Allocations served from the free index.
    pub index_hits: u64,
    /// Allocations that had to map a new arena.
    pub index_misses: u64,
    pub splits: u64,
    /// Bytes currently mapped from the page source.
    pub bytes_mapped: usize,
}

/// What [`Allocator::try_free`] did with a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Null pointer, nothing to do.
    Null,
    /// Block returned to the free index.
    Indexed { size: usize },
    /// Large arena returned to the page source.
    ArenaReleased { size: usize },
    /// Block was already free; the call was ignored.
    AlreadyFree { size: usize },
}

/// Block size (header included) serving a `size`-byte request.
pub fn block_size_for(size: usize) -> Result<usize, AllocError> {
    size.checked_add(HEADER_SIZE)
        .and_then(|n| checked_align_up(n, ALIGN))
        .map(|n| n.max(MIN_BLOCK_SIZE))
        .ok_or(AllocError::SizeOverflow { requested: size })
}

/// Arena-backed best-fit allocator.
///
/// Single-threaded: every mutating method takes `&mut self`. Wrap it in a
/// mutex (see [`crate::global`]) to share it. Dropping the allocator returns
/// every arena to the page source, invalidating all outstanding payloads.
pub struct Allocator<P: PageSource = MmapPageSource> {
    config: AllocatorConfig,
    source: P,
    arenas: ArenaList,
    index: FreeIndex,
    stats: AllocatorStats,
    log: LifecycleLog,
}

// SAFETY: the allocator exclusively owns every arena it links, and nothing
// else holds the raw block or arena handles stored inside it. Moving it to
// another thread moves that ownership wholesale.
unsafe impl<P: PageSource + Send> Send for Allocator<P> {}

impl Allocator<MmapPageSource> {
    /// Allocator over anonymous `mmap` regions with configuration resolved
    /// from the arguments, the environment, then OS defaults.
    pub fn from_system(
        page_size: Option<usize>,
        default_arena_size: Option<usize>,
    ) -> Result<Self, AllocError> {
        let config = AllocatorConfig::resolve(page_size, default_arena_size)?;
        Ok(Self::new(config, MmapPageSource::new()))
    }
}

impl<P: PageSource> Allocator<P> {
    pub fn new(config: AllocatorConfig, source: P) -> Self {
        let mut allocator = Self {
            config,
            source,
            arenas: ArenaList::new(),
            index: FreeIndex::new(),
            stats: AllocatorStats::default(),
            log: LifecycleLog::new(LOG_CAPACITY),
        };
        allocator.record(
            AllocatorLogLevel::Info,
            "initialize",
            "initialize",
            None,
            Some(config.default_arena_size),
            "success",
            format!(
                "page_size={} default_arena_size={}",
                config.page_size, config.default_arena_size
            ),
        );
        allocator
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    pub fn free_index(&self) -> &FreeIndex {
        &self.index
    }

    pub fn arenas(&self) -> &ArenaList {
        &self.arenas
    }

    pub fn page_source(&self) -> &P {
        &self.source
    }

    pub fn page_source_mut(&mut self) -> &mut P {
        &mut self.source
    }

    /// Lifecycle records, oldest first.
    pub fn lifecycle_logs(&self) -> &VecDeque<AllocatorLogRecord> {
        self.log.records()
    }

    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        self.log.drain()
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        let snapshot = LogSnapshot {
            live_allocations: self.stats.live_allocations,
            arenas_live: self.stats.arenas_live,
            free_index_len: self.index.len(),
        };
        self.log.push(
            LogEvent {
                level,
                symbol,
                event,
                ptr,
                size,
                outcome,
                details: details.into(),
            },
            snapshot,
        );
    }

    fn record_allocator_stats(&mut self, symbol: &'static str) {
        let stats = self.stats;
        self.record(
            AllocatorLogLevel::Debug,
            symbol,
            "allocator_stats",
            None,
            None,
            "snapshot",
            format!(
                "arenas_live={} large_arenas_live={} bytes_mapped={} index_hits={} index_misses={} splits={}",
                stats.arenas_live,
                stats.large_arenas_live,
                stats.bytes_mapped,
                stats.index_hits,
                stats.index_misses,
                stats.splits
            ),
        );
    }

    /// Carves `block` down to `total` bytes when the leftover is worth
    /// indexing. The tail inherits the "last" flag.
    fn split(&mut self, block: Block, total: usize) -> bool {
        let size = block.size();
        if size < total.saturating_add(HEADER_SIZE + SPLIT_SLACK) {
            return false;
        }
        let remaining = size - total;
        // SAFETY: total < size, so the tail header lies inside `block`, at an
        // ALIGN boundary because both sizes are multiples of ALIGN.
        let tail = unsafe { Block::from_raw(block.as_ptr().add(total)) }.init(
            remaining,
            false,
            false,
            block.is_last(),
        );
        tail.set_prev_size(total);
        if !tail.is_last() {
            // SAFETY: a block without the "last" flag is followed by another
            // block in the same arena, starting right after it.
            let successor = unsafe { Block::from_raw(tail.as_ptr().add(remaining)) };
            successor.set_prev_size(remaining);
        }
        block.set_size(total);
        block.set_last(false);
        self.index.insert(remaining, tail);
        self.stats.splits += 1;
        true
    }

    fn map_arena(&mut self, total: usize) -> Result<Arena, AllocError> {
        let is_large = total > self.config.normal_capacity();
        let arena = match self
            .arenas
            .create(&mut self.source, &self.config, total, is_large)
        {
            Ok(arena) => arena,
            Err(err) => {
                self.record(
                    AllocatorLogLevel::Warn,
                    "allocate",
                    "page_source_refused",
                    None,
                    Some(total),
                    "oom",
                    err.to_string(),
                );
                return Err(err);
            }
        };
        self.stats.arenas_created += 1;
        self.stats.arenas_live += 1;
        self.stats.bytes_mapped += arena.size();
        if is_large {
            self.stats.large_arenas_live += 1;
        }
        self.record(
            AllocatorLogLevel::Info,
            "allocate",
            "arena_created",
            Some(arena.addr()),
            Some(arena.size()),
            "success",
            format!("is_large={is_large} block_total={total}"),
        );
        self.record_allocator_stats("allocate");
        Ok(arena)
    }

    /// Allocates `size` bytes.
    ///
    /// `Ok(None)` for a zero-byte request. Errors when the size arithmetic
    /// overflows or the page source refuses a new arena.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            self.record(
                AllocatorLogLevel::Trace,
                "allocate",
                "alloc_zero",
                None,
                Some(0),
                "noop",
                "zero_size_request",
            );
            return Ok(None);
        }
        let total = match block_size_for(size) {
            Ok(total) => total,
            Err(err) => {
                self.record(
                    AllocatorLogLevel::Warn,
                    "allocate",
                    "size_overflow",
                    None,
                    Some(size),
                    "denied",
                    err.to_string(),
                );
                return Err(err);
            }
        };

        if let Some((key, block)) = self.index.best_fit(total) {
            self.index.remove(key, block);
            self.stats.index_hits += 1;
            let split = self.split(block, total);
            block.set_busy(true);
            self.stats.live_allocations += 1;
            let payload = block.payload();
            self.record(
                AllocatorLogLevel::Trace,
                "allocate",
                "alloc",
                Some(payload.as_ptr() as usize),
                Some(size),
                "success",
                format!("path=free_index_hit block_size={key} total={total} split={split}"),
            );
            return Ok(Some(payload));
        }

        self.stats.index_misses += 1;
        let arena = self.map_arena(total)?;
        let block = arena.first_block();
        let split = !arena.is_large() && self.split(block, total);
        self.stats.live_allocations += 1;
        let payload = block.payload();
        self.record(
            AllocatorLogLevel::Trace,
            "allocate",
            "alloc",
            Some(payload.as_ptr() as usize),
            Some(size),
            "success",
            format!(
                "path={} total={total} split={split}",
                if arena.is_large() {
                    "large_arena"
                } else {
                    "fresh_arena"
                }
            ),
        );
        Ok(Some(payload))
    }

    /// Allocates `size` bytes, `None` on a zero-byte request or any failure.
    ///
    /// The payload is aligned to [`ALIGN`] and holds at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).ok().flatten()
    }

    /// Frees `ptr`, reporting what happened.
    ///
    /// A pointer no arena claims yields [`AllocError::ForeignPointer`] and
    /// changes nothing. A block whose busy flag is already clear is left
    /// alone. These checks are best effort; they do not make arbitrary
    /// pointers safe to pass.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer returned by this allocator.
    /// After a successful free the payload must not be used again.
    pub unsafe fn try_free(&mut self, ptr: *mut u8) -> Result<FreeOutcome, AllocError> {
        let Some(payload) = NonNull::new(ptr) else {
            self.record(
                AllocatorLogLevel::Trace,
                "free",
                "free_null",
                None,
                None,
                "noop",
                "null_pointer",
            );
            return Ok(FreeOutcome::Null);
        };
        let addr = payload.as_ptr() as usize;
        let Some(arena) = self.arenas.find_owning(addr.wrapping_sub(HEADER_SIZE)) else {
            self.record(
                AllocatorLogLevel::Warn,
                "free",
                "foreign_pointer",
                Some(addr),
                None,
                "ignored",
                "no_owning_arena",
            );
            return Err(AllocError::ForeignPointer { addr });
        };

        if arena.is_large() {
            let size = arena.size();
            let released = self.arenas.destroy(&mut self.source, arena);
            // The arena is unlinked even when the page source fails to take
            // the region back.
            self.stats.arenas_live = self.arenas.len();
            self.stats.large_arenas_live = self.stats.large_arenas_live.saturating_sub(1);
            self.stats.live_allocations = self.stats.live_allocations.saturating_sub(1);
            self.stats.bytes_mapped = self.stats.bytes_mapped.saturating_sub(size);
            if let Err(err) = released {
                self.record(
                    AllocatorLogLevel::Error,
                    "free",
                    "page_source_release_failed",
                    Some(addr),
                    Some(size),
                    "leaked",
                    err.to_string(),
                );
                return Err(err.into());
            }
            self.stats.arenas_released += 1;
            self.record(
                AllocatorLogLevel::Info,
                "free",
                "arena_released",
                Some(addr),
                Some(size),
                "success",
                "path=large_arena",
            );
            self.record_allocator_stats("free");
            return Ok(FreeOutcome::ArenaReleased { size });
        }

        // SAFETY: the caller contract makes `payload` one of ours, and the
        // arena lookup confirmed the header lies in a live arena.
        let block = unsafe { Block::from_payload(payload) };
        let size = block.size();
        if !block.is_busy() {
            self.record(
                AllocatorLogLevel::Warn,
                "free",
                "double_free_detected",
                Some(addr),
                Some(size),
                "ignored",
                "busy_flag_clear",
            );
            return Ok(FreeOutcome::AlreadyFree { size });
        }
        if size > 0 {
            block.set_busy(false);
            self.index.insert(size, block);
        }
        self.stats.live_allocations = self.stats.live_allocations.saturating_sub(1);
        self.record(
            AllocatorLogLevel::Trace,
            "free",
            "free",
            Some(addr),
            Some(size),
            "success",
            "path=free_index_insert",
        );
        Ok(FreeOutcome::Indexed { size })
    }

    /// Frees `ptr`. Null and unowned pointers are ignored.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::try_free`].
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        // SAFETY: forwarded caller contract.
        let _ = unsafe { self.try_free(ptr) };
    }

    /// Usable bytes behind `ptr`, or `None` if no arena owns it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = (ptr.as_ptr() as usize).wrapping_sub(HEADER_SIZE);
        self.arenas.find_owning(addr)?;
        // SAFETY: caller contract plus the ownership check above.
        Some(unsafe { Block::from_payload(ptr) }.usable_size())
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes.
    ///
    /// - null `ptr`: same as `allocate(new_size)`.
    /// - zero `new_size`: frees `ptr` and returns `None`.
    /// - `new_size` fits the current block: returns `ptr` unchanged; the
    ///   unused tail stays with the block.
    /// - otherwise allocates, copies the old usable bytes and frees `ptr`. If
    ///   the allocation fails, `ptr` is left untouched and `None` returned.
    ///
    /// An unowned `ptr` is ignored and yields `None`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::try_free`].
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            let out = self.allocate(new_size);
            self.record(
                AllocatorLogLevel::Trace,
                "reallocate",
                "realloc_null_as_alloc",
                out.map(|p| p.as_ptr() as usize),
                Some(new_size),
                if out.is_some() { "success" } else { "empty" },
                "ptr_was_null",
            );
            return out;
        };
        let addr = old.as_ptr() as usize;
        if new_size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr) };
            self.record(
                AllocatorLogLevel::Trace,
                "reallocate",
                "realloc_zero_as_free",
                Some(addr),
                Some(0),
                "freed",
                "new_size_was_zero",
            );
            return None;
        }

        // SAFETY: forwarded caller contract.
        let Some(old_usable) = (unsafe { self.usable_size(old) }) else {
            self.record(
                AllocatorLogLevel::Warn,
                "reallocate",
                "foreign_pointer",
                Some(addr),
                Some(new_size),
                "ignored",
                "no_owning_arena",
            );
            return None;
        };

        if new_size <= old_usable {
            self.record(
                AllocatorLogLevel::Trace,
                "reallocate",
                "realloc_in_place",
                Some(addr),
                Some(new_size),
                "success",
                format!("old_usable={old_usable}"),
            );
            return Some(old);
        }

        let Some(new_ptr) = self.allocate(new_size) else {
            self.record(
                AllocatorLogLevel::Warn,
                "reallocate",
                "realloc_allocate_new_failed",
                Some(addr),
                Some(new_size),
                "oom",
                format!("old_usable={old_usable}"),
            );
            return None;
        };

        // SAFETY: the old payload holds `old_usable` bytes, the new one at
        // least `new_size > old_usable`, and they are distinct blocks.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), old_usable) };
        // SAFETY: forwarded caller contract; `ptr` is still live here.
        unsafe { self.free(ptr) };
        self.record(
            AllocatorLogLevel::Trace,
            "reallocate",
            "realloc_move",
            Some(new_ptr.as_ptr() as usize),
            Some(new_size),
            "success",
            format!("old_ptr={addr:#x} copied={old_usable}"),
        );
        Some(new_ptr)
    }
}

impl<P: PageSource> Drop for Allocator<P> {
    fn drop(&mut self) {
        let _ = self.arenas.release_all(&mut self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ARENA_HEADER_SIZE;
    use crate::error::PageSourceError;
    use crate::page_source::RecordingPageSource;

    type TestAllocator = Allocator<RecordingPageSource<MmapPageSource>>;

    fn allocator(arena_size: usize) -> TestAllocator {
        Allocator::new(
            AllocatorConfig::new(4096, arena_size).unwrap(),
            RecordingPageSource::new(MmapPageSource::new()),
        )
    }

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr::write_bytes(ptr.as_ptr(), byte, len) };
    }

    fn all_eq(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
            .iter()
            .all(|&b| b == byte)
    }

    #[test]
    fn block_size_rounds_and_floors() {
        assert_eq!(block_size_for(1).unwrap(), MIN_BLOCK_SIZE);
        assert_eq!(block_size_for(16).unwrap(), 32);
        assert_eq!(block_size_for(17).unwrap(), 48);
        assert_eq!(block_size_for(100).unwrap(), 128);
        assert_eq!(
            block_size_for(usize::MAX - 4),
            Err(AllocError::SizeOverflow {
                requested: usize::MAX - 4
            })
        );
    }

    #[test]
    fn zero_size_is_an_empty_result() {
        let mut a = allocator(8192);
        assert_eq!(a.try_allocate(0), Ok(None));
        assert!(a.allocate(0).is_none());
        assert_eq!(a.page_source().acquire_count(), 0);
        assert_eq!(a.stats().live_allocations, 0);
    }

    #[test]
    fn first_allocation_maps_arena_and_splits() {
        let mut a = allocator(8192);
        let p = a.allocate(100).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        assert_eq!(a.page_source().acquire_count(), 1);
        assert_eq!(a.stats().splits, 1);

        let entries: Vec<usize> = a.free_index().iter().map(|(k, _)| k).collect();
        assert_eq!(entries, vec![8192 - ARENA_HEADER_SIZE - 128]);
        assert_eq!(unsafe { a.usable_size(p) }, Some(128 - HEADER_SIZE));
    }

    #[test]
    fn freed_block_is_reused() {
        let mut a = allocator(8192);
        let p = a.allocate(100).unwrap();
        let q = a.allocate(200).unwrap();
        fill(q, 200, 0x5A);
        unsafe { a.free(p.as_ptr()) };
        let r = a.allocate(90).unwrap();
        assert_eq!(r, p);
        assert!(all_eq(q, 200, 0x5A));
        assert_eq!(a.page_source().acquire_count(), 1);
    }

    #[test]
    fn small_leftover_is_not_split() {
        let mut a = allocator(8192);
        let p = a.allocate(100).unwrap(); // 128-byte block
        let _guard = a.allocate(8).unwrap();
        unsafe { a.free(p.as_ptr()) };
        let splits = a.stats().splits;
        // 112-byte request: leftover 16 < HEADER_SIZE + SPLIT_SLACK.
        let r = a.allocate(96).unwrap();
        assert_eq!(r, p);
        assert_eq!(a.stats().splits, splits);
        assert_eq!(unsafe { a.usable_size(r) }, Some(128 - HEADER_SIZE));
    }

    #[test]
    fn large_allocation_round_trips_its_arena() {
        let mut a = allocator(8192);
        let p = a.allocate(9000).unwrap();
        fill(p, 9000, 0xEE);
        assert!(all_eq(p, 9000, 0xEE));
        assert_eq!(a.stats().large_arenas_live, 1);
        assert!(a.free_index().is_empty());

        assert_eq!(
            unsafe { a.try_free(p.as_ptr()) },
            Ok(FreeOutcome::ArenaReleased {
                size: checked_align_up(9000 + HEADER_SIZE + ARENA_HEADER_SIZE, ALIGN).unwrap()
            })
        );
        assert_eq!(a.page_source().release_count(), 1);
        assert_eq!(a.stats().large_arenas_live, 0);
        assert!(a.arenas().is_empty());

        let _again = a.allocate(9000).unwrap();
        assert_eq!(a.page_source().acquire_count(), 2);
    }

    #[test]
    fn request_just_over_normal_capacity_goes_large() {
        let mut a = allocator(8192);
        let capacity = a.config().normal_capacity();
        let fits = a.allocate(capacity - HEADER_SIZE).unwrap();
        assert!(!a.arenas().find_owning(fits.as_ptr() as usize).unwrap().is_large());
        let over = a.allocate(capacity - HEADER_SIZE + 1).unwrap();
        assert!(a.arenas().find_owning(over.as_ptr() as usize).unwrap().is_large());
    }

    #[test]
    fn null_and_foreign_frees_change_nothing() {
        let mut a = allocator(8192);
        let p = a.allocate(64).unwrap();
        let before = a.stats();

        assert_eq!(unsafe { a.try_free(ptr::null_mut()) }, Ok(FreeOutcome::Null));
        let mut local = [0u8; 64];
        let foreign = local.as_mut_ptr().wrapping_add(32);
        assert_eq!(
            unsafe { a.try_free(foreign) },
            Err(AllocError::ForeignPointer {
                addr: foreign as usize
            })
        );
        unsafe { a.free(foreign) };
        assert_eq!(a.stats(), before);
        assert!(a.lifecycle_logs().iter().any(|r| {
            r.level == AllocatorLogLevel::Warn && r.event == "foreign_pointer"
        }));
        unsafe { a.free(p.as_ptr()) };
    }

    #[test]
    fn double_free_is_ignored() {
        let mut a = allocator(8192);
        let p = a.allocate(64).unwrap();
        let _keep = a.allocate(64).unwrap();
        assert!(matches!(
            unsafe { a.try_free(p.as_ptr()) },
            Ok(FreeOutcome::Indexed { .. })
        ));
        let indexed = a.free_index().len();
        assert!(matches!(
            unsafe { a.try_free(p.as_ptr()) },
            Ok(FreeOutcome::AlreadyFree { .. })
        ));
        assert_eq!(a.free_index().len(), indexed);
    }

    /// Unmaps as usual but reports every release as failed.
    struct FailingRelease(MmapPageSource);

    impl PageSource for FailingRelease {
        fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, PageSourceError> {
            self.0.acquire(size)
        }

        unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), PageSourceError> {
            // SAFETY: forwarded caller contract.
            unsafe { self.0.release(ptr, size) }?;
            Err(PageSourceError::ReleaseFailed {
                addr: ptr.as_ptr() as usize,
                size,
                errno: libc::EINVAL,
            })
        }
    }

    #[test]
    fn failed_large_release_still_unlinks_arena() {
        let mut a = Allocator::new(
            AllocatorConfig::new(4096, 8192).unwrap(),
            FailingRelease(MmapPageSource::new()),
        );
        let p = a.allocate(20_000).unwrap();
        assert_eq!(a.stats().large_arenas_live, 1);

        let addr = p.as_ptr() as usize;
        match unsafe { a.try_free(p.as_ptr()) } {
            Err(AllocError::PageSource(PageSourceError::ReleaseFailed { addr: base, .. })) => {
                assert_eq!(base, addr - HEADER_SIZE - ARENA_HEADER_SIZE);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let stats = a.stats();
        assert_eq!(stats.arenas_live, 0);
        assert_eq!(stats.large_arenas_live, 0);
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.bytes_mapped, 0);
        assert!(a.arenas().is_empty());
        assert!(a.check_invariants().is_ok());
        assert!(a.lifecycle_logs().iter().any(|r| {
            r.level == AllocatorLogLevel::Error
                && r.event == "page_source_release_failed"
                && r.ptr == Some(addr)
        }));
    }

    #[test]
    fn foreign_realloc_returns_none_and_changes_nothing() {
        let mut a = allocator(8192);
        let p = a.allocate(64).unwrap();
        fill(p, 64, 0x44);
        let before = a.stats();
        let indexed = a.free_index().len();

        let mut local = [0x55u8; 64];
        let foreign = local.as_mut_ptr().wrapping_add(32);
        assert!(unsafe { a.reallocate(foreign, 128) }.is_none());
        assert!(local.iter().all(|&b| b == 0x55));
        assert_eq!(a.stats(), before);
        assert_eq!(a.free_index().len(), indexed);
        assert!(all_eq(p, 64, 0x44));
        assert!(a.lifecycle_logs().iter().any(|r| {
            r.level == AllocatorLogLevel::Warn
                && r.symbol == "reallocate"
                && r.event == "foreign_pointer"
        }));

        // An unsatisfiable size fails without touching the old block either.
        assert!(unsafe { a.reallocate(p.as_ptr(), usize::MAX) }.is_none());
        assert!(all_eq(p, 64, 0x44));
        assert_eq!(a.stats().live_allocations, 1);
    }

    #[test]
    fn refused_arena_yields_empty_result() {
        let mut a = allocator(8192);
        a.page_source_mut().set_acquire_budget(Some(0));
        assert!(matches!(
            a.try_allocate(64),
            Err(AllocError::PageSource(_))
        ));
        assert!(a.allocate(64).is_none());
        assert_eq!(a.stats().live_allocations, 0);
        assert!(a.lifecycle_logs().iter().any(|r| r.event == "page_source_refused"));
    }

    #[test]
    fn realloc_shrink_keeps_pointer_and_bytes() {
        let mut a = allocator(8192);
        let p = a.allocate(100).unwrap();
        fill(p, 100, 0x11);
        let q = unsafe { a.reallocate(p.as_ptr(), 50) }.unwrap();
        assert_eq!(q, p);
        assert!(all_eq(q, 50, 0x11));
        // Growing within the existing block also stays in place.
        let r = unsafe { a.reallocate(p.as_ptr(), 112) }.unwrap();
        assert_eq!(r, p);
    }

    #[test]
    fn realloc_grow_moves_and_copies() {
        let mut a = allocator(8192);
        let p = a.allocate(100).unwrap();
        fill(p, 112, 0x22);
        let q = unsafe { a.reallocate(p.as_ptr(), 1000) }.unwrap();
        assert_ne!(q, p);
        assert!(all_eq(q, 112, 0x22));
        assert_eq!(a.stats().live_allocations, 1);
        assert!(a.free_index().iter().any(|(_, b)| b.payload() == p));
    }

    #[test]
    fn realloc_edge_cases() {
        let mut a = allocator(8192);
        let p = unsafe { a.reallocate(ptr::null_mut(), 40) }.unwrap();
        assert_eq!(a.stats().live_allocations, 1);
        assert!(unsafe { a.reallocate(p.as_ptr(), 0) }.is_none());
        assert_eq!(a.stats().live_allocations, 0);
    }

    #[test]
    fn failed_realloc_leaves_old_block_intact() {
        let mut a = allocator(8192);
        let p = a.allocate(100).unwrap();
        fill(p, 100, 0x33);
        a.page_source_mut().set_acquire_budget(Some(0));
        assert!(unsafe { a.reallocate(p.as_ptr(), 20_000) }.is_none());
        assert!(all_eq(p, 100, 0x33));
        assert_eq!(a.stats().live_allocations, 1);
        assert!(!a.free_index().iter().any(|(_, b)| b.payload() == p));
        assert!(a.lifecycle_logs().iter().any(|r| {
            r.level == AllocatorLogLevel::Warn && r.event == "realloc_allocate_new_failed"
        }));
    }

    #[test]
    fn drop_releases_every_arena() {
        let mut source = RecordingPageSource::new(MmapPageSource::new());
        {
            let mut a = Allocator::new(AllocatorConfig::new(4096, 8192).unwrap(), &mut source);
            a.allocate(100).unwrap();
            a.allocate(9000).unwrap();
            a.allocate(8100).unwrap();
        }
        assert_eq!(source.acquire_count(), 3);
        assert_eq!(source.release_count(), 3);
        assert_eq!(source.mapped_bytes(), 0);
    }

    #[test]
    fn lifecycle_logs_trace_each_path() {
        let mut a = allocator(8192);
        let p = a.allocate(64).unwrap();
        unsafe { a.free(p.as_ptr()) };
        let _ = a.allocate(64).unwrap();
        let logs = a.drain_lifecycle_logs();
        assert!(logs.iter().all(|r| r.decision_id > 0));
        assert!(logs.iter().all(|r| r.trace_id.starts_with("core::treealloc::")));
        let details: Vec<&str> = logs
            .iter()
            .filter(|r| r.event == "alloc")
            .map(|r| r.details.as_str())
            .collect();
        assert!(details[0].starts_with("path=fresh_arena"));
        assert!(details[1].starts_with("path=free_index_hit"));
        assert!(logs.iter().any(|r| r.level == AllocatorLogLevel::Info && r.event == "arena_created"));
        assert!(logs.iter().any(|r| r.level == AllocatorLogLevel::Debug && r.event == "allocator_stats"));
        assert!(a.lifecycle_logs().is_empty());
    }
}
