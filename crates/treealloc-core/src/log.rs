//! Structured allocator lifecycle records.
//!
//! The engine never prints. Each public operation appends a record to a
//! bounded in-memory queue that callers inspect or drain.

use std::collections::VecDeque;

use serde::Serialize;

/// Records kept before the oldest are dropped.
pub const LOG_CAPACITY: usize = 4096;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    pub level: AllocatorLogLevel,
    /// API symbol (`allocate`, `free`, `reallocate`, `initialize`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `arena_created`, ...).
    pub event: &'static str,
    /// Payload address involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: live allocations.
    pub live_allocations: usize,
    /// Snapshot: arenas currently mapped.
    pub arenas_live: usize,
    /// Snapshot: free index entries.
    pub free_index_len: usize,
}

/// Counter snapshot attached to every record.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LogSnapshot {
    pub live_allocations: usize,
    pub arenas_live: usize,
    pub free_index_len: usize,
}

/// What happened, before ids and counters are attached.
pub(crate) struct LogEvent {
    pub level: AllocatorLogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub outcome: &'static str,
    pub details: String,
}

/// Bounded record queue.
#[derive(Debug)]
pub(crate) struct LifecycleLog {
    records: VecDeque<AllocatorLogRecord>,
    next_decision_id: u64,
    capacity: usize,
}

impl LifecycleLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            next_decision_id: 1,
            capacity,
        }
    }

    pub fn push(&mut self, event: LogEvent, snapshot: LogSnapshot) {
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(AllocatorLogRecord {
            decision_id,
            trace_id: format!("core::treealloc::{}::{:016x}", event.symbol, decision_id),
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            ptr: event.ptr,
            size: event.size,
            outcome: event.outcome,
            details: event.details,
            live_allocations: snapshot.live_allocations,
            arenas_live: snapshot.arenas_live,
            free_index_len: snapshot.free_index_len,
        });
    }

    pub fn records(&self) -> &VecDeque<AllocatorLogRecord> {
        &self.records
    }

    pub fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        self.records.drain(..).collect()
    }
}
