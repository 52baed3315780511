//! Workload runner for treealloc.
//!
//! - [`workload`]: the scripted demonstration and the seeded churn workload.
//! - [`report`]: text/JSON rendering and JSONL lifecycle log export.

pub mod report;
pub mod workload;

use thiserror::Error;
use treealloc_core::{AllocError, InvariantViolation};

/// Errors surfaced by harness workloads.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("step {step}: invariant violated: {violation}")]
    Invariant {
        step: usize,
        violation: InvariantViolation,
    },
    #[error("step {step}: allocation of {size} bytes failed")]
    AllocationFailed { step: usize, size: usize },
    #[error("step {step}: contents of slot {slot} were corrupted")]
    Corruption { step: usize, slot: usize },
    #[error("demo check failed: {0}")]
    DemoCheck(&'static str),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub use report::OutputFormat;
pub use workload::{ChurnConfig, ChurnReport, DemoReport, XorShift64, run_churn, run_demo};
