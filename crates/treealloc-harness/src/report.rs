//! Report rendering.

use std::fmt::Write as _;
use std::io::Write;

use clap::ValueEnum;
use treealloc_core::AllocatorLogRecord;

use crate::HarnessError;
use crate::workload::{ChurnReport, DemoReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn render_demo(report: &DemoReport, format: OutputFormat) -> Result<String, HarnessError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            let mut out = String::from("=== TREEALLOC DEMONSTRATION ===\n\n");
            for (i, step) in report.steps.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, step.label.to_uppercase());
                for note in &step.notes {
                    let _ = writeln!(out, "- {note}");
                }
                let _ = writeln!(out, "{}", step.state);
            }
            let _ = writeln!(out, "Page source events: {}", report.page_events.len());
            Ok(out)
        }
    }
}

pub fn render_churn(report: &ChurnReport, format: OutputFormat) -> Result<String, HarnessError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            let mut out = String::new();
            let _ = writeln!(
                out,
                "churn seed={:#x} ops={} max_size={} page_size={} arena_size={}",
                report.churn.seed,
                report.churn.ops,
                report.churn.max_size,
                report.config.page_size,
                report.config.default_arena_size
            );
            let _ = writeln!(
                out,
                "allocations={} (large {}) frees={} reallocs={} peak_live={}",
                report.allocations,
                report.large_allocations,
                report.frees,
                report.reallocs,
                report.peak_live
            );
            let _ = writeln!(
                out,
                "invariant_checks={} page_acquires={} page_releases={}",
                report.invariant_checks, report.page_acquires, report.page_releases
            );
            let s = report.stats_before_cleanup;
            let _ = writeln!(
                out,
                "before cleanup: live={} arenas={} index_hits={} index_misses={} splits={} bytes_mapped={}",
                s.live_allocations,
                s.arenas_live,
                s.index_hits,
                s.index_misses,
                s.splits,
                s.bytes_mapped
            );
            let _ = writeln!(
                out,
                "after cleanup: live={} arenas={} bytes_mapped={}",
                report.final_stats.live_allocations,
                report.final_stats.arenas_live,
                report.final_stats.bytes_mapped
            );
            Ok(out)
        }
    }
}

/// Writes one JSON object per line.
pub fn write_logs_jsonl<W: Write>(
    records: &[AllocatorLogRecord],
    mut out: W,
) -> Result<(), HarnessError> {
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
