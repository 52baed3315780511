//! CLI entrypoint for the treealloc workload harness.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use treealloc_core::AllocatorConfig;
use treealloc_core::config::parse_size;
use treealloc_harness::report::{render_churn, render_demo, write_logs_jsonl};
use treealloc_harness::{ChurnConfig, OutputFormat, run_churn, run_demo};

/// Drives the treealloc allocator through scripted and random workloads.
#[derive(Debug, Parser)]
#[command(name = "treealloc-harness")]
#[command(about = "Workload runner and state dumps for treealloc")]
struct Cli {
    /// Page size in bytes (decimal or 0x...). Defaults to env, then OS.
    #[arg(long, global = true, value_parser = size_arg)]
    page_size: Option<usize>,
    /// Normal arena size in bytes. Defaults to env, then four pages.
    #[arg(long, global = true, value_parser = size_arg)]
    arena_size: Option<usize>,
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Write lifecycle records as JSONL to this path.
    #[arg(long, global = true)]
    logs: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the demonstration script with a state dump after each step.
    Demo,
    /// Run a seeded random workload with invariant checks after every op.
    Churn {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Number of operations.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Largest small request in bytes.
        #[arg(long, default_value_t = 4096, value_parser = size_arg)]
        max_size: usize,
        /// Live slots the workload juggles.
        #[arg(long, default_value_t = 64)]
        slots: usize,
        /// One in N fresh allocations exceeds a normal arena (0 disables).
        #[arg(long, default_value_t = 16)]
        large_one_in: usize,
    },
}

fn size_arg(raw: &str) -> Result<usize, String> {
    parse_size(raw).ok_or_else(|| format!("'{raw}' is not a positive size"))
}

fn parse_seed(raw: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = raw.trim().replace('_', "");
    let seed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)?
    } else {
        s.parse::<u64>()?
    };
    Ok(seed)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = AllocatorConfig::resolve(cli.page_size, cli.arena_size)?;

    let logs = match cli.command {
        Command::Demo => {
            let report = run_demo(config)?;
            println!("{}", render_demo(&report, cli.format)?);
            report.logs
        }
        Command::Churn {
            seed,
            ops,
            max_size,
            slots,
            large_one_in,
        } => {
            let churn = ChurnConfig {
                seed: parse_seed(&seed)?,
                ops,
                max_size,
                slots,
                large_one_in,
                collect_logs: cli.logs.is_some(),
            };
            eprintln!("Running churn: seed={:#x} ops={ops}", churn.seed);
            let report = run_churn(config, churn)?;
            println!("{}", render_churn(&report, cli.format)?);
            report.logs
        }
    };

    if let Some(path) = cli.logs {
        let file = BufWriter::new(File::create(&path)?);
        write_logs_jsonl(&logs, file)?;
        eprintln!("Wrote {} lifecycle records to {}", logs.len(), path.display());
    }
    Ok(())
}
