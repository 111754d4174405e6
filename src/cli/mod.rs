//! sheetflow CLI Module
//!
//! Command-line interface for processing files, extracting row ranges and
//! inspecting sources.

use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::memory::{MemoryProbe, SystemProbe, MB};
use crate::orchestrator::{
    adapt_config, detect_edge_cases, EdgeCaseThresholds, LargeFileProcessor, ProcessingMode,
    ProcessingOptions, ProcessingResult, QualityAssuranceLevel, RunStatus,
};
use crate::processing::OptimizationLevel;
use crate::range::RangeViewExtractor;
use crate::source::{DataSource, FileSource};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString { s.truecolor(100, 100, 100) }
fn muted(s: &str) -> ColoredString { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString { s.truecolor(100, 210, 120) }
fn warn_c(s: &str) -> ColoredString { s.truecolor(230, 190, 90) }
fn bad(s: &str) -> ColoredString { s.truecolor(230, 100, 100) }

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

fn row(key: &str, val: impl std::fmt::Display) {
    println!("  {:<22} {}", muted(key), val);
}

fn mb(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / MB)
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "sheetflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Memory-managed chunked processing for large tabular files")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process a file in memory-bounded chunks
    Process {
        /// Input file (CSV, TSV, JSON, or Parquet)
        data: PathBuf,

        /// JSON file with processing options; flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Rows per chunk
        #[arg(short, long)]
        chunk_size: Option<usize>,

        /// Memory limit in MB
        #[arg(short, long)]
        memory_limit_mb: Option<f64>,

        /// Worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// streaming_optimized, memory_conservative, or speed_priority
        #[arg(long)]
        mode: Option<String>,

        /// basic, standard, or enterprise
        #[arg(long)]
        qa: Option<String>,

        /// Process chunks on a single thread
        #[arg(long)]
        sequential: bool,

        /// Disable automatic memory recovery
        #[arg(long)]
        no_recovery: bool,

        /// Stop after this many seconds
        #[arg(long)]
        deadline_secs: Option<f64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Extract rows [start, end) from a file
    Range {
        data: PathBuf,
        start: usize,
        end: usize,

        /// Print rows as JSON records
        #[arg(long)]
        records: bool,
    },

    /// Show source size, schema, and detected conditions
    Info {
        data: PathBuf,
    },
}

fn locator(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn build_options(
    config: Option<&Path>,
    chunk_size: Option<usize>,
    memory_limit_mb: Option<f64>,
    workers: Option<usize>,
    mode: Option<&str>,
    qa: Option<&str>,
    sequential: bool,
    no_recovery: bool,
    deadline_secs: Option<f64>,
) -> anyhow::Result<ProcessingOptions> {
    let mut options = match config {
        Some(path) => ProcessingOptions::from_json_file(path)?,
        None => ProcessingOptions::default(),
    };
    if let Some(size) = chunk_size {
        options.chunk_size = Some(size);
    }
    if let Some(limit) = memory_limit_mb {
        options.memory_limit_mb = limit;
    }
    if let Some(workers) = workers {
        options.max_workers = workers;
    }
    if let Some(mode) = mode {
        options.processing_mode = mode.parse::<ProcessingMode>()?;
    }
    if let Some(qa) = qa {
        options.quality_assurance_level = qa.parse::<QualityAssuranceLevel>()?;
    }
    if sequential {
        options.enable_parallel_processing = false;
    }
    if no_recovery {
        options.enable_auto_recovery = false;
    }
    if deadline_secs.is_some() {
        options.deadline_secs = deadline_secs;
    }
    options.validate()?;
    Ok(options)
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Process {
            data,
            config,
            chunk_size,
            memory_limit_mb,
            workers,
            mode,
            qa,
            sequential,
            no_recovery,
            deadline_secs,
            json,
        } => {
            let options = build_options(
                config.as_deref(),
                chunk_size,
                memory_limit_mb,
                workers,
                mode.as_deref(),
                qa.as_deref(),
                sequential,
                no_recovery,
                deadline_secs,
            )?;
            cmd_process(&data, &options, json)
        }
        Commands::Range {
            data,
            start,
            end,
            records,
        } => cmd_range(&data, start, end, records),
        Commands::Info { data } => cmd_info(&data),
    }
}

// ─── Process ───────────────────────────────────────────────────────────────────

pub fn cmd_process(data: &Path, options: &ProcessingOptions, json: bool) -> anyhow::Result<()> {
    let processor = LargeFileProcessor::new(Arc::new(FileSource::new()))?;
    let result = processor.process(&locator(data), options);

    if json {
        println!("{}", result.to_json()?);
    } else {
        print_result(&result);
        let pool = processor.get_pool_statistics();
        let metrics = processor.get_performance_metrics();
        section("Performance");
        row("Throughput", format!("{:.0} rows/s", metrics.throughput_rows_per_sec));
        row("Parallel efficiency", format!("{:.2}", metrics.parallel_efficiency));
        row("Worker utilization", format!("{:.2}", metrics.worker_utilization));
        row("Memory saved", format!("{:.1}%", metrics.memory_efficiency_improvement));
        row("Pool hit ratio", format!("{:.2}", pool.hit_ratio));
        println!();
    }

    if !result.success {
        anyhow::bail!(result.error.unwrap_or_else(|| "processing failed".to_string()));
    }
    Ok(())
}

fn print_result(result: &ProcessingResult) {
    section("Processing Result");
    let status = match result.status {
        RunStatus::Success => ok("success"),
        RunStatus::PartialRecovery => warn_c("partial recovery"),
        RunStatus::Failure => bad("failure"),
    };
    row("Source", &result.source);
    row("Status", status);
    row("Rows", result.rows_processed);
    row("Chunks", result.chunks_processed);
    row("Chunk size", result.effective_chunk_size);
    row("Time", format!("{:.2}s", result.processing_time_secs));
    row("Peak memory", mb(result.peak_memory_bytes));
    if result.recovery_attempts > 0 {
        row("Recovery attempts", result.recovery_attempts);
    }
    if !result.edge_cases.is_empty() {
        let cases: Vec<&str> = result.edge_cases.iter().map(|c| c.as_str()).collect();
        row("Edge cases", cases.join(", "));
    }
    if !result.optimizations_applied.is_empty() {
        row("Optimizations", result.optimizations_applied.join(", "));
    }
    if let Some(error) = &result.error {
        row("Error", bad(error));
    }
    for warning in &result.warnings {
        println!("  {} {}", warn_c("!"), warning);
    }
}

// ─── Range ─────────────────────────────────────────────────────────────────────

pub fn cmd_range(data: &Path, start: usize, end: usize, records: bool) -> anyhow::Result<()> {
    let extractor = RangeViewExtractor::new(Arc::new(FileSource::new()));
    let key = locator(data);

    if records {
        let records = extractor.get_records(&key, start, end)?;
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let view = extractor.get_range(&key, start, end)?;
    section("Range");
    row("Rows", format!("{}..{} ({})", view.start, view.end, view.len()));
    row(
        "Path",
        if view.used_fallback {
            warn_c("copy (fallback)")
        } else if view.is_view {
            ok("view")
        } else {
            muted("sub-batched copy")
        },
    );
    println!();
    println!("{}", view.rows());
    Ok(())
}

// ─── Info ──────────────────────────────────────────────────────────────────────

pub fn cmd_info(data: &Path) -> anyhow::Result<()> {
    let source = FileSource::new();
    let key = locator(data);
    let meta = source.probe(&key)?;
    let handle = source.open(&key)?;

    section("Source Info");
    row("File", data.display());
    row("Format", format!("{:?}", crate::source::SourceFormat::from_path(data)));
    row("Size on disk", mb(meta.size_bytes));
    row("Rows", handle.len());
    row("Loaded memory", mb(handle.memory_bytes() as u64));
    let columns: Vec<String> = handle.schema().names().map(str::to_string).collect();
    row("Columns", columns.join(", "));

    let probe = SystemProbe::new();
    let options = ProcessingOptions::default();
    let env = detect_edge_cases(
        &meta,
        &probe,
        options.memory_limit_bytes(),
        &EdgeCaseThresholds::default(),
    );
    let adapted = adapt_config(&options, &env.edge_cases);

    section("Environment");
    if let Ok(sample) = probe.sample() {
        row("Process memory", mb(sample.process_bytes));
        row("System memory used", format!("{:.1}%", sample.system_used_pct()));
    }
    if let Some(free) = env.free_disk_bytes {
        row("Free disk", mb(free));
    }
    if env.edge_cases.is_empty() {
        row("Conditions", ok("none"));
    } else {
        let cases: Vec<&str> = env.edge_cases.iter().map(|c| c.as_str()).collect();
        row("Conditions", warn_c(&cases.join(", ")));
    }
    row("Suggested chunk size", adapted.chunk_size);
    row("Check every", format!("{} chunks", adapted.gc_frequency));
    row("Monitor interval", format!("{:?}", adapted.monitoring_interval));
    if adapted.optimization_level == OptimizationLevel::Aggressive {
        row("Optimization", "aggressive");
    }
    println!();
    Ok(())
}
