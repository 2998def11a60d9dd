//! CLI entrypoint for the tiermem harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tiermem_core::{Engine, EngineConfig, LogLevel, MemoryTier, ModeScope};
use tiermem_harness::structured_log::{ArtifactIndex, LogEmitter, LogEntry, validate_log_file};
use tiermem_harness::{ChurnConfig, HarnessError, run_churn};

/// Workload and log tooling for the tiermem engine.
#[derive(Debug, Parser)]
#[command(name = "tiermem-harness")]
#[command(about = "Workload driver and log tooling for the tiermem engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a multi-threaded allocate/free churn against a fresh engine.
    Churn {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Largest single request in bytes.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Share of allocations aimed at CXL (0-100).
        #[arg(long, default_value_t = 50)]
        cxl_percent: u8,
        #[arg(long, default_value_t = 0x5EED_7135_4E4D_0001)]
        seed: u64,
        /// Mode register scope (`process` or `thread`); overrides the environment.
        #[arg(long)]
        scope: Option<String>,
        /// CXL capacity ceiling, e.g. `64m`; overrides the environment.
        #[arg(long)]
        cxl_capacity: Option<String>,
        /// Write engine lifecycle records here as JSONL.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Write the JSON report here (stdout if omitted).
        #[arg(long)]
        report: Option<PathBuf>,
        /// Write an artifact index covering the log and report here.
        #[arg(long)]
        artifact_index: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// Print the engine configuration resolved from the environment.
    Config,
}

fn churn_engine(
    scope: Option<String>,
    cxl_capacity: Option<String>,
    log_records: bool,
) -> Result<Engine, HarnessError> {
    let mut config = EngineConfig::from_env()?;
    if let Some(raw) = scope {
        let scope = ModeScope::from_str_loose(&raw).ok_or(tiermem_core::ConfigError::InvalidValue {
            key: "--scope",
            value: raw,
        })?;
        config = config.with_scope(scope);
    }
    if let Some(raw) = cxl_capacity {
        let bytes = tiermem_core::config::parse_size(&raw).ok_or(
            tiermem_core::ConfigError::InvalidValue {
                key: "--cxl-capacity",
                value: raw,
            },
        )?;
        config = config.with_capacity(MemoryTier::Cxl, Some(bytes));
    }
    if log_records && config.log_level.is_none_or(|level| level > LogLevel::Debug) {
        config = config.with_log_level(Some(LogLevel::Debug));
    }
    Ok(Engine::new(config))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Churn {
            threads,
            ops,
            max_size,
            cxl_percent,
            seed,
            scope,
            cxl_capacity,
            log,
            report,
            artifact_index,
        } => {
            let engine = churn_engine(scope, cxl_capacity, log.is_some())?;
            let config = ChurnConfig {
                threads,
                ops_per_thread: ops,
                max_size,
                cxl_percent: cxl_percent.min(100),
                seed,
                ..ChurnConfig::default()
            };
            let run_id = format!("churn-{seed:x}");
            eprintln!(
                "Running churn: {threads} threads x {ops} ops, cxl={}%",
                config.cxl_percent
            );
            let result = run_churn(&engine, &config)?;

            let mut artifacts = ArtifactIndex::new(&run_id);
            if let Some(path) = &log {
                let mut emitter = LogEmitter::to_file(path, &run_id)?;
                emitter.emit_entry(
                    LogEntry::new("", LogLevel::Info, "churn_start")
                        .with_details(serde_json::to_value(&config)?),
                )?;
                let exported = emitter.emit_lifecycle(&engine.drain_lifecycle_logs())?;
                emitter.emit_entry(
                    LogEntry::new("", LogLevel::Info, "churn_complete")
                        .with_duration_ms(result.elapsed_ms)
                        .with_outcome(if result.is_clean() { "clean" } else { "dirty" }),
                )?;
                emitter.flush()?;
                eprintln!("Wrote {exported} lifecycle records to {}", path.display());
                artifacts.add_file(path, "log")?;
            }

            let json = serde_json::to_string_pretty(&result)?;
            match &report {
                Some(path) => {
                    std::fs::write(path, &json)?;
                    artifacts.add_file(path, "report")?;
                }
                None => println!("{json}"),
            }
            if let Some(path) = artifact_index {
                std::fs::write(&path, artifacts.to_json()?)?;
            }

            if !result.is_clean() {
                return Err(format!(
                    "churn finished dirty: mismatches={} unknown_frees={} live={}",
                    result.tier_mismatches, result.unknown_frees, result.engine.live_blocks
                )
                .into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::Validation {
                    path: log.display().to_string(),
                    failures: errors.len(),
                }
                .into());
            }
            eprintln!("{lines} line(s) valid");
        }
        Command::Config => {
            let config = EngineConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
