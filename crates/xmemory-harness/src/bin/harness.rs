//! CLI entrypoint for the xmemory scenario harness.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use xmemory_core::{Verbosity, XmemConfig};
use xmemory_harness::structured_log::{LogLevel, Outcome};
use xmemory_harness::{
    HarnessError, LogEmitter, LogEntry, ScenarioReport, SweepTarget, scenarios, sweep,
};

/// Scenario checks for the xmemory allocator.
#[derive(Debug, Parser)]
#[command(name = "xmemory-harness")]
#[command(about = "Scenario checks for the xmemory allocator")]
struct Cli {
    /// Write JSONL structured logs to this path.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    /// Directory for swap files and fixtures (default: $XMEMORY_TMPDIR or `.`).
    #[arg(long, global = true)]
    tmpdir: Option<PathBuf>,
    /// Pointer registry capacity.
    #[arg(long, global = true)]
    capacity: Option<usize>,
    /// Diagnostic level: 0 quiet, 1 origins and leaks, 2 trace.
    #[arg(long, global = true)]
    verbosity: Option<u8>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Allocate and release RAM blocks of several sizes.
    RoundTrip,
    /// Force allocations onto swap files.
    Spill,
    /// Map one file twice and check that the mapping is shared.
    Map {
        /// File to map (a fixture is generated when omitted).
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Remove swap files left behind by dead processes.
    Sweep {
        /// Only remove files named by this pid.
        #[arg(long)]
        pid: Option<u32>,
        /// Directory to sweep (default: the tmpdir).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Print the status dump of a small mixed workload.
    Status {
        /// Print counters and dump as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("xmemory-harness: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn build_config(cli: &Cli) -> XmemConfig {
    let mut config = XmemConfig::from_build();
    if let Some(dir) = &cli.tmpdir {
        config = config.with_tmpdir(dir);
    }
    if let Some(capacity) = cli.capacity {
        config = config.with_capacity(capacity);
    }
    if let Some(level) = cli.verbosity {
        config = config.with_verbosity(Verbosity::from_level(level));
    }
    config
}

fn run(cli: Cli) -> Result<(), HarnessError> {
    let config = build_config(&cli);
    let run_id = format!("run-{}", std::process::id());
    let mut log = match &cli.log {
        Some(path) => LogEmitter::to_file(path, &run_id)?,
        None => LogEmitter::sink(&run_id),
    };

    let result = match cli.command {
        Command::RoundTrip => run_scenario(&mut log, || Ok(scenarios::round_trip(&config))),
        Command::Spill => run_scenario(&mut log, || Ok(scenarios::spill(&config))),
        Command::Map { file } => run_scenario(&mut log, || {
            scenarios::shared_mapping(&config, file.as_deref())
        }),
        Command::Sweep { pid, dir } => {
            let dir = dir.unwrap_or_else(|| config.tmpdir.clone());
            let target = pid.map_or(SweepTarget::Dead, SweepTarget::Pid);
            let report = sweep::sweep(&dir, target)?;
            let clean = report.errors.is_empty();
            log.emit_entry(
                LogEntry::new("", LogLevel::Info, "sweep")
                    .with_outcome(if clean { Outcome::Pass } else { Outcome::Fail })
                    .with_details(serde_json::to_value(&report)?),
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if clean {
                Ok(())
            } else {
                Err(HarnessError::Scenario {
                    scenario: "sweep",
                    message: report.errors.join("; "),
                })
            }
        }
        Command::Status { json } => {
            let dump = scenarios::status_dump(&config)?;
            log.emit_entry(
                LogEntry::new("", LogLevel::Info, "status")
                    .with_details(serde_json::to_value(dump.stats)?),
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dump)?);
            } else {
                print!("{}", dump.text);
            }
            Ok(())
        }
    };
    log.flush()?;
    result
}

fn run_scenario(
    log: &mut LogEmitter,
    scenario: impl FnOnce() -> Result<ScenarioReport, HarnessError>,
) -> Result<(), HarnessError> {
    let started = Instant::now();
    let report = scenario()?;
    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    log.emit_lifecycle(&report.records, report.scenario)?;
    let (level, outcome) = if report.passed() {
        (LogLevel::Info, Outcome::Pass)
    } else {
        (LogLevel::Error, Outcome::Fail)
    };
    log.emit_entry(
        LogEntry::new("", level, "scenario_result")
            .with_scenario(report.scenario)
            .with_mode(report.mode)
            .with_outcome(outcome)
            .with_duration_ms(elapsed)
            .with_details(serde_json::to_value(&report)?),
    )?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.passed() {
        Ok(())
    } else {
        Err(HarnessError::ChecksFailed {
            failed: report.failures(),
            total: report.checks.len(),
        })
    }
}
