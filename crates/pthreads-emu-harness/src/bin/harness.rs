//! CLI entrypoint for the pthreads-emu stress harness.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};

use pthreads_emu_core::config::{self, TraceLevel};
use pthreads_emu_core::pthread::mutex::{
    MutexContractOp, MutexContractState, PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL,
    PTHREAD_MUTEX_RECURSIVE, mutex_contract_transition,
};
use pthreads_emu_core::trace;
use pthreads_emu_harness::structured_log::{LogEmitter, validate_log_file};
use pthreads_emu_harness::{Scenario, ScenarioConfig, ScenarioRunner};

/// Stress tooling for pthreads-emu.
#[derive(Debug, Parser)]
#[command(name = "pthreads-emu-harness")]
#[command(about = "Stress scenarios and structured reports for pthreads-emu")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List available scenarios.
    List,
    /// Run scenarios and write a JSONL log.
    Run {
        /// Scenario names (repeatable). Runs all when omitted.
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Worker threads per scenario.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Iterations per worker (some scenarios cap this).
        #[arg(long, default_value_t = 1_000)]
        iterations: u64,
        /// JSONL log path (if omitted, prints to stdout).
        #[arg(long)]
        log: Option<PathBuf>,
        /// JSON summary path.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Library trace level (`off`, `error`, `warn`, `info`, `debug`, `trace`).
        #[arg(long)]
        trace_level: Option<String>,
        /// Library trace JSONL path (default stderr).
        #[arg(long)]
        trace_file: Option<PathBuf>,
        /// Campaign name used in trace ids.
        #[arg(long, default_value = "stress")]
        campaign: String,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// Dump the mutex contract transition table as JSON.
    ContractMatrix {
        /// Output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for scenario in Scenario::ALL {
                println!("{:<16} {}", scenario.name(), scenario.summary());
            }
        }
        Command::Run {
            scenarios,
            threads,
            iterations,
            log,
            report,
            trace_level,
            trace_file,
            campaign,
        } => {
            let selected = if scenarios.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenarios
                    .iter()
                    .map(|name| Scenario::from_name(name))
                    .collect::<Result<Vec<_>, _>>()?
            };
            if let Some(level) = trace_level {
                config::set_trace_level(TraceLevel::from_str_loose(&level));
            }
            if let Some(path) = trace_file {
                trace::set_writer(Box::new(std::fs::File::create(&path)?));
            }

            let run_id = format!(
                "run-{}",
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default()
            );
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &campaign, &run_id)?,
                None => LogEmitter::to_stdout(&campaign, &run_id),
            };
            let runner = ScenarioRunner::new(&campaign, &run_id, ScenarioConfig { threads, iterations });
            let summary = runner.run(&selected, &mut emitter)?;

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
                eprintln!("Wrote summary to {}", path.display());
            }
            eprintln!("{} passed, {} failed", summary.passed, summary.failed);
            for failure in &summary.failures {
                eprintln!("  {}: {}", failure.scenario.name(), failure.message);
            }
            if !summary.ok() {
                return Err(format!("{} scenario(s) failed", summary.failed).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!("{} error(s) in {lines} line(s)", errors.len()).into());
            }
            eprintln!("{}: {lines} valid line(s)", log.display());
        }
        Command::ContractMatrix { output } => {
            let json = serde_json::to_string_pretty(&contract_matrix())?;
            match output {
                Some(path) => std::fs::write(path, json)?,
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

fn contract_matrix() -> serde_json::Value {
    use MutexContractOp as Op;
    use MutexContractState as S;

    let kinds = [
        ("NORMAL", PTHREAD_MUTEX_NORMAL),
        ("RECURSIVE", PTHREAD_MUTEX_RECURSIVE),
        ("ERRORCHECK", PTHREAD_MUTEX_ERRORCHECK),
    ];
    let states = [
        S::StaticInitializer,
        S::Unlocked,
        S::LockedBySelf,
        S::LockedByOther,
        S::Destroyed,
    ];
    let ops = [Op::Init, Op::Lock, Op::TryLock, Op::Unlock, Op::Destroy];

    let mut rows = Vec::new();
    for (kind_name, kind) in kinds {
        for state in states {
            for op in ops {
                let outcome = mutex_contract_transition(kind, state, op);
                rows.push(serde_json::json!({
                    "kind": kind_name,
                    "state": format!("{state:?}"),
                    "op": format!("{op:?}"),
                    "next": format!("{:?}", outcome.next),
                    "errno": outcome.errno,
                    "blocks": outcome.blocks,
                }));
            }
        }
    }
    serde_json::json!({ "schema_version": "v1", "rows": rows })
}
