//! Scenario execution engine.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::scenarios::{Scenario, ScenarioConfig, ScenarioReport};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// Runs scenarios and records one `scenario_result` line per scenario.
pub struct ScenarioRunner {
    /// Name of the campaign, first component of every trace id.
    pub campaign: String,
    pub run_id: String,
    pub config: ScenarioConfig,
}

/// A scenario that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    pub scenario: Scenario,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    pub message: String,
}

/// Machine-readable result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub campaign: String,
    pub run_id: String,
    pub config: ScenarioConfig,
    pub passed: usize,
    pub failed: usize,
    pub reports: Vec<ScenarioReport>,
    pub failures: Vec<ScenarioFailure>,
}

impl RunSummary {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.failed == 0
    }
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(campaign: impl Into<String>, run_id: impl Into<String>, config: ScenarioConfig) -> Self {
        Self {
            campaign: campaign.into(),
            run_id: run_id.into(),
            config,
        }
    }

    /// Run `scenarios` in order. A failing scenario does not stop the run.
    pub fn run(&self, scenarios: &[Scenario], log: &mut LogEmitter) -> std::io::Result<RunSummary> {
        log.emit_entry(
            self.entry(LogLevel::Info, "run_start")
                .with_workload(self.config.threads, self.config.iterations)
                .with_details(serde_json::json!({
                    "scenarios": scenarios.iter().map(|s| s.name()).collect::<Vec<_>>(),
                })),
        )?;

        let mut summary = RunSummary {
            campaign: self.campaign.clone(),
            run_id: self.run_id.clone(),
            config: self.config,
            passed: 0,
            failed: 0,
            reports: Vec::new(),
            failures: Vec::new(),
        };
        for &scenario in scenarios {
            let start = Instant::now();
            let entry = self
                .entry(LogLevel::Info, "scenario_result")
                .with_scenario(scenario.name())
                .with_workload(self.config.threads, self.config.iterations);
            match scenario.run(&self.config) {
                Ok(report) => {
                    log.emit_entry(
                        entry
                            .with_outcome(Outcome::Pass)
                            .with_duration_ns(report.elapsed_ns)
                            .with_op_counts(report.op_counts.clone()),
                    )?;
                    summary.passed += 1;
                    summary.reports.push(report);
                }
                Err(err) => {
                    let mut entry = entry
                        .with_outcome(Outcome::Fail)
                        .with_duration_ns(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX))
                        .with_failure(err.to_string());
                    entry.level = LogLevel::Error;
                    if let Some(errno) = err.errno() {
                        entry = entry.with_errno(errno);
                    }
                    log.emit_entry(entry)?;
                    summary.failed += 1;
                    summary.failures.push(ScenarioFailure {
                        scenario,
                        errno: err.errno(),
                        message: err.to_string(),
                    });
                }
            }
        }

        log.emit_entry(
            self.entry(LogLevel::Info, "run_end").with_details(serde_json::json!({
                "passed": summary.passed,
                "failed": summary.failed,
            })),
        )?;
        log.flush()?;
        Ok(summary)
    }

    /// Entry whose trace id the emitter fills in.
    fn entry(&self, level: LogLevel, event: &str) -> LogEntry {
        LogEntry::new(String::new(), level, event)
    }
}
