//! Stress harness for pthreads-emu.
//!
//! This crate provides:
//! - Scenarios: multi-threaded workloads over each primitive that check
//!   their own invariants and count the operations they performed
//! - A runner that executes scenarios and records one structured log line
//!   per scenario
//! - The structured log schema, emitter and validator used by the
//!   `harness` binary

#![forbid(unsafe_code)]

pub mod error;
pub mod runner;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use runner::{RunSummary, ScenarioRunner};
pub use scenarios::{Scenario, ScenarioConfig, ScenarioReport};
