//! Conformance harness for frankenpthread.
//!
//! This crate provides:
//! - Scenarios: multi-threaded checks of mutex, condition variable, rwlock,
//!   semaphore, cancellation and fork behavior
//! - A runner that executes scenarios under a chosen sync mode
//! - JSONL structured logs and digest-sealed JSON/markdown reports

#![forbid(unsafe_code)]

pub mod error;
pub mod report;
pub mod runner;
pub mod scenarios;
pub mod structured_log;

pub use error::{HarnessError, HarnessResult};
pub use report::ScenarioReport;
pub use runner::{ScenarioResult, ScenarioRunner};
pub use scenarios::{SCENARIOS, Scenario};
