//! Scenario execution engine.

use std::io::Write;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use frankenpthread_core::config::{SyncMode, set_sync_mode};

use crate::scenarios::Scenario;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// Result of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub primitive: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    pub duration_ns: u64,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Runs scenarios under one sync mode.
pub struct ScenarioRunner {
    mode: SyncMode,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(mode: SyncMode) -> Self {
        Self { mode }
    }

    #[must_use]
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Run `scenarios` in order. The process-wide mode is switched for the
    /// duration of the run and restored afterwards.
    pub fn run<W: Write>(
        &self,
        scenarios: &[&Scenario],
        log: &mut LogEmitter<W>,
    ) -> std::io::Result<Vec<ScenarioResult>> {
        let previous = set_sync_mode(self.mode);
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let result = self.run_one(scenario);
            log.emit_entry(self.log_entry(&result))?;
            results.push(result);
        }
        set_sync_mode(previous);
        log.flush()?;
        Ok(results)
    }

    fn run_one(&self, scenario: &Scenario) -> ScenarioResult {
        log::debug!("scenario {} ({})", scenario.name, self.mode.as_str());
        let started = Instant::now();
        let outcome = (scenario.run)();
        let duration_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        match outcome {
            Ok(details) => ScenarioResult {
                name: scenario.name.to_string(),
                primitive: scenario.primitive.to_string(),
                passed: true,
                message: None,
                errno: None,
                duration_ns,
                details,
            },
            Err(failure) => {
                log::warn!("scenario {} failed: {}", scenario.name, failure.message);
                ScenarioResult {
                    name: scenario.name.to_string(),
                    primitive: scenario.primitive.to_string(),
                    passed: false,
                    message: Some(failure.message),
                    errno: failure.errno,
                    duration_ns,
                    details: serde_json::Value::Null,
                }
            }
        }
    }

    fn log_entry(&self, result: &ScenarioResult) -> LogEntry {
        let (level, outcome) = if result.passed {
            (LogLevel::Info, Outcome::Pass)
        } else {
            (LogLevel::Error, Outcome::Fail)
        };
        let mut entry = LogEntry::new(String::new(), level, "scenario_result")
            .with_mode(self.mode.as_str())
            .with_scenario(&result.primitive, &result.name)
            .with_outcome(outcome)
            .with_latency_ns(result.duration_ns);
        if let Some(errno) = result.errno {
            entry = entry.with_errno(errno);
        }
        if let Some(message) = &result.message {
            entry = entry.with_details(serde_json::json!({ "message": message }));
        }
        entry
    }
}
