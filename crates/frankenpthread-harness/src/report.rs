//! Report generation for scenario runs.
//!
//! A report is JSON with a SHA-256 digest over its own canonical form, so a
//! stored report can be checked for edits after the fact.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HarnessError, HarnessResult};
use crate::runner::ScenarioResult;
use crate::structured_log::now_utc;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub schema_version: u32,
    /// Sync mode the scenarios ran under.
    pub mode: String,
    pub generated_utc: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioResult>,
    /// Lowercase hex SHA-256 of the report with this field empty.
    #[serde(default)]
    pub digest: String,
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

impl ScenarioReport {
    /// Build and seal a report.
    pub fn new(mode: &str, results: Vec<ScenarioResult>) -> HarnessResult<Self> {
        Self::with_timestamp(mode, now_utc(), results)
    }

    /// Like [`ScenarioReport::new`] with a fixed timestamp, for reproducible
    /// output.
    pub fn with_timestamp(
        mode: &str,
        generated_utc: String,
        results: Vec<ScenarioResult>,
    ) -> HarnessResult<Self> {
        let passed = results.iter().filter(|r| r.passed).count();
        let mut report = Self {
            schema_version: REPORT_SCHEMA_VERSION,
            mode: mode.to_string(),
            generated_utc,
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
            digest: String::new(),
        };
        report.digest = report.compute_digest()?;
        Ok(report)
    }

    /// Digest over the canonical JSON of the report minus its digest.
    pub fn compute_digest(&self) -> HarnessResult<String> {
        let mut unsealed = self.clone();
        unsealed.digest.clear();
        let canonical = serde_json::to_vec(&unsealed)?;
        Ok(hex_lower(&Sha256::digest(&canonical)))
    }

    /// Check the recorded digest and the pass/fail tallies.
    pub fn verify(&self) -> HarnessResult<()> {
        let computed = self.compute_digest()?;
        if !computed.eq_ignore_ascii_case(&self.digest) {
            return Err(HarnessError::DigestMismatch {
                recorded: self.digest.clone(),
                computed,
            });
        }
        let passed = self.results.iter().filter(|r| r.passed).count();
        let consistent = passed == self.passed
            && self.total == self.results.len()
            && self.failed + passed == self.total;
        if !consistent {
            return Err(HarnessError::InconsistentTally {
                recorded: self.passed,
                counted: passed,
            });
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> HarnessResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> HarnessResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# frankenpthread scenarios ({})\n", self.mode);
        let _ = writeln!(out, "- Generated: {}", self.generated_utc);
        let _ = writeln!(out, "- Passed: {}/{}", self.passed, self.total);
        let _ = writeln!(out, "- Digest: `{}`\n", self.digest);
        out.push_str("| Scenario | Primitive | Status | Time (us) |\n");
        out.push_str("|----------|-----------|--------|-----------|\n");
        for r in &self.results {
            let status = if r.passed { "PASS" } else { "FAIL" };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                r.name,
                r.primitive,
                status,
                r.duration_ns / 1_000
            );
        }
        out
    }
}
