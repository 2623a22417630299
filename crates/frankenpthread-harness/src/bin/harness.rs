//! CLI entrypoint for the frankenpthread scenario harness.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use frankenpthread_core::config::SyncMode;
use frankenpthread_harness::structured_log::{LogEmitter, validate_log_file};
use frankenpthread_harness::{
    HarnessError, SCENARIOS, Scenario, ScenarioReport, ScenarioResult, ScenarioRunner, scenarios,
};

/// Conformance tooling for frankenpthread.
#[derive(Debug, Parser)]
#[command(name = "frankenpthread-harness")]
#[command(about = "Scenario harness for frankenpthread threading primitives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List available scenarios.
    List,
    /// Run scenarios and write a sealed report.
    Run {
        /// Scenario name, or `all`.
        #[arg(long, default_value = "all")]
        scenario: String,
        /// Sync mode (`strict` or `hardened`).
        #[arg(long, default_value = "strict")]
        mode: String,
        /// Output report path (JSON). Prints to stdout if omitted.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Optional markdown rendering of the report.
        #[arg(long)]
        markdown: Option<PathBuf>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Check a report's digest and tallies.
    VerifyReport {
        #[arg(long)]
        report: PathBuf,
    },
    /// Validate a JSONL log against the schema.
    VerifyLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn parse_mode(raw: &str) -> Result<SyncMode, HarnessError> {
    match raw.to_ascii_lowercase().as_str() {
        "strict" => Ok(SyncMode::Strict),
        "hardened" => Ok(SyncMode::Hardened),
        _ => Err(HarnessError::UnknownMode(raw.to_string())),
    }
}

fn select(name: &str) -> Result<Vec<&'static Scenario>, HarnessError> {
    if name == "all" {
        return Ok(SCENARIOS.iter().collect());
    }
    scenarios::find(name)
        .map(|s| vec![s])
        .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
}

fn run_logged<W: Write>(
    runner: &ScenarioRunner,
    selected: &[&Scenario],
    mut log: LogEmitter<W>,
) -> std::io::Result<Vec<ScenarioResult>> {
    runner.run(selected, &mut log)
}

fn write_file(path: &Path, contents: &str) -> Result<(), HarnessError> {
    std::fs::write(path, contents).map_err(|source| HarnessError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for s in SCENARIOS {
                println!("{:<28} {:<10} {}", s.name, s.primitive, s.property);
            }
        }
        Command::Run {
            scenario,
            mode,
            output,
            markdown,
            log,
        } => {
            let mode = parse_mode(&mode)?;
            let selected = select(&scenario)?;
            let runner = ScenarioRunner::new(mode);
            let run_id = format!("{}-{}", mode.as_str(), std::process::id());
            eprintln!("Running {} scenario(s) in {} mode", selected.len(), mode.as_str());

            let results = match &log {
                Some(path) => {
                    let emitter = LogEmitter::to_file(path, &run_id).map_err(|source| {
                        HarnessError::Io {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    run_logged(&runner, &selected, emitter)?
                }
                None => run_logged(&runner, &selected, LogEmitter::to_buffer(&run_id))?,
            };
            for r in &results {
                let status = if r.passed { "PASS" } else { "FAIL" };
                eprintln!("[{status}] {}", r.name);
                if let Some(message) = &r.message {
                    eprintln!("       {message}");
                }
            }

            let report = ScenarioReport::new(mode.as_str(), results)?;
            let json = report.to_json()?;
            match &output {
                Some(path) => write_file(path, &json)?,
                None => println!("{json}"),
            }
            if let Some(path) = &markdown {
                write_file(path, &report.to_markdown())?;
            }
            if report.failed > 0 {
                return Err(HarnessError::ScenariosFailed {
                    failed: report.failed,
                    total: report.total,
                }
                .into());
            }
        }
        Command::VerifyReport { report } => {
            let text = std::fs::read_to_string(&report).map_err(|source| HarnessError::Io {
                path: report.clone(),
                source,
            })?;
            let parsed = ScenarioReport::from_json(&text)?;
            parsed.verify()?;
            eprintln!(
                "Report OK: {}/{} passed, digest {}",
                parsed.passed, parsed.total, parsed.digest
            );
        }
        Command::VerifyLog { log } => {
            let (lines, errors) = validate_log_file(&log).map_err(|source| HarnessError::Io {
                path: log.clone(),
                source,
            })?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog(errors.len()).into());
            }
            eprintln!("Log OK: {lines} line(s)");
        }
    }

    Ok(())
}
