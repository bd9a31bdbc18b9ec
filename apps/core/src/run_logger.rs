//! Run Journal Module
//!
//! Appends one JSON line per CLI run to `<data>/logs/runs.log`: command, round,
//! timestamps, status, stage reports and errors. Only the last runs are kept.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut journal = RunJournal::start(&layout, "stage-a", "round-1")?;
//! journal.record_report(report.clone());
//! journal.complete(true);
//! ```

use crate::error::AppError;
use crate::fs_manager::DataLayout;
use crate::pipeline::StageReport;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Maximum number of runs to keep in the log file
const MAX_RUNS: usize = 20;

/// Name of the run log file
const RUN_LOG_FILENAME: &str = "runs.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

/// Represents a single CLI run entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEntry {
    pub run_id: Uuid,
    pub command: String,
    pub round_id: String,
    pub start_time: DateTime<Local>,
    /// End time of the run (None if still running)
    pub end_time: Option<DateTime<Local>>,
    pub status: RunStatus,
    #[serde(default)]
    pub reports: Vec<StageReport>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

/// Represents an error that occurred during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Time when the error occurred
    pub timestamp: DateTime<Local>,
    /// Error message
    pub message: String,
    /// Optional context or location of the error
    pub context: Option<String>,
}

/// Tracks the current run and persists it after every change.
pub struct RunJournal {
    current_run: RunEntry,
    log_path: PathBuf,
}

impl RunJournal {
    /// Starts tracking a new run; creates the logs directory when needed.
    pub fn start(layout: &DataLayout, command: &str, round_id: &str) -> Result<Self, AppError> {
        let logs_dir = layout.logs_dir();
        fs::create_dir_all(&logs_dir)?;
        let journal = Self::at_path(logs_dir.join(RUN_LOG_FILENAME), command, round_id);
        journal.write_to_file();
        info!(
            "Run journal started. Run ID: {}, Log file: {:?}",
            journal.current_run.run_id, journal.log_path
        );
        Ok(journal)
    }

    fn at_path(log_path: PathBuf, command: &str, round_id: &str) -> Self {
        Self {
            current_run: RunEntry {
                run_id: Uuid::new_v4(),
                command: command.to_string(),
                round_id: round_id.to_string(),
                start_time: Local::now(),
                end_time: None,
                status: RunStatus::Running,
                reports: Vec::new(),
                errors: Vec::new(),
            },
            log_path,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn current_run(&self) -> &RunEntry {
        &self.current_run
    }

    pub fn record_report(&mut self, report: StageReport) {
        self.current_run.reports.push(report);
        self.write_to_file();
    }

    /// Logs an error with optional context for the current run.
    pub fn log_error(&mut self, message: &str, context: Option<&str>) {
        self.current_run.errors.push(ErrorEntry {
            timestamp: Local::now(),
            message: message.to_string(),
            context: context.map(|s| s.to_string()),
        });
        self.write_to_file();
    }

    /// Completes the current run and updates its status.
    pub fn complete(&mut self, success: bool) {
        let end = Local::now();
        self.current_run.end_time = Some(end);
        self.current_run.status = if success {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };
        self.write_to_file();

        info!(
            "Run {} completed with status {:?} in {}s",
            self.current_run.run_id,
            self.current_run.status,
            end.signed_duration_since(self.current_run.start_time).num_seconds()
        );
    }

    /// Reads and returns all run entries from the log file.
    pub fn history(&self) -> Vec<RunEntry> {
        self.read_existing_runs()
    }

    /// Writes the current run to the log file, keeping only the last MAX_RUNS entries.
    fn write_to_file(&self) {
        let mut runs = self.read_existing_runs();

        match runs.iter_mut().find(|r| r.run_id == self.current_run.run_id) {
            Some(run) => *run = self.current_run.clone(),
            None => runs.push(self.current_run.clone()),
        }

        if runs.len() > MAX_RUNS {
            let excess = runs.len() - MAX_RUNS;
            runs.drain(..excess);
        }

        if let Err(e) = self.write_runs_to_file(&runs) {
            error!("Failed to write run log: {}", e);
        }
    }

    fn read_existing_runs(&self) -> Vec<RunEntry> {
        if !self.log_path.exists() {
            return Vec::new();
        }

        match fs::File::open(&self.log_path) {
            Ok(file) => BufReader::new(file)
                .lines()
                .map_while(Result::ok)
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with('#')
                })
                .filter_map(|line| match serde_json::from_str::<RunEntry>(line.trim()) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Failed to parse run entry: {} - line: {}", e, line.trim());
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!("Failed to open run log file: {}", e);
                Vec::new()
            }
        }
    }

    fn write_runs_to_file(&self, runs: &[RunEntry]) -> std::io::Result<()> {
        let mut file = fs::File::create(&self.log_path)?;

        writeln!(file, "# phrasemap run log - last {} runs", runs.len())?;
        writeln!(file, "# Each line is a JSON object representing one run")?;

        for run in runs {
            match serde_json::to_string(run) {
                Ok(json) => writeln!(file, "{}", json)?,
                Err(e) => error!("Failed to serialize run entry: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use tempfile::TempDir;

    #[test]
    fn test_start_creates_log() {
        let temp_dir = TempDir::new().unwrap();
        let layout = DataLayout::new(temp_dir.path());
        let journal = RunJournal::start(&layout, "stage-a", "r1").unwrap();

        assert!(journal.log_path().exists());
        assert_eq!(journal.current_run().status, RunStatus::Running);
        assert_eq!(journal.history().len(), 1);
    }

    #[test]
    fn test_complete_with_errors_and_reports() {
        let temp_dir = TempDir::new().unwrap();
        let layout = DataLayout::new(temp_dir.path());
        let mut journal = RunJournal::start(&layout, "stage-b", "r1").unwrap();

        journal.record_report(StageReport::new(Stage::B, "r1", Uuid::new_v4(), 12));
        journal.log_error("Provider timed out", Some("stage-b"));
        journal.complete(false);

        let runs = journal.history();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failure);
        assert_eq!(runs[0].reports[0].input_phrases, 12);
        assert_eq!(runs[0].errors[0].context.as_deref(), Some("stage-b"));
        assert!(runs[0].end_time.is_some());
    }

    #[test]
    fn test_run_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let layout = DataLayout::new(temp_dir.path());

        let mut last = None;
        for i in 0..(MAX_RUNS + 5) {
            let mut journal = RunJournal::start(&layout, &format!("cmd-{}", i), "r").unwrap();
            journal.complete(true);
            last = Some(journal);
        }

        let runs = last.unwrap().history();
        assert_eq!(runs.len(), MAX_RUNS);
        assert_eq!(runs[0].command, "cmd-5");
        assert_eq!(runs[MAX_RUNS - 1].command, format!("cmd-{}", MAX_RUNS + 4));
    }
}
