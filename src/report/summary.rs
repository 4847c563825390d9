//! Run summary (run_summary.json) and report delivery

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{human_size, RunEvent, RunReport};
use crate::run::{FailureKind, RunResult, RunWarning};

/// Schema version for run_summary.json
pub const RUN_SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for run_summary.json
pub const RUN_SUMMARY_SCHEMA_ID: &str = "encarch/run_summary@1";

/// Errors while delivering a report
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid report mode '{0}': must be all or errors")]
    InvalidMode(String),
}

/// Which runs produce a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Every run
    All,
    /// Only runs that were not clean successes
    Errors,
}

impl ReportMode {
    pub fn should_deliver(&self, result: &RunResult) -> bool {
        match self {
            ReportMode::All => true,
            ReportMode::Errors => !result.is_clean(),
        }
    }
}

impl FromStr for ReportMode {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(ReportMode::All),
            "errors" => Ok(ReportMode::Errors),
            _ => Err(ReportError::InvalidMode(s.to_string())),
        }
    }
}

/// Counters gathered while the run progresses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Catalog size
    pub files_found: usize,
    /// Files published to the destination
    pub files_published: usize,
    /// Files skipped by the publisher
    pub files_skipped: usize,
    /// Total source bytes (from the pre-run capacity check)
    pub bytes_required: Option<u64>,
    /// Dated destination directory of this run
    pub destination: Option<PathBuf>,
}

/// Final report of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: String,
    pub instance: String,
    /// SUCCEEDED, SUCCEEDED_WITH_WARNINGS, FAILED or CANCELED
    pub outcome: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RunWarning>,
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Subject line, including the alert notice when warnings or errors occurred
    pub subject: String,
    pub human_summary: String,
    pub events: Vec<RunEvent>,
}

impl RunSummary {
    pub(super) fn build(report: RunReport, result: &RunResult, subject_prefix: &str) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - report.started_at)
            .num_milliseconds()
            .max(0) as u64;

        let notice = report.alert_notice();
        let mut subject = subject_prefix.trim().to_string();
        for part in [notice.as_deref(), Some(subject_for(result))].into_iter().flatten() {
            if !subject.is_empty() {
                subject.push(' ');
            }
            subject.push_str(part);
        }

        let (failure_kind, failure_detail) = match result {
            RunResult::Failed { kind, detail } => (Some(*kind), Some(detail.clone())),
            _ => (None, None),
        };

        let human_summary = human_summary(result, &report.stats);

        Self {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION,
            schema_id: RUN_SUMMARY_SCHEMA_ID.to_string(),
            run_id: report.run_id.to_string(),
            instance: report.instance,
            outcome: result.label().to_string(),
            exit_code: result.exit_code().as_i32(),
            failure_kind,
            failure_detail,
            warnings: result.warnings().to_vec(),
            stats: report.stats,
            started_at: report.started_at,
            finished_at,
            duration_ms,
            subject,
            human_summary,
            events: report.events,
        }
    }

    /// Write the summary as pretty JSON through a temp file and rename.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ReportError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = OsString::from(path.as_os_str());
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let json = serde_json::to_string_pretty(self)?;
        if let Err(e) = fs::write(&tmp, json).and_then(|_| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Load a summary from a file
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn subject_for(result: &RunResult) -> &'static str {
    match result {
        RunResult::Succeeded => "Archive Completed Without Errors",
        RunResult::SucceededWithWarnings(warnings) => {
            let low_space = warnings
                .iter()
                .any(|w| matches!(w, RunWarning::LowCapacityForNextRun { .. }));
            if low_space {
                "Destination Capacity Insufficient"
            } else {
                "Archive Completed With Warnings"
            }
        }
        RunResult::Failed {
            kind: FailureKind::InsufficientCapacity,
            ..
        } => "Destination Capacity Insufficient",
        RunResult::Failed {
            kind: FailureKind::Unexpected,
            ..
        } => "Unhandled Problems Encountered",
        RunResult::Failed { .. } => "Problems Encountered",
        RunResult::Canceled => "Archive Canceled",
    }
}

fn human_summary(result: &RunResult, stats: &RunStats) -> String {
    let mut lines = Vec::new();

    match result {
        RunResult::Succeeded => lines.push("Job completed normally.".to_string()),
        RunResult::SucceededWithWarnings(warnings) => {
            lines.push("Job completed with warnings.".to_string());
            for warning in warnings {
                lines.push(match warning {
                    RunWarning::FilesSkipped { count } => {
                        format!("{} file(s) were skipped; see the event log", count)
                    }
                    RunWarning::LowCapacityForNextRun { shortfall_bytes } => format!(
                        "The next archive may fail: free at least {}B at the destination",
                        human_size(*shortfall_bytes)
                    ),
                    RunWarning::CapacityRecheckFailed { detail } => {
                        format!("Post-archive capacity check failed: {}", detail)
                    }
                    RunWarning::CleanupFailed { detail } => {
                        format!("Staged files could not all be removed: {}", detail)
                    }
                });
            }
        }
        RunResult::Failed { kind, detail } => {
            lines.push(format!("{}: {}", kind.description(), detail));
            lines.push("Please review the log and investigate as needed.".to_string());
        }
        RunResult::Canceled => lines.push("Archive canceled by user.".to_string()),
    }

    if stats.files_found > 0 {
        lines.push(format!(
            "{} file(s) found, {} published, {} skipped",
            stats.files_found, stats.files_published, stats.files_skipped
        ));
    }
    if let Some(ref dest) = stats.destination {
        lines.push(format!("Destination: {}", dest.display()));
    }

    lines.join("\n")
}

/// Delivers finished summaries somewhere
pub trait ReportSink {
    fn deliver(&self, summary: &RunSummary) -> Result<(), ReportError>;
}

/// Writes each summary to a fixed JSON file path
#[derive(Debug, Clone)]
pub struct JsonSummarySink {
    path: PathBuf,
}

impl JsonSummarySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonSummarySink {
    fn deliver(&self, summary: &RunSummary) -> Result<(), ReportError> {
        summary.write_to_file(&self.path)
    }
}
