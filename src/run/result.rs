//! Terminal run results and stable exit codes

use serde::{Deserialize, Serialize};

use crate::signal::EXIT_CODE_CANCELED;

/// Stable process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Every file published, capacity fine
    Success = 0,
    /// Configuration could not be loaded or validated
    Config = 2,
    /// Run completed but some files were skipped or space is running low
    Warnings = 3,
    /// Another instance holds the pid file
    AlreadyRunning = 10,
    /// Nothing matched the source pattern
    NoFilesFound = 11,
    /// Recipient key missing from the keyring
    RecipientKeyNotFound = 12,
    /// Not enough space at the destination before the run
    InsufficientCapacity = 13,
    /// Source base missing or unreadable
    SourceUnreadable = 14,
    /// Copy into the staging area failed
    StagingFailed = 15,
    /// Anything unclassified
    Unexpected = 70,
    /// Canceled by a termination signal
    Canceled = EXIT_CODE_CANCELED,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Fatal, run-aborting conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    AlreadyRunning,
    NoFilesFound,
    RecipientKeyNotFound,
    InsufficientCapacity,
    SourceUnreadable,
    StagingFailed,
    Unexpected,
}

impl FailureKind {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            FailureKind::AlreadyRunning => ExitCode::AlreadyRunning,
            FailureKind::NoFilesFound => ExitCode::NoFilesFound,
            FailureKind::RecipientKeyNotFound => ExitCode::RecipientKeyNotFound,
            FailureKind::InsufficientCapacity => ExitCode::InsufficientCapacity,
            FailureKind::SourceUnreadable => ExitCode::SourceUnreadable,
            FailureKind::StagingFailed => ExitCode::StagingFailed,
            FailureKind::Unexpected => ExitCode::Unexpected,
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::AlreadyRunning => "Already running",
            FailureKind::NoFilesFound => "No files to back up",
            FailureKind::RecipientKeyNotFound => "Missing recipient key",
            FailureKind::InsufficientCapacity => "Low pre-archive destination space",
            FailureKind::SourceUnreadable => "Source base unreadable",
            FailureKind::StagingFailed => "Staging copy failed",
            FailureKind::Unexpected => "Unexpected error",
        }
    }
}

/// Advisory conditions attached to an otherwise successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunWarning {
    /// Some files were skipped by the publisher
    FilesSkipped { count: usize },
    /// Another run of the same size would not fit
    LowCapacityForNextRun { shortfall_bytes: u64 },
    /// The post-run capacity check itself could not be completed
    CapacityRecheckFailed { detail: String },
    /// Staged copies could not all be removed
    CleanupFailed { detail: String },
}

/// Terminal result of one archive run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Succeeded,
    SucceededWithWarnings(Vec<RunWarning>),
    Failed { kind: FailureKind, detail: String },
    Canceled,
}

impl RunResult {
    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        RunResult::Failed {
            kind,
            detail: detail.into(),
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunResult::Succeeded => ExitCode::Success,
            RunResult::SucceededWithWarnings(_) => ExitCode::Warnings,
            RunResult::Failed { kind, .. } => kind.exit_code(),
            RunResult::Canceled => ExitCode::Canceled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Succeeded | RunResult::SucceededWithWarnings(_))
    }

    /// Clean runs are the only ones `report.on = "errors"` stays quiet for.
    pub fn is_clean(&self) -> bool {
        matches!(self, RunResult::Succeeded)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RunResult::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn warnings(&self) -> &[RunWarning] {
        match self {
            RunResult::SucceededWithWarnings(warnings) => warnings,
            _ => &[],
        }
    }

    /// Stable label used in summaries
    pub fn label(&self) -> &'static str {
        match self {
            RunResult::Succeeded => "SUCCEEDED",
            RunResult::SucceededWithWarnings(_) => "SUCCEEDED_WITH_WARNINGS",
            RunResult::Failed { .. } => "FAILED",
            RunResult::Canceled => "CANCELED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinct_for_cancel() {
        assert_eq!(RunResult::Canceled.exit_code().as_i32(), 80);
        assert_eq!(RunResult::Succeeded.exit_code().as_i32(), 0);
        assert_ne!(
            RunResult::SucceededWithWarnings(vec![]).exit_code(),
            RunResult::Succeeded.exit_code()
        );
    }

    #[test]
    fn test_failure_kind_exit_codes() {
        let result = RunResult::failed(FailureKind::InsufficientCapacity, "short by 200B");
        assert_eq!(result.exit_code(), ExitCode::InsufficientCapacity);
        assert_eq!(result.failure_kind(), Some(FailureKind::InsufficientCapacity));
        assert!(!result.is_success());
    }

    #[test]
    fn test_warnings_accessor() {
        let result = RunResult::SucceededWithWarnings(vec![RunWarning::FilesSkipped { count: 2 }]);
        assert!(result.is_success());
        assert!(!result.is_clean());
        assert_eq!(result.warnings().len(), 1);
        assert!(RunResult::Succeeded.warnings().is_empty());
    }

    #[test]
    fn test_warning_serialization() {
        let json = serde_json::to_value(RunWarning::LowCapacityForNextRun { shortfall_bytes: 5 })
            .unwrap();
        assert_eq!(json["kind"], "LOW_CAPACITY_FOR_NEXT_RUN");
        assert_eq!(json["shortfall_bytes"], 5);
    }
}
