//! Run report and structured event stream
//!
//! A [`RunReport`] is created when a run starts, receives every event the
//! run emits, and is consumed exactly once at termination to build a
//! [`RunSummary`]. Events are forwarded to `tracing` as they arrive, so the
//! console/file log and the report always agree.

mod size;
mod summary;

pub use size::human_size;
pub use summary::{JsonSummarySink, ReportError, ReportMode, ReportSink, RunSummary, RunStats};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunResult;

/// Severity of a run event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
            EventLevel::Critical => "CRITICAL",
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn filter_directive(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warning => "warn",
            EventLevel::Error | EventLevel::Critical => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown log level name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid log level '{0}': must be CRITICAL, ERROR, WARNING, INFO, or DEBUG")]
pub struct ParseLevelError(pub String);

impl FromStr for EventLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(EventLevel::Debug),
            "INFO" => Ok(EventLevel::Info),
            "WARNING" | "WARN" => Ok(EventLevel::Warning),
            "ERROR" => Ok(EventLevel::Error),
            "CRITICAL" => Ok(EventLevel::Critical),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// One entry of the event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub level: EventLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Receiver of run events
pub trait EventSink {
    fn emit(&mut self, level: EventLevel, message: String);

    fn debug(&mut self, message: String) {
        self.emit(EventLevel::Debug, message);
    }

    fn info(&mut self, message: String) {
        self.emit(EventLevel::Info, message);
    }

    fn warning(&mut self, message: String) {
        self.emit(EventLevel::Warning, message);
    }

    fn error(&mut self, message: String) {
        self.emit(EventLevel::Error, message);
    }
}

fn forward_to_tracing(instance: &str, level: EventLevel, message: &str) {
    match level {
        EventLevel::Debug => tracing::debug!(instance, "{}", message),
        EventLevel::Info => tracing::info!(instance, "{}", message),
        EventLevel::Warning => tracing::warn!(instance, "{}", message),
        EventLevel::Error | EventLevel::Critical => tracing::error!(instance, "{}", message),
    }
}

/// Accumulated record of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    run_id: Uuid,
    instance: String,
    started_at: DateTime<Utc>,
    threshold: EventLevel,
    events: Vec<RunEvent>,
    max_level: Option<EventLevel>,
    stats: RunStats,
}

impl RunReport {
    /// Start a report; events below `threshold` are logged but not recorded.
    pub fn new(instance: impl Into<String>, threshold: EventLevel) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            instance: instance.into(),
            started_at: Utc::now(),
            threshold,
            events: Vec::new(),
            max_level: None,
            stats: RunStats::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    /// Highest level recorded so far
    pub fn max_level(&self) -> Option<EventLevel> {
        self.max_level
    }

    /// Alert notice for the subject line, present once anything above INFO
    /// has been recorded.
    pub fn alert_notice(&self) -> Option<String> {
        self.max_level
            .filter(|level| *level > EventLevel::Info)
            .map(|level| format!("({} ALERT)", level))
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RunStats {
        &mut self.stats
    }

    /// Consume the report into its final summary.
    pub fn finish(self, result: &RunResult, subject_prefix: &str) -> RunSummary {
        RunSummary::build(self, result, subject_prefix)
    }
}

impl EventSink for RunReport {
    fn emit(&mut self, level: EventLevel, message: String) {
        forward_to_tracing(&self.instance, level, &message);
        if level < self.threshold {
            return;
        }
        if self.max_level.map_or(true, |max| level > max) {
            self.max_level = Some(level);
        }
        self.events.push(RunEvent {
            level,
            message,
            timestamp: Utc::now(),
        });
    }
}
