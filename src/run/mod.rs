//! Archive run coordinator
//!
//! One run walks the phases in [`state::RunPhase`] order:
//! - acquire the pid-file guard
//! - discover the catalog (empty is fatal)
//! - pre-archive capacity gate against `dest_root`
//! - resolve the recipient key
//! - optionally stage the catalog under `temp_base`
//! - encrypt and publish every file
//! - advisory capacity recheck for the next run
//!
//! Whatever happens, staged copies are cleared (unless preserved) and the
//! guard is released before the result is returned.

pub mod result;
pub mod state;

pub use result::{ExitCode, FailureKind, RunResult, RunWarning};
pub use state::{RunPhase, RunStateError, RunStateMachine};

use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Local};
use encarch_crypto::{Encryptor, Recipient, RecipientResolver};
use tracing::debug;

use crate::capacity::{self, FsSpaceProbe, SpaceProbe};
use crate::catalog::{self, Catalog, DiscoveryError};
use crate::config::ArchiveConfig;
use crate::guard::{GuardError, RunGuard};
use crate::publish::EncryptionPublisher;
use crate::report::{human_size, EventLevel, EventSink, RunReport};
use crate::signal::CancelToken;
use crate::staging::{StagingArea, StagingError, WorkingBase};

/// Why a run stopped before completing
#[derive(Debug)]
enum Stop {
    Failed(FailureKind, String),
    Canceled,
}

impl From<RunStateError> for Stop {
    fn from(err: RunStateError) -> Self {
        Stop::Failed(FailureKind::Unexpected, format!("{:?}", err))
    }
}

/// Resources the cleanup step must know about, filled in as the run
/// progresses
#[derive(Default)]
struct Cleanup {
    staging: Option<StagingArea>,
}

/// Drives one archive run against a configuration
pub struct RunCoordinator<'a> {
    config: &'a ArchiveConfig,
    encryptor: &'a dyn Encryptor,
    resolver: &'a dyn RecipientResolver,
    space: &'a dyn SpaceProbe,
    cancel: CancelToken,
    run_time: Option<DateTime<Local>>,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(
        config: &'a ArchiveConfig,
        encryptor: &'a dyn Encryptor,
        resolver: &'a dyn RecipientResolver,
    ) -> Self {
        Self {
            config,
            encryptor,
            resolver,
            space: &FsSpaceProbe,
            cancel: CancelToken::new(),
            run_time: None,
        }
    }

    /// Measure destination free space with `probe` instead of the filesystem.
    pub fn with_space_probe(mut self, probe: &'a dyn SpaceProbe) -> Self {
        self.space = probe;
        self
    }

    /// Observe `token` for cancellation requests.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Pin the time used to name the dated destination directory.
    pub fn with_run_time(mut self, when: DateTime<Local>) -> Self {
        self.run_time = Some(when);
        self
    }

    /// Execute one run, emitting events into `report`.
    pub fn run(&self, report: &mut RunReport) -> RunResult {
        let mut machine = RunStateMachine::new();
        let result = self.run_guarded(&mut machine, report);
        machine.finish(&result);
        debug!(
            outcome = result.label(),
            phases = ?machine.history().collect::<Vec<_>>(),
            "run finished"
        );
        result
    }

    fn run_guarded(&self, machine: &mut RunStateMachine, report: &mut RunReport) -> RunResult {
        if let Err(e) = machine.transition(RunPhase::GuardCheck) {
            return self.conclude(Err(e.into()), report);
        }
        if self.cancel.is_canceled() {
            return self.conclude(Err(Stop::Canceled), report);
        }

        let guard = match RunGuard::acquire(&self.config.pid_file) {
            Ok(guard) => guard,
            Err(e @ GuardError::AlreadyRunning { .. }) => {
                report.error(format!(
                    "Previous instance already running! Remove pidfile {} if incorrect",
                    self.config.pid_file.display()
                ));
                return self.conclude(
                    Err(Stop::Failed(FailureKind::AlreadyRunning, e.to_string())),
                    report,
                );
            }
            Err(e) => {
                return self.conclude(
                    Err(Stop::Failed(FailureKind::Unexpected, format!("{:?}", e))),
                    report,
                );
            }
        };

        let mut cleanup = Cleanup::default();
        let outcome = self.execute(machine, report, &mut cleanup);
        let mut result = self.conclude(outcome, report);

        if let Some(warning) = self.clear_staging(&cleanup, report) {
            result = match result {
                RunResult::Succeeded => RunResult::SucceededWithWarnings(vec![warning]),
                RunResult::SucceededWithWarnings(mut warnings) => {
                    warnings.push(warning);
                    RunResult::SucceededWithWarnings(warnings)
                }
                other => other,
            };
        }

        if let Err(e) = guard.release() {
            report.warning(format!("Could not release pid file: {}", e));
        }

        result
    }

    fn execute(
        &self,
        machine: &mut RunStateMachine,
        report: &mut RunReport,
        cleanup: &mut Cleanup,
    ) -> Result<Vec<RunWarning>, Stop> {
        let config = self.config;
        let started = Instant::now();

        machine.transition(RunPhase::Discovery)?;
        self.checkpoint()?;
        let catalog = self.discover(report)?;
        report.stats_mut().files_found = catalog.len();

        machine.transition(RunPhase::CapacityCheck)?;
        self.checkpoint()?;
        let capacity = capacity::plan(self.space, &config.source_base, &catalog, &config.dest_root)
            .map_err(|e| Stop::Failed(FailureKind::Unexpected, format!("{:?}", e)))?;
        report.stats_mut().bytes_required = Some(capacity.required_bytes);
        if !capacity.is_sufficient() {
            report.error(format!(
                "Insufficient space under {} to hold total archive size of {}B! Free {}B to allow archive",
                config.dest_root.display(),
                human_size(capacity.required_bytes),
                human_size(capacity.shortfall())
            ));
            return Err(Stop::Failed(
                FailureKind::InsufficientCapacity,
                format!(
                    "Please free at least {}B on {}",
                    human_size(capacity.shortfall()),
                    config.dest_root.display()
                ),
            ));
        }

        machine.transition(RunPhase::KeyResolve)?;
        self.checkpoint()?;
        let recipient = self.resolve_recipient(report)?;

        let now = self.run_time.unwrap_or_else(Local::now);
        let destination = config
            .destination_base(&now)
            .map_err(|e| Stop::Failed(FailureKind::Unexpected, format!("{:?}", e)))?;
        report.stats_mut().destination = Some(destination.clone());

        let working = match config.temp_base {
            Some(ref temp_base) => {
                machine.transition(RunPhase::Staging)?;
                self.checkpoint()?;
                self.stage(temp_base, &catalog, report, cleanup)?
            }
            None => WorkingBase::Source(config.source_base.clone()),
        };

        machine.transition(RunPhase::Publishing)?;
        self.checkpoint()?;
        report.info(format!("Encrypting files for {}", recipient));
        let published = EncryptionPublisher::new(self.encryptor).publish(
            &catalog,
            working.path(),
            &destination,
            &recipient,
            &self.cancel,
            report,
        );
        report.stats_mut().files_published = published.published();
        report.stats_mut().files_skipped = published.skipped();
        if published.canceled {
            return Err(Stop::Canceled);
        }

        report.debug(format!(
            "Completed archiving of {}B after {}",
            human_size(capacity.required_bytes),
            format_elapsed(started.elapsed().as_secs())
        ));

        let mut warnings = Vec::new();
        if published.skipped() > 0 {
            warnings.push(RunWarning::FilesSkipped {
                count: published.skipped(),
            });
        }

        machine.transition(RunPhase::FinalCapacityCheck)?;
        self.checkpoint()?;
        if let Some(warning) = self.recheck_capacity(&catalog, report) {
            warnings.push(warning);
        }

        Ok(warnings)
    }

    fn checkpoint(&self) -> Result<(), Stop> {
        if self.cancel.is_canceled() {
            Err(Stop::Canceled)
        } else {
            Ok(())
        }
    }

    fn discover(&self, report: &mut RunReport) -> Result<Catalog, Stop> {
        let config = self.config;
        match catalog::discover(&config.source_match, &config.source_base) {
            Ok(catalog) if catalog.is_empty() => {
                report.warning(format!(
                    "No suitable files matching {} found in {}",
                    config.source_match,
                    config.source_base.display()
                ));
                Err(Stop::Failed(
                    FailureKind::NoFilesFound,
                    format!(
                        "no files matching '{}' under {}",
                        config.source_match,
                        config.source_base.display()
                    ),
                ))
            }
            Ok(catalog) => Ok(catalog),
            Err(e @ DiscoveryError::Pattern(_)) => {
                Err(Stop::Failed(FailureKind::Unexpected, format!("{:?}", e)))
            }
            Err(e) => {
                report.error(format!(
                    "Could not read source base {}: {}",
                    config.source_base.display(),
                    e
                ));
                Err(Stop::Failed(FailureKind::SourceUnreadable, e.to_string()))
            }
        }
    }

    fn resolve_recipient(&self, report: &mut RunReport) -> Result<Recipient, Stop> {
        self.resolver.resolve(&self.config.encrypt_to).map_err(|e| {
            report.error(format!("Could not find key for ID {}", self.config.encrypt_to));
            Stop::Failed(FailureKind::RecipientKeyNotFound, e.to_string())
        })
    }

    fn stage(
        &self,
        temp_base: &Path,
        catalog: &Catalog,
        report: &mut RunReport,
        cleanup: &mut Cleanup,
    ) -> Result<WorkingBase, Stop> {
        report.info(format!(
            "Copying from {} to temporary location {}",
            self.config.source_base.display(),
            temp_base.display()
        ));

        let mut area = StagingArea::new(temp_base);
        let staged = area.stage(catalog, &self.config.source_base, &self.cancel);
        // Registered on every path so a partial stage is still cleared.
        if self.config.clears_staging() {
            cleanup.staging = Some(area);
        }

        match staged {
            Ok(working) => Ok(working),
            Err(StagingError::Canceled { staged }) => {
                debug!(staged, "staging interrupted by cancellation");
                Err(Stop::Canceled)
            }
            Err(e) => {
                report.error(format!("Could not copy sources to temporary location: {}", e));
                Err(Stop::Failed(FailureKind::StagingFailed, e.to_string()))
            }
        }
    }

    /// Post-archive check: would another run of the same size still fit?
    fn recheck_capacity(&self, catalog: &Catalog, report: &mut RunReport) -> Option<RunWarning> {
        let config = self.config;
        match capacity::plan(self.space, &config.source_base, catalog, &config.dest_root) {
            Ok(capacity) if capacity.is_sufficient() => None,
            Ok(capacity) => {
                report.error(format!(
                    "Preemptive notice: Next archive may fail!  Low space on {} - Please free {}B before next archive",
                    config.dest_root.display(),
                    human_size(capacity.shortfall())
                ));
                Some(RunWarning::LowCapacityForNextRun {
                    shortfall_bytes: capacity.shortfall(),
                })
            }
            Err(e) => {
                report.warning(format!("Could not recheck destination capacity: {}", e));
                Some(RunWarning::CapacityRecheckFailed {
                    detail: e.to_string(),
                })
            }
        }
    }

    fn clear_staging(&self, cleanup: &Cleanup, report: &mut RunReport) -> Option<RunWarning> {
        let area = cleanup.staging.as_ref()?;
        match area.clear() {
            Ok(removed) => {
                report.debug(format!(
                    "Cleared {} staged file(s) from {}",
                    removed,
                    area.root().display()
                ));
                None
            }
            Err(e) => {
                report.warning(format!("Could not clear temporary files: {}", e));
                Some(RunWarning::CleanupFailed {
                    detail: e.to_string(),
                })
            }
        }
    }

    fn conclude(&self, outcome: Result<Vec<RunWarning>, Stop>, report: &mut RunReport) -> RunResult {
        match outcome {
            Ok(warnings) if warnings.is_empty() => RunResult::Succeeded,
            Ok(warnings) => RunResult::SucceededWithWarnings(warnings),
            Err(Stop::Canceled) => {
                report.info("Archive canceled by user".to_string());
                RunResult::Canceled
            }
            Err(Stop::Failed(FailureKind::Unexpected, detail)) => {
                report.emit(
                    EventLevel::Critical,
                    format!("Unexpected errors were encountered: {}", detail),
                );
                RunResult::failed(FailureKind::Unexpected, detail)
            }
            Err(Stop::Failed(kind, detail)) => RunResult::failed(kind, detail),
        }
    }
}

/// Render whole seconds as `H:MM:SS`.
fn format_elapsed(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}
