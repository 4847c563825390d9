//! encarch - encrypt-and-archive
//!
//! Scans a source tree for files matching a glob, optionally stages them,
//! encrypts each one for a single recipient and publishes the ciphertext
//! into a dated destination tree. Capacity is checked before and after the
//! run, every artifact is published atomically, and one bad file never
//! aborts the rest of the run.

pub mod capacity;
pub mod catalog;
pub mod config;
pub mod guard;
pub mod logging;
pub mod publish;
pub mod report;
pub mod run;
pub mod signal;
pub mod staging;

pub use catalog::{discover, Catalog, FileRef};
pub use config::{ArchiveConfig, ConfigError, ConfigOverrides};
pub use report::{EventLevel, EventSink, RunReport, RunSummary};
pub use run::{ExitCode, FailureKind, RunCoordinator, RunResult, RunWarning};
pub use signal::{CancelToken, SignalHandler};

pub use encarch_crypto::{Encryptor, GpgBackend, Recipient, RecipientResolver};
