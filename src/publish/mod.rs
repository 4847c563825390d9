//! Encrypt-and-publish protocol
//!
//! For every catalog entry, independently:
//! 1. create the mirrored destination directory
//! 2. open the working copy read-only
//! 3. encrypt into `<name>.<ext>.tmp` next to the final location
//! 4. flush the temp file and rename it to `<name>.<ext>`
//!
//! Readers of the destination tree therefore see either nothing or a
//! complete artifact at the final name. Any step failing skips that one
//! file (its temp file is removed) and the pass continues with the next.

mod outcome;

pub use outcome::{PublishOutcome, PublishReport, SkipReason};

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use encarch_crypto::{Encryptor, Recipient, ARTIFACT_EXTENSION};

use crate::catalog::{Catalog, FileRef};
use crate::report::EventSink;
use crate::signal::CancelToken;
use crate::staging::ensure_dir;

/// Suffix of in-progress artifacts
pub const TEMP_SUFFIX: &str = ".tmp";

/// Final and temporary artifact paths for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
}

impl ArtifactPaths {
    /// Paths for `file` published under `destination_base` with `extension`.
    pub fn for_file(file: &FileRef, destination_base: &Path, extension: &str) -> Self {
        let dir = file.dir_under(destination_base);

        let mut final_name = OsString::from(&file.name);
        final_name.push(".");
        final_name.push(extension);

        let mut temp_name = final_name.clone();
        temp_name.push(TEMP_SUFFIX);

        Self {
            final_path: dir.join(final_name),
            temp_path: dir.join(temp_name),
        }
    }
}

/// Publishes encrypted artifacts for a catalog
pub struct EncryptionPublisher<'a> {
    encryptor: &'a dyn Encryptor,
    extension: String,
}

impl<'a> EncryptionPublisher<'a> {
    pub fn new(encryptor: &'a dyn Encryptor) -> Self {
        Self {
            encryptor,
            extension: ARTIFACT_EXTENSION.to_string(),
        }
    }

    /// Override the artifact extension (without the leading dot).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Encrypt every catalog entry from `working_base` into
    /// `destination_base` for `recipient`.
    ///
    /// Unless canceled, the report holds exactly one outcome per catalog
    /// entry. Cancellation is checked before each file; files already
    /// published stay published.
    pub fn publish(
        &self,
        catalog: &Catalog,
        working_base: &Path,
        destination_base: &Path,
        recipient: &Recipient,
        cancel: &CancelToken,
        events: &mut dyn EventSink,
    ) -> PublishReport {
        let mut report = PublishReport::default();

        for file in catalog {
            if cancel.is_canceled() {
                events.info(format!(
                    "Publishing canceled after {} of {} file(s)",
                    report.outcomes.len(),
                    catalog.len()
                ));
                report.canceled = true;
                break;
            }
            let outcome = self.publish_one(file, working_base, destination_base, recipient, events);
            report.outcomes.push(outcome);
        }

        report
    }

    fn publish_one(
        &self,
        file: &FileRef,
        working_base: &Path,
        destination_base: &Path,
        recipient: &Recipient,
        events: &mut dyn EventSink,
    ) -> PublishOutcome {
        let skip = |reason: SkipReason| PublishOutcome::Skipped {
            file: file.clone(),
            reason,
        };

        let dest_dir = file.dir_under(destination_base);
        if let Err(e) = ensure_dir(&dest_dir) {
            events.warning(format!(
                "Could not build destination folders under {}: Skipping {}",
                dest_dir.display(),
                file
            ));
            return skip(SkipReason::DirectoryCreateFailed(e.to_string()));
        }

        let source_path = file.resolve(working_base);
        let source = match File::open(&source_path) {
            Ok(source) => source,
            Err(e) => {
                events.warning(format!(
                    "Could not open source {} for reading: Skipping",
                    source_path.display()
                ));
                return skip(SkipReason::SourceUnreadable(e.to_string()));
            }
        };

        let paths = ArtifactPaths::for_file(file, destination_base, &self.extension);

        let mut reader = BufReader::new(source);
        if let Err(e) = self
            .encryptor
            .encrypt_to_file(&mut reader, recipient, &paths.temp_path)
        {
            events.warning(format!(
                "Problem while encrypting {}: \"{}\" - Skipping",
                source_path.display(),
                e
            ));
            discard_temp(&paths.temp_path, events);
            return skip(SkipReason::EncryptionFailed(e.to_string()));
        }

        if let Err(e) = commit(&paths) {
            events.warning(format!(
                "Could not move {} into place: {} - Skipping",
                paths.temp_path.display(),
                e
            ));
            discard_temp(&paths.temp_path, events);
            return skip(SkipReason::PublishFailed(e.to_string()));
        }

        events.info(format!(
            "Completed encrypting file {}",
            paths.final_path.display()
        ));
        PublishOutcome::Published {
            file: file.clone(),
            path: paths.final_path,
        }
    }
}

/// Flush the finished temp file and atomically rename it to its final name.
fn commit(paths: &ArtifactPaths) -> io::Result<()> {
    File::open(&paths.temp_path)?.sync_all()?;
    fs::rename(&paths.temp_path, &paths.final_path)
}

/// Best-effort removal of a temp artifact; a missing file is fine.
fn discard_temp(path: &Path, events: &mut dyn EventSink) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => events.warning(format!(
            "Could not remove temporary file {}: {}",
            path.display(),
            e
        )),
    }
}
