//! End-to-end archive runs
//!
//! Drives `RunCoordinator` against temporary trees with in-process fakes for
//! the encryption backend, the keyring and destination free space:
//! - the four reference scenarios (clean run, low space, one bad file,
//!   already running)
//! - atomic publication under injected faults
//! - staging and cleanup guarantees
//! - cancellation

use std::cell::{Cell, RefCell};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use encarch::capacity::SpaceProbe;
use encarch::config::ArchiveConfig;
use encarch::report::{EventLevel, RunReport};
use encarch::run::{ExitCode, FailureKind, RunCoordinator, RunResult, RunWarning};
use encarch::signal::CancelToken;
use encarch_crypto::{CryptoError, CryptoResult, Encryptor, Recipient, RecipientResolver};
use tempfile::TempDir;

const KEY_SUFFIX: &str = "CCCCDDDD";
const DATE_DIR: &str = "2024-05";

// =============================================================================
// Fakes
// =============================================================================

/// Writes `ENC:` followed by the plaintext; fails for plaintexts containing
/// any of `fail_on`, after writing half of the output.
#[derive(Default)]
struct FakeEncryptor {
    fail_on: Vec<&'static str>,
    calls: Cell<usize>,
    final_visible_while_writing: Cell<bool>,
    /// Cancel this token once the given number of files were encrypted
    cancel_after: Option<(usize, CancelToken)>,
}

impl FakeEncryptor {
    fn failing_on(needles: &[&'static str]) -> Self {
        Self {
            fail_on: needles.to_vec(),
            ..Self::default()
        }
    }
}

impl Encryptor for FakeEncryptor {
    fn encrypt_to_file(
        &self,
        source: &mut dyn Read,
        _recipient: &Recipient,
        output: &Path,
    ) -> CryptoResult<()> {
        self.calls.set(self.calls.get() + 1);

        let mut plain = Vec::new();
        source.read_to_end(&mut plain)?;

        let mut out = File::create(output)?;
        out.write_all(b"ENC:")?;

        let final_path = output.with_extension("");
        if final_path.exists() {
            self.final_visible_while_writing.set(true);
        }

        let text = String::from_utf8_lossy(&plain);
        if self.fail_on.iter().any(|needle| text.contains(needle)) {
            out.write_all(&plain[..plain.len() / 2])?;
            return Err(CryptoError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected encryption fault",
            )));
        }
        out.write_all(&plain)?;

        if let Some((after, ref token)) = self.cancel_after {
            if self.calls.get() >= after {
                token.cancel();
            }
        }
        Ok(())
    }
}

struct FakeKeyring {
    keys: Vec<Recipient>,
}

impl FakeKeyring {
    fn with_test_key() -> Self {
        Self {
            keys: vec![Recipient::new(
                "0123456789ABCDEF0123456789ABCDEFCCCCDDDD",
                "Archive Key <archive@example.com>",
            )],
        }
    }

    fn empty() -> Self {
        Self { keys: Vec::new() }
    }
}

impl RecipientResolver for FakeKeyring {
    fn resolve(&self, suffix: &str) -> CryptoResult<Recipient> {
        self.keys
            .iter()
            .find(|key| encarch_crypto::matches_suffix(&key.fingerprint, suffix))
            .cloned()
            .ok_or_else(|| CryptoError::RecipientNotFound(suffix.to_string()))
    }
}

/// Reports a fixed free-space figure for every check
struct FixedSpace(u64);

impl SpaceProbe for FixedSpace {
    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Reports successive figures, repeating the last one
struct SpaceSequence {
    figures: Vec<u64>,
    calls: RefCell<usize>,
}

impl SpaceProbe for SpaceSequence {
    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        let mut calls = self.calls.borrow_mut();
        let figure = self.figures[(*calls).min(self.figures.len() - 1)];
        *calls += 1;
        Ok(figure)
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    temp: TempDir,
    config: ArchiveConfig,
}

impl Fixture {
    /// Source tree with `files` (relative path, contents) and an empty
    /// destination root.
    fn new(files: &[(&str, &str)]) -> Self {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        fs::create_dir_all(&source).unwrap();
        for (rel, body) in files {
            let path = source.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        fs::create_dir_all(temp.path().join("dest")).unwrap();

        let config = ArchiveConfig::new(
            KEY_SUFFIX,
            source,
            "*.txt",
            temp.path().join("dest"),
            temp.path().join("encarch.pid"),
        );
        Self { temp, config }
    }

    fn with_staging(mut self, preserve: bool) -> Self {
        self.config.temp_base = Some(self.temp.path().join("staging"));
        self.config.temp_preserve = preserve;
        self
    }

    fn dest_base(&self) -> PathBuf {
        self.config.dest_root.join(DATE_DIR)
    }

    fn staging(&self) -> PathBuf {
        self.temp.path().join("staging")
    }

    fn run(
        &self,
        encryptor: &dyn Encryptor,
        keyring: &dyn RecipientResolver,
        space: &dyn SpaceProbe,
        cancel: CancelToken,
    ) -> (RunResult, RunReport) {
        let mut report = RunReport::new("test", EventLevel::Debug);
        let result = RunCoordinator::new(&self.config, encryptor, keyring)
            .with_space_probe(space)
            .with_cancel_token(cancel)
            .with_run_time(Local.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap())
            .run(&mut report);
        (result, report)
    }
}

fn hundred(ch: char) -> String {
    std::iter::repeat(ch).take(100).collect()
}

fn files_under(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let mut found: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    found.sort();
    found
}

fn three_files() -> Fixture {
    let a = hundred('a');
    let b = hundred('b');
    let c = hundred('c');
    Fixture::new(&[
        ("a.txt", a.as_str()),
        ("logs/b.txt", b.as_str()),
        ("logs/old/c.txt", c.as_str()),
        ("notes.md", "not matched"),
    ])
}

// =============================================================================
// Scenario 1: clean run
// =============================================================================

#[test]
fn test_clean_run_publishes_every_file() {
    let fixture = three_files();
    let encryptor = FakeEncryptor::default();

    let (result, report) = fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result, RunResult::Succeeded);
    assert_eq!(result.exit_code(), ExitCode::Success);
    assert_eq!(
        files_under(&fixture.dest_base()),
        vec![
            PathBuf::from("a.txt.gpg"),
            PathBuf::from("logs/b.txt.gpg"),
            PathBuf::from("logs/old/c.txt.gpg"),
        ]
    );
    let artifact = fs::read_to_string(fixture.dest_base().join("logs/b.txt.gpg")).unwrap();
    assert_eq!(artifact, format!("ENC:{}", hundred('b')));

    assert_eq!(report.stats().files_found, 3);
    assert_eq!(report.stats().files_published, 3);
    assert_eq!(report.stats().bytes_required, Some(300));
    assert_eq!(report.stats().destination, Some(fixture.dest_base()));
    assert!(report.alert_notice().is_none());
    assert!(!fixture.config.pid_file.exists(), "pid file released");
}

// =============================================================================
// Scenario 2: insufficient capacity before the run
// =============================================================================

#[test]
fn test_low_space_aborts_before_any_work() {
    let fixture = three_files().with_staging(false);
    let encryptor = FakeEncryptor::default();

    let (result, report) = fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(100),
        CancelToken::new(),
    );

    assert_eq!(result.failure_kind(), Some(FailureKind::InsufficientCapacity));
    assert_eq!(result.exit_code(), ExitCode::InsufficientCapacity);
    assert_eq!(encryptor.calls.get(), 0);
    assert!(!fixture.dest_base().exists());
    assert!(files_under(&fixture.staging()).is_empty());
    assert_eq!(report.max_level(), Some(EventLevel::Error));
    assert!(report
        .events()
        .iter()
        .any(|e| e.message.contains("Free 200B to allow archive")));
    assert!(!fixture.config.pid_file.exists());
}

// =============================================================================
// Scenario 3: one file fails to encrypt
// =============================================================================

#[test]
fn test_encryption_failure_skips_only_that_file() {
    let fixture = Fixture::new(&[("one.txt", "good data"), ("two.txt", "BROKEN data")]);
    let encryptor = FakeEncryptor::failing_on(&["BROKEN"]);

    let (result, report) = fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(
        result,
        RunResult::SucceededWithWarnings(vec![RunWarning::FilesSkipped { count: 1 }])
    );
    assert_eq!(result.exit_code(), ExitCode::Warnings);
    assert_eq!(encryptor.calls.get(), 2);
    assert_eq!(files_under(&fixture.dest_base()), vec![PathBuf::from("one.txt.gpg")]);
    assert!(!fixture.dest_base().join("two.txt.gpg.tmp").exists());
    assert_eq!(report.stats().files_published, 1);
    assert_eq!(report.stats().files_skipped, 1);
    assert_eq!(report.max_level(), Some(EventLevel::Warning));
}

#[test]
fn test_final_name_never_visible_during_encryption() {
    let fixture = Fixture::new(&[("a.txt", "fine"), ("b.txt", "BROKEN"), ("c.txt", "fine too")]);
    let encryptor = FakeEncryptor::failing_on(&["BROKEN"]);

    fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert!(!encryptor.final_visible_while_writing.get());
    assert!(!fixture.dest_base().join("b.txt.gpg").exists());
    let leftovers: Vec<_> = files_under(&fixture.dest_base())
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
}

// =============================================================================
// Scenario 4: already running
// =============================================================================

#[test]
fn test_live_pid_file_blocks_run() {
    let fixture = three_files();
    let own_pid = std::process::id().to_string();
    fs::write(&fixture.config.pid_file, &own_pid).unwrap();
    let encryptor = FakeEncryptor::default();

    let (result, report) = fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result.failure_kind(), Some(FailureKind::AlreadyRunning));
    assert_eq!(result.exit_code(), ExitCode::AlreadyRunning);
    assert_eq!(fs::read_to_string(&fixture.config.pid_file).unwrap(), own_pid);
    assert_eq!(encryptor.calls.get(), 0);
    assert_eq!(report.stats().files_found, 0, "no discovery");
    assert!(!fixture.dest_base().exists());
}

#[test]
fn test_stale_pid_file_is_taken_over() {
    let fixture = three_files();
    fs::write(&fixture.config.pid_file, i32::MAX.to_string()).unwrap();

    let (result, _) = fixture.run(
        &FakeEncryptor::default(),
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result, RunResult::Succeeded);
    assert!(!fixture.config.pid_file.exists());
}

// =============================================================================
// Other fatal conditions
// =============================================================================

#[test]
fn test_missing_key_aborts_before_staging() {
    let fixture = three_files().with_staging(true);
    let encryptor = FakeEncryptor::default();

    let (result, _) = fixture.run(
        &encryptor,
        &FakeKeyring::empty(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result.failure_kind(), Some(FailureKind::RecipientKeyNotFound));
    assert!(files_under(&fixture.staging()).is_empty());
    assert_eq!(encryptor.calls.get(), 0);
}

#[test]
fn test_no_matching_files() {
    let fixture = Fixture::new(&[("readme.md", "x")]);

    let (result, report) = fixture.run(
        &FakeEncryptor::default(),
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result.failure_kind(), Some(FailureKind::NoFilesFound));
    assert_eq!(result.exit_code(), ExitCode::NoFilesFound);
    assert!(report
        .events()
        .iter()
        .any(|e| e.message.starts_with("No suitable files matching *.txt")));
}

#[test]
fn test_missing_source_base() {
    let mut fixture = three_files();
    fixture.config.source_base = fixture.temp.path().join("gone");

    let (result, _) = fixture.run(
        &FakeEncryptor::default(),
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result.failure_kind(), Some(FailureKind::SourceUnreadable));
    assert!(!fixture.config.pid_file.exists());
}

// =============================================================================
// Staging
// =============================================================================

#[test]
fn test_staged_copies_cleared_after_run() {
    let fixture = three_files().with_staging(false);

    let (result, _) = fixture.run(
        &FakeEncryptor::default(),
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result, RunResult::Succeeded);
    assert!(files_under(&fixture.staging()).is_empty());
    // Directories stay; only files are removed
    assert!(fixture.staging().join("logs/old").is_dir());
    assert_eq!(files_under(&fixture.dest_base()).len(), 3);
}

#[test]
fn test_preserved_staging_is_kept() {
    let fixture = three_files().with_staging(true);

    let (result, _) = fixture.run(
        &FakeEncryptor::default(),
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result, RunResult::Succeeded);
    assert_eq!(
        files_under(&fixture.staging()),
        vec![
            PathBuf::from("a.txt"),
            PathBuf::from("logs/b.txt"),
            PathBuf::from("logs/old/c.txt"),
        ]
    );
}

#[test]
fn test_staging_cleared_after_publish_failures() {
    let fixture = Fixture::new(&[("one.txt", "ok"), ("two.txt", "BROKEN")]).with_staging(false);

    let (result, _) = fixture.run(
        &FakeEncryptor::failing_on(&["BROKEN"]),
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert!(result.is_success());
    assert!(files_under(&fixture.staging()).is_empty());
}

#[test]
fn test_staging_into_source_base_leaves_sources_intact() {
    let mut fixture = three_files();
    fixture.config.temp_base = Some(fixture.config.source_base.clone());
    fixture.config.temp_preserve = false;
    let encryptor = FakeEncryptor::default();

    let (result, _) = fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result.failure_kind(), Some(FailureKind::StagingFailed));
    let source = &fixture.config.source_base;
    assert_eq!(fs::read_to_string(source.join("a.txt")).unwrap(), hundred('a'));
    assert_eq!(fs::read_to_string(source.join("logs/b.txt")).unwrap(), hundred('b'));
    assert_eq!(fs::read_to_string(source.join("logs/old/c.txt")).unwrap(), hundred('c'));
    assert_eq!(encryptor.calls.get(), 0);
    assert!(files_under(&fixture.dest_base()).is_empty());
    assert!(!fixture.config.pid_file.exists());
}

#[test]
fn test_failed_staging_clears_only_staged_copies() {
    let fixture = three_files().with_staging(false);
    // a.txt is staged, then the copy of logs/b.txt fails on a directory
    fs::create_dir_all(fixture.staging().join("logs/b.txt")).unwrap();
    fs::create_dir_all(fixture.staging().join("logs/old")).unwrap();
    fs::write(fixture.staging().join("logs/old/c.txt"), "operator copy").unwrap();

    let (result, _) = fixture.run(
        &FakeEncryptor::default(),
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        CancelToken::new(),
    );

    assert_eq!(result.failure_kind(), Some(FailureKind::StagingFailed));
    assert!(!fixture.staging().join("a.txt").exists());
    assert_eq!(
        fs::read_to_string(fixture.staging().join("logs/old/c.txt")).unwrap(),
        "operator copy"
    );
    assert!(!fixture.config.pid_file.exists());
}

// =============================================================================
// Post-run capacity
// =============================================================================

#[test]
fn test_low_space_after_run_is_a_warning() {
    let fixture = three_files();
    let space = SpaceSequence {
        figures: vec![1000, 250],
        calls: RefCell::new(0),
    };

    let (result, report) = fixture.run(
        &FakeEncryptor::default(),
        &FakeKeyring::with_test_key(),
        &space,
        CancelToken::new(),
    );

    assert_eq!(
        result,
        RunResult::SucceededWithWarnings(vec![RunWarning::LowCapacityForNextRun {
            shortfall_bytes: 50
        }])
    );
    assert_eq!(files_under(&fixture.dest_base()).len(), 3);
    assert_eq!(report.max_level(), Some(EventLevel::Error));

    let summary = report.finish(&result, "[encarch]");
    assert_eq!(
        summary.subject,
        "[encarch] (ERROR ALERT) Destination Capacity Insufficient"
    );
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_before_start() {
    let fixture = three_files();
    let token = CancelToken::new();
    token.cancel();
    let encryptor = FakeEncryptor::default();

    let (result, report) = fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        token,
    );

    assert_eq!(result, RunResult::Canceled);
    assert_eq!(result.exit_code().as_i32(), 80);
    assert_eq!(encryptor.calls.get(), 0);
    assert!(!fixture.config.pid_file.exists());
    assert!(report.alert_notice().is_none(), "cancel is not an alarm");
}

#[test]
fn test_cancel_during_publishing_keeps_published_and_cleans_up() {
    let fixture = three_files().with_staging(false);
    let token = CancelToken::new();
    let encryptor = FakeEncryptor {
        cancel_after: Some((1, token.clone())),
        ..FakeEncryptor::default()
    };

    let (result, report) = fixture.run(
        &encryptor,
        &FakeKeyring::with_test_key(),
        &FixedSpace(1000),
        token,
    );

    assert_eq!(result, RunResult::Canceled);
    assert_eq!(encryptor.calls.get(), 1);
    assert_eq!(files_under(&fixture.dest_base()), vec![PathBuf::from("a.txt.gpg")]);
    assert_eq!(report.stats().files_published, 1);
    assert!(files_under(&fixture.staging()).is_empty(), "staging cleared");
    assert!(!fixture.config.pid_file.exists(), "pid file released");
}
