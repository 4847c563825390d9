//! Single-instance guard backed by a pid file
//!
//! A run owns the pid file from a successful [`RunGuard::acquire`] until
//! [`RunGuard::release`]. A recorded pid that still names a live process
//! blocks acquisition and the file is left untouched; an absent, unreadable
//! or stale pid file is taken over.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Errors for guard operations
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("another instance (pid {pid}) is already running; remove {path} if this is wrong")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("cannot write pid file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot remove pid file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the pid file currently says
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recorded {
    Absent,
    Pid(u32),
    Unreadable,
}

fn read_recorded(path: &Path) -> Recorded {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse::<u32>()
            .map(Recorded::Pid)
            .unwrap_or(Recorded::Unreadable),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Recorded::Absent,
        Err(_) => Recorded::Unreadable,
    }
}

/// Check whether `pid` names a live process.
///
/// Uses `kill(pid, 0)`, which probes without delivering a signal. EPERM
/// means the process exists under another user and counts as alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

/// Ownership of the pid file for the duration of a run
#[derive(Debug)]
pub struct RunGuard {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl RunGuard {
    /// Claim the pid file at `path` for the current process.
    pub fn acquire(path: &Path) -> Result<Self, GuardError> {
        Self::acquire_as(path, std::process::id())
    }

    /// Claim the pid file for an explicit pid.
    pub fn acquire_as(path: &Path, pid: u32) -> Result<Self, GuardError> {
        // Two attempts: the file may appear between our read and create_new.
        for _ in 0..2 {
            match read_recorded(path) {
                Recorded::Pid(recorded) if is_process_alive(recorded) => {
                    return Err(GuardError::AlreadyRunning {
                        pid: recorded,
                        path: path.to_path_buf(),
                    });
                }
                Recorded::Pid(stale) => {
                    debug!(pid = stale, path = %path.display(), "replacing stale pid file");
                    overwrite_pid(path, pid)?;
                    return Ok(Self::owned(path, pid));
                }
                Recorded::Unreadable => {
                    warn!(path = %path.display(), "pid file unreadable, taking it over");
                    overwrite_pid(path, pid)?;
                    return Ok(Self::owned(path, pid));
                }
                Recorded::Absent => match create_pid(path, pid) {
                    Ok(()) => return Ok(Self::owned(path, pid)),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(source) => {
                        return Err(GuardError::Write {
                            path: path.to_path_buf(),
                            source,
                        })
                    }
                },
            }
        }

        Err(GuardError::Write {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::WouldBlock,
                "pid file changed repeatedly during acquisition",
            ),
        })
    }

    fn owned(path: &Path, pid: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            pid,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Delete the pid file.
    ///
    /// The file is only removed while it still records our pid; if another
    /// process has since replaced it, it is left alone.
    pub fn release(mut self) -> Result<(), GuardError> {
        self.released = true;
        remove_if_owned(&self.path, self.pid)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Backstop for unwinding; the coordinator releases explicitly.
        if !self.released {
            if let Err(e) = remove_if_owned(&self.path, self.pid) {
                warn!(error = %e, "failed to release pid file during unwind");
            }
        }
    }
}

fn create_pid(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(file, "{}", pid)?;
    file.sync_all()
}

fn overwrite_pid(path: &Path, pid: u32) -> Result<(), GuardError> {
    fs::write(path, pid.to_string()).map_err(|source| GuardError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_if_owned(path: &Path, pid: u32) -> Result<(), GuardError> {
    match read_recorded(path) {
        Recorded::Pid(recorded) if recorded == pid => {}
        Recorded::Absent => return Ok(()),
        other => {
            warn!(path = %path.display(), recorded = ?other, "pid file no longer ours, leaving it");
            return Ok(());
        }
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(GuardError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
