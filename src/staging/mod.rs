//! Staging copy of the catalog
//!
//! Copies every cataloged file into a private temporary tree before
//! encryption so the originals are neither read for a long time nor
//! depended on while encrypting. A copy failure aborts staging: a partially
//! staged set is not safe to encrypt from.
//!
//! The staging root must not overlap the source tree, and clearing only
//! touches files this area copied itself.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::catalog::{Catalog, FileRef};
use crate::signal::CancelToken;

/// Errors for staging operations
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("staging directory {root} overlaps source tree {source_base}")]
    OverlapsSource { root: PathBuf, source_base: PathBuf },

    #[error("cannot create staging directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot remove staged file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("staging canceled after {staged} file(s)")]
    Canceled { staged: usize },
}

/// The source root used for encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkingBase {
    /// Encrypt straight from the original tree
    Source(PathBuf),
    /// Encrypt from a staged copy
    Staged(PathBuf),
}

impl WorkingBase {
    pub fn path(&self) -> &Path {
        match self {
            WorkingBase::Source(path) | WorkingBase::Staged(path) => path,
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, WorkingBase::Staged(_))
    }
}

/// Create `path` and its parents; an existing directory is not an error.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resolve symlinks through the deepest existing ancestor of `path`.
fn real_path(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if let Ok(real) = fs::canonicalize(ancestor) {
            if let Ok(rest) = path.strip_prefix(ancestor) {
                return real.join(rest);
            }
        }
    }
    path.to_path_buf()
}

/// True when one path is equal to or nested inside the other.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    let a = real_path(a);
    let b = real_path(b);
    a.starts_with(&b) || b.starts_with(&a)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Private working copy rooted at `temp_base`
#[derive(Debug, Clone)]
pub struct StagingArea {
    temp_base: PathBuf,
    staged: Vec<FileRef>,
}

impl StagingArea {
    pub fn new(temp_base: impl Into<PathBuf>) -> Self {
        Self {
            temp_base: temp_base.into(),
            staged: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.temp_base
    }

    /// Files copied by this area so far
    pub fn staged(&self) -> &[FileRef] {
        &self.staged
    }

    /// Copy every catalog entry from `source_base` into the staging root.
    ///
    /// `cancel` is checked before each file so a termination request does
    /// not have to wait for the whole copy. Files copied before an error
    /// stay recorded in [`StagingArea::staged`].
    pub fn stage(
        &mut self,
        catalog: &Catalog,
        source_base: &Path,
        cancel: &CancelToken,
    ) -> Result<WorkingBase, StagingError> {
        if paths_overlap(&self.temp_base, source_base) {
            return Err(StagingError::OverlapsSource {
                root: self.temp_base.clone(),
                source_base: source_base.to_path_buf(),
            });
        }

        for file in catalog {
            if cancel.is_canceled() {
                return Err(StagingError::Canceled {
                    staged: self.staged.len(),
                });
            }
            self.stage_one(file, source_base)?;
            self.staged.push(file.clone());
        }

        debug!(
            files = self.staged.len(),
            root = %self.temp_base.display(),
            "staging complete"
        );
        Ok(WorkingBase::Staged(self.temp_base.clone()))
    }

    fn stage_one(&self, file: &FileRef, source_base: &Path) -> Result<(), StagingError> {
        let dir = file.dir_under(&self.temp_base);
        ensure_dir(&dir).map_err(|source| StagingError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let from = file.resolve(source_base);
        let to = dir.join(&file.name);
        if same_file(&from, &to) {
            return Err(StagingError::Copy {
                from,
                to,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "source and staging target are the same file",
                ),
            });
        }
        fs::copy(&from, &to).map_err(|source| StagingError::Copy { from, to, source })?;
        Ok(())
    }

    /// Remove the staged copy of every file this area copied.
    ///
    /// Directories are left in place. A file that is already gone counts as
    /// cleared, so calling this twice is harmless. Other removal failures are
    /// collected; the first one is returned after every file was attempted.
    pub fn clear(&self) -> Result<usize, StagingError> {
        let mut removed = 0;
        let mut first_error = None;

        for file in &self.staged {
            let path = file.resolve(&self.temp_base);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "failed to remove staged file");
                    if first_error.is_none() {
                        first_error = Some(StagingError::Remove { path, source });
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }
}
