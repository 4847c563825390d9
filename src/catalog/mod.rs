//! Source file discovery
//!
//! Walks a source tree and records every regular file whose name matches a
//! shell glob (`*`, `?`, `[...]`). Each hit is stored relative to the base
//! path so the same catalog can be resolved against the original tree, a
//! staging copy, or the destination tree.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Errors for discovery
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("source base {path} is not readable: {source}")]
    BaseUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source base {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("invalid file pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// One source file, identified relative to a base path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRef {
    /// File name (last path component)
    pub name: OsString,
    /// Containing directory relative to the base ("" for the base itself)
    pub relative_dir: PathBuf,
}

impl FileRef {
    pub fn new(name: impl Into<OsString>, relative_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            relative_dir: relative_dir.into(),
        }
    }

    /// Path of the file relative to any base
    pub fn relative_path(&self) -> PathBuf {
        self.relative_dir.join(&self.name)
    }

    /// Absolute location of the file under `base`
    pub fn resolve(&self, base: &Path) -> PathBuf {
        base.join(&self.relative_dir).join(&self.name)
    }

    /// Directory holding the file under `base`
    pub fn dir_under(&self, base: &Path) -> PathBuf {
        base.join(&self.relative_dir)
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path().display())
    }
}

/// The ordered set of files selected for one run.
///
/// Built once by [`discover`] and never mutated afterwards, so staging,
/// publishing and capacity checks all see the same files in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<FileRef>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileRef> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[FileRef] {
        &self.entries
    }
}

impl From<Vec<FileRef>> for Catalog {
    fn from(entries: Vec<FileRef>) -> Self {
        Self { entries }
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a FileRef;
    type IntoIter = std::slice::Iter<'a, FileRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Compiled file-name pattern
#[derive(Debug, Clone)]
pub struct NamePattern {
    matcher: GlobMatcher,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Result<Self, DiscoveryError> {
        let glob = GlobBuilder::new(pattern).literal_separator(true).build()?;
        Ok(Self {
            matcher: glob.compile_matcher(),
        })
    }

    pub fn is_match(&self, name: &OsStr) -> bool {
        self.matcher.is_match(Path::new(name))
    }
}

/// Find all regular files under `base` whose name matches `pattern`.
///
/// Symlinks are followed. A link that points back at one of its own
/// ancestors is reported by the walker as a loop; such entries are logged and
/// skipped, as are unreadable entries below the base. Only a missing or
/// unreadable base is an error. Entries are visited in file-name order so
/// the result is stable for a given tree.
pub fn discover(pattern: &str, base: &Path) -> Result<Catalog, DiscoveryError> {
    let pattern = NamePattern::new(pattern)?;

    let metadata = fs::metadata(base).map_err(|source| DiscoveryError::BaseUnreadable {
        path: base.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(DiscoveryError::NotADirectory(base.to_path_buf()));
    }
    fs::read_dir(base).map_err(|source| DiscoveryError::BaseUnreadable {
        path: base.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();

    for entry in WalkDir::new(base).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(DiscoveryError::Walk(e)),
            Err(e) => {
                if let Some(ancestor) = e.loop_ancestor() {
                    warn!(
                        path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                        ancestor = %ancestor.display(),
                        "skipping symlink loop"
                    );
                } else {
                    warn!(error = %e, "skipping unreadable entry");
                }
                continue;
            }
        };

        if !entry.file_type().is_file() || !pattern.is_match(entry.file_name()) {
            continue;
        }

        let parent = entry.path().parent().unwrap_or(base);
        let relative_dir = match parent.strip_prefix(base) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                warn!(path = %entry.path().display(), "entry outside source base, skipping");
                continue;
            }
        };

        entries.push(FileRef::new(entry.file_name(), relative_dir));
    }

    debug!(count = entries.len(), base = %base.display(), "discovery complete");
    Ok(Catalog::from(entries))
}
