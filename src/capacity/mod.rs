//! Destination capacity accounting
//!
//! Required space is the sum of the *source* file sizes. Encrypted output
//! size is not known in advance and is treated as roughly equal to the input,
//! both before the run (hard gate) and after it (advisory look-ahead for the
//! next run of the same size).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::Catalog;

/// Errors for capacity computation
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    #[error("cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read free space at {path}: {source}")]
    FreeSpace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Source of free-space figures for a destination
pub trait SpaceProbe {
    /// Bytes available to the current user at `path`.
    fn free_space(&self, path: &Path) -> io::Result<u64>;
}

/// Free space as reported by the filesystem.
///
/// Uses the unprivileged figure (`f_bavail` on Unix), so blocks reserved for
/// root are not counted as usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn free_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Result of comparing required bytes against free space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReport {
    /// Free space minus required bytes; negative means insufficient
    pub available_after_reserve: i64,
    /// Total size of the catalog
    pub required_bytes: u64,
}

impl CapacityReport {
    /// Combine a free-space figure with a requirement.
    pub fn new(free_bytes: u64, required_bytes: u64) -> Self {
        let free = i128::from(free_bytes);
        let required = i128::from(required_bytes);
        let diff = (free - required).clamp(i128::from(i64::MIN), i128::from(i64::MAX));
        Self {
            available_after_reserve: diff as i64,
            required_bytes,
        }
    }

    pub fn is_sufficient(&self) -> bool {
        self.available_after_reserve >= 0
    }

    /// Bytes that must be freed for the requirement to fit (0 when it fits)
    pub fn shortfall(&self) -> u64 {
        if self.available_after_reserve < 0 {
            self.available_after_reserve.unsigned_abs()
        } else {
            0
        }
    }
}

/// Sum the sizes of every catalog entry resolved against `base`.
///
/// Fails closed: a single unreadable entry fails the whole computation
/// rather than undercounting.
pub fn required_size(base: &Path, catalog: &Catalog) -> Result<u64, CapacityError> {
    catalog.iter().try_fold(0u64, |total, file| {
        let path = file.resolve(base);
        let metadata =
            fs::metadata(&path).map_err(|source| CapacityError::Stat { path, source })?;
        Ok(total.saturating_add(metadata.len()))
    })
}

/// Free space at `path` according to `probe`.
pub fn free_space(probe: &dyn SpaceProbe, path: &Path) -> Result<u64, CapacityError> {
    probe
        .free_space(path)
        .map_err(|source| CapacityError::FreeSpace {
            path: path.to_path_buf(),
            source,
        })
}

/// Compute the capacity report for `catalog` against `destination`.
pub fn plan(
    probe: &dyn SpaceProbe,
    base: &Path,
    catalog: &Catalog,
    destination: &Path,
) -> Result<CapacityReport, CapacityError> {
    let required = required_size(base, catalog)?;
    let free = free_space(probe, destination)?;
    Ok(CapacityReport::new(free, required))
}
