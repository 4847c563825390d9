//! Per-file publication outcomes

use std::fmt;
use std::path::PathBuf;

use crate::catalog::FileRef;

/// Why a file was not published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The mirrored destination directory could not be created
    DirectoryCreateFailed(String),
    /// The working copy could not be opened for reading
    SourceUnreadable(String),
    /// The encryption capability reported a failure
    EncryptionFailed(String),
    /// The finished temp file could not be renamed into place
    PublishFailed(String),
}

impl SkipReason {
    /// Stable identifier used in summaries
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::DirectoryCreateFailed(_) => "DIRECTORY_CREATE_FAILED",
            SkipReason::SourceUnreadable(_) => "SOURCE_UNREADABLE",
            SkipReason::EncryptionFailed(_) => "ENCRYPTION_FAILED",
            SkipReason::PublishFailed(_) => "PUBLISH_FAILED",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            SkipReason::DirectoryCreateFailed(d)
            | SkipReason::SourceUnreadable(d)
            | SkipReason::EncryptionFailed(d)
            | SkipReason::PublishFailed(d) => d,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.detail())
    }
}

/// Result of publishing one catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { file: FileRef, path: PathBuf },
    Skipped { file: FileRef, reason: SkipReason },
}

impl PublishOutcome {
    pub fn file(&self) -> &FileRef {
        match self {
            PublishOutcome::Published { file, .. } | PublishOutcome::Skipped { file, .. } => file,
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

/// All outcomes of one publishing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// One entry per attempted file, in catalog order
    pub outcomes: Vec<PublishOutcome>,
    /// Publishing stopped early because of a cancellation request
    pub canceled: bool,
}

impl PublishReport {
    pub fn published(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_published()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.published()
    }

    pub fn skipped_reasons(&self) -> impl Iterator<Item = (&FileRef, &SkipReason)> {
        self.outcomes.iter().filter_map(|o| match o {
            PublishOutcome::Skipped { file, reason } => Some((file, reason)),
            PublishOutcome::Published { .. } => None,
        })
    }
}
