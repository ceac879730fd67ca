use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::inventory::LockHolder;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error for '{}': {source}", display_opt(.path))]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("Invalid path '{}': {reason}", .path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Refusing to touch protected location '{}' (matches '{}')", .path.display(), .entry.display())]
    ProtectedPath { path: PathBuf, entry: PathBuf },

    #[error("Could not release '{}': {} reference(s) remain", .path.display(), .holders.len())]
    LocksRemain {
        path: PathBuf,
        holders: Vec<LockHolder>,
    },

    #[error("Delete of '{}' failed after unlocking: {} error(s)", .path.display(), .errors.len())]
    DeleteFailed {
        path: PathBuf,
        errors: Vec<FailedItem>,
        holders: Vec<LockHolder>,
    },

    #[error("Move of '{}' to '{}' failed: {reason}", .path.display(), .destination.display())]
    MoveFailed {
        path: PathBuf,
        destination: PathBuf,
        reason: String,
    },
}

/// One entry that could not be removed.
#[derive(Debug, Clone)]
pub struct FailedItem {
    pub path: PathBuf,
    pub error: String,
    pub is_dir: bool,
}

impl fmt::Display for FailedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir { "directory" } else { "file" };
        write!(f, "{} '{}': {}", kind, self.path.display(), self.error)
    }
}

fn display_opt(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io {
            path: None,
            source: err,
        }
    }
}

impl Error {
    /// Lock holders still present when the operation gave up, for operator diagnosis.
    pub fn holders(&self) -> &[LockHolder] {
        match self {
            Error::LocksRemain { holders, .. } | Error::DeleteFailed { holders, .. } => holders,
            _ => &[],
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ProtectedPath { .. } => 2,
            Error::InvalidPath { .. } => 3,
            Error::LocksRemain { .. } => 4,
            Error::DeleteFailed { .. } => 5,
            Error::Io { .. } | Error::MoveFailed { .. } => 1,
        }
    }
}
