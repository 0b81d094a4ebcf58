use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::remote::SnapshotId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that abort a whole volume download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    #[error("download declined")]
    Declined,

    #[error("download cancelled")]
    Cancelled,

    #[error("{operation} failed")]
    Remote {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("snapshot {0} entered the error state")]
    SnapshotFailed(SnapshotId),

    #[error("snapshot {snapshot} did not complete after {attempts} polls")]
    SnapshotTimeout { snapshot: SnapshotId, attempts: u32 },

    #[error("listing snapshot blocks failed")]
    Listing(#[source] BoxError),

    #[error("snapshot listing returned block {0} more than once")]
    DuplicateBlock(u64),

    #[error("failed to allocate output file {}", path.display())]
    Allocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to flush output file {}", path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write metadata file {}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub(crate) fn remote(
        operation: &'static str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Remote {
            operation,
            source: Box::new(err),
        }
    }
}

/// Why a single block was not written. None of these abort the download.
#[derive(Debug, Error)]
pub enum BlockFailure {
    #[error("fetch failed")]
    Fetch(#[source] BoxError),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: u64, actual: u64 },

    #[error("block starts at offset {offset}, past the end of the volume")]
    OutOfBounds { offset: u64 },

    #[error("positioned write failed")]
    Write(#[source] std::io::Error),

    #[error("block task panicked: {0}")]
    Panicked(String),

    #[error("block task was lost before reporting an outcome")]
    Lost,
}
