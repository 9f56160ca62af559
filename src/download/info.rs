//! Notification payloads delivered to observers.

use std::path::PathBuf;
use std::sync::Arc;

use super::error::DownloadError;

/// Snapshot of an in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    /// The URL being downloaded.
    pub url: String,
    /// Expected total bytes.
    pub total: u64,
    /// Bytes present so far (including any resumed prefix).
    pub current: u64,
    /// Integer percentage in `0..=100`.
    pub percent: u8,
    /// Transfer speed in bytes per second since the previous progress event.
    pub speed_bps: u64,
}

/// One event in a download's lifetime.
///
/// For a single URL, observers see `Initialized`, zero or more `Progress`,
/// an optional `Cancelling`, then exactly one of `Success` or `Error`.
#[derive(Debug, Clone)]
pub enum DownloadInfo {
    /// A task was registered and submitted.
    Initialized {
        /// The URL of the task.
        url: String,
    },
    /// The transfer advanced past the notification threshold.
    Progress(DownloadProgress),
    /// Cancellation was requested and has not drained yet.
    Cancelling {
        /// The URL of the task.
        url: String,
    },
    /// The file was downloaded and published at `file`.
    Success {
        /// The URL of the task.
        url: String,
        /// The final file.
        file: PathBuf,
    },
    /// The attempt failed or was cancelled.
    Error {
        /// The URL of the task.
        url: String,
        /// Why the attempt ended.
        error: Arc<DownloadError>,
    },
}

impl DownloadInfo {
    /// Returns the URL this event belongs to.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Initialized { url }
            | Self::Cancelling { url }
            | Self::Success { url, .. }
            | Self::Error { url, .. } => url,
            Self::Progress(progress) => &progress.url,
        }
    }

    /// Returns true for `Success` and `Error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Error { .. })
    }

    /// Short label used in logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initialized { .. } => "initialized",
            Self::Progress(_) => "progress",
            Self::Cancelling { .. } => "cancelling",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
        }
    }
}
