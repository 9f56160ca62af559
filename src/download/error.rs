//! Error types for the download module.
//!
//! Every failure of a download attempt is terminal for that attempt and is
//! delivered through the registry's error path as a [`DownloadError`]. The
//! variants carry enough context (url, path) to be useful in logs, and
//! [`DownloadError::kind`] collapses them into the closed [`ErrorKind`]
//! taxonomy callers use to decide whether to retry.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that end a download attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The request could not be accepted (e.g. empty URL).
    #[error("illegal request: {reason}")]
    IllegalRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// The temp or final path for the download could not be prepared.
    #[error("failed to prepare download file {path}: {source}")]
    PrepareFileFailed {
        /// Directory or file that could not be prepared.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The transfer executor refused the work item.
    #[error("failed to submit transfer for {url}: {reason}")]
    SubmitFailed {
        /// The URL whose transfer was refused.
        url: String,
        /// The executor's reason.
        reason: String,
    },

    /// The server answered with a status the engine cannot use.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Network-level error (DNS resolution, connection refused, TLS, broken body stream).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// No response headers arrived within the request's connect timeout.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// File system error while writing the temp file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The temp file vanished between transfer completion and finalize.
    #[error("temp file {path} not found at finalize")]
    TempFileMissing {
        /// The temp file that was expected.
        path: PathBuf,
    },

    /// The temp file could not be moved onto the final path.
    #[error("failed to finalize download into {path}: {source}")]
    FinalizeFailed {
        /// The final path that could not be written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The transfer was cancelled cooperatively.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// The URL whose transfer was cancelled.
        url: String,
    },
}

/// Closed classification of [`DownloadError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request rejected before any work started.
    IllegalRequest,
    /// Temp or final path could not be prepared.
    PrepareFileFailed,
    /// Executor refused the work item.
    SubmitFailed,
    /// Unusable HTTP status, with its code.
    HttpStatus(u16),
    /// Network, timeout or stream-write failure.
    TransportIo,
    /// Temp file vanished before finalize.
    TempFileMissing,
    /// Rename/replace onto the final path failed.
    FinalizeFailed,
    /// Cooperative cancellation completed.
    Cancelled,
}

impl DownloadError {
    /// Creates an illegal-request error.
    pub fn illegal_request(reason: impl Into<String>) -> Self {
        Self::IllegalRequest {
            reason: reason.into(),
        }
    }

    /// Creates a prepare-file error.
    pub fn prepare_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PrepareFileFailed {
            path: path.into(),
            source,
        }
    }

    /// Creates a submit error.
    pub fn submit_failed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::SubmitFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a temp-file-missing error.
    pub fn temp_file_missing(path: impl Into<PathBuf>) -> Self {
        Self::TempFileMissing { path: path.into() }
    }

    /// Creates a finalize error.
    pub fn finalize_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FinalizeFailed {
            path: path.into(),
            source,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalRequest { .. } => ErrorKind::IllegalRequest,
            Self::PrepareFileFailed { .. } => ErrorKind::PrepareFileFailed,
            Self::SubmitFailed { .. } => ErrorKind::SubmitFailed,
            Self::HttpStatus { status, .. } => ErrorKind::HttpStatus(*status),
            Self::Network { .. } | Self::Timeout { .. } | Self::Io { .. } => ErrorKind::TransportIo,
            Self::TempFileMissing { .. } => ErrorKind::TempFileMissing,
            Self::FinalizeFailed { .. } => ErrorKind::FinalizeFailed,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns true if the attempt ended because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns true if calling `add_task` again has a reasonable chance to succeed.
    ///
    /// Transport failures and 5xx/408/429 statuses are transient; request,
    /// filesystem and cancellation outcomes are not retried automatically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::TransportIo | ErrorKind::TempFileMissing => true,
            ErrorKind::HttpStatus(status) => status >= 500 || status == 408 || status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.zip", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(
            msg.contains("https://example.com/file.zip"),
            "Expected URL in: {msg}"
        );
        assert_eq!(error.kind(), ErrorKind::HttpStatus(404));
    }

    #[test]
    fn test_download_error_io_display_and_kind() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/abc.temp"), io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/abc.temp"), "Expected path in: {msg}");
        assert_eq!(error.kind(), ErrorKind::TransportIo);
    }

    #[test]
    fn test_download_error_timeout_is_transport() {
        let error = DownloadError::timeout("https://example.com/a.bin");
        assert_eq!(error.kind(), ErrorKind::TransportIo);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_cancelled_is_distinguishable_from_transport() {
        let error = DownloadError::cancelled("https://example.com/a.bin");
        assert!(error.is_cancelled());
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("cancelled"));
    }

    #[test]
    fn test_illegal_request_not_retryable() {
        let error = DownloadError::illegal_request("url is empty");
        assert_eq!(error.kind(), ErrorKind::IllegalRequest);
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("url is empty"));
    }

    #[test]
    fn test_http_status_retryable_only_for_transient_codes() {
        assert!(DownloadError::http_status("u", 503).is_retryable());
        assert!(DownloadError::http_status("u", 429).is_retryable());
        assert!(!DownloadError::http_status("u", 404).is_retryable());
    }

    #[test]
    fn test_finalize_and_prepare_kinds() {
        let io = || std::io::Error::other("boom");
        assert_eq!(
            DownloadError::finalize_failed("/x/y.zip", io()).kind(),
            ErrorKind::FinalizeFailed
        );
        assert_eq!(
            DownloadError::prepare_file("/x", io()).kind(),
            ErrorKind::PrepareFileFailed
        );
        assert_eq!(
            DownloadError::temp_file_missing("/x/y.temp").kind(),
            ErrorKind::TempFileMissing
        );
        assert_eq!(
            DownloadError::submit_failed("u", "shut down").kind(),
            ErrorKind::SubmitFailed
        );
    }
}
