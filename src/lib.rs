//! Resumable Downloader Library
//!
//! A concurrency-bounded HTTP download engine with per-URL deduplication,
//! breakpoint resume and atomic publication of finished files.
//!
//! # Architecture
//!
//! - [`download`] - registry, task state machine, transfer executor and
//!   notification bus
//! - [`config`] - downloader configuration and validation

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, DownloaderConfig, DownloaderConfigBuilder};
pub use download::{
    CallbackHandle, DirScope, DownloadCallback, DownloadError, DownloadInfo, DownloadProgress,
    DownloadRequest, Downloader, ErrorKind, HttpTransferExecutor, InfoSubscription,
    ProgressNotifyStrategy, SubmitError, TransferExecutor, TransferUpdater,
};
