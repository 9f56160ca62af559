//! Resumable HTTP download engine.
//!
//! A [`Downloader`] keeps at most one task per URL, streams the response
//! into a content-addressed temp file and publishes it under its final name
//! once the transfer completes.
//!
//! # Features
//!
//! - Deduplication: concurrent requests for one URL share one transfer
//! - Breakpoint resume through `Range` requests against the temp file
//! - Bounded parallelism (3 transfers by default)
//! - Cooperative cancellation, with re-requests parked until the cancelled
//!   attempt has drained
//! - Throttled progress events delivered in order on one dispatcher thread
//!
//! # Example
//!
//! ```no_run
//! use resumable_downloader::{DownloadRequest, Downloader, DownloaderConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DownloaderConfig::builder("./downloads").build()?;
//! let downloader = Downloader::new(config)?;
//! let request = DownloadRequest::builder()
//!     .prefer_breakpoint(Some(true))
//!     .build("https://example.com/archive.zip");
//! let file = downloader.download(request).await?;
//! println!("Downloaded: {}", file.display());
//! # Ok(())
//! # }
//! ```

pub mod constants;
mod directory;
mod error;
mod executor;
mod info;
mod notify;
mod registry;
mod request;
mod scope;
mod task;

pub use directory::{DownloadDirectory, final_file_name, key_extension, key_hash, temp_file_name};
pub use error::{DownloadError, ErrorKind};
pub use executor::{
    ExecutorOptions, HttpTransferExecutor, SubmitError, TransferExecutor, TransferUpdater,
};
pub use info::{DownloadInfo, DownloadProgress};
pub use notify::{CallbackHandle, DownloadCallback};
pub use registry::{Downloader, InfoSubscription};
pub use request::{DownloadRequest, DownloadRequestBuilder, ProgressNotifyStrategy};
pub use scope::DirScope;
pub use task::{DownloadTask, TaskState};
