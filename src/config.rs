//! Downloader configuration.
//!
//! [`DownloaderConfig`] is the one value a host application needs to build a
//! [`Downloader`](crate::Downloader): the download root plus the executor and
//! notification defaults that requests inherit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::download::constants::{
    DEFAULT_PARALLELISM, DEFAULT_READ_TIMEOUT, MAX_PARALLELISM, MIN_PARALLELISM,
};
use crate::download::{ExecutorOptions, ProgressNotifyStrategy};

/// Errors raised while validating a configuration or building a downloader.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Parallelism outside the supported range.
    #[error("invalid parallelism {value}: must be between {MIN_PARALLELISM} and {MAX_PARALLELISM}")]
    InvalidParallelism {
        /// The rejected value.
        value: usize,
    },

    /// Progress step outside `1..=100`.
    #[error("invalid progress step {value}: must be between 1 and 100")]
    InvalidProgressStep {
        /// The rejected value.
        value: u8,
    },

    /// The downloader was built outside a Tokio runtime.
    #[error("no Tokio runtime available; build the downloader from within a runtime")]
    NoRuntime,

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// The notification dispatcher thread could not be started.
    #[error("failed to start notification dispatcher: {0}")]
    Dispatcher(#[source] std::io::Error),
}

/// Configuration for a [`Downloader`](crate::Downloader).
///
/// ```
/// use resumable_downloader::DownloaderConfig;
///
/// let config = DownloaderConfig::builder("/tmp/downloads")
///     .parallelism(4)
///     .prefer_breakpoint(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.parallelism(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    directory: PathBuf,
    parallelism: usize,
    prefer_breakpoint: bool,
    progress_notify_strategy: ProgressNotifyStrategy,
    read_timeout: Duration,
}

impl DownloaderConfig {
    /// Starts a builder rooted at `directory`.
    #[must_use]
    pub fn builder(directory: impl Into<PathBuf>) -> DownloaderConfigBuilder {
        DownloaderConfigBuilder {
            config: Self {
                directory: directory.into(),
                parallelism: DEFAULT_PARALLELISM,
                prefer_breakpoint: false,
                progress_notify_strategy: ProgressNotifyStrategy::default(),
                read_timeout: DEFAULT_READ_TIMEOUT,
            },
        }
    }

    /// Root of the download directory tree.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Maximum number of concurrent transfers.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Breakpoint preference for requests that do not set one.
    #[must_use]
    pub fn prefer_breakpoint(&self) -> bool {
        self.prefer_breakpoint
    }

    /// Progress policy for requests that do not set one.
    #[must_use]
    pub fn progress_notify_strategy(&self) -> ProgressNotifyStrategy {
        self.progress_notify_strategy
    }

    /// Idle timeout while reading a response body.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Checks every field against its valid range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParallelism`] or
    /// [`ConfigError::InvalidProgressStep`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PARALLELISM..=MAX_PARALLELISM).contains(&self.parallelism) {
            return Err(ConfigError::InvalidParallelism {
                value: self.parallelism,
            });
        }
        let ProgressNotifyStrategy::WhenProgressIncreased { step } = self.progress_notify_strategy;
        if !(1..=100).contains(&step) {
            return Err(ConfigError::InvalidProgressStep { value: step });
        }
        Ok(())
    }

    pub(crate) fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            parallelism: self.parallelism,
            prefer_breakpoint: self.prefer_breakpoint,
            read_timeout: self.read_timeout,
        }
    }
}

/// Builder for [`DownloaderConfig`].
#[derive(Debug, Clone)]
#[must_use]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    /// Sets the maximum number of concurrent transfers.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    /// Sets the default breakpoint preference.
    pub fn prefer_breakpoint(mut self, prefer_breakpoint: bool) -> Self {
        self.config.prefer_breakpoint = prefer_breakpoint;
        self
    }

    /// Sets the default progress policy.
    pub fn progress_notify_strategy(mut self, strategy: ProgressNotifyStrategy) -> Self {
        self.config.progress_notify_strategy = strategy;
        self
    }

    /// Sets the body read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// See [`DownloaderConfig::validate`].
    pub fn build(self) -> Result<DownloaderConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
