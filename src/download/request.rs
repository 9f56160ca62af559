//! Download request value type.

use std::time::Duration;

use super::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROGRESS_STEP};

/// Policy deciding when a progress sample becomes a `Progress` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressNotifyStrategy {
    /// Notify when the integer percentage grew by at least `step` points
    /// since the last notification. Reaching 100% always notifies once.
    WhenProgressIncreased {
        /// Minimum growth in percentage points (1..=100).
        step: u8,
    },
}

impl ProgressNotifyStrategy {
    /// Creates a step strategy, clamping `step` into `1..=100`.
    #[must_use]
    pub fn when_increased_by(step: u8) -> Self {
        Self::WhenProgressIncreased {
            step: step.clamp(1, 100),
        }
    }

    /// Returns the minimum percentage growth between two notifications.
    #[must_use]
    pub fn step(self) -> u8 {
        match self {
            Self::WhenProgressIncreased { step } => step.clamp(1, 100),
        }
    }
}

impl Default for ProgressNotifyStrategy {
    fn default() -> Self {
        Self::WhenProgressIncreased {
            step: DEFAULT_PROGRESS_STEP,
        }
    }
}

/// An immutable request to download one URL.
///
/// The URL is the identity key: two requests with the same URL share one
/// active task in the registry.
///
/// ```
/// use resumable_downloader::DownloadRequest;
///
/// let request = DownloadRequest::builder()
///     .prefer_breakpoint(Some(true))
///     .dirname("exe")
///     .build("https://example.com/setup.exe");
/// assert_eq!(request.url(), "https://example.com/setup.exe");
/// assert_eq!(request.prefer_breakpoint(), Some(true));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    url: String,
    prefer_breakpoint: Option<bool>,
    connect_timeout: Duration,
    progress_notify_strategy: Option<ProgressNotifyStrategy>,
    dirname: String,
}

impl DownloadRequest {
    /// Creates a request with default options.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::builder().build(url)
    }

    /// Starts building a request.
    #[must_use]
    pub fn builder() -> DownloadRequestBuilder {
        DownloadRequestBuilder::default()
    }

    /// The URL to download.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether to resume from a partial temp file; `None` inherits the executor default.
    #[must_use]
    pub fn prefer_breakpoint(&self) -> Option<bool> {
        self.prefer_breakpoint
    }

    /// Time allowed for the server to answer with response headers.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Per-request progress policy; `None` inherits the downloader default.
    #[must_use]
    pub fn progress_notify_strategy(&self) -> Option<ProgressNotifyStrategy> {
        self.progress_notify_strategy
    }

    /// Logical subdirectory of the download root; empty means the root itself.
    #[must_use]
    pub fn dirname(&self) -> &str {
        &self.dirname
    }
}

/// Builder for [`DownloadRequest`].
#[derive(Debug, Clone)]
pub struct DownloadRequestBuilder {
    prefer_breakpoint: Option<bool>,
    connect_timeout: Duration,
    progress_notify_strategy: Option<ProgressNotifyStrategy>,
    dirname: String,
}

impl Default for DownloadRequestBuilder {
    fn default() -> Self {
        Self {
            prefer_breakpoint: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            progress_notify_strategy: None,
            dirname: String::new(),
        }
    }
}

impl DownloadRequestBuilder {
    /// `Some(true)` resumes, `Some(false)` always restarts, `None` follows the executor default.
    #[must_use]
    pub fn prefer_breakpoint(mut self, prefer_breakpoint: Option<bool>) -> Self {
        self.prefer_breakpoint = prefer_breakpoint;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the progress policy for this request only.
    #[must_use]
    pub fn progress_notify_strategy(mut self, strategy: ProgressNotifyStrategy) -> Self {
        self.progress_notify_strategy = Some(strategy);
        self
    }

    /// Scopes the download into a subdirectory of the download root.
    #[must_use]
    pub fn dirname(mut self, dirname: impl Into<String>) -> Self {
        self.dirname = dirname.into();
        self
    }

    /// Finishes the request for `url`.
    #[must_use]
    pub fn build(self, url: impl Into<String>) -> DownloadRequest {
        DownloadRequest {
            url: url.into(),
            prefer_breakpoint: self.prefer_breakpoint,
            connect_timeout: self.connect_timeout,
            progress_notify_strategy: self.progress_notify_strategy,
            dirname: self.dirname,
        }
    }
}
