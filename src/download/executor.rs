//! Transfer executor: runs the network transfer for a registered task.
//!
//! The registry hands a request, the temp file and a [`TransferUpdater`] to
//! a [`TransferExecutor`]; the executor reports progress and exactly one
//! terminal outcome back through the updater. [`HttpTransferExecutor`] is
//! the default implementation on top of `reqwest`.
//!
//! # Transfer strategy
//!
//! - temp file has `L > 0` bytes and breakpoint is preferred: send
//!   `Range: bytes=L-`
//!   - `206`: append to the temp file, progress is `(L + received) / (L + length)`
//!   - `200`: the server ignored the range, rewrite from offset 0
//!   - `416`: fall back to a fresh full request
//!   - anything else: [`DownloadError::HttpStatus`]
//! - otherwise: plain `GET`, only `200` is accepted
//!
//! Cancellation is cooperative: every network await races the job's
//! cancellation token, and the token is re-checked around each chunk write.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::constants::{DEFAULT_PARALLELISM, DEFAULT_READ_TIMEOUT, MAX_PARALLELISM, MIN_PARALLELISM};
use super::error::DownloadError;
use super::request::DownloadRequest;
use crate::config::ConfigError;

/// Sink through which an executor reports on one transfer.
pub trait TransferUpdater: Send + Sync {
    /// Reports `current` of `total` bytes present in the temp file.
    fn notify_progress(&self, total: u64, current: u64);

    /// Reports that the temp file is complete.
    fn notify_success(&self);

    /// Reports that the transfer failed or was cancelled.
    fn notify_error(&self, error: DownloadError);
}

/// Why an executor refused a transfer.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The executor no longer accepts work.
    #[error("transfer executor is shut down")]
    Shutdown,

    /// A transfer for the same URL is still running.
    #[error("a transfer for {url} is already running")]
    AlreadyRunning {
        /// The duplicated URL.
        url: String,
    },
}

/// Runs transfers on behalf of the registry.
///
/// `submit` must not block and must report network failures through the
/// updater, never as a return value. `cancel` may complete asynchronously:
/// the updater can still receive a terminal outcome after it returns, and
/// it may also be invoked synchronously from inside `cancel`.
pub trait TransferExecutor: Send + Sync {
    /// Starts transferring `request` into `file`.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if the work item cannot be accepted.
    fn submit(
        &self,
        request: DownloadRequest,
        file: PathBuf,
        updater: Arc<dyn TransferUpdater>,
    ) -> Result<(), SubmitError>;

    /// Requests cooperative cancellation of the transfer for `url`.
    fn cancel(&self, url: &str);

    /// Breakpoint preference applied to requests that do not set one.
    fn prefer_breakpoint(&self) -> bool {
        false
    }
}

/// Options for [`HttpTransferExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum number of transfers running at once.
    pub parallelism: usize,
    /// Default breakpoint preference.
    pub prefer_breakpoint: bool,
    /// Maximum idle time while reading the response body.
    pub read_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            prefer_breakpoint: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct Job {
    id: u64,
    token: CancellationToken,
}

type JobMap = Arc<Mutex<HashMap<String, Job>>>;

/// HTTP executor with bounded parallelism.
///
/// Each submitted transfer becomes a Tokio task on the runtime captured at
/// construction. A semaphore bounds how many of them touch the network at
/// once; excess transfers wait for a permit (and can be cancelled while
/// waiting).
#[derive(Debug)]
pub struct HttpTransferExecutor {
    client: Client,
    runtime: Handle,
    permits: Arc<Semaphore>,
    parallelism: usize,
    prefer_breakpoint: bool,
    jobs: JobMap,
    next_job: AtomicU64,
    shutdown: CancellationToken,
}

impl HttpTransferExecutor {
    /// Creates an executor on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParallelism`] for a parallelism outside
    /// the supported range, [`ConfigError::NoRuntime`] when called outside a
    /// Tokio runtime and [`ConfigError::HttpClient`] if the client cannot be built.
    pub fn new(options: ExecutorOptions) -> Result<Self, ConfigError> {
        if !(MIN_PARALLELISM..=MAX_PARALLELISM).contains(&options.parallelism) {
            return Err(ConfigError::InvalidParallelism {
                value: options.parallelism,
            });
        }
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let client = Client::builder()
            .read_timeout(options.read_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ConfigError::HttpClient)?;

        debug!(
            parallelism = options.parallelism,
            prefer_breakpoint = options.prefer_breakpoint,
            "creating HTTP transfer executor"
        );

        Ok(Self {
            client,
            runtime,
            permits: Arc::new(Semaphore::new(options.parallelism)),
            parallelism: options.parallelism,
            prefer_breakpoint: options.prefer_breakpoint,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_job: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Configured parallelism.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Number of submitted transfers that have not reported yet.
    #[must_use]
    pub fn running(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Stops accepting work and cancels every in-flight transfer.
    pub fn shutdown(&self) {
        debug!(running = self.running(), "shutting down transfer executor");
        self.shutdown.cancel();
        self.permits.close();
    }
}

impl TransferExecutor for HttpTransferExecutor {
    fn submit(
        &self,
        request: DownloadRequest,
        file: PathBuf,
        updater: Arc<dyn TransferUpdater>,
    ) -> Result<(), SubmitError> {
        if self.shutdown.is_cancelled() || self.permits.is_closed() {
            return Err(SubmitError::Shutdown);
        }

        let url = request.url().to_string();
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&url) {
                return Err(SubmitError::AlreadyRunning { url });
            }
            jobs.insert(
                url.clone(),
                Job {
                    id,
                    token: token.clone(),
                },
            );
            debug!(url = %url, size = jobs.len(), "executor submit");
        }

        let transfer = Transfer {
            client: self.client.clone(),
            permits: Arc::clone(&self.permits),
            prefer_breakpoint: request.prefer_breakpoint().unwrap_or(self.prefer_breakpoint),
            token,
            request,
            file,
        };
        let jobs = Arc::clone(&self.jobs);
        let file = transfer.file.clone();
        let span = info_span!("transfer", url = %url);

        self.runtime.spawn(
            async move {
                let outcome = std::panic::AssertUnwindSafe(transfer.run(updater.as_ref()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(DownloadError::io(
                            file,
                            std::io::Error::other("transfer task panicked"),
                        ))
                    });

                // the slot is free before the outcome is reported, so a request
                // replayed from inside the updater can be submitted again
                remove_job(&jobs, &url, id);
                match outcome {
                    Ok(()) => updater.notify_success(),
                    Err(error) => {
                        debug!(error = %error, "transfer finished with error");
                        updater.notify_error(error);
                    }
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    fn cancel(&self, url: &str) {
        if let Some(job) = self.jobs.lock().get(url) {
            debug!(url, job = job.id, "executor cancel");
            job.token.cancel();
        }
    }

    fn prefer_breakpoint(&self) -> bool {
        self.prefer_breakpoint
    }
}

fn remove_job(jobs: &Mutex<HashMap<String, Job>>, url: &str, id: u64) {
    let mut jobs = jobs.lock();
    if jobs.get(url).is_some_and(|job| job.id == id) {
        jobs.remove(url);
    }
    debug!(url, size = jobs.len(), "executor finish");
}

/// One submitted transfer.
struct Transfer {
    client: Client,
    permits: Arc<Semaphore>,
    prefer_breakpoint: bool,
    token: CancellationToken,
    request: DownloadRequest,
    file: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    /// Truncate and write from offset 0.
    Full,
    /// Keep the first `offset` bytes and append after them.
    Resume { offset: u64 },
}

impl Transfer {
    async fn run(self, updater: &dyn TransferUpdater) -> Result<(), DownloadError> {
        let url = self.request.url();
        let _permit = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(DownloadError::cancelled(url)),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| DownloadError::cancelled(url))?
            }
        };

        let length = tokio::fs::metadata(&self.file)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        if self.prefer_breakpoint && length > 0 {
            let response = self.send(Some(length)).await?;
            let status = response.status();
            debug!(status = status.as_u16(), offset = length, "breakpoint response");
            match status {
                StatusCode::PARTIAL_CONTENT => {
                    return self
                        .write_body(response, WriteMode::Resume { offset: length }, updater)
                        .await;
                }
                StatusCode::OK => {
                    return self.write_body(response, WriteMode::Full, updater).await;
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    debug!(offset = length, "range not satisfiable, restarting from zero");
                }
                other => return Err(DownloadError::http_status(url, other.as_u16())),
            }
        }

        let response = self.send(None).await?;
        let status = response.status();
        debug!(status = status.as_u16(), "full response");
        if status == StatusCode::OK {
            self.write_body(response, WriteMode::Full, updater).await
        } else {
            Err(DownloadError::http_status(url, status.as_u16()))
        }
    }

    /// Sends the GET and waits for response headers within the connect timeout.
    async fn send(&self, range_start: Option<u64>) -> Result<Response, DownloadError> {
        let url = self.request.url();
        let mut builder = self.client.get(url);
        if let Some(start) = range_start {
            builder = builder.header(RANGE, format!("bytes={start}-"));
        }

        let timeout = self.request.connect_timeout();
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(DownloadError::cancelled(url)),
            result = tokio::time::timeout(timeout, builder.send()) => match result {
                Err(_) => Err(DownloadError::timeout(url)),
                Ok(Err(e)) if e.is_timeout() => Err(DownloadError::timeout(url)),
                Ok(Err(e)) => Err(DownloadError::network(url, e)),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }

    async fn write_body(
        &self,
        response: Response,
        mode: WriteMode,
        updater: &dyn TransferUpdater,
    ) -> Result<(), DownloadError> {
        let url = self.request.url();
        let path = self.file.as_path();

        let (file, offset) = match mode {
            WriteMode::Full => (File::create(path).await.map_err(|e| DownloadError::io(path, e))?, 0),
            WriteMode::Resume { offset } => (open_at(path, offset).await?, offset),
        };
        let total = response.content_length().map_or(0, |len| len.saturating_add(offset));
        debug!(?mode, total, "streaming body");

        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            self.ensure_active()?;
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(DownloadError::cancelled(url)),
                next = stream.next() => next,
            };
            self.ensure_active()?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    DownloadError::timeout(url)
                } else {
                    DownloadError::network(url, e)
                }
            })?;

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            self.ensure_active()?;

            received += chunk.len() as u64;
            updater.notify_progress(total, offset + received);
        }

        writer.flush().await.map_err(|e| DownloadError::io(path, e))?;
        if let Err(error) = writer.get_ref().sync_all().await {
            warn!(path = %path.display(), error = %error, "failed to sync temp file");
        }
        debug!(bytes = offset + received, "transfer complete");
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), DownloadError> {
        if self.token.is_cancelled() {
            Err(DownloadError::cancelled(self.request.url()))
        } else {
            Ok(())
        }
    }
}

async fn open_at(path: &Path, offset: u64) -> Result<File, DownloadError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    Ok(file)
}
