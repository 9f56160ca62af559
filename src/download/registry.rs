//! Task registry: the [`Downloader`] orchestrator.
//!
//! The registry owns the per-URL bookkeeping (`active`, `cancelling`,
//! `pending`) behind one reentrant lock. Executor callbacks may arrive on
//! any thread, or synchronously from inside `submit`/`cancel` on the thread
//! that already holds the lock; the reentrant mutex lets both paths share
//! the same mutual-exclusion domain. A `RefCell` borrow is never held
//! across a call into the executor.
//!
//! Lock order is registry, then task. Task events are published while the
//! task mutex is held.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::directory::DownloadDirectory;
use super::error::DownloadError;
use super::executor::{HttpTransferExecutor, TransferExecutor, TransferUpdater};
use super::info::DownloadInfo;
use super::notify::{CallbackHandle, DownloadCallback, NotificationBus};
use super::request::{DownloadRequest, ProgressNotifyStrategy};
use super::task::{DownloadTask, TaskState};
use crate::config::{ConfigError, DownloaderConfig};

/// Resumable download orchestrator.
///
/// Cheap to clone; clones share one registry. At most one task exists per
/// URL: adding a URL that is already downloading joins the running task.
#[derive(Clone, Debug)]
pub struct Downloader {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) directory: DownloadDirectory,
    executor: Arc<dyn TransferExecutor>,
    bus: NotificationBus,
    default_strategy: ProgressNotifyStrategy,
    pub(super) state: ReentrantMutex<RefCell<RegistryState>>,
    next_attempt: AtomicU64,
}

#[derive(Debug, Default)]
pub(super) struct RegistryState {
    pub(super) active: HashMap<String, ActiveEntry>,
    cancelling: HashSet<String>,
    pending: HashMap<String, DownloadRequest>,
}

#[derive(Debug)]
pub(super) struct ActiveEntry {
    attempt: u64,
    task: Arc<DownloadTask>,
    pub(super) temp: PathBuf,
    final_path: PathBuf,
    keep_temp_on_error: bool,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.state.lock();
        let mut debug = f.debug_struct("Downloader");
        debug.field("root", &self.directory.root());
        if let Ok(state) = guard.try_borrow() {
            debug
                .field("active", &state.active.len())
                .field("cancelling", &state.cancelling.len())
                .field("pending", &state.pending.len());
        }
        debug.field("bus", &self.bus).finish_non_exhaustive()
    }
}

impl Downloader {
    /// Builds a downloader backed by an [`HttpTransferExecutor`] on the
    /// current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid, no runtime is
    /// available, or the HTTP client or dispatcher thread cannot be started.
    pub fn new(config: DownloaderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = HttpTransferExecutor::new(config.executor_options())?;
        Self::with_executor(config, Arc::new(executor))
    }

    /// Builds a downloader on top of a caller-provided executor.
    ///
    /// Only the directory and progress strategy of `config` are used. The
    /// transfer settings (`parallelism`, `prefer_breakpoint`, `read_timeout`)
    /// belong to the executor, so they are ignored here. Requests that leave
    /// `prefer_breakpoint` unset fall back to
    /// [`TransferExecutor::prefer_breakpoint`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the
    /// dispatcher thread cannot be started.
    pub fn with_executor(
        config: DownloaderConfig,
        executor: Arc<dyn TransferExecutor>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let bus = NotificationBus::start().map_err(ConfigError::Dispatcher)?;
        debug!(root = %config.directory().display(), "creating downloader");
        Ok(Self {
            inner: Arc::new(Inner {
                directory: DownloadDirectory::new(config.directory()),
                executor,
                bus,
                default_strategy: config.progress_notify_strategy(),
                state: ReentrantMutex::new(RefCell::new(RegistryState::default())),
                next_attempt: AtomicU64::new(1),
            }),
        })
    }

    /// Starts (or joins) the download of `request.url()`.
    ///
    /// Returns true if a task now exists for the URL. Returns false when the
    /// request was rejected; the reason is published as an `Error` event.
    /// If the URL is being cancelled, the request is parked and started once
    /// the cancelled attempt has reported its terminal error.
    pub fn add_task(&self, request: DownloadRequest) -> bool {
        self.inner.add_task(request)
    }

    /// Requests cancellation of the active task for `url`. No-op for unknown URLs.
    pub fn cancel_task(&self, url: &str) {
        self.inner.cancel_task(url);
    }

    /// Returns true while a task for `url` is registered.
    #[must_use]
    pub fn has_task(&self, url: &str) -> bool {
        let guard = self.inner.state.lock();
        guard.borrow().active.contains_key(url)
    }

    /// Last non-terminal event of the active task for `url`.
    #[must_use]
    pub fn get_active_info(&self, url: &str) -> Option<DownloadInfo> {
        let guard = self.inner.state.lock();
        let task = guard.borrow().active.get(url).map(|entry| Arc::clone(&entry.task));
        task.and_then(|task| task.info())
    }

    /// Adds an observer for every event of every URL.
    pub fn register_callback(&self, callback: impl DownloadCallback + 'static) -> CallbackHandle {
        self.inner.bus.register(Arc::new(callback))
    }

    /// Removes an observer. Returns false if it was not registered.
    pub fn unregister_callback(&self, handle: CallbackHandle) -> bool {
        self.inner.bus.unregister(handle)
    }

    /// Downloads `request` and waits for its terminal event.
    ///
    /// Dropping the returned future stops waiting but leaves the download
    /// running.
    ///
    /// # Errors
    ///
    /// Returns the error carried by the terminal `Error` event.
    pub async fn download(&self, request: DownloadRequest) -> Result<PathBuf, Arc<DownloadError>> {
        self.run_to_completion(request, None).await
    }

    /// Like [`download`](Self::download), also forwarding every event of the
    /// URL to `observer` until the terminal one.
    ///
    /// # Errors
    ///
    /// Returns the error carried by the terminal `Error` event.
    pub async fn download_observed(
        &self,
        request: DownloadRequest,
        observer: impl DownloadCallback + 'static,
    ) -> Result<PathBuf, Arc<DownloadError>> {
        let observer: Arc<dyn DownloadCallback> = Arc::new(observer);
        self.run_to_completion(request, Some(observer)).await
    }

    #[instrument(skip(self, request, observer), fields(url = %request.url()))]
    async fn run_to_completion(
        &self,
        request: DownloadRequest,
        observer: Option<Arc<dyn DownloadCallback>>,
    ) -> Result<PathBuf, Arc<DownloadError>> {
        let url = request.url().to_string();
        let (sender, receiver) = oneshot::channel();
        let slot = Mutex::new(Some(sender));
        let watched = url.clone();

        let handle = self.register_callback(move |info: &DownloadInfo| {
            if info.url() != watched {
                return;
            }
            let mut slot = slot.lock();
            if slot.is_none() {
                return;
            }
            if let Some(observer) = &observer {
                observer.on_download_info(info);
            }
            let outcome = match info {
                DownloadInfo::Success { file, .. } => Ok(file.clone()),
                DownloadInfo::Error { error, .. } => Err(Arc::clone(error)),
                _ => return,
            };
            if let Some(sender) = slot.take() {
                let _ = sender.send(outcome);
            }
        });
        let _registration = Registration {
            downloader: self.clone(),
            handle,
        };

        self.add_task(request);
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Arc::new(DownloadError::cancelled(url))),
        }
    }

    /// Streams events, optionally only those of `url_filter`.
    ///
    /// The observer is removed when the subscription is dropped.
    #[must_use]
    pub fn subscribe(&self, url_filter: Option<String>) -> InfoSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = self.register_callback(move |info: &DownloadInfo| {
            if url_filter.as_deref().is_none_or(|url| url == info.url()) {
                let _ = sender.send(info.clone());
            }
        });
        InfoSubscription {
            receiver,
            _registration: Registration {
                downloader: self.clone(),
                handle,
            },
        }
    }

    /// Number of registered observers, including internal one-shot ones.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.bus.observer_count()
    }
}

/// Unregisters an observer on drop.
#[derive(Debug)]
struct Registration {
    downloader: Downloader,
    handle: CallbackHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.downloader.unregister_callback(self.handle);
    }
}

/// Live stream of [`DownloadInfo`] events.
#[derive(Debug)]
pub struct InfoSubscription {
    receiver: mpsc::UnboundedReceiver<DownloadInfo>,
    _registration: Registration,
}

impl InfoSubscription {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<DownloadInfo> {
        self.receiver.recv().await
    }

    /// Returns an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<DownloadInfo> {
        self.receiver.try_recv().ok()
    }
}

impl Inner {
    fn publish(&self, info: DownloadInfo) {
        self.bus.publish(info);
    }

    /// Publishes an `Error` for a request that never became an active task.
    fn reject(&self, url: &str, strategy: ProgressNotifyStrategy, error: DownloadError) {
        warn!(url, error = %error, "rejecting download request");
        let task = DownloadTask::new(url, strategy);
        task.mark_error(Arc::new(error), |info| self.publish(info));
    }

    fn add_task(self: &Arc<Self>, request: DownloadRequest) -> bool {
        let url = request.url().to_string();
        let guard = self.state.lock();
        {
            let mut state = guard.borrow_mut();
            if state.active.contains_key(&url) {
                if state.cancelling.contains(&url) {
                    debug!(url = %url, "task is cancelling, parking request");
                    state.pending.insert(url, request);
                } else {
                    debug!(url = %url, "task already active");
                }
                return true;
            }
        }

        let strategy = request
            .progress_notify_strategy()
            .unwrap_or(self.default_strategy);
        if url.is_empty() {
            self.reject(&url, strategy, DownloadError::illegal_request("url is empty"));
            return false;
        }

        let dirname = request.dirname();
        let temp = match self.directory.temp_path_for(dirname, &url) {
            Ok(path) => path,
            Err(e) => {
                let path = self.directory.root().join(dirname);
                self.reject(&url, strategy, DownloadError::prepare_file(path, e));
                return false;
            }
        };
        let final_path = match self.directory.final_path_for(dirname, &url) {
            Ok(path) => path,
            Err(e) => {
                let path = self.directory.root().join(dirname);
                self.reject(&url, strategy, DownloadError::prepare_file(path, e));
                return false;
            }
        };

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(DownloadTask::new(&url, strategy));
        let keep_temp_on_error = request
            .prefer_breakpoint()
            .unwrap_or_else(|| self.executor.prefer_breakpoint());
        {
            let mut state = guard.borrow_mut();
            state.active.insert(
                url.clone(),
                ActiveEntry {
                    attempt,
                    task: Arc::clone(&task),
                    temp: temp.clone(),
                    final_path,
                    keep_temp_on_error,
                },
            );
            debug!(url = %url, attempt, size = state.active.len(), "add task");
        }
        task.mark_initialized(|info| self.publish(info));

        let updater = Arc::new(RegistryUpdater {
            registry: Arc::downgrade(self),
            url: url.clone(),
            attempt,
            task,
            finished: AtomicBool::new(false),
        });
        match self.executor.submit(request, temp, updater) {
            Ok(()) => true,
            Err(e) => {
                self.finish_error(&url, attempt, DownloadError::submit_failed(&url, e));
                false
            }
        }
    }

    fn cancel_task(&self, url: &str) {
        let guard = self.state.lock();
        let attempt = {
            let mut state = guard.borrow_mut();
            let Some(entry) = state.active.get(url) else {
                debug!(url, "cancel ignored, no active task");
                return;
            };
            let attempt = entry.attempt;
            if state.pending.remove(url).is_some() {
                debug!(url, "dropping parked request");
            }
            attempt
        };

        self.executor.cancel(url);

        let task = {
            let mut state = guard.borrow_mut();
            match state.active.get(url) {
                Some(entry) if entry.attempt == attempt => {
                    let task = Arc::clone(&entry.task);
                    state.cancelling.insert(url.to_string());
                    Some(task)
                }
                _ => None,
            }
        };
        match task {
            Some(task) => {
                debug!(url, attempt, "task cancelling");
                task.mark_cancelling(|info| self.publish(info));
            }
            None => debug!(url, attempt, "task terminated during cancel"),
        }
    }

    fn finish_success(self: &Arc<Self>, url: &str, attempt: u64) {
        let guard = self.state.lock();
        let (task, temp, final_path, cancelling) = {
            let state = guard.borrow();
            match state.active.get(url) {
                Some(entry) if entry.attempt == attempt => (
                    Arc::clone(&entry.task),
                    entry.temp.clone(),
                    entry.final_path.clone(),
                    state.cancelling.contains(url),
                ),
                _ => {
                    debug!(url, attempt, "ignoring success of a stale attempt");
                    return;
                }
            }
        };

        if cancelling || task.state() == TaskState::Cancelling {
            debug!(url, "transfer completed while cancelling, discarding temp file");
            remove_temp(&temp);
            self.finish_error(url, attempt, DownloadError::cancelled(url));
            return;
        }
        if !temp.is_file() {
            self.finish_error(url, attempt, DownloadError::temp_file_missing(temp));
            return;
        }
        if let Err(e) = self.directory.replace_final(&temp, &final_path) {
            self.finish_error(url, attempt, DownloadError::finalize_failed(final_path, e));
            return;
        }

        {
            let mut state = guard.borrow_mut();
            state.active.remove(url);
            state.cancelling.remove(url);
            if state.pending.remove(url).is_some() {
                debug!(url, "discarding parked request after success");
            }
            debug!(url, attempt, size = state.active.len(), "remove task");
        }
        info!(url, file = %final_path.display(), "download complete");
        task.mark_success(final_path, |info| self.publish(info));
    }

    fn finish_error(self: &Arc<Self>, url: &str, attempt: u64, error: DownloadError) {
        let guard = self.state.lock();
        let entry = {
            let mut state = guard.borrow_mut();
            if !state.active.get(url).is_some_and(|entry| entry.attempt == attempt) {
                debug!(url, attempt, error = %error, "ignoring error of a stale attempt");
                return;
            }
            state.cancelling.remove(url);
            let entry = state.active.remove(url);
            debug!(url, attempt, size = state.active.len(), "remove task");
            entry
        };
        let Some(entry) = entry else {
            return;
        };

        if !entry.keep_temp_on_error {
            remove_temp(&entry.temp);
        }
        if error.is_cancelled() {
            info!(url, "download cancelled");
        } else {
            warn!(url, error = %error, "download failed");
        }
        entry.task.mark_error(Arc::new(error), |info| self.publish(info));

        let pending = guard.borrow_mut().pending.remove(url);
        if let Some(request) = pending {
            debug!(url, "replaying parked request");
            self.add_task(request);
        }
    }
}

fn remove_temp(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "deleted temp file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete temp file"),
    }
}

/// Executor-facing sink for one attempt. Reports after the first terminal
/// outcome are ignored.
struct RegistryUpdater {
    registry: Weak<Inner>,
    url: String,
    attempt: u64,
    task: Arc<DownloadTask>,
    finished: AtomicBool,
}

impl TransferUpdater for RegistryUpdater {
    fn notify_progress(&self, total: u64, current: u64) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            self.task
                .mark_progress(total, current, |info| registry.publish(info));
        }
    }

    fn notify_success(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.finish_success(&self.url, self.attempt);
        }
    }

    fn notify_error(&self, error: DownloadError) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.finish_error(&self.url, self.attempt, error);
        }
    }
}
