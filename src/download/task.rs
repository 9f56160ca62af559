//! Per-URL download task: state machine plus progress accumulator.
//!
//! All transitions are compare-and-set under one mutex and are idempotent
//! against duplicate calls. The event produced by a successful transition
//! is handed to the caller's sink while the mutex is still held, so events
//! of one task reach the notification channel in transition order even when
//! transitions race on different threads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::error;

use super::error::DownloadError;
use super::info::{DownloadInfo, DownloadProgress};
use super::request::ProgressNotifyStrategy;

/// Lifecycle state of a [`DownloadTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet registered.
    None,
    /// Registered and submitted.
    Initialized,
    /// At least one progress sample arrived.
    Progress,
    /// Cancellation requested, waiting for the executor to drain.
    Cancelling,
    /// Terminal: file published.
    Success,
    /// Terminal: attempt failed or was cancelled.
    Error,
}

impl TaskState {
    /// Returns true for `Success` and `Error`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// In-memory state of one URL's active download.
#[derive(Debug)]
pub struct DownloadTask {
    url: String,
    strategy: ProgressNotifyStrategy,
    inner: Mutex<TaskInner>,
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    transmit: Transmit,
    info: Option<DownloadInfo>,
}

impl DownloadTask {
    /// Creates a task in state `None`.
    #[must_use]
    pub fn new(url: impl Into<String>, strategy: ProgressNotifyStrategy) -> Self {
        Self {
            url: url.into(),
            strategy,
            inner: Mutex::new(TaskInner {
                state: TaskState::None,
                transmit: Transmit::new(Instant::now()),
                info: None,
            }),
        }
    }

    /// The URL of this task.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Last non-terminal event emitted by this task.
    #[must_use]
    pub fn info(&self) -> Option<DownloadInfo> {
        self.inner.lock().info.clone()
    }

    /// `None -> Initialized`. Emits `Initialized` once.
    pub fn mark_initialized(&self, emit: impl FnOnce(DownloadInfo)) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::None {
            return false;
        }
        inner.state = TaskState::Initialized;
        let info = DownloadInfo::Initialized {
            url: self.url.clone(),
        };
        inner.info = Some(info.clone());
        emit(info);
        true
    }

    /// Records a progress sample and emits `Progress` if the throttling policy accepts it.
    pub fn mark_progress(&self, total: u64, current: u64, emit: impl FnOnce(DownloadInfo)) -> bool {
        self.mark_progress_at(total, current, Instant::now(), emit)
    }

    /// Like [`mark_progress`](Self::mark_progress) with an explicit sample time.
    pub fn mark_progress_at(
        &self,
        total: u64,
        current: u64,
        now: Instant,
        emit: impl FnOnce(DownloadInfo),
    ) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            TaskState::None => {
                error!(url = %self.url, "progress reported for a task that was never initialized");
                debug_assert!(false, "progress reported before initialization");
                false
            }
            TaskState::Initialized | TaskState::Progress => {
                inner.state = TaskState::Progress;
                if !inner.transmit.update(total, current, now, self.strategy.step()) {
                    return false;
                }
                let info = DownloadInfo::Progress(inner.transmit.to_progress(&self.url));
                inner.info = Some(info.clone());
                emit(info);
                true
            }
            TaskState::Cancelling | TaskState::Success | TaskState::Error => false,
        }
    }

    /// `Initialized | Progress -> Cancelling`. Emits `Cancelling` once.
    pub fn mark_cancelling(&self, emit: impl FnOnce(DownloadInfo)) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, TaskState::Initialized | TaskState::Progress) {
            return false;
        }
        inner.state = TaskState::Cancelling;
        let info = DownloadInfo::Cancelling {
            url: self.url.clone(),
        };
        inner.info = Some(info.clone());
        emit(info);
        true
    }

    /// `Initialized | Progress -> Success`. Emits `Success(file)`.
    pub fn mark_success(&self, file: PathBuf, emit: impl FnOnce(DownloadInfo)) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, TaskState::Initialized | TaskState::Progress) {
            return false;
        }
        inner.state = TaskState::Success;
        emit(DownloadInfo::Success {
            url: self.url.clone(),
            file,
        });
        true
    }

    /// Any non-terminal state `-> Error`. Emits `Error(error)`.
    pub fn mark_error(&self, error: Arc<DownloadError>, emit: impl FnOnce(DownloadInfo)) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = TaskState::Error;
        emit(DownloadInfo::Error {
            url: self.url.clone(),
            error,
        });
        true
    }
}

/// Progress and speed accumulator.
#[derive(Debug)]
struct Transmit {
    total: u64,
    current: u64,
    percent: u8,
    speed_bps: u64,
    reached_full: bool,
    last_speed_at: Instant,
    last_speed_count: u64,
}

impl Transmit {
    fn new(now: Instant) -> Self {
        Self {
            total: 0,
            current: 0,
            percent: 0,
            speed_bps: 0,
            reached_full: false,
            last_speed_at: now,
            last_speed_count: 0,
        }
    }

    /// Applies a sample; returns true if it should be notified.
    fn update(&mut self, total: u64, current: u64, now: Instant, step: u8) -> bool {
        let old_percent = self.percent;

        if total == 0 || current == 0 {
            *self = Self::new(now);
            return old_percent != self.percent;
        }

        self.total = total;
        self.current = current;

        let percent = percent_of(current, total);
        let first_full = percent == 100 && !self.reached_full;
        if percent.saturating_sub(old_percent) < step && !first_full {
            return false;
        }

        let elapsed_ms = now.saturating_duration_since(self.last_speed_at).as_millis().max(1);
        let bytes = u128::from(current.saturating_sub(self.last_speed_count));
        self.speed_bps = u64::try_from(bytes * 1000 / elapsed_ms).unwrap_or(u64::MAX);
        self.last_speed_at = now;
        self.last_speed_count = current;

        self.percent = percent;
        self.reached_full |= percent == 100;
        true
    }

    fn to_progress(&self, url: &str) -> DownloadProgress {
        DownloadProgress {
            url: url.to_string(),
            total: self.total,
            current: self.current,
            percent: self.percent,
            speed_bps: self.speed_bps,
        }
    }
}

fn percent_of(current: u64, total: u64) -> u8 {
    let percent = (u128::from(current) * 100 / u128::from(total)).min(100);
    u8::try_from(percent).unwrap_or(100)
}
