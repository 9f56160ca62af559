//! Notification bus fanning [`DownloadInfo`] events out to observers.
//!
//! Events are queued on one channel and delivered by a single dispatcher
//! thread, so an observer never sees two events at the same time and the
//! events of one URL arrive in the order they were published. Every event
//! carries a sequence number; an observer only receives events published
//! after it was registered, even if older ones are still queued.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};

use super::info::DownloadInfo;

/// Observer of download events.
///
/// Implemented for any `Fn(&DownloadInfo) + Send + Sync` closure.
pub trait DownloadCallback: Send + Sync {
    /// Called on the dispatcher thread for every published event.
    fn on_download_info(&self, info: &DownloadInfo);
}

impl<F> DownloadCallback for F
where
    F: Fn(&DownloadInfo) + Send + Sync,
{
    fn on_download_info(&self, info: &DownloadInfo) {
        self(info);
    }
}

/// Token identifying a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

struct Observer {
    handle: CallbackHandle,
    since: u64,
    callback: Arc<dyn DownloadCallback>,
}

type ObserverList = Vec<Observer>;

struct Envelope {
    seq: u64,
    info: DownloadInfo,
}

struct Publisher {
    next_seq: u64,
    sender: Sender<Envelope>,
}

/// Ordered single-consumer delivery channel plus the observer set.
pub(crate) struct NotificationBus {
    publisher: Mutex<Publisher>,
    observers: Arc<RwLock<ObserverList>>,
    next_handle: AtomicU64,
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("observers", &self.observers.read().len())
            .finish_non_exhaustive()
    }
}

impl NotificationBus {
    /// Starts the dispatcher thread.
    ///
    /// The thread exits once the bus is dropped and the queue is drained.
    pub(crate) fn start() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let observers: Arc<RwLock<ObserverList>> = Arc::new(RwLock::new(Vec::new()));
        let dispatch_observers = Arc::clone(&observers);
        thread::Builder::new()
            .name("download-notify".to_string())
            .spawn(move || dispatch(&receiver, &dispatch_observers))?;
        Ok(Self {
            publisher: Mutex::new(Publisher {
                next_seq: 0,
                sender,
            }),
            observers,
            next_handle: AtomicU64::new(1),
        })
    }

    /// Queues an event for delivery.
    pub(crate) fn publish(&self, info: DownloadInfo) {
        trace!(url = %info.url(), event = info.label(), "queue notification");
        let mut publisher = self.publisher.lock();
        let seq = publisher.next_seq;
        publisher.next_seq += 1;
        if publisher.sender.send(Envelope { seq, info }).is_err() {
            debug!("notification dispatcher stopped; event dropped");
        }
    }

    /// Adds an observer and returns its handle.
    pub(crate) fn register(&self, callback: Arc<dyn DownloadCallback>) -> CallbackHandle {
        let handle = CallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        // holding the publisher pins `since` against concurrent publishes
        let publisher = self.publisher.lock();
        let mut observers = self.observers.write();
        observers.push(Observer {
            handle,
            since: publisher.next_seq,
            callback,
        });
        debug!(handle = handle.0, size = observers.len(), "register callback");
        handle
    }

    /// Removes an observer. Returns false if it was not registered.
    pub(crate) fn unregister(&self, handle: CallbackHandle) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|observer| observer.handle != handle);
        let removed = observers.len() != before;
        if removed {
            debug!(handle = handle.0, size = observers.len(), "unregister callback");
        }
        removed
    }

    /// Number of registered observers.
    pub(crate) fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

fn dispatch(receiver: &Receiver<Envelope>, observers: &RwLock<ObserverList>) {
    while let Ok(Envelope { seq, info }) = receiver.recv() {
        let snapshot: Vec<Arc<dyn DownloadCallback>> = observers
            .read()
            .iter()
            .filter(|observer| observer.since <= seq)
            .map(|observer| Arc::clone(&observer.callback))
            .collect();
        debug!(
            url = %info.url(),
            event = info.label(),
            observers = snapshot.len(),
            "notify callbacks"
        );
        for callback in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| callback.on_download_info(&info)));
            if delivered.is_err() {
                error!(url = %info.url(), "download callback panicked");
            }
        }
    }
    debug!("notification dispatcher exiting");
}
