//! Notification dispatch queue.
//!
//! Events are matched to device tokens when they are enqueued and delivered
//! in batches by a fixed-interval flush. A token whose delivery fails is
//! removed from the registrations; nothing is retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use skypush_atproto::FirehoseEvent;
use skypush_store::KvStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::push::PushSender;

/// An event waiting to be delivered, with the tokens it goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedNotification {
    pub event: FirehoseEvent,
    pub tokens: Vec<String>,
}

/// Outcome of one [`NotificationQueue::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
}

/// Lifetime delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub enqueued: u64,
    pub sent: u64,
    pub failed: u64,
    pub pruned_tokens: u64,
}

pub struct NotificationQueue {
    /// Recipient did -> device tokens.
    registrations: Arc<KvStore>,
    sender: Arc<dyn PushSender>,
    pending: Mutex<Vec<QueuedNotification>>,
    enqueued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    pruned: AtomicU64,
}

impl NotificationQueue {
    pub fn new(registrations: Arc<KvStore>, sender: Arc<dyn PushSender>) -> Self {
        Self {
            registrations,
            sender,
            pending: Mutex::new(Vec::new()),
            enqueued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    /// Queue `event` for every device registered to its recipient.
    ///
    /// Returns false when nothing was queued: self-events and recipients
    /// without tokens are dropped here.
    pub fn enqueue(&self, event: &FirehoseEvent) -> bool {
        if event.is_self_event() {
            return false;
        }
        let Some(tokens) = self.registrations.get(&event.to_did) else {
            return false;
        };

        lock(&self.pending).push(QueuedNotification {
            event: event.clone(),
            tokens,
        });
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Notifications waiting for the next flush.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pruned_tokens: self.pruned.load(Ordering::Relaxed),
        }
    }

    /// Deliver everything queued so far and wait for every send.
    ///
    /// The queue is swapped out before sending, so events enqueued while a
    /// flush is in flight wait for the next one.
    pub async fn flush(&self) -> FlushReport {
        let batch = self.take_batch();
        self.deliver(batch).await
    }

    /// Swap out everything queued so far and deliver it on a spawned task.
    ///
    /// Returns without waiting for the push service; the handle resolves to
    /// the batch's report.
    pub fn dispatch(self: &Arc<Self>) -> JoinHandle<FlushReport> {
        let batch = self.take_batch();
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.deliver(batch).await })
    }

    fn take_batch(&self) -> Vec<QueuedNotification> {
        std::mem::take(&mut *lock(&self.pending))
    }

    async fn deliver(&self, batch: Vec<QueuedNotification>) -> FlushReport {
        if batch.is_empty() {
            return FlushReport::default();
        }

        let deliveries = batch.iter().flat_map(|notification| {
            notification.tokens.iter().map(move |token| async move {
                let result = self.sender.send(token, &notification.event).await;
                (notification, token, result)
            })
        });

        let mut report = FlushReport::default();
        for (notification, token, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    self.prune(&notification.event.to_did, token, &e);
                }
            }
        }

        self.sent.fetch_add(report.sent as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        debug!(sent = report.sent, failed = report.failed, "notification flush complete");
        report
    }

    fn prune(&self, did: &str, token: &str, error: &dyn std::error::Error) {
        warn!(did = %did, error = %error, "push failed, dropping token");
        match self.registrations.remove(did, token) {
            Ok(true) => {
                self.pruned.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(e) => warn!(did = %did, error = %e, "failed to drop token"),
        }
    }

    /// Dispatch every `period` until `shutdown` flips to true. Ticks never
    /// wait on earlier deliveries. Whatever is still queued at shutdown is
    /// dropped.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_empty() {
                        self.dispatch();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(dropped = self.len(), "notification queue stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
