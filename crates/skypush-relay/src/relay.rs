//! The relay service: consumes commits, classifies them and fans the
//! resulting events out to subscribers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use skypush_atproto::{EventKind, FirehoseEvent, FirehoseMonitor, RepoCommit, classify_commit};
use skypush_store::{KvStore, PrefixCodec, ReplayMode, StoreError, StoreOptions};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::RelayError;
use crate::push::PushSender;
use crate::queue::NotificationQueue;
use crate::quotes::QuoteCounter;

/// File name of the did -> device token store.
pub const REGISTRATIONS_FILE: &str = "registrations.log";

/// File name of the quoted uri -> quoting uri store.
pub const QUOTES_FILE: &str = "quotes.log";

/// Receives every classified event.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &FirehoseEvent);
}

impl EventSubscriber for NotificationQueue {
    fn on_event(&self, event: &FirehoseEvent) {
        if self.enqueue(event) {
            debug!(kind = %event.kind, to = %event.to_did, "notification queued");
        }
    }
}

impl EventSubscriber for QuoteCounter {
    fn on_event(&self, event: &FirehoseEvent) {
        if let Err(e) = self.observe(event) {
            warn!(error = %e, "failed to record quote");
        }
    }
}

/// Where the relay keeps its data.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    pub replay: ReplayMode,
}

impl RelayConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            replay: ReplayMode::Strict,
        }
    }

    pub fn registrations_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRATIONS_FILE)
    }

    pub fn quotes_path(&self) -> PathBuf {
        self.data_dir.join(QUOTES_FILE)
    }

    /// Open a store under the data directory with the ATProto prefix codec.
    pub fn open_store(&self, path: PathBuf) -> Result<KvStore, StoreError> {
        KvStore::open_with(
            path,
            PrefixCodec::atproto(),
            StoreOptions {
                replay: self.replay,
            },
        )
    }
}

pub struct Relay {
    registrations: Arc<KvStore>,
    quotes: QuoteCounter,
    queue: Arc<NotificationQueue>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    firehose: Option<FirehoseMonitor>,
    events: Mutex<HashMap<EventKind, u64>>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Relay {
    /// Open both stores under `config.data_dir`.
    pub fn open(config: &RelayConfig, sender: Arc<dyn PushSender>) -> Result<Self, RelayError> {
        let registrations = config.open_store(config.registrations_path())?;
        let quotes = config.open_store(config.quotes_path())?;
        Ok(Self::new(Arc::new(registrations), Arc::new(quotes), sender))
    }

    pub fn new(
        registrations: Arc<KvStore>,
        quotes: Arc<KvStore>,
        sender: Arc<dyn PushSender>,
    ) -> Self {
        let quotes = QuoteCounter::new(quotes);
        let queue = Arc::new(NotificationQueue::new(Arc::clone(&registrations), sender));
        let subscribers: Vec<Arc<dyn EventSubscriber>> = vec![
            Arc::new(quotes.clone()) as Arc<dyn EventSubscriber>,
            Arc::clone(&queue) as Arc<dyn EventSubscriber>,
        ];

        Self {
            registrations,
            quotes,
            queue,
            subscribers,
            firehose: None,
            events: Mutex::new(HashMap::new()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Report the state of this firehose connection in the status snapshot.
    pub fn with_firehose(mut self, monitor: FirehoseMonitor) -> Self {
        self.firehose = Some(monitor);
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn registrations(&self) -> &KvStore {
        &self.registrations
    }

    pub fn quotes(&self) -> &QuoteCounter {
        &self.quotes
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }

    pub(crate) fn firehose(&self) -> Option<&FirehoseMonitor> {
        self.firehose.as_ref()
    }

    pub(crate) fn started(&self) -> (Instant, DateTime<Utc>) {
        (self.started, self.started_at)
    }

    pub(crate) fn event_counts(&self) -> HashMap<EventKind, u64> {
        lock(&self.events).clone()
    }

    /// Register `token` to receive notifications for `did`.
    pub fn register(&self, did: &str, token: &str) -> Result<bool, RelayError> {
        let added = self.registrations.add(did, token)?;
        if added {
            info!(did = %did, "device registered");
        }
        Ok(added)
    }

    /// Remove `token` from `did`. Fails when `did` has no registrations.
    pub fn unregister(&self, did: &str, token: &str) -> Result<bool, RelayError> {
        if !self.registrations.has(did) {
            return Err(RelayError::UnknownDid(did.to_string()));
        }
        let removed = self.registrations.remove(did, token)?;
        if removed {
            info!(did = %did, "device unregistered");
        }
        Ok(removed)
    }

    /// Classify `commit` and publish its events. Returns how many were published.
    pub fn handle_commit(&self, commit: &RepoCommit) -> usize {
        let events = classify_commit(commit);
        for event in &events {
            self.publish(event);
        }
        events.len()
    }

    /// Hand `event` to every subscriber, in registration order.
    pub fn publish(&self, event: &FirehoseEvent) {
        *lock(&self.events).entry(event.kind).or_default() += 1;
        for subscriber in &self.subscribers {
            subscriber.on_event(event);
        }
    }

    /// Consume commits in order until the channel closes or `shutdown` flips.
    pub async fn run_pipeline(
        &self,
        mut commits: mpsc::UnboundedReceiver<RepoCommit>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                commit = commits.recv() => match commit {
                    Some(commit) => {
                        self.handle_commit(&commit);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("event pipeline stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
