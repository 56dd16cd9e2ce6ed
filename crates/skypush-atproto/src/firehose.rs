//! Firehose client for the network-wide repository event stream.
//!
//! Subscribes to `com.atproto.sync.subscribeRepos`, decodes `#commit` frames
//! and hands every [`RepoCommit`] to a consumer over an unbounded channel.
//! The connection is watched by a liveness timer and re-opened after a fixed
//! delay whenever it fails, forever.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::frame::{Frame, RepoCommit, decode_frame};
use crate::AtprotoError;

/// Default upstream relay.
pub const DEFAULT_RELAY_URL: &str = "wss://bsky.network";

const SUBSCRIBE_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

/// Default liveness interval.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(10);

/// Default delay between a failure and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How many stream errors [`FirehoseStats`] remembers.
pub const MAX_RECENT_ERRORS: usize = 20;

/// Error frames after which the remembered cursor is useless.
const CURSOR_RESET_ERRORS: &[&str] = &["FutureCursor", "ConsumerTooSlow"];

/// Binary frames from one subscription.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, AtprotoError>> + Send>>;

/// Opens a subscription and yields its binary frames.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream, AtprotoError>;
}

/// [`Connector`] over a real WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, AtprotoError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| AtprotoError::WebSocket(format!("connection failed: {}", e)))?;

        // Pongs are queued by tungstenite and flushed on the next read.
        let frames = ws_stream.filter_map(|message| async move {
            match message {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Close(_)) => Some(Err(AtprotoError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(AtprotoError::WebSocket(format!("read error: {}", e)))),
            }
        });
        Ok(Box::pin(frames))
    }
}

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    ErrorBackoff,
}

/// Client tuning.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Relay base URL, e.g. `wss://bsky.network`.
    pub url: String,
    pub watchdog: Duration,
    pub reconnect_delay: Duration,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            watchdog: DEFAULT_WATCHDOG,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// A stream failure, as remembered for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Counters describing the stream since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseStats {
    /// Number of times a subscription was opened.
    pub restarts: u64,
    pub messages: u64,
    pub commits: u64,
    pub ops: u64,
    /// Frames and operations that failed to decode.
    pub decode_errors: u64,
    pub last_seq: Option<i64>,
    pub recent_errors: VecDeque<StreamError>,
}

impl FirehoseStats {
    fn record_error(&mut self, message: String) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(StreamError {
            at: Utc::now(),
            message,
        });
    }
}

/// Read-only view of a running [`FirehoseClient`].
#[derive(Debug, Clone)]
pub struct FirehoseMonitor {
    stats: Arc<Mutex<FirehoseStats>>,
    state: watch::Receiver<ConnectionState>,
}

impl FirehoseMonitor {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub fn stats(&self) -> FirehoseStats {
        lock(&self.stats).clone()
    }

    /// A receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Reconnecting firehose subscriber.
pub struct FirehoseClient {
    config: FirehoseConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<Mutex<FirehoseStats>>,
    /// Last commit `seq` seen; 0 when there is nothing to resume from.
    cursor: AtomicI64,
}

impl FirehoseClient {
    /// A client that connects over WebSocket.
    pub fn new(config: FirehoseConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(config: FirehoseConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            state,
            stats: Arc::new(Mutex::new(FirehoseStats::default())),
            cursor: AtomicI64::new(0),
        }
    }

    pub fn monitor(&self) -> FirehoseMonitor {
        FirehoseMonitor {
            stats: Arc::clone(&self.stats),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The subscription URL for the next connection attempt.
    pub fn subscribe_url(&self) -> String {
        let base = self.config.url.trim_end_matches('/');
        match self.cursor.load(Ordering::SeqCst) {
            0 => format!("{}{}", base, SUBSCRIBE_PATH),
            seq => format!("{}{}?cursor={}", base, SUBSCRIBE_PATH, seq),
        }
    }

    /// Stream commits into `commits` until `shutdown` flips to true or the
    /// receiving side goes away.
    ///
    /// Every failure leads to `ErrorBackoff` and, after the reconnect delay,
    /// a fresh subscription.
    pub async fn run(
        &self,
        commits: mpsc::UnboundedSender<RepoCommit>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Constant::new(self.config.reconnect_delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let url = self.subscribe_url();
            let attempt = {
                let mut stats = lock(&self.stats);
                stats.restarts += 1;
                stats.restarts
            };
            self.set_state(ConnectionState::Connecting);
            info!(url = %url, attempt, "connecting to firehose");

            let outcome = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => None,
                outcome = self.stream_once(&url, &commits) => Some(outcome),
            };

            let error = match outcome {
                None => break,
                Some(Ok(())) => {
                    info!("commit consumer gone, stopping firehose");
                    break;
                }
                Some(Err(e)) => e,
            };

            warn!(error = %error, "firehose connection lost");
            lock(&self.stats).record_error(error.to_string());
            self.set_state(ConnectionState::ErrorBackoff);

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect_delay);
            let stopped = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if stopped {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("firehose client stopped");
    }

    /// Run one subscription. Returns `Ok` only when the consumer has hung up.
    async fn stream_once(
        &self,
        url: &str,
        commits: &mpsc::UnboundedSender<RepoCommit>,
    ) -> Result<(), AtprotoError> {
        let mut frames = timeout(self.config.watchdog, self.connector.connect(url))
            .await
            .map_err(|_| AtprotoError::Stale(self.config.watchdog.as_secs()))??;

        loop {
            // Returning drops `frames`, which closes a stale connection.
            let data = match timeout(self.config.watchdog, frames.next()).await {
                Err(_) => return Err(AtprotoError::Stale(self.config.watchdog.as_secs())),
                Ok(None) => return Err(AtprotoError::Closed),
                Ok(Some(result)) => result?,
            };

            lock(&self.stats).messages += 1;

            match decode_frame(&data).await {
                Ok(Frame::Commit(commit)) => {
                    self.mark_streaming();
                    {
                        let mut stats = lock(&self.stats);
                        stats.commits += 1;
                        stats.ops += commit.ops.len() as u64;
                        stats.decode_errors += commit.skipped_ops as u64;
                        stats.last_seq = Some(commit.seq);
                    }
                    if commit.seq > 0 {
                        self.cursor.store(commit.seq, Ordering::SeqCst);
                    }
                    if commits.send(commit).is_err() {
                        return Ok(());
                    }
                }
                Ok(Frame::Info { name, message }) => {
                    self.mark_streaming();
                    info!(name = ?name, message = ?message, "firehose info frame");
                }
                Ok(Frame::Error { error, message }) => {
                    let error = error.unwrap_or_else(|| "unknown".to_string());
                    if CURSOR_RESET_ERRORS.contains(&error.as_str()) {
                        warn!(error = %error, "dropping firehose cursor");
                        self.cursor.store(0, Ordering::SeqCst);
                    }
                    return Err(AtprotoError::ErrorFrame { error, message });
                }
                Ok(Frame::Ignored(kind)) => {
                    self.mark_streaming();
                    trace!(kind = ?kind, "ignoring firehose frame");
                }
                Err(e) => {
                    lock(&self.stats).decode_errors += 1;
                    debug!(error = %e, "failed to decode firehose frame");
                }
            }
        }
    }

    fn mark_streaming(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Streaming;
                true
            } else {
                false
            }
        });
        if changed {
            info!("firehose streaming");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }
}

/// Resolves once the shutdown flag is set or its sender is dropped.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
