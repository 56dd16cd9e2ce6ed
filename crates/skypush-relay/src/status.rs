//! Status snapshot served by `/api/status`.

use std::collections::BTreeMap;
use std::fs;

use chrono::{DateTime, Utc};
use serde::Serialize;
use skypush_atproto::{ConnectionState, EventKind, StreamError};
use tracing::debug;

use crate::queue::QueueStats;
use crate::relay::Relay;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub stream: StreamStatus,
    /// Classified events by kind.
    pub events: BTreeMap<&'static str, u64>,
    pub queue: QueueStats,
    pub registrations: RegistrationStatus,
    pub quotes: QuoteStatus,
    pub memory: MemoryStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub restarts: u64,
    pub messages: u64,
    pub commits: u64,
    pub ops: u64,
    pub decode_errors: u64,
    pub last_seq: Option<i64>,
    pub recent_errors: Vec<StreamError>,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self {
            connected: false,
            state: ConnectionState::Disconnected,
            restarts: 0,
            messages: 0,
            commits: 0,
            ops: 0,
            decode_errors: 0,
            last_seq: None,
            recent_errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStatus {
    pub dids: usize,
    pub tokens: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteStatus {
    /// Posts with at least one quote.
    pub posts: usize,
    pub quotes: usize,
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    /// Resident set size, where the platform reports it.
    pub rss_bytes: Option<u64>,
}

impl Relay {
    pub fn status(&self) -> StatusSnapshot {
        let (started, started_at) = self.started();

        let stream = self
            .firehose()
            .map(|monitor| {
                let stats = monitor.stats();
                StreamStatus {
                    connected: monitor.is_connected(),
                    state: monitor.state(),
                    restarts: stats.restarts,
                    messages: stats.messages,
                    commits: stats.commits,
                    ops: stats.ops,
                    decode_errors: stats.decode_errors,
                    last_seq: stats.last_seq,
                    recent_errors: stats.recent_errors.into_iter().collect(),
                }
            })
            .unwrap_or_default();

        let counts = self.event_counts();
        let events = EventKind::ALL
            .iter()
            .map(|kind| (kind.as_str(), counts.get(kind).copied().unwrap_or(0)))
            .collect();

        let quote_store = self.quotes().store();
        let file_size = quote_store.file_size().unwrap_or_else(|e| {
            debug!(error = %e, "failed to stat quote store");
            0
        });

        StatusSnapshot {
            started_at,
            uptime_secs: started.elapsed().as_secs(),
            stream,
            events,
            queue: self.queue().stats(),
            registrations: RegistrationStatus {
                dids: self.registrations().len(),
                tokens: self.registrations().total_entries(),
            },
            quotes: QuoteStatus {
                posts: quote_store.len(),
                quotes: quote_store.total_entries(),
                file_size,
            },
            memory: MemoryStatus {
                rss_bytes: resident_set_size(),
            },
        }
    }
}

/// Resident set size from `/proc/self/status`.
fn resident_set_size() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(parse_kib)
        .map(|kib| kib * 1024)
}

fn parse_kib(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::queue::test_support::RecordingSender;
    use crate::relay::RelayConfig;
    use skypush_atproto::FirehoseEvent;
    use tempfile::TempDir;

    #[test]
    fn test_parse_kib() {
        assert_eq!(parse_kib("   123456 kB"), Some(123456));
        assert_eq!(parse_kib(""), None);
        assert_eq!(parse_kib("lots"), None);
    }

    #[test]
    fn test_status_counts() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::open(
            &RelayConfig::new(dir.path()),
            Arc::new(RecordingSender::default()),
        )
        .unwrap();
        relay.register("did:plc:b", "tok1").unwrap();
        relay.register("did:plc:b", "tok2").unwrap();
        relay.register("did:plc:c", "tok3").unwrap();
        relay.publish(&FirehoseEvent {
            kind: EventKind::Quote,
            from_did: "did:plc:a".to_string(),
            to_did: "did:plc:b".to_string(),
            post_uri: Some("at://did:plc:a/app.bsky.feed.post/1".to_string()),
            quoted_uri: Some("at://did:plc:b/app.bsky.feed.post/2".to_string()),
        });

        let status = relay.status();
        assert_eq!(status.registrations.dids, 2);
        assert_eq!(status.registrations.tokens, 3);
        assert_eq!(status.quotes.posts, 1);
        assert_eq!(status.quotes.quotes, 1);
        assert!(status.quotes.file_size > 0);
        assert_eq!(status.queue.pending, 1);
        assert_eq!(status.events["quote"], 1);
        assert_eq!(status.events["like"], 0);
        assert!(!status.stream.connected);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stream"]["state"], "disconnected");
        assert!(json["uptimeSecs"].is_u64());
    }
}
