//! Quote tracking.

use std::collections::BTreeMap;
use std::sync::Arc;

use skypush_atproto::{EventKind, FirehoseEvent};
use skypush_store::{KvStore, StoreError};
use tracing::trace;

/// Records which posts quote which, keyed by the quoted post's URI.
#[derive(Debug, Clone)]
pub struct QuoteCounter {
    store: Arc<KvStore>,
}

impl QuoteCounter {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Record a `quote` event. Other kinds are ignored.
    pub fn observe(&self, event: &FirehoseEvent) -> Result<(), StoreError> {
        if event.kind != EventKind::Quote {
            return Ok(());
        }
        let (Some(quoted), Some(post)) = (&event.quoted_uri, &event.post_uri) else {
            return Ok(());
        };
        if self.store.add(quoted, post)? {
            trace!(quoted = %quoted, post = %post, "quote recorded");
        }
        Ok(())
    }

    /// URIs of the posts quoting `uri`.
    pub fn quotes(&self, uri: &str) -> Vec<String> {
        self.store.get(uri).unwrap_or_default()
    }

    pub fn count(&self, uri: &str) -> usize {
        self.store.num_entries(uri)
    }

    /// Counts for several URIs at once; unknown URIs count 0.
    pub fn counts<'a>(&self, uris: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
        uris.into_iter()
            .map(|uri| (uri.to_string(), self.count(uri)))
            .collect()
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }
}
