//! Push-notification relay for the ATProto firehose.
//!
//! This crate turns decoded firehose commits into notifications:
//! - [`Relay`] classifies commits and fans events out to subscribers
//! - [`NotificationQueue`] batches deliveries to registered devices
//! - [`QuoteCounter`] keeps a durable index of quote posts
//! - [`create_router`] serves the registration and quote API

mod error;
pub mod push;
mod queue;
mod quotes;
mod relay;
mod routes;
mod status;

pub use error::{ApiError, RelayError};
pub use push::{DEFAULT_PUSH_URL, ExpoPushSender, PushError, PushMessage, PushSender};
pub use queue::{FlushReport, NotificationQueue, QueueStats, QueuedNotification};
pub use quotes::QuoteCounter;
pub use relay::{EventSubscriber, QUOTES_FILE, REGISTRATIONS_FILE, Relay, RelayConfig};
pub use routes::create_router;
pub use status::{MemoryStatus, QuoteStatus, RegistrationStatus, StatusSnapshot, StreamStatus};
