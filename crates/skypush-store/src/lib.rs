//! Durable multi-valued key/value store for skypush.
//!
//! Each store is a single append-only text file. Every line records one set
//! mutation (`+ key value` or `- key value`) and the full file is replayed into
//! an in-memory mirror on open. Reads never touch the disk.
//!
//! Keys and values can be routed through a [`Codec`] that shortens common
//! prefixes before they are written.

mod codec;
mod error;
mod store;

pub use codec::{Codec, IdentityCodec, PrefixCodec};
pub use error::StoreError;
pub use store::{KvStore, ReplayMode, StoreOptions};
