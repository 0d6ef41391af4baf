//! `DeviceHub` Core -- wire messages, channel schema, and hash-ids.
//!
//! This crate provides the foundation layer for the `DeviceHub` gateway:
//!
//! - **Message** ([`message`]): the protocol `Message` and its binary frame codec
//! - **Schema** ([`schema`]): `Channel` definitions with tag/field validation
//! - **Hash-id** ([`hashid`]): salted reversible channel handles for URLs
//! - **Traits** ([`traits`]): `ChannelResolver`, `IndexSink` seams to external
//!   persistence and search indexing

pub mod hashid;
pub mod message;
pub mod schema;
pub mod traits;

// Message
pub use message::{CodecError, Message, MessageKind, FLAG_RETAINED, FLAG_URGENT, MAX_ID_LEN};

// Schema
pub use schema::{Channel, FieldType, ValidationError, MAX_FIELDS, MAX_TAGS};

// Hash-id
pub use hashid::{ChannelHash, HashIdError, DEFAULT_MIN_LENGTH};

// Traits
pub use traits::{ChannelResolver, IndexError, IndexSink, TelemetryDocument};
