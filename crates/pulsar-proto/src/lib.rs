//! Pulsar Wire Protocol
//!
//! This crate defines the subset of the Apache Pulsar binary protocol spoken
//! by the producer client: protobuf command structures and the length-prefixed
//! frame codec that carries them.
//!
//! # Wire Format
//!
//! Every frame starts with two big-endian length prefixes:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────────────────┐
//! │ total_size (u32) │ command_size(u32)│ command (protobuf)          │
//! └──────────────────┴──────────────────┴─────────────────────────────┘
//! ```
//!
//! Frames that carry message payloads (`Send`) append a payload block after
//! the command:
//!
//! ```text
//! ┌──────────────┬───────────────┬────────────────────┬──────────┬─────────┐
//! │ magic 0x0e01 │ checksum (u32)│ metadata_size (u32)│ metadata │ payload │
//! └──────────────┴───────────────┴────────────────────┴──────────┴─────────┘
//! ```
//!
//! The checksum is CRC32C (Castagnoli) computed over everything after the
//! checksum field: `[metadata_size][metadata][payload]`. The magic/checksum
//! pair is optional on the wire; frames without it are accepted as-is.
//!
//! Batched sends concatenate, per message, a big-endian `u32` size prefix,
//! a `SingleMessageMetadata`, and the message payload. A single un-batched
//! message is written directly with no per-message prefix.
//!
//! # Protocol Stability
//!
//! Field tags mirror `PulsarApi.proto`; changing them breaks interop with
//! real brokers.

mod commands;
mod error;
pub mod frame;

pub use commands::{
    base_command, BaseCommand, CommandCloseProducer, CommandConnect, CommandConnected,
    CommandPing, CommandPong, CommandProducer, CommandProducerSuccess, CommandSend,
    CommandSendError, CommandSendReceipt, KeyValue, MessageIdData, MessageMetadata,
    SingleMessageMetadata,
};
pub use error::{ProtoError, Result};
pub use frame::{BrokerPayload, Frame};

/// Protocol version advertised in `Connect`.
pub const PROTOCOL_VERSION: i32 = 15;

/// Client version string advertised in `Connect`.
pub const CLIENT_VERSION: &str = concat!("pulsar-spool-", env!("CARGO_PKG_VERSION"));

/// Magic number preceding the payload checksum.
pub const PAYLOAD_MAGIC: u16 = 0x0e01;

/// Maximum accepted frame size: 5 MiB of body plus framing headers.
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024 + 64;
