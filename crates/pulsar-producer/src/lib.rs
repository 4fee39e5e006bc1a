//! # pulsar-producer
//!
//! A durable producer client for Apache Pulsar: one single-task actor per
//! topic partition that owns the broker TCP connection, spools every
//! outbound message through a [`replayq`] queue, batches and sequences
//! sends, and correlates broker receipts with the callers and storage they
//! release.
//!
//! ## Features
//!
//! - **Durable spooling**: messages are accepted even while disconnected;
//!   a disk-backed queue (configure `replayq_dir`) survives restarts, and
//!   storage is released only after the broker confirms receipt.
//! - **Automatic reconnect**: transient transport failures retry on a fixed
//!   delay; unacknowledged batches are re-sent with their original sequence
//!   ids before anything newer.
//! - **Batching**: fire-and-forget sends coalesce up to `batch_size`
//!   messages per frame; awaitable sends are always their own batch.
//! - **Partition fan-out**: the [`Producers`] façade routes batches across
//!   partitions by random, round-robin, or key-dispatch strategy.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use pulsar_producer::{Message, Producer, ProducerOpts};
//!
//! # async fn example() -> pulsar_producer::Result<()> {
//! let producer = Producer::spawn(
//!     "persistent://public/default/events-partition-0",
//!     "pulsar://127.0.0.1:6650",
//!     ProducerOpts::builder()
//!         .batch_size(100)
//!         .replayq_dir("/var/spool/pulsar")
//!         .build(),
//! )?;
//!
//! // Fire-and-forget: spooled durably, confirmed via the callback.
//! producer.send(vec![Message::with_key("k", "v")]).await?;
//!
//! // Awaitable: resolves with the broker receipt.
//! let receipt = producer.send_sync(vec![Message::new("payload")]).await?;
//! assert!(receipt.sequence_id > 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Partitioned topics
//!
//! ```rust,ignore
//! use pulsar_producer::{Message, PartitionSpec, Producers, ProducerOpts, Strategy};
//!
//! # async fn example(partitions: Vec<PartitionSpec>) -> pulsar_producer::Result<()> {
//! let producers = Producers::start(
//!     "persistent://public/default/events",
//!     partitions,
//!     ProducerOpts::builder().strategy(Strategy::KeyDispatch).build(),
//! )?;
//! producers.send(vec![Message::with_key("customer-42", "v")]).await?;
//! # Ok(())
//! # }
//! ```

mod actor;
mod compat;
mod error;
pub mod hash;
mod message;
mod options;
mod producer;
mod requests;
mod state;
mod supervised;

pub use compat::{LegacyOpts, LegacyRequest, LegacyState, RequestSnapshot, StateSnapshot};
pub use error::{Error, Result};
pub use message::Message;
pub use options::{ProducerOpts, ProducerOptsBuilder, SendCallback, Strategy, TcpOpts};
pub use producer::{Producer, DEFAULT_SEND_SYNC_TIMEOUT};
pub use state::ProducerState;
pub use supervised::{PartitionSpec, Producers};

// Protocol types that surface through the public API.
pub use pulsar_proto::{CommandSendReceipt, MessageIdData};
pub use replayq::AckRef;
