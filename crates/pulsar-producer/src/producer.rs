//! Public producer handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pulsar_proto::CommandSendReceipt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::actor::{Cmd, ProducerActor};
use crate::error::Error;
use crate::message::Message;
use crate::options::ProducerOpts;
use crate::state::ProducerState;

/// Default caller-side timeout for [`Producer::send_sync`].
pub const DEFAULT_SEND_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

const MAILBOX_CAPACITY: usize = 1024;

static NEXT_PRODUCER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one partition producer actor. Cheap to clone; every clone
/// addresses the same actor.
#[derive(Debug, Clone)]
pub struct Producer {
    tx: mpsc::Sender<Cmd>,
    partition_topic: String,
}

impl Producer {
    /// Open the durable queue for this partition and spawn its actor. The
    /// actor immediately starts dialing the broker; messages sent before
    /// the connection is up are spooled and drained on connect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        partition_topic: impl Into<String>,
        broker_url: impl Into<String>,
        opts: ProducerOpts,
    ) -> crate::Result<Self> {
        let partition_topic = partition_topic.into();
        let producer_id = NEXT_PRODUCER_ID.fetch_add(1, Ordering::Relaxed);
        let state = ProducerState::new(partition_topic.clone(), broker_url, producer_id, opts)?;
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(ProducerActor::new(state, rx).run());
        Ok(Self {
            tx,
            partition_topic,
        })
    }

    /// The partition topic this producer publishes to.
    pub fn topic(&self) -> &str {
        &self.partition_topic
    }

    /// Fire-and-forget publish. The messages are spooled durably and the
    /// configured callback (if any) fires once the batch is receipted.
    pub async fn send(&self, messages: Vec<Message>) -> crate::Result<()> {
        self.tx
            .send(Cmd::Publish { messages })
            .await
            .map_err(|_| Error::ProducerClosed)
    }

    /// Awaitable publish with the default caller timeout.
    pub async fn send_sync(&self, messages: Vec<Message>) -> crate::Result<CommandSendReceipt> {
        self.send_sync_timeout(messages, DEFAULT_SEND_SYNC_TIMEOUT)
            .await
    }

    /// Awaitable publish. A timeout here is local to the caller: the actor
    /// still processes the broker receipt and releases spool storage.
    pub async fn send_sync_timeout(
        &self,
        messages: Vec<Message>,
        wait: Duration,
    ) -> crate::Result<CommandSendReceipt> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::PublishSync { messages, reply })
            .await
            .map_err(|_| Error::ProducerClosed)?;
        match timeout(wait, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::ProducerClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Stop the actor, flushing and closing the durable queue. Resolves
    /// once the actor has exited.
    pub async fn shutdown(&self) -> crate::Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Shutdown { done })
            .await
            .map_err(|_| Error::ProducerClosed)?;
        rx.await.map_err(|_| Error::ProducerClosed)
    }
}
