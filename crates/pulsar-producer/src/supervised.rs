//! Partition fan-out façade.
//!
//! Routes each publish to one of the per-partition producer actors by the
//! configured [`Strategy`]. Partition actors never see their siblings.

use std::sync::atomic::{AtomicUsize, Ordering};

use pulsar_proto::CommandSendReceipt;
use tracing::info;

use crate::error::Error;
use crate::hash::murmur2_partition;
use crate::message::Message;
use crate::options::{ProducerOpts, Strategy};
use crate::producer::Producer;

/// One partition of a partitioned topic: the suffixed topic name plus the
/// broker that owns it (from a topic lookup, which is outside this crate).
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub partition_topic: String,
    pub broker_url: String,
}

/// A set of supervised partition producers for one partitioned topic.
pub struct Producers {
    topic: String,
    strategy: Strategy,
    producers: Vec<Producer>,
    round_robin: AtomicUsize,
}

impl Producers {
    /// Spawn one producer per partition.
    pub fn start(
        topic: impl Into<String>,
        partitions: Vec<PartitionSpec>,
        opts: ProducerOpts,
    ) -> crate::Result<Self> {
        let topic = topic.into();
        if partitions.is_empty() {
            return Err(Error::Config(format!("topic {} has no partitions", topic)));
        }
        let strategy = opts.strategy;
        let producers = partitions
            .into_iter()
            .map(|p| Producer::spawn(p.partition_topic, p.broker_url, opts.clone()))
            .collect::<crate::Result<Vec<_>>>()?;
        info!(
            topic = %topic,
            partitions = producers.len(),
            strategy = ?strategy,
            "producers started"
        );
        Ok(Self {
            topic,
            strategy,
            producers,
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_count(&self) -> usize {
        self.producers.len()
    }

    /// Pick the partition producer for a batch by the configured strategy.
    /// Key dispatch hashes the first message's key; keyless batches go to
    /// partition 0.
    pub fn pick_producer(&self, batch: &[Message]) -> &Producer {
        let n = self.producers.len();
        let index = match self.strategy {
            Strategy::Random => rand::random::<u32>() as usize % n,
            Strategy::RoundRobin => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
            Strategy::KeyDispatch => batch
                .first()
                .and_then(|m| m.key.as_ref())
                .map(|key| murmur2_partition(key, n as u32) as usize)
                .unwrap_or(0),
        };
        &self.producers[index]
    }

    /// Fire-and-forget publish, routed by strategy.
    pub async fn send(&self, batch: Vec<Message>) -> crate::Result<()> {
        self.pick_producer(&batch).send(batch).await
    }

    /// Awaitable publish, routed by strategy.
    pub async fn send_sync(&self, batch: Vec<Message>) -> crate::Result<CommandSendReceipt> {
        self.pick_producer(&batch).send_sync(batch).await
    }

    /// Stop every partition producer and drop the handles.
    pub async fn stop_and_delete(&mut self) -> crate::Result<()> {
        for producer in self.producers.drain(..) {
            // A producer that already terminated (broker-initiated close)
            // is fine to skip.
            let _ = producer.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(n: usize) -> Vec<PartitionSpec> {
        (0..n)
            .map(|i| PartitionSpec {
                partition_topic: format!("persistent://public/default/t-partition-{}", i),
                broker_url: "pulsar://127.0.0.1:6650".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn round_robin_cycles_partitions() {
        let mut producers = Producers::start(
            "persistent://public/default/t",
            specs(3),
            ProducerOpts::builder().strategy(Strategy::RoundRobin).build(),
        )
        .unwrap();

        let batch = vec![Message::new("x")];
        let picked: Vec<String> = (0..6)
            .map(|_| producers.pick_producer(&batch).topic().to_string())
            .collect();
        assert_eq!(picked[0], picked[3]);
        assert_eq!(picked[1], picked[4]);
        assert_eq!(picked[2], picked[5]);
        assert_ne!(picked[0], picked[1]);
        producers.stop_and_delete().await.unwrap();
    }

    #[tokio::test]
    async fn key_dispatch_is_sticky_per_key() {
        let mut producers = Producers::start(
            "persistent://public/default/t",
            specs(4),
            ProducerOpts::builder().strategy(Strategy::KeyDispatch).build(),
        )
        .unwrap();

        let batch = vec![Message::with_key("customer-42", "v")];
        let first = producers.pick_producer(&batch).topic().to_string();
        for _ in 0..10 {
            assert_eq!(producers.pick_producer(&batch).topic(), first);
        }

        // Keyless batches land on partition 0.
        let keyless = vec![Message::new("v")];
        assert!(producers
            .pick_producer(&keyless)
            .topic()
            .ends_with("-partition-0"));
        producers.stop_and_delete().await.unwrap();
    }

    #[tokio::test]
    async fn start_rejects_empty_partition_list() {
        let result = Producers::start(
            "persistent://public/default/t",
            Vec::new(),
            ProducerOpts::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn random_stays_in_range() {
        let mut producers = Producers::start(
            "persistent://public/default/t",
            specs(2),
            ProducerOpts::builder().strategy(Strategy::Random).build(),
        )
        .unwrap();
        let batch = vec![Message::new("x")];
        for _ in 0..32 {
            let topic = producers.pick_producer(&batch).topic();
            assert!(topic.contains("-partition-"));
        }
        producers.stop_and_delete().await.unwrap();
    }
}
