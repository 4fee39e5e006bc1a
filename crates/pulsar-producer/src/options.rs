//! Producer configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pulsar_proto::CommandSendReceipt;
use replayq::QueueConfig;
use serde::{Deserialize, Serialize};

/// Async result sink invoked once per completed batch with the broker
/// receipt.
pub type SendCallback = Arc<dyn Fn(CommandSendReceipt) + Send + Sync + 'static>;

/// Partition routing strategy, applied by the [`Producers`](crate::Producers)
/// façade; individual partition actors never route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strategy {
    #[default]
    Random,
    RoundRobin,
    /// Route by murmur2 hash of the first message's key.
    KeyDispatch,
}

/// Socket options, merged over the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpOpts {
    pub nodelay: bool,
    /// Desired send buffer size; the larger of send/recv is applied to both.
    pub send_buf: Option<usize>,
    pub recv_buf: Option<usize>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for TcpOpts {
    fn default() -> Self {
        Self {
            nodelay: true,
            send_buf: None,
            recv_buf: None,
            connect_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(60),
        }
    }
}

/// Options for a partition producer.
#[derive(Clone, Default)]
pub struct ProducerOpts {
    /// Soft maximum of messages coalesced per send; 0 disables coalescing.
    pub batch_size: usize,
    pub strategy: Strategy,
    pub tcp_opts: TcpOpts,
    /// Spool directory; absence selects a mem-only queue.
    pub replayq_dir: Option<PathBuf>,
    pub replayq_seg_bytes: Option<u64>,
    pub replayq_offload_mode: bool,
    pub replayq_max_total_bytes: Option<u64>,
    /// How long a spooled message may age before being dropped at drain
    /// time; `None` disables retention-based drops.
    pub retention_period: Option<Duration>,
    /// Invoked once per completed batch with the broker receipt.
    pub callback: Option<SendCallback>,
}

impl fmt::Debug for ProducerOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerOpts")
            .field("batch_size", &self.batch_size)
            .field("strategy", &self.strategy)
            .field("tcp_opts", &self.tcp_opts)
            .field("replayq_dir", &self.replayq_dir)
            .field("replayq_seg_bytes", &self.replayq_seg_bytes)
            .field("replayq_offload_mode", &self.replayq_offload_mode)
            .field("replayq_max_total_bytes", &self.replayq_max_total_bytes)
            .field("retention_period", &self.retention_period)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ProducerOpts {
    pub fn builder() -> ProducerOptsBuilder {
        ProducerOptsBuilder::default()
    }

    /// Queue configuration for one partition topic. Each partition spools
    /// into its own subdirectory of `replayq_dir`.
    pub(crate) fn queue_config(&self, partition_topic: &str) -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig {
            dir: self
                .replayq_dir
                .as_ref()
                .map(|dir| dir.join(sanitize_topic(partition_topic))),
            seg_bytes: self.replayq_seg_bytes.unwrap_or(defaults.seg_bytes),
            offload_mode: self.replayq_offload_mode,
            max_total_bytes: self.replayq_max_total_bytes,
        }
    }
}

/// Builder for [`ProducerOpts`].
#[derive(Default)]
pub struct ProducerOptsBuilder {
    opts: ProducerOpts,
}

impl ProducerOptsBuilder {
    /// Soft maximum of messages coalesced per send.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.opts.batch_size = size;
        self
    }

    /// Partition routing strategy.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.opts.strategy = strategy;
        self
    }

    /// Socket options merged over the defaults.
    pub fn tcp_opts(mut self, tcp_opts: TcpOpts) -> Self {
        self.opts.tcp_opts = tcp_opts;
        self
    }

    /// Enable the disk spool under this directory.
    pub fn replayq_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opts.replayq_dir = Some(dir.into());
        self
    }

    /// Segment file size for the disk spool.
    pub fn replayq_seg_bytes(mut self, bytes: u64) -> Self {
        self.opts.replayq_seg_bytes = Some(bytes);
        self
    }

    /// Bypass the RAM front of the spool.
    pub fn replayq_offload_mode(mut self, offload: bool) -> Self {
        self.opts.replayq_offload_mode = offload;
        self
    }

    /// Cap on total spooled bytes.
    pub fn replayq_max_total_bytes(mut self, bytes: u64) -> Self {
        self.opts.replayq_max_total_bytes = Some(bytes);
        self
    }

    /// Drop spooled messages older than this at drain time.
    pub fn retention_period(mut self, period: Duration) -> Self {
        self.opts.retention_period = Some(period);
        self
    }

    /// Result sink invoked once per completed batch.
    pub fn callback(mut self, callback: SendCallback) -> Self {
        self.opts.callback = Some(callback);
        self
    }

    pub fn build(self) -> ProducerOpts {
        self.opts
    }
}

/// Parse `pulsar://host:port`; anything else falls back to the local
/// default broker address.
pub(crate) fn broker_addr(url: &str) -> (String, u16) {
    if let Some(rest) = url.strip_prefix("pulsar://") {
        if let Some((host, port)) = rest.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() {
                    return (host.to_string(), port);
                }
            }
        }
    }
    ("127.0.0.1".to_string(), 6650)
}

fn sanitize_topic(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let opts = ProducerOpts::builder()
            .batch_size(64)
            .strategy(Strategy::KeyDispatch)
            .replayq_dir("/tmp/spool")
            .replayq_seg_bytes(1024)
            .replayq_offload_mode(true)
            .replayq_max_total_bytes(1 << 20)
            .retention_period(Duration::from_secs(60))
            .build();

        assert_eq!(opts.batch_size, 64);
        assert_eq!(opts.strategy, Strategy::KeyDispatch);
        assert_eq!(opts.replayq_dir, Some(PathBuf::from("/tmp/spool")));
        assert_eq!(opts.replayq_seg_bytes, Some(1024));
        assert!(opts.replayq_offload_mode);
        assert_eq!(opts.replayq_max_total_bytes, Some(1 << 20));
        assert_eq!(opts.retention_period, Some(Duration::from_secs(60)));
        assert!(opts.callback.is_none());
    }

    #[test]
    fn defaults_disable_coalescing_and_spool() {
        let opts = ProducerOpts::default();
        assert_eq!(opts.batch_size, 0);
        assert_eq!(opts.strategy, Strategy::Random);
        assert!(opts.replayq_dir.is_none());
        assert!(opts.retention_period.is_none());
        let qc = opts.queue_config("persistent://t/ns/topic-partition-0");
        assert!(qc.dir.is_none());
    }

    #[test]
    fn queue_dir_is_partition_scoped() {
        let opts = ProducerOpts::builder().replayq_dir("/var/spool").build();
        let qc = opts.queue_config("persistent://public/default/t-partition-3");
        assert_eq!(
            qc.dir,
            Some(PathBuf::from(
                "/var/spool/persistent___public_default_t-partition-3"
            ))
        );
    }

    #[test]
    fn url_parsing_with_fallback() {
        assert_eq!(
            broker_addr("pulsar://broker.example.com:6651"),
            ("broker.example.com".to_string(), 6651)
        );
        assert_eq!(broker_addr("pulsar://10.0.0.7:6650"), ("10.0.0.7".to_string(), 6650));
        // Everything else falls back to the local default.
        assert_eq!(broker_addr("http://broker:8080"), ("127.0.0.1".to_string(), 6650));
        assert_eq!(broker_addr("pulsar://nohost"), ("127.0.0.1".to_string(), 6650));
        assert_eq!(broker_addr("pulsar://:6650"), ("127.0.0.1".to_string(), 6650));
        assert_eq!(broker_addr("garbage"), ("127.0.0.1".to_string(), 6650));
    }
}
