//! Versioned state handoff for in-place code change.
//!
//! A live producer's state can be converted to a serializable snapshot, and
//! down- or up-graded across the schema boundary that introduced the durable
//! queue. The legacy form is a fixed-arity tuple: it carries no queue handle,
//! no retention option, and reduces each in-flight entry to its sequence id
//! and message count.

use std::path::PathBuf;
use std::time::Duration;

use replayq::AckRef;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::options::{ProducerOpts, Strategy, TcpOpts};
use crate::state::ProducerState;

/// Serializable image of a live producer's state (current schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub partition_topic: String,
    pub broker_url: String,
    pub producer_id: u64,
    pub producer_name: Option<String>,
    pub request_id: u64,
    pub sequence_id: u64,
    pub batch_size: usize,
    pub strategy: Strategy,
    pub tcp_opts: TcpOpts,
    pub replayq_dir: Option<PathBuf>,
    pub replayq_seg_bytes: Option<u64>,
    pub replayq_offload_mode: bool,
    pub replayq_max_total_bytes: Option<u64>,
    pub retention_period: Option<Duration>,
    pub mem_only_queue: bool,
    pub requests: Vec<RequestSnapshot>,
}

/// Snapshot of one in-flight batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub sequence_id: u64,
    pub ack_ref: AckRef,
    /// `(enqueue timestamp, message count)` per coalesced group.
    pub entries: Vec<(u64, usize)>,
}

impl From<&RequestSnapshot> for LegacyRequest {
    fn from(snapshot: &RequestSnapshot) -> Self {
        Self {
            sequence_id: snapshot.sequence_id,
            total_message_count: snapshot.entries.iter().map(|(_, count)| count).sum(),
        }
    }
}

/// Fixed-arity tuple form understood by versions predating the durable
/// queue. Slot order: partition topic, broker url, producer id, producer
/// name, request id, sequence id, batch size, options, in-flight requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyState(
    pub String,
    pub String,
    pub u64,
    pub Option<String>,
    pub u64,
    pub u64,
    pub usize,
    pub LegacyOpts,
    pub Vec<LegacyRequest>,
);

/// Options as the legacy schema knew them: no retention period, no spool
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyOpts {
    pub strategy: Strategy,
    pub tcp_opts: TcpOpts,
}

/// Legacy reduction of an in-flight entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRequest {
    pub sequence_id: u64,
    pub total_message_count: usize,
}

impl ProducerState {
    /// Current-schema snapshot of this state.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            partition_topic: self.partition_topic.clone(),
            broker_url: self.broker_url.clone(),
            producer_id: self.producer_id,
            producer_name: self.producer_name.clone(),
            request_id: self.request_id,
            sequence_id: self.sequence_id,
            batch_size: self.batch_size,
            strategy: self.opts.strategy,
            tcp_opts: self.opts.tcp_opts.clone(),
            replayq_dir: self.opts.replayq_dir.clone(),
            replayq_seg_bytes: self.opts.replayq_seg_bytes,
            replayq_offload_mode: self.opts.replayq_offload_mode,
            replayq_max_total_bytes: self.opts.replayq_max_total_bytes,
            retention_period: self.opts.retention_period,
            mem_only_queue: self.durable_queue.is_mem_only(),
            requests: self
                .requests
                .iter_sorted()
                .map(|(sequence_id, request)| RequestSnapshot {
                    sequence_id,
                    ack_ref: request.ack_ref,
                    entries: request
                        .entries
                        .iter()
                        .map(|entry| (entry.enqueued_at_ms, entry.messages.len()))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Convert to the legacy tuple form. The durable queue is flushed and
    /// closed (the legacy schema has no slot for it) and the retention
    /// option is dropped. In-flight entries survive only as
    /// `{sequence id, message count}`; reply channels are dropped, so
    /// waiting callers time out locally.
    pub fn downgrade(self) -> crate::Result<LegacyState> {
        let ProducerState {
            partition_topic,
            broker_url,
            producer_id,
            producer_name,
            request_id,
            sequence_id,
            requests,
            opts,
            batch_size,
            durable_queue,
            ..
        } = self;
        let legacy_requests = requests
            .into_entries()
            .map(|(sequence_id, request)| LegacyRequest {
                sequence_id,
                total_message_count: request.total_message_count(),
            })
            .collect();
        durable_queue.close()?;
        Ok(LegacyState(
            partition_topic,
            broker_url,
            producer_id,
            producer_name,
            request_id,
            sequence_id,
            batch_size,
            LegacyOpts {
                strategy: opts.strategy,
                tcp_opts: opts.tcp_opts,
            },
            legacy_requests,
        ))
    }

    /// Re-introduce the current schema over a legacy state: a fresh
    /// mem-only queue (the old spool directory cannot be recovered without
    /// the caller re-providing configuration) and infinite retention.
    /// Legacy in-flight entries carry no payloads or ack references, so
    /// they are discarded; a late receipt for such a sequence id takes the
    /// unknown-sequence path and is ignored safely.
    pub fn upgrade(legacy: LegacyState) -> crate::Result<ProducerState> {
        let LegacyState(
            partition_topic,
            broker_url,
            producer_id,
            producer_name,
            request_id,
            sequence_id,
            batch_size,
            legacy_opts,
            legacy_requests,
        ) = legacy;
        if !legacy_requests.is_empty() {
            warn!(
                count = legacy_requests.len(),
                "discarding legacy in-flight entries without payloads"
            );
        }
        let opts = ProducerOpts {
            batch_size,
            strategy: legacy_opts.strategy,
            tcp_opts: legacy_opts.tcp_opts,
            replayq_dir: None,
            replayq_seg_bytes: None,
            replayq_offload_mode: false,
            replayq_max_total_bytes: None,
            retention_period: None,
            callback: None,
        };
        let mut state = ProducerState::new(partition_topic, broker_url, producer_id, opts)?;
        state.producer_name = producer_name;
        state.request_id = request_id;
        state.sequence_id = sequence_id;
        Ok(state)
    }
}
