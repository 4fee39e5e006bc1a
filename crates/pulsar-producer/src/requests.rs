//! In-flight request table.
//!
//! Sent-but-unacked batches keyed by `sequence_id`. Sequence ids are
//! allocated monotonically (modulo the wrap point) and inserted in
//! allocation order, so the map's insertion order *is* ascending sequence
//! order respecting wrap, so reconnect replay walks it without sorting.

use indexmap::IndexMap;
use pulsar_proto::CommandSendReceipt;
use replayq::AckRef;
use tokio::sync::oneshot;

use crate::message::Message;

/// Reply channel of one synchronous caller.
pub(crate) type ReplySender = oneshot::Sender<crate::Result<CommandSendReceipt>>;

/// One publish call's messages plus their enqueue timestamp.
#[derive(Debug)]
pub(crate) struct BatchEntry {
    pub enqueued_at_ms: u64,
    pub messages: Vec<Message>,
}

/// A batch sent to the broker but not yet receipted.
#[derive(Debug)]
pub(crate) struct InflightRequest {
    /// Durable-queue cursor token covering this batch's spooled items.
    pub ack_ref: AckRef,
    /// Synchronous callers awaiting this batch; empty for cast-only batches.
    pub replies: Vec<ReplySender>,
    /// The coalesced sub-batches, preserving per-call grouping.
    pub entries: Vec<BatchEntry>,
}

impl InflightRequest {
    pub(crate) fn total_message_count(&self) -> usize {
        self.entries.iter().map(|e| e.messages.len()).sum()
    }
}

#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    inner: IndexMap<u64, InflightRequest>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, sequence_id: u64, request: InflightRequest) {
        let replaced = self.inner.insert(sequence_id, request);
        debug_assert!(replaced.is_none(), "duplicate in-flight sequence id");
    }

    /// Remove and return the entry for `sequence_id`, preserving the order
    /// of the remaining entries.
    pub(crate) fn take(&mut self, sequence_id: u64) -> Option<InflightRequest> {
        self.inner.shift_remove(&sequence_id)
    }

    pub(crate) fn contains(&self, sequence_id: u64) -> bool {
        self.inner.contains_key(&sequence_id)
    }

    /// Entries in ascending sequence order respecting wrap (= insertion
    /// order), for replay after reconnect.
    pub(crate) fn iter_sorted(&self) -> impl Iterator<Item = (u64, &InflightRequest)> {
        self.inner.iter().map(|(seq, req)| (*seq, req))
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (u64, InflightRequest)> {
        self.inner.into_iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// AckRefs are only minted by a queue; produce `n` distinct ones.
    fn refs(n: usize) -> Vec<AckRef> {
        let mut q = replayq::ReplayQueue::open(replayq::QueueConfig::default()).unwrap();
        (0..n)
            .map(|_| q.append(Bytes::from_static(b"x")).unwrap())
            .collect()
    }

    fn request(ack_ref: AckRef, counts: &[usize]) -> InflightRequest {
        InflightRequest {
            ack_ref,
            replies: Vec::new(),
            entries: counts
                .iter()
                .map(|&n| BatchEntry {
                    enqueued_at_ms: 0,
                    messages: (0..n)
                        .map(|i| Message::new(Bytes::from(format!("m{}", i))))
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn take_removes_and_returns() {
        let r = refs(2);
        let mut table = RequestTable::new();
        table.insert(1, request(r[0], &[1]));
        table.insert(2, request(r[1], &[2, 3]));
        assert_eq!(table.len(), 2);
        assert!(table.contains(2));

        let taken = table.take(2).unwrap();
        assert_eq!(taken.total_message_count(), 5);
        assert!(!table.contains(2));
        assert!(table.take(2).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn iter_sorted_is_send_order_even_across_wrap() {
        let r = refs(4);
        let mut table = RequestTable::new();
        // Allocation order around the wrap point: two ids just before the
        // wrap, then the counter restarts at 1.
        for (i, seq) in [4_294_836_224, 4_294_836_225, 1, 2].into_iter().enumerate() {
            table.insert(seq, request(r[i], &[1]));
        }
        let order: Vec<u64> = table.iter_sorted().map(|(seq, _)| seq).collect();
        assert_eq!(order, vec![4_294_836_224, 4_294_836_225, 1, 2]);
    }

    #[test]
    fn take_preserves_replay_order_of_remaining() {
        let r = refs(4);
        let mut table = RequestTable::new();
        for (i, seq) in [10, 11, 12, 13].into_iter().enumerate() {
            table.insert(seq, request(r[i], &[1]));
        }
        // Acks may arrive out of send order.
        table.take(11);
        let order: Vec<u64> = table.iter_sorted().map(|(seq, _)| seq).collect();
        assert_eq!(order, vec![10, 12, 13]);
    }
}
