//! Producer state machine.
//!
//! The connection lifecycle is a tagged [`ConnState`] plus one
//! [`ProducerState::step`] function mapping an [`Event`] to the outbound
//! [`Effect`]s. All state mutation happens here; the actor driver performs
//! the IO (dialing, socket writes, timers) and feeds results back as events.
//! This keeps every transition unit-testable without a socket.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use pulsar_proto::base_command::Type as CommandType;
use pulsar_proto::{
    frame, BaseCommand, CommandSendReceipt, Frame, KeyValue, MessageMetadata,
    SingleMessageMetadata,
};
use replayq::{AckRef, ReplayQueue};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::message::QueueItem;
use crate::options::ProducerOpts;
use crate::requests::{BatchEntry, InflightRequest, ReplySender, RequestTable};

/// `sequence_id` wraps back to 1 at 65535², below the 32-bit maximum so the
/// broker's deduplication window is never confused.
pub(crate) const SEQUENCE_ID_WRAP: u64 = 4_294_836_225;

/// `request_id` wraps back to 1 at the 16-bit maximum.
pub(crate) const REQUEST_ID_WRAP: u64 = 65_535;

/// Fixed delay before a reconnect attempt.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Client-initiated keepalive ping interval.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Idle,
    Connecting,
    Connected,
}

/// Everything that can happen to a partition producer.
#[derive(Debug)]
pub(crate) enum Event {
    /// Actor startup; kicks off the first dial.
    Start,
    /// The driver established a TCP connection.
    DialSucceeded,
    DialFailed,
    ReconnectTick,
    KeepaliveTick,
    /// A whole frame arrived from the broker.
    Frame(Frame),
    TcpClosed,
    /// Fire-and-forget publish; the driver has already coalesced waiting
    /// casts into `groups`.
    Publish { groups: Vec<BatchEntry> },
    /// Awaitable publish; always its own batch.
    PublishSync { entry: BatchEntry, reply: ReplySender },
    Shutdown,
}

/// Outbound actions for the driver to perform, in order.
#[derive(Debug)]
pub(crate) enum Effect {
    /// Open a TCP connection to the broker.
    Dial,
    /// Write an encoded frame to the socket.
    Transmit(Bytes),
    /// Answer a synchronous caller.
    Reply(ReplySender, crate::Result<CommandSendReceipt>),
    /// Invoke the user callback with a batch receipt.
    Callback(CommandSendReceipt),
    ScheduleReconnect(Duration),
    StartKeepalive,
    ResetKeepalive,
    /// Stop the actor; the queue is flushed and closed on the way out.
    Terminate,
}

/// State of one partition producer actor.
pub struct ProducerState {
    pub(crate) partition_topic: String,
    pub(crate) broker_url: String,
    pub(crate) producer_id: u64,
    /// Assigned by the broker in `ProducerSuccess`.
    pub(crate) producer_name: Option<String>,
    /// Last allocated control request id.
    pub(crate) request_id: u64,
    /// Last allocated batch sequence id.
    pub(crate) sequence_id: u64,
    pub(crate) requests: RequestTable,
    pub(crate) opts: ProducerOpts,
    pub(crate) batch_size: usize,
    pub(crate) durable_queue: ReplayQueue,
    /// High-water mark of queue items already formed into batches; the
    /// drain after reconnect resumes past it.
    pub(crate) drained_to: Option<AckRef>,
    pub(crate) conn: ConnState,
    /// Sync calls that arrived while disconnected, flushed on connect.
    pub(crate) postponed: VecDeque<(BatchEntry, ReplySender)>,
    /// Ack for a fully retention-expired drain chunk, deferred until no
    /// older batch is in flight so the cursor never passes an unacked one.
    pub(crate) pending_drop_ack: Option<AckRef>,
}

impl ProducerState {
    /// Build the state for one partition, opening its durable queue
    /// (disk-backed iff `replayq_dir` is configured).
    pub fn new(
        partition_topic: impl Into<String>,
        broker_url: impl Into<String>,
        producer_id: u64,
        opts: ProducerOpts,
    ) -> crate::Result<Self> {
        let partition_topic = partition_topic.into();
        let durable_queue = ReplayQueue::open(opts.queue_config(&partition_topic))?;
        let batch_size = opts.batch_size;
        Ok(Self {
            partition_topic,
            broker_url: broker_url.into(),
            producer_id,
            producer_name: None,
            request_id: 0,
            sequence_id: 0,
            requests: RequestTable::new(),
            opts,
            batch_size,
            durable_queue,
            drained_to: None,
            conn: ConnState::Idle,
            postponed: VecDeque::new(),
            pending_drop_ack: None,
        })
    }

    pub(crate) fn step(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Start | Event::ReconnectTick => match self.conn {
                ConnState::Idle => vec![Effect::Dial],
                _ => Vec::new(),
            },
            Event::DialSucceeded => {
                self.conn = ConnState::Connecting;
                match frame::encode_simple(&BaseCommand::connect()) {
                    Ok(bytes) => vec![Effect::Transmit(bytes)],
                    Err(e) => {
                        warn!(error = %e, "failed to encode Connect");
                        self.conn = ConnState::Idle;
                        vec![Effect::ScheduleReconnect(RECONNECT_DELAY)]
                    }
                }
            }
            Event::DialFailed => {
                warn!(
                    broker = %self.broker_url,
                    delay = ?RECONNECT_DELAY,
                    "connect failed, retrying"
                );
                vec![Effect::ScheduleReconnect(RECONNECT_DELAY)]
            }
            Event::TcpClosed => {
                if self.conn == ConnState::Idle {
                    Vec::new()
                } else {
                    info!(
                        topic = %self.partition_topic,
                        inflight = self.requests.len(),
                        "connection lost, reconnecting"
                    );
                    self.conn = ConnState::Idle;
                    vec![Effect::ScheduleReconnect(RECONNECT_DELAY)]
                }
            }
            Event::KeepaliveTick => match self.conn {
                ConnState::Connected => self.transmit(BaseCommand::ping()),
                _ => Vec::new(),
            },
            Event::Frame(frame) => self.on_frame(frame),
            Event::Publish { groups } => self.on_publish(groups),
            Event::PublishSync { entry, reply } => self.on_publish_sync(entry, reply),
            Event::Shutdown => vec![Effect::Terminate],
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Vec<Effect> {
        let Some(command_type) = frame.command.command_type() else {
            debug!(raw = frame.command.r#type, "ignoring unknown command");
            return Vec::new();
        };
        match (command_type, self.conn) {
            (CommandType::Connected, ConnState::Connecting) => {
                let request_id = self.next_request_id();
                debug!(request_id, topic = %self.partition_topic, "registering producer");
                self.transmit(BaseCommand::producer(
                    self.partition_topic.clone(),
                    self.producer_id,
                    request_id,
                ))
            }
            (CommandType::ProducerSuccess, ConnState::Connecting) => {
                let name = frame
                    .command
                    .producer_success
                    .map(|s| s.producer_name)
                    .unwrap_or_default();
                info!(
                    topic = %self.partition_topic,
                    producer_name = %name,
                    "producer registered"
                );
                self.producer_name = Some(name);
                self.conn = ConnState::Connected;
                let mut effects = vec![Effect::StartKeepalive];
                effects.extend(self.replay_inflight());
                effects.extend(self.drain_queue());
                effects.extend(self.flush_postponed());
                effects
            }
            (CommandType::SendReceipt, _) => self.on_receipt(frame.command.send_receipt),
            (CommandType::Ping, _) => self.transmit(BaseCommand::pong()),
            (CommandType::Pong, _) => vec![Effect::ResetKeepalive],
            (CommandType::CloseProducer, _) => {
                info!(topic = %self.partition_topic, "broker closed the producer");
                vec![Effect::Terminate]
            }
            (CommandType::SendError, _) => {
                let detail = frame
                    .command
                    .send_error
                    .map(|e| format!("seq {}: {}", e.sequence_id, e.message))
                    .unwrap_or_default();
                warn!(topic = %self.partition_topic, %detail, "broker reported send error");
                Vec::new()
            }
            (other, state) => {
                debug!(command = ?other, state = ?state, "ignoring command in current state");
                Vec::new()
            }
        }
    }

    fn on_publish(&mut self, groups: Vec<BatchEntry>) -> Vec<Effect> {
        if self.conn != ConnState::Connected {
            // Spool only; the drain after (re)connect will send these.
            for entry in &groups {
                if let Err(e) = self.append_entry(entry) {
                    warn!(
                        error = %e,
                        messages = entry.messages.len(),
                        "dropping publish: durable queue append failed"
                    );
                }
            }
            return Vec::new();
        }

        let mut appended = Vec::with_capacity(groups.len());
        let mut last_ref = None;
        for entry in groups {
            match self.append_entry(&entry) {
                Ok(ack_ref) => {
                    last_ref = Some(ack_ref);
                    appended.push(entry);
                }
                Err(e) => warn!(
                    error = %e,
                    messages = entry.messages.len(),
                    "dropping publish: durable queue append failed"
                ),
            }
        }
        match last_ref {
            Some(ack_ref) => self.dispatch_batch(ack_ref, Vec::new(), appended),
            None => Vec::new(),
        }
    }

    fn on_publish_sync(&mut self, entry: BatchEntry, reply: ReplySender) -> Vec<Effect> {
        if self.conn != ConnState::Connected {
            self.postponed.push_back((entry, reply));
            return Vec::new();
        }
        match self.append_entry(&entry) {
            Err(e) => vec![Effect::Reply(reply, Err(e))],
            Ok(ack_ref) => self.dispatch_batch(ack_ref, vec![reply], vec![entry]),
        }
    }

    fn on_receipt(&mut self, receipt: Option<CommandSendReceipt>) -> Vec<Effect> {
        let Some(receipt) = receipt else {
            warn!("SendReceipt frame without a receipt body");
            return Vec::new();
        };
        match self.requests.take(receipt.sequence_id) {
            None => {
                debug!(
                    sequence_id = receipt.sequence_id,
                    "receipt for unknown sequence id"
                );
                Vec::new()
            }
            Some(request) => {
                let mut effects: Vec<Effect> = request
                    .replies
                    .into_iter()
                    .map(|reply| Effect::Reply(reply, Ok(receipt.clone())))
                    .collect();
                effects.push(Effect::Callback(receipt));
                if let Err(e) = self.durable_queue.ack(request.ack_ref) {
                    warn!(error = %e, "durable queue ack failed");
                }
                self.flush_pending_drop_ack();
                effects
            }
        }
    }

    /// Spool one publish call's messages as a single queue item.
    fn append_entry(&mut self, entry: &BatchEntry) -> crate::Result<AckRef> {
        let item = QueueItem {
            enqueued_at_ms: entry.enqueued_at_ms,
            messages: entry.messages.clone(),
        };
        Ok(self.durable_queue.append(item.encode()?)?)
    }

    /// Allocate a sequence id, record the in-flight entry, and emit the
    /// send frame. `ack_ref` must cover every spooled item of `entries`.
    fn dispatch_batch(
        &mut self,
        ack_ref: AckRef,
        replies: Vec<ReplySender>,
        entries: Vec<BatchEntry>,
    ) -> Vec<Effect> {
        let sequence_id = match self.next_sequence_id() {
            Ok(seq) => seq,
            Err(e) => {
                warn!(error = %e, "cannot allocate sequence id");
                return replies
                    .into_iter()
                    .map(|reply| {
                        Effect::Reply(reply, Err(Error::SendFailed("sequence id exhausted".into())))
                    })
                    .collect();
            }
        };
        let bytes = match self.build_send_frame(sequence_id, &entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, sequence_id, "failed to build send frame");
                return replies
                    .into_iter()
                    .map(|reply| Effect::Reply(reply, Err(Error::SendFailed(e.to_string()))))
                    .collect();
            }
        };
        self.drained_to = Some(ack_ref);
        self.requests.insert(
            sequence_id,
            InflightRequest {
                ack_ref,
                replies,
                entries,
            },
        );
        vec![Effect::Transmit(bytes)]
    }

    /// Re-send every unacked batch with its original sequence id, oldest
    /// first. Runs on reconnect before any newer messages are drained.
    fn replay_inflight(&mut self) -> Vec<Effect> {
        let mut replays = Vec::new();
        for (sequence_id, request) in self.requests.iter_sorted() {
            match self.build_send_frame(sequence_id, &request.entries) {
                Ok(bytes) => replays.push((sequence_id, bytes)),
                Err(e) => warn!(
                    error = %e,
                    sequence_id,
                    "failed to rebuild in-flight batch, leaving for next reconnect"
                ),
            }
        }
        replays
            .into_iter()
            .map(|(sequence_id, bytes)| {
                debug!(sequence_id, "re-sending in-flight batch");
                Effect::Transmit(bytes)
            })
            .collect()
    }

    /// Batch and send everything spooled past the drained high-water mark,
    /// dropping groups that aged out of the retention period.
    fn drain_queue(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let chunk = self.batch_size.max(1);
        loop {
            let items = match self.durable_queue.peek_from(self.drained_to, chunk) {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "durable queue peek failed");
                    break;
                }
            };
            let last_ref = match items.last() {
                Some((ack_ref, _)) => *ack_ref,
                None => break,
            };
            let mut fresh = Vec::new();
            let mut dropped = 0usize;
            for (_, bytes) in &items {
                match QueueItem::decode(bytes) {
                    Ok(item) => {
                        if self.expired(item.enqueued_at_ms) {
                            dropped += item.messages.len();
                        } else {
                            fresh.push(BatchEntry {
                                enqueued_at_ms: item.enqueued_at_ms,
                                messages: item.messages,
                            });
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable spooled item"),
                }
            }
            if dropped > 0 {
                warn!(dropped, "dropped spooled messages past the retention period");
            }
            self.drained_to = Some(last_ref);
            if fresh.is_empty() {
                self.defer_drop_ack(last_ref);
                continue;
            }
            effects.extend(self.dispatch_batch(last_ref, Vec::new(), fresh));
        }
        effects
    }

    fn flush_postponed(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        while let Some((entry, reply)) = self.postponed.pop_front() {
            effects.extend(self.on_publish_sync(entry, reply));
        }
        effects
    }

    /// Release a fully-dropped queue region, or hold it until every older
    /// in-flight batch has been acked.
    fn defer_drop_ack(&mut self, ack_ref: AckRef) {
        if self.requests.is_empty() {
            if let Err(e) = self.durable_queue.ack(ack_ref) {
                warn!(error = %e, "durable queue ack failed");
            }
        } else {
            self.pending_drop_ack = Some(self.pending_drop_ack.map_or(ack_ref, |p| p.max(ack_ref)));
        }
    }

    fn flush_pending_drop_ack(&mut self) {
        if self.requests.is_empty() {
            if let Some(ack_ref) = self.pending_drop_ack.take() {
                if let Err(e) = self.durable_queue.ack(ack_ref) {
                    warn!(error = %e, "durable queue ack failed");
                }
            }
        }
    }

    fn expired(&self, enqueued_at_ms: u64) -> bool {
        match self.opts.retention_period {
            None => false,
            Some(period) => {
                now_ms().saturating_sub(enqueued_at_ms) > period.as_millis() as u64
            }
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_id = if self.request_id >= REQUEST_ID_WRAP {
            1
        } else {
            self.request_id + 1
        };
        self.request_id
    }

    /// Allocate the next sequence id, refusing a value that is still in
    /// flight rather than colliding after wrap.
    fn next_sequence_id(&mut self) -> crate::Result<u64> {
        let next = if self.sequence_id >= SEQUENCE_ID_WRAP {
            1
        } else {
            self.sequence_id + 1
        };
        if self.requests.contains(next) {
            return Err(Error::SequenceIdInFlight(next));
        }
        self.sequence_id = next;
        Ok(next)
    }

    fn transmit(&self, command: BaseCommand) -> Vec<Effect> {
        match frame::encode_simple(&command) {
            Ok(bytes) => vec![Effect::Transmit(bytes)],
            Err(e) => {
                warn!(error = %e, "failed to encode command");
                Vec::new()
            }
        }
    }

    /// Frame a batch. One message is written directly; several are wrapped
    /// in per-message `SingleMessageMetadata` with `num_messages_in_batch`
    /// set on the envelope.
    fn build_send_frame(&self, sequence_id: u64, entries: &[BatchEntry]) -> crate::Result<Bytes> {
        let messages: Vec<&crate::Message> =
            entries.iter().flat_map(|e| e.messages.iter()).collect();
        if messages.is_empty() {
            return Err(Error::SendFailed("empty batch".into()));
        }
        let producer_name = self.producer_name.clone().unwrap_or_default();
        let command = BaseCommand::send(self.producer_id, sequence_id, messages.len() as i32);

        if let [message] = messages[..] {
            let metadata = MessageMetadata {
                producer_name,
                sequence_id,
                publish_time: now_ms(),
                properties: properties_of(message),
                partition_key: key_of(message),
                num_messages_in_batch: None,
                event_time: message.event_time,
            };
            return Ok(frame::encode_payload(&command, &metadata, &message.value)?);
        }

        let batched: Vec<(SingleMessageMetadata, Bytes)> = messages
            .iter()
            .map(|message| {
                (
                    SingleMessageMetadata {
                        properties: properties_of(message),
                        partition_key: key_of(message),
                        payload_size: message.value.len() as i32,
                        event_time: message.event_time,
                    },
                    message.value.clone(),
                )
            })
            .collect();
        let payload = frame::encode_batch(&batched)?;
        let metadata = MessageMetadata {
            producer_name,
            sequence_id,
            publish_time: now_ms(),
            properties: Vec::new(),
            partition_key: None,
            num_messages_in_batch: Some(messages.len() as i32),
            event_time: None,
        };
        Ok(frame::encode_payload(&command, &metadata, &payload)?)
    }

    /// Flush and close the durable queue; called once when the actor stops.
    pub(crate) fn close(self) {
        if let Err(e) = self.durable_queue.close() {
            warn!(error = %e, "failed to close durable queue");
        }
    }
}

fn properties_of(message: &crate::Message) -> Vec<KeyValue> {
    message
        .properties
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

fn key_of(message: &crate::Message) -> Option<String> {
    message
        .key
        .as_ref()
        .map(|key| String::from_utf8_lossy(key).into_owned())
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
