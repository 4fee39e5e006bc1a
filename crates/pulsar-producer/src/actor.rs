//! Actor driver.
//!
//! One tokio task per partition producer serializes every state mutation:
//! it owns the mailbox, the socket write half, and the timers, translates IO
//! into [`Event`]s for [`ProducerState::step`], and executes the returned
//! [`Effect`]s. Each connection gets its own reader task that owns the TCP
//! carry buffer, extracts whole frames, and forwards them tagged with a
//! connection epoch; events from a dead connection are discarded.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;

use bytes::BytesMut;
use pulsar_proto::{frame, ProtoError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::options::{broker_addr, TcpOpts};
use crate::requests::{BatchEntry, ReplySender};
use crate::state::{now_ms, ConnState, Effect, Event, ProducerState, KEEPALIVE_INTERVAL};

/// Mailbox commands from [`Producer`](crate::Producer) handles.
#[derive(Debug)]
pub(crate) enum Cmd {
    Publish {
        messages: Vec<Message>,
    },
    PublishSync {
        messages: Vec<Message>,
        reply: ReplySender,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct ConnEvent {
    epoch: u64,
    kind: ConnEventKind,
}

#[derive(Debug)]
enum ConnEventKind {
    Frame(frame::Frame),
    Closed,
}

enum Wake {
    Conn(Option<ConnEvent>),
    Cmd(Option<Cmd>),
    Reconnect,
    Keepalive,
}

pub(crate) struct ProducerActor {
    state: ProducerState,
    mailbox: mpsc::Receiver<Cmd>,
    conn_tx: mpsc::Sender<ConnEvent>,
    conn_rx: mpsc::Receiver<ConnEvent>,
    writer: Option<OwnedWriteHalf>,
    epoch: u64,
    reconnect: Option<Pin<Box<Sleep>>>,
    keepalive: Option<Interval>,
    shutdown_done: Option<oneshot::Sender<()>>,
}

impl ProducerActor {
    pub(crate) fn new(state: ProducerState, mailbox: mpsc::Receiver<Cmd>) -> Self {
        let (conn_tx, conn_rx) = mpsc::channel(64);
        Self {
            state,
            mailbox,
            conn_tx,
            conn_rx,
            writer: None,
            epoch: 0,
            reconnect: None,
            keepalive: None,
            shutdown_done: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let effects = self.state.step(Event::Start);
        let mut running = self.apply(effects).await;

        while running {
            let wake = {
                let reconnect_armed = self.reconnect.is_some();
                let keepalive_armed = self.keepalive.is_some();
                let Self {
                    conn_rx,
                    mailbox,
                    reconnect,
                    keepalive,
                    ..
                } = &mut self;
                tokio::select! {
                    biased;
                    ev = conn_rx.recv() => Wake::Conn(ev),
                    cmd = mailbox.recv() => Wake::Cmd(cmd),
                    _ = async {
                        match reconnect.as_mut() {
                            Some(delay) => delay.await,
                            None => std::future::pending().await,
                        }
                    }, if reconnect_armed => Wake::Reconnect,
                    _ = async {
                        match keepalive.as_mut() {
                            Some(ticker) => {
                                ticker.tick().await;
                            }
                            None => std::future::pending().await,
                        }
                    }, if keepalive_armed => Wake::Keepalive,
                }
            };

            running = match wake {
                Wake::Conn(None) => true,
                Wake::Conn(Some(ev)) => {
                    if ev.epoch != self.epoch {
                        debug!(epoch = ev.epoch, "discarding event from stale connection");
                        true
                    } else {
                        let event = match ev.kind {
                            ConnEventKind::Frame(frame) => Event::Frame(frame),
                            ConnEventKind::Closed => {
                                self.writer = None;
                                self.keepalive = None;
                                Event::TcpClosed
                            }
                        };
                        let effects = self.state.step(event);
                        self.apply(effects).await
                    }
                }
                Wake::Cmd(None) => {
                    // Every handle dropped: shut down.
                    let effects = self.state.step(Event::Shutdown);
                    self.apply(effects).await
                }
                Wake::Cmd(Some(cmd)) => self.handle_cmd(cmd).await,
                Wake::Reconnect => {
                    self.reconnect = None;
                    let effects = self.state.step(Event::ReconnectTick);
                    self.apply(effects).await
                }
                Wake::Keepalive => {
                    let effects = self.state.step(Event::KeepaliveTick);
                    self.apply(effects).await
                }
            };
        }

        self.finish();
    }

    /// Dispatch one mailbox command. A cast drains further waiting casts
    /// from the mailbox (up to `batch_size` messages total) so they coalesce
    /// into one frame; a non-cast command popped during the drain is handled
    /// right after. A sync call is never coalesced.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        let mut next = Some(cmd);
        while let Some(cmd) = next.take() {
            let keep_running = match cmd {
                Cmd::Shutdown { done } => {
                    self.shutdown_done = Some(done);
                    let effects = self.state.step(Event::Shutdown);
                    self.apply(effects).await
                }
                Cmd::PublishSync { messages, reply } => {
                    let entry = BatchEntry {
                        enqueued_at_ms: now_ms(),
                        messages,
                    };
                    let effects = self.state.step(Event::PublishSync { entry, reply });
                    self.apply(effects).await
                }
                Cmd::Publish { messages } => {
                    let mut total = messages.len();
                    let mut groups = vec![BatchEntry {
                        enqueued_at_ms: now_ms(),
                        messages,
                    }];
                    if self.state_connected() && self.state_batch_size() > 1 {
                        while total < self.state_batch_size() {
                            match self.mailbox.try_recv() {
                                Ok(Cmd::Publish { messages }) => {
                                    total += messages.len();
                                    groups.push(BatchEntry {
                                        enqueued_at_ms: now_ms(),
                                        messages,
                                    });
                                }
                                Ok(other) => {
                                    next = Some(other);
                                    break;
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    let effects = self.state.step(Event::Publish { groups });
                    self.apply(effects).await
                }
            };
            if !keep_running {
                return false;
            }
        }
        true
    }

    /// Execute effects in order. IO outcomes (dial results, write failures)
    /// are fed back into the state machine and their effects appended.
    async fn apply(&mut self, effects: Vec<Effect>) -> bool {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Dial => {
                    let event = self.dial().await;
                    queue.extend(self.state.step(event));
                }
                Effect::Transmit(bytes) => {
                    let send_timeout = self.state_tcp_opts().send_timeout;
                    let Some(writer) = self.writer.as_mut() else {
                        debug!("dropping frame: no active connection");
                        continue;
                    };
                    let result = timeout(send_timeout, writer.write_all(&bytes)).await;
                    if !matches!(result, Ok(Ok(()))) {
                        warn!("socket write failed or timed out");
                        self.writer = None;
                        self.keepalive = None;
                        // Orphan the reader; whatever it still sends carries
                        // a stale epoch.
                        self.epoch += 1;
                        queue.extend(self.state.step(Event::TcpClosed));
                    }
                }
                Effect::Reply(reply, result) => {
                    // The caller may have timed out and dropped the receiver.
                    let _ = reply.send(result);
                }
                Effect::Callback(receipt) => {
                    if let Some(callback) = &self.state.opts.callback {
                        callback(receipt);
                    }
                }
                Effect::ScheduleReconnect(delay) => {
                    self.reconnect = Some(Box::pin(sleep(delay)));
                }
                Effect::StartKeepalive => {
                    let mut ticker = interval_at(
                        Instant::now() + KEEPALIVE_INTERVAL,
                        KEEPALIVE_INTERVAL,
                    );
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keepalive = Some(ticker);
                }
                Effect::ResetKeepalive => {
                    if let Some(ticker) = self.keepalive.as_mut() {
                        ticker.reset();
                    }
                }
                Effect::Terminate => return false,
            }
        }
        true
    }

    async fn dial(&mut self) -> Event {
        let (host, port) = broker_addr(&self.state.broker_url);
        let tcp_opts = self.state_tcp_opts();
        match timeout(tcp_opts.connect_timeout, open_socket(&host, port, &tcp_opts)).await {
            Ok(Ok(stream)) => {
                self.epoch += 1;
                let (read_half, write_half) = stream.into_split();
                self.writer = Some(write_half);
                tokio::spawn(reader_task(read_half, self.conn_tx.clone(), self.epoch));
                info!(broker = %self.state.broker_url, "transport established");
                Event::DialSucceeded
            }
            Ok(Err(e)) => {
                debug!(broker = %self.state.broker_url, error = %e, "connect error");
                Event::DialFailed
            }
            Err(_) => {
                debug!(broker = %self.state.broker_url, "connect timed out");
                Event::DialFailed
            }
        }
    }

    fn state_connected(&self) -> bool {
        self.state.conn == ConnState::Connected
    }

    fn state_batch_size(&self) -> usize {
        self.state.batch_size
    }

    fn state_tcp_opts(&self) -> TcpOpts {
        self.state.opts.tcp_opts.clone()
    }

    fn finish(self) {
        debug!(topic = %self.state.partition_topic, "producer actor stopped");
        // Flush and close the spool before exiting; pending reply channels
        // drop here, surfacing `ProducerClosed` to any waiting callers.
        self.state.close();
        if let Some(done) = self.shutdown_done {
            let _ = done.send(());
        }
    }
}

/// Open a TCP connection with the configured socket options. The read and
/// send buffers are both set to the larger of the two configured sizes.
async fn open_socket(host: &str, port: u16, opts: &TcpOpts) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }?;
        socket.set_reuseaddr(true)?;
        if let Some(buf) = opts.send_buf.into_iter().chain(opts.recv_buf).max() {
            socket.set_send_buffer_size(buf as u32)?;
            socket.set_recv_buffer_size(buf as u32)?;
        }
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(opts.nodelay)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
}

/// Per-connection reader. Owns the residual byte buffer, extracts whole
/// frames, and forwards them to the actor. Malformed frame bodies are logged
/// and skipped; only an untrustworthy length prefix tears the connection.
async fn reader_task(mut read_half: OwnedReadHalf, tx: mpsc::Sender<ConnEvent>, epoch: u64) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    'conn: loop {
        loop {
            match frame::decode(&mut buf) {
                Ok(Some(frame)) => {
                    let event = ConnEvent {
                        epoch,
                        kind: ConnEventKind::Frame(frame),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e @ ProtoError::FrameTooLarge { .. }) => {
                    warn!(error = %e, "unrecoverable framing error");
                    break 'conn;
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed frame");
                }
            }
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    let _ = tx
        .send(ConnEvent {
            epoch,
            kind: ConnEventKind::Closed,
        })
        .await;
}
