//! # replayq
//!
//! An append-only replay queue with a durable ack cursor, used to spool
//! outbound messages so they survive process restarts and transient
//! disconnects.
//!
//! Items are opaque byte strings. [`ReplayQueue::append`] hands back an
//! [`AckRef`]; once the item (and everything before it) has been handled,
//! [`ReplayQueue::ack`] releases storage up to and including that reference.
//! The queue never reorders.
//!
//! Two modes:
//!
//! - **mem-only** (no directory configured): a plain in-memory queue with
//!   identical semantics but no crash durability.
//! - **disk-backed**: items are framed into segment files and the ack cursor
//!   is persisted, so a reopened queue resumes from the first unacked item.
//!   With `offload_mode` enabled the RAM front is bypassed entirely and
//!   peeks read back from the segment files.
//!
//! ```no_run
//! use replayq::{QueueConfig, ReplayQueue};
//!
//! # fn main() -> replayq::Result<()> {
//! let mut q = ReplayQueue::open(QueueConfig {
//!     dir: Some("/var/spool/my-topic".into()),
//!     ..Default::default()
//! })?;
//! let ack = q.append(bytes::Bytes::from("payload"))?;
//! // ... send the item somewhere, wait for confirmation ...
//! q.ack(ack)?;
//! q.close()?;
//! # Ok(())
//! # }
//! ```

mod error;
mod segment;

use std::collections::VecDeque;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use error::{ReplayQError, Result};

use segment::DiskLog;

/// Default segment file size: 20 MiB.
pub const DEFAULT_SEG_BYTES: u64 = 20 * 1024 * 1024;

/// Opaque, ordered token identifying an appended item. Redeem with
/// [`ReplayQueue::ack`] to release all items up to and including it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AckRef(u64);

impl AckRef {
    /// Raw sequence number, for diagnostics and state snapshots.
    pub fn seqno(self) -> u64 {
        self.0
    }
}

/// Queue construction options. Retention is the caller's policy; the queue
/// stores opaque bytes and does not inspect timestamps.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Spool directory. `None` selects mem-only mode.
    pub dir: Option<PathBuf>,
    /// Segment file size before rolling.
    pub seg_bytes: u64,
    /// Bypass the RAM front; peeks read back from segment files.
    pub offload_mode: bool,
    /// Cap on pending (unacked) bytes. `None` = unlimited.
    pub max_total_bytes: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: None,
            seg_bytes: DEFAULT_SEG_BYTES,
            offload_mode: false,
            max_total_bytes: None,
        }
    }
}

/// Append-only queue with an ack cursor. Owned by a single task; methods
/// take `&mut self` and the type is not internally synchronized.
pub struct ReplayQueue {
    /// RAM front of unacked items; empty when offloading to disk.
    mem: VecDeque<(u64, Bytes)>,
    /// `(seqno, byte length)` of every unacked item, kept in all modes.
    sizes: VecDeque<(u64, usize)>,
    disk: Option<DiskLog>,
    offload: bool,
    next_seqno: u64,
    acked: u64,
    pending_bytes: u64,
    max_total_bytes: Option<u64>,
}

impl ReplayQueue {
    /// Open (or create) a queue. Disk-backed queues replay their unacked
    /// region; torn tails from a crash are discarded.
    pub fn open(config: QueueConfig) -> Result<Self> {
        match config.dir {
            None => Ok(Self {
                mem: VecDeque::new(),
                sizes: VecDeque::new(),
                disk: None,
                offload: false,
                next_seqno: 1,
                acked: 0,
                pending_bytes: 0,
                max_total_bytes: config.max_total_bytes,
            }),
            Some(dir) => {
                let opened = DiskLog::open(&dir, config.seg_bytes)?;
                let sizes: VecDeque<(u64, usize)> = opened
                    .items
                    .iter()
                    .map(|(seqno, item)| (*seqno, item.len()))
                    .collect();
                let pending_bytes = sizes.iter().map(|(_, len)| *len as u64).sum();
                let mem = if config.offload_mode {
                    VecDeque::new()
                } else {
                    opened.items.into()
                };
                debug!(
                    dir = %dir.display(),
                    unacked = sizes.len(),
                    pending_bytes,
                    "replay queue opened"
                );
                Ok(Self {
                    mem,
                    sizes,
                    disk: Some(opened.log),
                    offload: config.offload_mode,
                    next_seqno: opened.next_seqno,
                    acked: opened.acked,
                    pending_bytes,
                    max_total_bytes: config.max_total_bytes,
                })
            }
        }
    }

    /// Append one item, returning its ack reference.
    pub fn append(&mut self, item: Bytes) -> Result<AckRef> {
        if let Some(max) = self.max_total_bytes {
            if self.pending_bytes + item.len() as u64 > max {
                return Err(ReplayQError::QueueFull {
                    pending: self.pending_bytes,
                    max,
                });
            }
        }
        let seqno = self.next_seqno;
        if let Some(disk) = &mut self.disk {
            disk.append(seqno, &item)?;
        }
        self.sizes.push_back((seqno, item.len()));
        self.pending_bytes += item.len() as u64;
        if !(self.offload && self.disk.is_some()) {
            self.mem.push_back((seqno, item));
        }
        self.next_seqno += 1;
        Ok(AckRef(seqno))
    }

    /// First `n` unacked items, oldest first.
    pub fn peek(&self, n: usize) -> Result<Vec<(AckRef, Bytes)>> {
        self.peek_from(None, n)
    }

    /// Up to `n` unacked items strictly after `after` (or from the cursor
    /// when `None`), oldest first.
    pub fn peek_from(&self, after: Option<AckRef>, n: usize) -> Result<Vec<(AckRef, Bytes)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let start = after.map(|a| a.0).unwrap_or(0).max(self.acked) + 1;
        if self.offload {
            if let Some(disk) = &self.disk {
                return Ok(disk
                    .read_from(start, n)?
                    .into_iter()
                    .filter(|(seqno, _)| *seqno > self.acked)
                    .map(|(seqno, item)| (AckRef(seqno), item))
                    .collect());
            }
        }
        Ok(self
            .mem
            .iter()
            .skip_while(|(seqno, _)| *seqno < start)
            .take(n)
            .map(|(seqno, item)| (AckRef(*seqno), item.clone()))
            .collect())
    }

    /// Release every item up to and including `ack_ref`. Persists the cursor
    /// and garbage-collects fully released segments in disk mode. Acking an
    /// already released reference is a no-op.
    pub fn ack(&mut self, ack_ref: AckRef) -> Result<()> {
        if ack_ref.0 <= self.acked {
            return Ok(());
        }
        if ack_ref.0 >= self.next_seqno {
            return Err(ReplayQError::InvalidAck { seqno: ack_ref.0 });
        }
        while let Some(&(seqno, len)) = self.sizes.front() {
            if seqno > ack_ref.0 {
                break;
            }
            self.sizes.pop_front();
            self.pending_bytes -= len as u64;
        }
        while let Some((seqno, _)) = self.mem.front() {
            if *seqno > ack_ref.0 {
                break;
            }
            self.mem.pop_front();
        }
        self.acked = ack_ref.0;
        if let Some(disk) = &mut self.disk {
            disk.commit(self.acked)?;
        }
        Ok(())
    }

    /// Whether this queue was opened without a backing directory.
    pub fn is_mem_only(&self) -> bool {
        self.disk.is_none()
    }

    /// Number of unacked items.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Total bytes pending (appended but not yet acked).
    pub fn total_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Flush and release file descriptors. Unacked disk items remain on
    /// disk for the next open; mem-only contents are dropped.
    pub fn close(self) -> Result<()> {
        if let Some(disk) = self.disk {
            disk.close()?;
        }
        Ok(())
    }
}
