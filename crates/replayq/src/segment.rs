//! On-disk segment log.
//!
//! Items live in segment files named `{:020}.replaylog` after the sequence
//! number of their first record. Each record is framed as
//! `[crc32 u32 BE][len u32 BE][payload]`; the crc covers the payload only.
//! The ack cursor is persisted in a `COMMIT` file
//! (`[seqno u64 BE][crc32 u32 BE]`), rewritten atomically via a temp file.
//!
//! On open, segments are scanned in order. A record that fails its length or
//! crc check marks a torn tail: the remainder of that segment is discarded
//! and, for the final segment, the file is truncated so appends continue
//! after the last valid record.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use tracing::{debug, warn};

use crate::error::{ReplayQError, Result};

const SEG_SUFFIX: &str = "replaylog";
const COMMIT_FILE: &str = "COMMIT";
const RECORD_HEADER: usize = 8;

fn segment_path(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", base, SEG_SUFFIX))
}

fn crc_of(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Decode all valid records in a segment file body.
///
/// Returns the records plus the byte length of the valid prefix; anything
/// past it is a torn tail.
fn scan_records(data: &[u8]) -> (Vec<Bytes>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + RECORD_HEADER <= data.len() {
        let stored_crc = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        let len = u32::from_be_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let end = offset + RECORD_HEADER + len;
        if end > data.len() {
            break;
        }
        let payload = &data[offset + RECORD_HEADER..end];
        if crc_of(payload) != stored_crc {
            break;
        }
        records.push(Bytes::copy_from_slice(payload));
        offset = end;
    }
    (records, offset)
}

struct SegWriter {
    file: BufWriter<File>,
    base: u64,
    len: u64,
}

pub(crate) struct DiskLog {
    dir: PathBuf,
    seg_bytes: u64,
    /// Sorted base sequence numbers of the on-disk segments.
    segments: Vec<u64>,
    writer: Option<SegWriter>,
    committed: u64,
}

pub(crate) struct OpenedLog {
    pub log: DiskLog,
    /// Unacked items recovered from disk, in order.
    pub items: Vec<(u64, Bytes)>,
    /// Sequence number the next append will receive.
    pub next_seqno: u64,
    /// Persisted ack cursor.
    pub acked: u64,
}

impl DiskLog {
    pub(crate) fn open(dir: &Path, seg_bytes: u64) -> Result<OpenedLog> {
        fs::create_dir_all(dir)?;
        let committed = read_commit(dir);

        let mut bases: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == SEG_SUFFIX) {
                if let Some(base) = path
                    .file_stem()
                    .and_then(|s| s.to_string_lossy().parse::<u64>().ok())
                {
                    bases.push(base);
                }
            }
        }
        bases.sort_unstable();

        let mut items: Vec<(u64, Bytes)> = Vec::new();
        let mut next_seqno = committed + 1;
        let mut last_valid_len = 0u64;

        for (i, &base) in bases.iter().enumerate() {
            let path = segment_path(dir, base);
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            let (records, valid_len) = scan_records(&data);
            if valid_len < data.len() {
                warn!(
                    segment = %path.display(),
                    valid = valid_len,
                    total = data.len(),
                    "discarding torn segment tail"
                );
            }
            for (j, payload) in records.into_iter().enumerate() {
                let seqno = base + j as u64;
                if seqno > committed {
                    items.push((seqno, payload));
                }
                next_seqno = next_seqno.max(seqno + 1);
            }
            if i + 1 == bases.len() {
                last_valid_len = valid_len as u64;
            }
        }

        let writer = match bases.last() {
            Some(&base) => {
                let path = segment_path(dir, base);
                // Drop the torn tail so appends land after valid data.
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                file.set_len(last_valid_len)?;
                let file = OpenOptions::new().append(true).open(&path)?;
                Some(SegWriter {
                    file: BufWriter::new(file),
                    base,
                    len: last_valid_len,
                })
            }
            None => None,
        };

        debug!(
            dir = %dir.display(),
            segments = bases.len(),
            unacked = items.len(),
            committed,
            "opened replay log"
        );

        Ok(OpenedLog {
            log: DiskLog {
                dir: dir.to_path_buf(),
                seg_bytes,
                segments: bases,
                writer,
                committed,
            },
            items,
            next_seqno,
            acked: committed,
        })
    }

    pub(crate) fn append(&mut self, seqno: u64, payload: &[u8]) -> Result<()> {
        let needs_roll = match &self.writer {
            None => true,
            Some(w) => w.len >= self.seg_bytes,
        };
        if needs_roll {
            self.roll(seqno)?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ReplayQError::Corrupt("no active segment after roll".into()))?;

        let mut frame = BytesMut::with_capacity(RECORD_HEADER + payload.len());
        frame.put_u32(crc_of(payload));
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);
        writer.file.write_all(&frame)?;
        writer.file.flush()?;
        writer.len += frame.len() as u64;
        Ok(())
    }

    fn roll(&mut self, base: u64) -> Result<()> {
        if let Some(w) = self.writer.take() {
            w.file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        let path = segment_path(&self.dir, base);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.segments.push(base);
        self.writer = Some(SegWriter {
            file: BufWriter::new(file),
            base,
            len: 0,
        });
        Ok(())
    }

    /// Read up to `n` items with sequence numbers `>= start` back from disk.
    pub(crate) fn read_from(&self, start: u64, n: usize) -> Result<Vec<(u64, Bytes)>> {
        let mut out = Vec::new();
        // First segment that could contain `start`.
        let first = match self.segments.iter().rposition(|&b| b <= start) {
            Some(i) => i,
            None => 0,
        };
        for &base in &self.segments[first..] {
            if out.len() >= n {
                break;
            }
            let path = segment_path(&self.dir, base);
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            let (records, _) = scan_records(&data);
            for (j, payload) in records.into_iter().enumerate() {
                let seqno = base + j as u64;
                if seqno >= start {
                    out.push((seqno, payload));
                    if out.len() >= n {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Persist the ack cursor and delete segments whose contents are all
    /// at or below it.
    pub(crate) fn commit(&mut self, acked: u64) -> Result<()> {
        if acked == self.committed {
            return Ok(());
        }
        write_commit(&self.dir, acked)?;
        self.committed = acked;

        // A segment is removable when the following segment starts at or
        // below acked + 1 (everything in it is released) and it is not the
        // active writer segment.
        let writer_base = self.writer.as_ref().map(|w| w.base);
        let mut kept = Vec::with_capacity(self.segments.len());
        for i in 0..self.segments.len() {
            let base = self.segments[i];
            let next_base = self.segments.get(i + 1).copied();
            let removable = matches!(next_base, Some(nb) if nb <= acked + 1)
                && Some(base) != writer_base;
            if removable {
                let path = segment_path(&self.dir, base);
                if let Err(e) = fs::remove_file(&path) {
                    warn!(segment = %path.display(), error = %e, "failed to remove acked segment");
                    kept.push(base);
                }
            } else {
                kept.push(base);
            }
        }
        self.segments = kept;
        Ok(())
    }

    pub(crate) fn close(mut self) -> Result<()> {
        if let Some(w) = self.writer.take() {
            w.file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        Ok(())
    }
}

fn read_commit(dir: &Path) -> u64 {
    let path = dir.join(COMMIT_FILE);
    let mut data = Vec::new();
    match File::open(&path).and_then(|mut f| f.read_to_end(&mut data)) {
        Ok(_) if data.len() == 12 => {
            let seqno = u64::from_be_bytes(data[..8].try_into().unwrap_or([0; 8]));
            let stored = u32::from_be_bytes(data[8..12].try_into().unwrap_or([0; 4]));
            if crc_of(&data[..8]) == stored {
                seqno
            } else {
                warn!(file = %path.display(), "commit file checksum mismatch, restarting from zero");
                0
            }
        }
        Ok(_) => {
            warn!(file = %path.display(), len = data.len(), "commit file malformed, restarting from zero");
            0
        }
        Err(_) => 0,
    }
}

fn write_commit(dir: &Path, acked: u64) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", COMMIT_FILE));
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u64(acked);
    buf.put_u32(crc_of(&acked.to_be_bytes()));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, dir.join(COMMIT_FILE))?;
    Ok(())
}
