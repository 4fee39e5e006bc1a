//! Length-prefixed frame codec with carry-buffer extraction.
//!
//! TCP delivers byte streams, not frames. [`decode`] works against a residual
//! buffer owned by the caller: it returns `Ok(None)` until the buffer holds at
//! least one whole frame, then consumes exactly that frame. Body-level parse
//! failures (bad protobuf, checksum mismatch) also consume the frame so the
//! caller can log and keep reading; only a nonsensical length prefix is
//! unrecoverable, since frame boundaries can no longer be trusted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;

use crate::commands::{BaseCommand, MessageMetadata, SingleMessageMetadata};
use crate::error::{ProtoError, Result};
use crate::{MAX_FRAME_SIZE, PAYLOAD_MAGIC};

/// A decoded frame: the command plus, for `Send`-style frames, its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: BaseCommand,
    pub payload: Option<BrokerPayload>,
}

/// Metadata and body carried after the command in a payload frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPayload {
    pub metadata: MessageMetadata,
    pub data: Bytes,
}

/// Encode a command-only frame.
pub fn encode_simple(command: &BaseCommand) -> Result<Bytes> {
    let command_size = command.encoded_len();
    let total_size = 4 + command_size;
    let mut buf = BytesMut::with_capacity(4 + total_size);
    buf.put_u32(total_size as u32);
    buf.put_u32(command_size as u32);
    command.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame carrying metadata and payload, with magic + CRC32C.
pub fn encode_payload(
    command: &BaseCommand,
    metadata: &MessageMetadata,
    payload: &[u8],
) -> Result<Bytes> {
    let command_size = command.encoded_len();
    let metadata_size = metadata.encoded_len();

    // checksum covers [metadata_size][metadata][payload]
    let mut checked = BytesMut::with_capacity(4 + metadata_size + payload.len());
    checked.put_u32(metadata_size as u32);
    metadata.encode(&mut checked)?;
    checked.put_slice(payload);
    let checksum = crc32c::crc32c(&checked);

    let total_size = 4 + command_size + 2 + 4 + checked.len();
    let mut buf = BytesMut::with_capacity(4 + total_size);
    buf.put_u32(total_size as u32);
    buf.put_u32(command_size as u32);
    command.encode(&mut buf)?;
    buf.put_u16(PAYLOAD_MAGIC);
    buf.put_u32(checksum);
    buf.put_slice(&checked);
    Ok(buf.freeze())
}

/// Assemble a batched payload: per message a big-endian size prefix, the
/// single-message metadata, then the message body.
pub fn encode_batch(messages: &[(SingleMessageMetadata, Bytes)]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for (meta, payload) in messages {
        let meta_len = meta.encoded_len();
        buf.put_u32(meta_len as u32);
        meta.encode(&mut buf)?;
        buf.put_slice(payload);
    }
    Ok(buf.freeze())
}

/// Split the entries of a batched payload back out.
pub fn decode_batch(mut payload: Bytes, n: usize) -> Result<Vec<(SingleMessageMetadata, Bytes)>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        if payload.remaining() < 4 {
            return Err(ProtoError::Truncated("batch entry size prefix"));
        }
        let meta_len = payload.get_u32() as usize;
        if payload.remaining() < meta_len {
            return Err(ProtoError::Truncated("batch entry metadata"));
        }
        let meta = SingleMessageMetadata::decode(payload.split_to(meta_len))?;
        let size = meta.payload_size.max(0) as usize;
        if payload.remaining() < size {
            return Err(ProtoError::Truncated("batch entry payload"));
        }
        let data = payload.split_to(size);
        out.push((meta, data));
    }
    Ok(out)
}

/// Try to extract one whole frame from `buf`.
///
/// Returns `Ok(None)` while the buffer holds less than a complete frame. On
/// any `Err` other than [`ProtoError::FrameTooLarge`] the offending frame has
/// been consumed and decoding may continue with the next one.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let total_size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if total_size < 4 || total_size > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge {
            declared: total_size,
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.len() < 4 + total_size {
        return Ok(None);
    }

    let mut frame = buf.split_to(4 + total_size).freeze();
    frame.advance(4);
    parse_frame(frame)
}

fn parse_frame(mut frame: Bytes) -> Result<Option<Frame>> {
    if frame.remaining() < 4 {
        return Err(ProtoError::Truncated("command size"));
    }
    let command_size = frame.get_u32() as usize;
    if frame.remaining() < command_size {
        return Err(ProtoError::Truncated("command body"));
    }
    let command = BaseCommand::decode(frame.split_to(command_size))?;

    if !frame.has_remaining() {
        return Ok(Some(Frame {
            command,
            payload: None,
        }));
    }

    // Optional magic + checksum block before the metadata.
    let mut expected = None;
    if frame.remaining() >= 2 && u16::from_be_bytes([frame[0], frame[1]]) == PAYLOAD_MAGIC {
        frame.advance(2);
        if frame.remaining() < 4 {
            return Err(ProtoError::Truncated("payload checksum"));
        }
        expected = Some(frame.get_u32());
    }

    if let Some(stored) = expected {
        let computed = crc32c::crc32c(&frame);
        if stored != computed {
            return Err(ProtoError::ChecksumMismatch { stored, computed });
        }
    }

    if frame.remaining() < 4 {
        return Err(ProtoError::Truncated("metadata size"));
    }
    let metadata_size = frame.get_u32() as usize;
    if frame.remaining() < metadata_size {
        return Err(ProtoError::Truncated("metadata body"));
    }
    let metadata = MessageMetadata::decode(frame.split_to(metadata_size))?;

    Ok(Some(Frame {
        command,
        payload: Some(BrokerPayload {
            metadata,
            data: frame,
        }),
    }))
}
