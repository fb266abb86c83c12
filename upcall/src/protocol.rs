//! Consumer-facing framing for pulled commands and pushed replies.
//!
//! The transport does not interpret command bodies; it only frames them so
//! the consumer can correlate its reply with the command id.
//!
//! # Pull frames
//!
//! Every frame handed to the consumer starts with a 16-byte header:
//!
//! ```text
//! ┌─────────┬─────────┬──────────────┬──────────────┬──────────────────────────┐
//! │ Type(1) │ Flags(1)│ Reserved(2)  │ Len(4)       │ Command ID (8)           │
//! └─────────┴─────────┴──────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! - `COMMAND` frames carry the command body followed by whole scatter
//!   regions.
//! - `CONTINUATION` frames carry only scatter regions that did not fit in an
//!   earlier frame for the same command.
//! - `Len` is the total frame length including the header.
//! - The `MORE` flag is set when further continuation frames follow.
//!
//! # Push frames
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ Command ID (8)           │ Payload (0..n)               │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! A frame consisting of the id alone is a bare acknowledgment; anything
//! longer is a full reply.
//!
//! All integers are little-endian.

use thiserror::Error;

use crate::transport::CommandId;

/// Pull frame type discriminants.
pub mod frame_type {
    pub const COMMAND: u8 = 0x01;
    pub const CONTINUATION: u8 = 0x02;
}

/// Pull frame flag bits.
pub mod flags {
    /// More continuation frames follow for this command.
    pub const MORE: u8 = 0x01;
}

/// Size of the pull frame header.
pub const HEADER_SIZE: usize = 16;

/// Size of a reply frame that carries only the id (a bare acknowledgment).
pub const ACK_SIZE: usize = 8;

/// Kind of pull frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// First frame of a command: body plus leading scatter regions.
    Command,
    /// Later frame carrying the remaining scatter regions.
    Continuation,
}

impl FrameKind {
    const fn type_byte(self) -> u8 {
        match self {
            Self::Command => frame_type::COMMAND,
            Self::Continuation => frame_type::CONTINUATION,
        }
    }
}

/// Decoded pull frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub id: CommandId,
    /// Total frame length including this header.
    pub len: u32,
    /// Further continuation frames follow.
    pub more: bool,
}

impl FrameHeader {
    /// Length of the frame body after the header.
    #[must_use]
    pub const fn body_len(&self) -> usize {
        self.len as usize - HEADER_SIZE
    }
}

/// A reply pushed back by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFrame<'a> {
    /// Work confirmed in progress; no payload.
    Ack(CommandId),
    /// Final reply for the command.
    Data { id: CommandId, payload: &'a [u8] },
}

impl ReplyFrame<'_> {
    #[must_use]
    pub const fn id(&self) -> CommandId {
        match self {
            Self::Ack(id) | Self::Data { id, .. } => *id,
        }
    }
}

/// Errors during frame encode/decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer too small to hold or decode a frame.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// Unknown frame type.
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),
    /// Frame length field doesn't match actual data.
    #[error("invalid frame length")]
    InvalidLength,
}

/// Writes a pull frame header into the first [`HEADER_SIZE`] bytes of `buf`.
///
/// `len` is the total frame length. The header is written last by the pull
/// path, once it knows how many regions fit.
pub fn write_header(
    buf: &mut [u8],
    kind: FrameKind,
    id: CommandId,
    len: usize,
    more: bool,
) -> Result<(), ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::BufferTooSmall {
            need: HEADER_SIZE,
            have: buf.len(),
        });
    }
    let len = u32::try_from(len).map_err(|_| ProtocolError::InvalidLength)?;
    buf[0] = kind.type_byte();
    buf[1] = if more { flags::MORE } else { 0 };
    buf[2..4].copy_from_slice(&0u16.to_le_bytes());
    buf[4..8].copy_from_slice(&len.to_le_bytes());
    buf[8..16].copy_from_slice(&id.as_u64().to_le_bytes());
    Ok(())
}

/// Reader for decoding frames.
struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        if self.remaining() < N {
            return Err(ProtocolError::BufferTooSmall {
                need: N,
                have: self.remaining(),
            });
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        Ok(arr)
    }

    fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        self.take::<1>().map(|[b]| b)
    }

    fn take_u16(&mut self) -> Result<u16, ProtocolError> {
        self.take().map(u16::from_le_bytes)
    }

    fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        self.take().map(u32::from_le_bytes)
    }

    fn take_u64(&mut self) -> Result<u64, ProtocolError> {
        self.take().map(u64::from_le_bytes)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.cursor..]
    }
}

/// Decodes the header of a pull frame.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::BufferTooSmall {
            need: HEADER_SIZE,
            have: bytes.len(),
        });
    }
    let mut r = FrameReader::new(bytes);
    let kind = match r.take_u8()? {
        frame_type::COMMAND => FrameKind::Command,
        frame_type::CONTINUATION => FrameKind::Continuation,
        other => return Err(ProtocolError::UnknownFrameType(other)),
    };
    let flag_bits = r.take_u8()?;
    let _reserved = r.take_u16()?;
    let len = r.take_u32()?;
    let id = CommandId::from(r.take_u64()?);
    if (len as usize) < HEADER_SIZE {
        return Err(ProtocolError::InvalidLength);
    }
    Ok(FrameHeader {
        kind,
        id,
        len,
        more: flag_bits & flags::MORE != 0,
    })
}

/// Decodes a whole pull frame into its header and body.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), ProtocolError> {
    let header = decode_header(bytes)?;
    let len = header.len as usize;
    if bytes.len() < len {
        return Err(ProtocolError::BufferTooSmall {
            need: len,
            have: bytes.len(),
        });
    }
    Ok((header, &bytes[HEADER_SIZE..len]))
}

/// Decodes a frame pushed by the consumer.
pub fn decode_reply(bytes: &[u8]) -> Result<ReplyFrame<'_>, ProtocolError> {
    let mut r = FrameReader::new(bytes);
    let id = CommandId::from(r.take_u64()?);
    let payload = r.rest();
    if payload.is_empty() {
        Ok(ReplyFrame::Ack(id))
    } else {
        Ok(ReplyFrame::Data { id, payload })
    }
}

/// Encodes a bare acknowledgment for `id`.
#[must_use]
pub fn encode_ack(id: CommandId) -> [u8; ACK_SIZE] {
    id.as_u64().to_le_bytes()
}

/// Encodes a full reply into `buf`, reusing its allocation.
pub fn encode_reply(id: CommandId, payload: &[u8], buf: &mut Vec<u8>) {
    buf.clear();
    buf.reserve(ACK_SIZE + payload.len());
    buf.extend_from_slice(&id.as_u64().to_le_bytes());
    buf.extend_from_slice(payload);
}
