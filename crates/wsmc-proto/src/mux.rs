//! Stream-tag framing used when multiplexing is negotiated
//!
//! Each binary WebSocket message starts with one tag byte:
//! `0x00` for the primary stream, `0x01` for the secondary stream.

use bytes::Bytes;
use thiserror::Error;

/// Which logical stream a multiplexed frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamTag {
    Primary = 0x00,
    Secondary = 0x01,
}

impl TryFrom<u8> for StreamTag {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(StreamTag::Primary),
            0x01 => Ok(StreamTag::Secondary),
            other => Err(MuxError::UnknownTag(other)),
        }
    }
}

/// Decode errors are local to one frame; the connection keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    #[error("Unknown multiplex tag: 0x{0:02X}")]
    UnknownTag(u8),

    #[error("Empty multiplexed frame")]
    EmptyFrame,
}

/// Prefix `payload` with `tag`. The result is exactly one byte longer.
pub fn encode_tagged(tag: StreamTag, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(tag as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Split a tagged frame into its tag and payload without copying.
pub fn decode_tagged(frame: Bytes) -> Result<(StreamTag, Bytes), MuxError> {
    let first = *frame.first().ok_or(MuxError::EmptyFrame)?;
    let tag = StreamTag::try_from(first)?;
    Ok((tag, frame.slice(1..)))
}

/// Bytes per row in [`hex_dump`]
pub const HEX_DUMP_ROW: usize = 32;

/// Render `data` as upper-case hex rows for trace logging.
pub fn hex_dump(data: &[u8]) -> Vec<String> {
    data.chunks(HEX_DUMP_ROW)
        .map(|row| {
            row.iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}
