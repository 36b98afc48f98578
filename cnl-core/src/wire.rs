//! Face framing, plus the `_meta` and `_latest` payload encodings.
//!
//! A frame is a 4-byte little-endian payload length followed by the bincode
//! encoding of one [`Packet`].

use crate::name::Name;
use crate::protocol::{ContentMetaInfo, Packet};

const HEADER_LEN: usize = 4;

/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(packet)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend(payload);
    Ok(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("packet of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
}

/// Decode the frame at the front of `bytes`, returning the packet and the
/// bytes consumed. A partial frame yields `NeedMore`; keep the buffer and
/// call again once more bytes have arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let end = HEADER_LEN + len;
    let payload = bytes.get(HEADER_LEN..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((bincode::deserialize(payload)?, end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("frame announces {0} bytes, over the limit")]
    TooLarge(usize),
    #[error("packet decoding failed: {0}")]
    Decode(#[from] bincode::Error),
}

pub fn encode_content_meta_info(info: &ContentMetaInfo) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(info)
}

pub fn decode_content_meta_info(bytes: &[u8]) -> Result<ContentMetaInfo, bincode::Error> {
    bincode::deserialize(bytes)
}

/// A stream's `_latest` packet carries the name of its newest sequence object.
pub fn encode_latest_target(target: &Name) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(target)
}

pub fn decode_latest_target(bytes: &[u8]) -> Result<Name, bincode::Error> {
    bincode::deserialize(bytes)
}
