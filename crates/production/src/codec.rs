//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [length: u32 BE][version: u8][payload: SBOR-encoded ProtocolMessage]
//! ```
//!
//! - The length covers the version byte plus the payload.
//! - Version is currently `1`.
//! - The payload is the SBOR encoding of the
//!   [`ProtocolMessage`] tagged union; the tag inside the union selects the
//!   message kind, so a single topic/stream carries every kind.

use lockstep_types::ProtocolMessage;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Maximum accepted frame length. Bigger frames are rejected before
/// allocation.
pub const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("message too short")]
    MessageTooShort,

    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(u32),

    #[error("SBOR decode error: {0}")]
    SborDecode(String),

    #[error("SBOR encode error: {0}")]
    SborEncode(String),
}

/// Encode a message as one length-prefixed frame.
pub fn encode_message(message: &ProtocolMessage) -> Result<Vec<u8>, CodecError> {
    let payload =
        sbor::basic_encode(message).map_err(|e| CodecError::SborEncode(format!("{e:?}")))?;
    let body_len = (payload.len() + 1) as u32;
    let mut bytes = Vec::with_capacity(4 + body_len as usize);
    bytes.extend_from_slice(&body_len.to_be_bytes());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a frame body (everything after the length prefix).
pub fn decode_message(data: &[u8]) -> Result<ProtocolMessage, CodecError> {
    let (&version, payload) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    sbor::basic_decode(payload).map_err(|e| CodecError::SborDecode(format!("{e:?}")))
}

/// Try to split one frame off the front of a byte stream.
///
/// Returns the decoded message and the number of bytes consumed, or `None`
/// when the buffer does not yet hold a full frame.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(ProtocolMessage, usize)>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if body_len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body_len));
    }
    if body_len == 0 {
        return Err(CodecError::MessageTooShort);
    }
    let total = 4 + body_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let message = decode_message(&buf[4..total])?;
    Ok(Some((message, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_types::{Commit, Digest, PrePrepare, ReplicaId, Request};

    fn sample_pre_prepare() -> ProtocolMessage {
        let request = Request::new(7, b"payload".to_vec(), ReplicaId(2));
        ProtocolMessage::PrePrepare(PrePrepare {
            view: 1,
            seq_no: 9,
            digest: request.digest(),
            request: Some(request),
            replica_id: ReplicaId(1),
        })
    }

    #[test]
    fn roundtrip_pre_prepare() {
        let message = sample_pre_prepare();
        let bytes = encode_message(&message).unwrap();
        assert_eq!(bytes[4], WIRE_VERSION);

        let (decoded, consumed) = decode_frame(&bytes).unwrap().expect("full frame");
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, message);
        // The digest still verifies against the carried request.
        let ProtocolMessage::PrePrepare(pp) = decoded else {
            unreachable!()
        };
        assert_eq!(pp.request.as_ref().unwrap().digest(), pp.digest);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let message = ProtocolMessage::Commit(Commit {
            view: 0,
            seq_no: 3,
            digest: Digest::of(b"x"),
            replica_id: ReplicaId(0),
        });
        let bytes = encode_message(&message).unwrap();
        for cut in 0..bytes.len() {
            assert!(decode_frame(&bytes[..cut]).unwrap().is_none(), "cut {cut}");
        }

        // Two frames back to back decode one at a time.
        let mut stream = bytes.clone();
        stream.extend_from_slice(&bytes);
        let (first, consumed) = decode_frame(&stream).unwrap().unwrap();
        assert_eq!(first, message);
        let (second, _) = decode_frame(&stream[consumed..]).unwrap().unwrap();
        assert_eq!(second, message);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = encode_message(&sample_pre_prepare()).unwrap();
        bytes[4] = 99;
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::UnknownVersion(99))
        ));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.push(WIRE_VERSION);
        bytes.extend_from_slice(&[0xff, 0xff]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::SborDecode(_))
        ));
    }

    #[test]
    fn oversized_frames_are_rejected_up_front() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        bytes.push(WIRE_VERSION);
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
