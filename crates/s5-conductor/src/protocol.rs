//! Frame format of the conductor control channel.
//!
//! Every message travels as a fixed 20-byte big-endian header followed by a bincode payload:
//! `magic:4 | version:1 | kind:1 | reserved:2 | request_id:8 | payload_length:4`.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};
use crate::message::{deserialize_message, serialize_message, Envelope, Reply};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0x5535_C0D7;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted payload (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client to conductor.
    Request = 1,
    /// Conductor to client.
    Reply = 2,
}

impl FrameKind {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Reply),
            other => Err(TransportError::InvalidFrame {
                reason: format!("unknown frame kind {}", other),
            }),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Direction.
    pub kind: FrameKind,
    /// Request the frame belongs to.
    pub request_id: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encodes the header into its wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        let mut out = &mut buf[..];
        out.put_u32(MAGIC);
        out.put_u8(PROTOCOL_VERSION);
        out.put_u8(self.kind as u8);
        out.put_u16(0);
        out.put_u64(self.request_id);
        out.put_u32(self.payload_length);
        buf
    }

    /// Decodes and validates a header.
    pub fn decode(raw: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let kind = FrameKind::from_u8(buf.get_u8())?;
        let _reserved = buf.get_u16();
        let request_id = buf.get_u64();
        let payload_length = buf.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            kind,
            request_id,
            payload_length,
        })
    }
}

fn encode_frame(kind: FrameKind, request_id: u64, payload: Vec<u8>) -> Result<BytesMut> {
    let payload_length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_SIZE)
        .ok_or(TransportError::PayloadTooLarge {
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            max_size: MAX_PAYLOAD_SIZE,
        })?;
    let header = FrameHeader {
        kind,
        request_id,
        payload_length,
    };
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(&payload);
    Ok(buf)
}

/// Encodes a request envelope into a complete frame.
pub fn encode_request(envelope: &Envelope) -> Result<BytesMut> {
    encode_frame(
        FrameKind::Request,
        envelope.request_id,
        serialize_message(envelope)?,
    )
}

/// Encodes a reply into a complete frame.
pub fn encode_reply(reply: &Reply) -> Result<BytesMut> {
    encode_frame(FrameKind::Reply, reply.request_id, serialize_message(reply)?)
}

/// Decodes a request payload received under `header`.
pub fn decode_request(header: &FrameHeader, payload: &[u8]) -> Result<Envelope> {
    if header.kind != FrameKind::Request {
        return Err(TransportError::InvalidFrame {
            reason: "expected request frame".to_string(),
        });
    }
    let envelope: Envelope = deserialize_message(payload)?;
    if envelope.request_id != header.request_id {
        return Err(TransportError::InvalidFrame {
            reason: "request id differs from header".to_string(),
        });
    }
    Ok(envelope)
}

/// Decodes a reply payload received under `header`.
pub fn decode_reply(header: &FrameHeader, payload: &[u8]) -> Result<Reply> {
    if header.kind != FrameKind::Reply {
        return Err(TransportError::InvalidFrame {
            reason: "expected reply frame".to_string(),
        });
    }
    let reply: Reply = deserialize_message(payload)?;
    if reply.request_id != header.request_id {
        return Err(TransportError::InvalidFrame {
            reason: "request id differs from header".to_string(),
        });
    }
    Ok(reply)
}

/// Allocates a zeroed payload buffer, reporting allocation failure instead of aborting.
pub fn alloc_payload(len: usize) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|_| TransportError::OutOfMemory { size: len })?;
    payload.resize(len, 0);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Executor, Request, Response};
    use proptest::prelude::*;

    fn split(frame: &[u8]) -> (FrameHeader, &[u8]) {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        (FrameHeader::decode(&raw).unwrap(), &frame[FRAME_HEADER_SIZE..])
    }

    #[test]
    fn test_request_frame_layout() {
        let env = Envelope {
            request_id: 9,
            executor: Executor::new("admin", "pw"),
            request: Request::ListStores,
        };
        let frame = encode_request(&env).unwrap();
        assert_eq!(&frame[0..4], &MAGIC.to_be_bytes());
        assert_eq!(frame[4], PROTOCOL_VERSION);
        assert_eq!(frame[5], FrameKind::Request as u8);
        let (header, payload) = split(&frame);
        assert_eq!(header.request_id, 9);
        assert_eq!(header.payload_length as usize, payload.len());
        let decoded = decode_request(&header, payload).unwrap();
        assert_eq!(decoded.request, Request::ListStores);
    }

    #[test]
    fn test_reply_frame_rejected_as_request() {
        let frame = encode_reply(&Reply::ok(3, Response::Done)).unwrap();
        let (header, payload) = split(&frame);
        assert!(decode_request(&header, payload).is_err());
        assert!(decode_reply(&header, payload).is_ok());
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = FrameHeader {
            kind: FrameKind::Reply,
            request_id: 1,
            payload_length: 0,
        }
        .encode();
        raw[0] = 0;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut raw = FrameHeader {
            kind: FrameKind::Reply,
            request_id: 1,
            payload_length: 0,
        }
        .encode();
        raw[4] = 99;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::VersionMismatch { got: 99, .. })
        ));
    }

    #[test]
    fn test_oversized_payload_header() {
        let raw = FrameHeader {
            kind: FrameKind::Reply,
            request_id: 1,
            payload_length: MAX_PAYLOAD_SIZE + 1,
        }
        .encode();
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_alloc_payload_zeroed() {
        let buf = alloc_payload(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|b| *b == 0));
    }

    proptest! {
        #[test]
        fn prop_decode_arbitrary_header_never_panics(raw in proptest::array::uniform20(any::<u8>())) {
            let _ = FrameHeader::decode(&raw);
        }

        #[test]
        fn prop_payload_length_bound_enforced(request_id in any::<u64>(), len in any::<u32>()) {
            let raw = FrameHeader {
                kind: FrameKind::Request,
                request_id,
                payload_length: len,
            }
            .encode();
            let decoded = FrameHeader::decode(&raw);
            prop_assert_eq!(decoded.is_ok(), len <= MAX_PAYLOAD_SIZE);
        }
    }
}
