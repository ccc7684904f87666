//! HTTP/3 frame codec (RFC 9114 Section 7).
//!
//! Every frame is `varint type, varint length, payload`. Unknown types are
//! legal and skipped; the frame types carried over from HTTP/2 but banned in
//! HTTP/3 are a connection error.

use crate::error::H3Error;
use crate::settings::Settings;
use crate::varint::{get_varint, put_varint, varint_size};

/// HTTP/3 frame type registry values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameType(pub u64);

impl FrameType {
    pub const DATA: FrameType = FrameType(0x00);
    pub const HEADERS: FrameType = FrameType(0x01);
    pub const CANCEL_PUSH: FrameType = FrameType(0x03);
    pub const SETTINGS: FrameType = FrameType(0x04);
    pub const PUSH_PROMISE: FrameType = FrameType(0x05);
    pub const GOAWAY: FrameType = FrameType(0x07);
    pub const MAX_PUSH_ID: FrameType = FrameType(0x0d);

    /// HTTP/2 frame types with no HTTP/3 meaning (RFC 9114 Section 7.2.8):
    /// PRIORITY, PING, WINDOW_UPDATE, CONTINUATION.
    pub fn is_h2_reserved(self) -> bool {
        matches!(self.0, 0x02 | 0x06 | 0x08 | 0x09)
    }
}

/// One HTTP/3 frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Request or response body bytes.
    Data { payload: Vec<u8> },
    /// A QPACK-encoded field section.
    Headers { block: Vec<u8> },
    /// Settings exchange; control stream only.
    Settings(Settings),
    /// Graceful shutdown with the last accepted stream/push ID.
    GoAway { id: u64 },
    /// Any type this implementation does not interpret. The payload is
    /// discarded on decode; only its size is kept for accounting.
    Unknown { frame_type: u64, len: usize },
}

impl Frame {
    /// Append the wire encoding (header + payload) to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Data { payload } => {
                put_varint(out, FrameType::DATA.0);
                put_varint(out, payload.len() as u64);
                out.extend_from_slice(payload);
            }
            Frame::Headers { block } => {
                put_varint(out, FrameType::HEADERS.0);
                put_varint(out, block.len() as u64);
                out.extend_from_slice(block);
            }
            Frame::Settings(settings) => {
                put_varint(out, FrameType::SETTINGS.0);
                put_varint(out, settings.wire_size() as u64);
                settings.encode(out);
            }
            Frame::GoAway { id } => {
                put_varint(out, FrameType::GOAWAY.0);
                put_varint(out, varint_size(*id) as u64);
                put_varint(out, *id);
            }
            Frame::Unknown { frame_type, len } => {
                put_varint(out, *frame_type);
                put_varint(out, *len as u64);
                out.resize(out.len() + len, 0);
            }
        }
    }

    /// Decode one frame from the head of `buf`.
    ///
    /// `Ok(Some((frame, consumed)))` on success, `Ok(None)` when more bytes
    /// are needed, `Err` on a framing violation.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, H3Error> {
        let Some((raw_type, type_len)) = get_varint(buf) else {
            return Ok(None);
        };
        let Some((payload_len, len_len)) = get_varint(&buf[type_len..]) else {
            return Ok(None);
        };

        let frame_type = FrameType(raw_type);
        if frame_type.is_h2_reserved() {
            return Err(H3Error::FrameUnexpected(raw_type));
        }

        let header = type_len + len_len;
        let payload_len = usize::try_from(payload_len).map_err(|_| H3Error::FrameError)?;
        let total = header + payload_len;
        if buf.len() < total {
            return Ok(None);
        }
        let payload = &buf[header..total];

        let frame = match frame_type {
            FrameType::DATA => Frame::Data {
                payload: payload.to_vec(),
            },
            FrameType::HEADERS => Frame::Headers {
                block: payload.to_vec(),
            },
            FrameType::SETTINGS => Frame::Settings(Settings::decode(payload)?),
            FrameType::GOAWAY => {
                let (id, _) = get_varint(payload).ok_or(H3Error::FrameError)?;
                Frame::GoAway { id }
            }
            _ => Frame::Unknown {
                frame_type: raw_type,
                len: payload_len,
            },
        };
        Ok(Some((frame, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> (Frame, usize) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let (decoded, consumed) = Frame::decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        (decoded, consumed)
    }

    #[test]
    fn data_round_trip() {
        let (frame, _) = round_trip(Frame::Data {
            payload: b"body bytes".to_vec(),
        });
        assert!(matches!(frame, Frame::Data { payload } if payload == b"body bytes"));
    }

    #[test]
    fn headers_round_trip() {
        let (frame, _) = round_trip(Frame::Headers {
            block: vec![0x00, 0x00, 0xd1, 0xd7],
        });
        assert!(matches!(frame, Frame::Headers { block } if block == [0x00, 0x00, 0xd1, 0xd7]));
    }

    #[test]
    fn goaway_round_trip() {
        let (frame, _) = round_trip(Frame::GoAway { id: 0x4000 });
        assert!(matches!(frame, Frame::GoAway { id: 0x4000 }));
    }

    #[test]
    fn settings_round_trip() {
        let (frame, _) = round_trip(Frame::Settings(Settings::default()));
        let Frame::Settings(s) = frame else {
            panic!("expected SETTINGS");
        };
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn unknown_type_is_skipped_not_fatal() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 0x21); // GREASE-adjacent unknown type
        put_varint(&mut buf, 3);
        buf.extend_from_slice(b"xyz");
        let (frame, consumed) = Frame::decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert!(matches!(
            frame,
            Frame::Unknown {
                frame_type: 0x21,
                len: 3
            }
        ));
    }

    #[test]
    fn h2_reserved_types_are_fatal() {
        for t in [0x02u64, 0x06, 0x08, 0x09] {
            let mut buf = Vec::new();
            put_varint(&mut buf, t);
            put_varint(&mut buf, 0);
            assert!(matches!(
                Frame::decode(&buf),
                Err(H3Error::FrameUnexpected(found)) if found == t
            ));
        }
    }

    #[test]
    fn incomplete_needs_more() {
        // Bare type varint.
        assert!(Frame::decode(&[0x00]).unwrap().is_none());
        // Declared length longer than what is buffered.
        let mut buf = Vec::new();
        put_varint(&mut buf, 0x00);
        put_varint(&mut buf, 10);
        buf.extend_from_slice(b"short");
        assert!(Frame::decode(&buf).unwrap().is_none());
    }
}
