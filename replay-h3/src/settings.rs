//! HTTP/3 SETTINGS (RFC 9114 Section 7.2.4).
//!
//! The replay engine always advertises the same three values so that runs
//! are byte-reproducible: no QPACK dynamic table, no blocked streams, and a
//! 64 KiB field-section ceiling. All three are written explicitly rather
//! than elided at their defaults.

use crate::error::H3Error;
use crate::varint::{get_varint, put_varint, varint_size};

pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;

/// SETTINGS identifiers carried over from HTTP/2 that must not appear
/// (RFC 9114 Section 7.2.4.1).
const H2_RESERVED_SETTINGS: [u64; 5] = [0x00, 0x02, 0x03, 0x04, 0x05];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// QPACK dynamic table budget. Zero: static table only.
    pub qpack_max_table_capacity: u64,
    /// Largest field section this endpoint accepts.
    pub max_field_section_size: u64,
    /// QPACK streams allowed to block on the encoder stream. Zero.
    pub qpack_blocked_streams: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 0,
            max_field_section_size: 65536,
            qpack_blocked_streams: 0,
        }
    }
}

impl Settings {
    /// Append the identifier/value pairs to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, SETTINGS_QPACK_MAX_TABLE_CAPACITY);
        put_varint(out, self.qpack_max_table_capacity);
        put_varint(out, SETTINGS_MAX_FIELD_SECTION_SIZE);
        put_varint(out, self.max_field_section_size);
        put_varint(out, SETTINGS_QPACK_BLOCKED_STREAMS);
        put_varint(out, self.qpack_blocked_streams);
    }

    /// Payload size of [`encode`](Self::encode)'s output.
    pub fn wire_size(&self) -> usize {
        varint_size(SETTINGS_QPACK_MAX_TABLE_CAPACITY)
            + varint_size(self.qpack_max_table_capacity)
            + varint_size(SETTINGS_MAX_FIELD_SECTION_SIZE)
            + varint_size(self.max_field_section_size)
            + varint_size(SETTINGS_QPACK_BLOCKED_STREAMS)
            + varint_size(self.qpack_blocked_streams)
    }

    /// Parse a SETTINGS frame payload. Unknown identifiers are ignored;
    /// identifiers reserved from HTTP/2 are a connection error. A peer that
    /// omits a setting gets that setting's default.
    pub fn decode(mut payload: &[u8]) -> Result<Self, H3Error> {
        let mut settings = Settings::default();
        while !payload.is_empty() {
            let (id, n) = get_varint(payload).ok_or(H3Error::FrameError)?;
            payload = &payload[n..];
            let (value, n) = get_varint(payload).ok_or(H3Error::FrameError)?;
            payload = &payload[n..];
            if H2_RESERVED_SETTINGS.contains(&id) {
                return Err(H3Error::InvalidSetting(id));
            }
            match id {
                SETTINGS_QPACK_MAX_TABLE_CAPACITY => settings.qpack_max_table_capacity = value,
                SETTINGS_MAX_FIELD_SECTION_SIZE => settings.max_field_section_size = value,
                SETTINGS_QPACK_BLOCKED_STREAMS => settings.qpack_blocked_streams = value,
                _ => {}
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_wire_image() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        Settings::default().encode(&mut a);
        Settings::default().encode(&mut b);
        assert_eq!(a, b);
        assert_eq!(a.len(), Settings::default().wire_size());
        // All three identifiers present even at their defaults.
        assert_eq!(Settings::decode(&a).unwrap(), Settings::default());
    }

    #[test]
    fn replay_constants() {
        let s = Settings::default();
        assert_eq!(s.qpack_max_table_capacity, 0);
        assert_eq!(s.qpack_blocked_streams, 0);
        assert_eq!(s.max_field_section_size, 65536);
    }

    #[test]
    fn unknown_identifiers_ignored() {
        let mut payload = Vec::new();
        put_varint(&mut payload, 0x21); // GREASE
        put_varint(&mut payload, 7);
        put_varint(&mut payload, SETTINGS_MAX_FIELD_SECTION_SIZE);
        put_varint(&mut payload, 1024);
        let s = Settings::decode(&payload).unwrap();
        assert_eq!(s.max_field_section_size, 1024);
    }

    #[test]
    fn h2_identifiers_rejected() {
        let mut payload = Vec::new();
        put_varint(&mut payload, 0x04); // SETTINGS_INITIAL_WINDOW_SIZE in h2
        put_varint(&mut payload, 65535);
        assert!(matches!(
            Settings::decode(&payload),
            Err(H3Error::InvalidSetting(0x04))
        ));
    }

    #[test]
    fn truncated_pair_is_error() {
        let mut payload = Vec::new();
        put_varint(&mut payload, SETTINGS_MAX_FIELD_SECTION_SIZE);
        assert!(matches!(
            Settings::decode(&payload),
            Err(H3Error::FrameError)
        ));
    }
}
