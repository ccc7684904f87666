//! QPACK field-section coding, static table only (RFC 9204).
//!
//! With `QPACK_MAX_TABLE_CAPACITY = 0` both sides are confined to the
//! 99-entry static table, which keeps replay deterministic: no encoder or
//! decoder streams, no blocked streams, Required Insert Count always zero.
//! Post-base representations therefore never appear and are rejected.

use crate::error::H3Error;
use crate::huffman;

/// One header field as carried in a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Field size for the MAX_FIELD_SECTION_SIZE accounting
    /// (RFC 9204 Section 4.5.1: name + value + 32).
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// The QPACK static table (RFC 9204 Appendix A).
const STATIC_TABLE: [(&[u8], &[u8]); 99] = [
    (b":authority", b""),
    (b":path", b"/"),
    (b"age", b"0"),
    (b"content-disposition", b""),
    (b"content-length", b"0"),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"referer", b""),
    (b"set-cookie", b""),
    (b":method", b"CONNECT"),
    (b":method", b"DELETE"),
    (b":method", b"GET"),
    (b":method", b"HEAD"),
    (b":method", b"OPTIONS"),
    (b":method", b"POST"),
    (b":method", b"PUT"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"103"),
    (b":status", b"200"),
    (b":status", b"304"),
    (b":status", b"404"),
    (b":status", b"503"),
    (b"accept", b"*/*"),
    (b"accept", b"application/dns-message"),
    (b"accept-encoding", b"gzip, deflate, br"),
    (b"accept-ranges", b"bytes"),
    (b"access-control-allow-headers", b"cache-control"),
    (b"access-control-allow-headers", b"content-type"),
    (b"access-control-allow-origin", b"*"),
    (b"cache-control", b"max-age=0"),
    (b"cache-control", b"max-age=2592000"),
    (b"cache-control", b"max-age=604800"),
    (b"cache-control", b"no-cache"),
    (b"cache-control", b"no-store"),
    (b"cache-control", b"public, max-age=31536000"),
    (b"content-encoding", b"br"),
    (b"content-encoding", b"gzip"),
    (b"content-type", b"application/dns-message"),
    (b"content-type", b"application/javascript"),
    (b"content-type", b"application/json"),
    (b"content-type", b"application/x-www-form-urlencoded"),
    (b"content-type", b"image/gif"),
    (b"content-type", b"image/jpeg"),
    (b"content-type", b"image/png"),
    (b"content-type", b"text/css"),
    (b"content-type", b"text/html; charset=utf-8"),
    (b"content-type", b"text/plain"),
    (b"content-type", b"text/plain;charset=utf-8"),
    (b"range", b"bytes=0-"),
    (b"strict-transport-security", b"max-age=31536000"),
    (b"strict-transport-security", b"max-age=31536000; includesubdomains"),
    (b"strict-transport-security", b"max-age=31536000; includesubdomains; preload"),
    (b"vary", b"accept-encoding"),
    (b"vary", b"origin"),
    (b"x-content-type-options", b"nosniff"),
    (b"x-xss-protection", b"1; mode=block"),
    (b":status", b"100"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"302"),
    (b":status", b"400"),
    (b":status", b"403"),
    (b":status", b"421"),
    (b":status", b"425"),
    (b":status", b"500"),
    (b"accept-language", b""),
    (b"access-control-allow-credentials", b"FALSE"),
    (b"access-control-allow-credentials", b"TRUE"),
    (b"access-control-allow-headers", b"*"),
    (b"access-control-allow-methods", b"get"),
    (b"access-control-allow-methods", b"get, post, options"),
    (b"access-control-allow-methods", b"options"),
    (b"access-control-expose-headers", b"content-length"),
    (b"access-control-request-headers", b"content-type"),
    (b"access-control-request-method", b"get"),
    (b"access-control-request-method", b"post"),
    (b"alt-svc", b"clear"),
    (b"authorization", b""),
    (b"content-security-policy", b"script-src 'none'; object-src 'none'; base-uri 'none'"),
    (b"early-data", b"1"),
    (b"expect-ct", b""),
    (b"forwarded", b""),
    (b"if-range", b""),
    (b"origin", b""),
    (b"purpose", b"prefetch"),
    (b"server", b""),
    (b"timing-allow-origin", b"*"),
    (b"upgrade-insecure-requests", b"1"),
    (b"user-agent", b""),
    (b"x-forwarded-for", b""),
    (b"x-frame-options", b"deny"),
    (b"x-frame-options", b"sameorigin"),];

fn match_full(field: &HeaderField) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, v)| n == field.name && v == field.value)
        .map(|i| i as u64)
}

fn match_name(name: &[u8]) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, _)| n == name)
        .map(|i| i as u64)
}

// ── Prefix integers (RFC 9204 Section 4.1.1) ────────────────────────
//
// Not QUIC varints: an N-bit prefix either holds the value directly or is
// saturated and followed by 7-bit continuation bytes.

fn put_prefix_int(out: &mut Vec<u8>, value: u64, prefix_bits: u8, pattern: u8) {
    let cap = (1u64 << prefix_bits) - 1;
    if value < cap {
        out.push(pattern | value as u8);
        return;
    }
    out.push(pattern | cap as u8);
    let mut rest = value - cap;
    while rest >= 0x80 {
        out.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    out.push(rest as u8);
}

fn get_prefix_int(buf: &[u8], prefix_bits: u8) -> Option<(u64, usize)> {
    let cap = (1u64 << prefix_bits) - 1;
    let head = u64::from(*buf.first()?) & cap;
    if head < cap {
        return Some((head, 1));
    }
    let mut value = cap;
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        value = value.checked_add(u64::from(b & 0x7f) << shift)?;
        if b & 0x80 == 0 {
            return Some((value, i + 2));
        }
        shift += 7;
        if shift > 56 {
            return None;
        }
    }
    None
}

// ── String literals ─────────────────────────────────────────────────

/// Append a string literal with an `h_bit`-flagged length of `prefix_bits`
/// bits, Huffman-coding when that is strictly shorter.
fn put_string(out: &mut Vec<u8>, data: &[u8], prefix_bits: u8, pattern: u8, h_bit: u8) {
    let coded = huffman::encoded_len(data);
    if coded < data.len() {
        put_prefix_int(out, coded as u64, prefix_bits, pattern | h_bit);
        huffman::encode(data, out);
    } else {
        put_prefix_int(out, data.len() as u64, prefix_bits, pattern);
        out.extend_from_slice(data);
    }
}

fn get_string(
    buf: &[u8],
    prefix_bits: u8,
    h_bit: u8,
) -> Result<(Vec<u8>, usize), H3Error> {
    let first = *buf.first().ok_or(H3Error::QpackDecompressionFailed)?;
    let coded = first & h_bit != 0;
    let (len, int_len) =
        get_prefix_int(buf, prefix_bits).ok_or(H3Error::QpackDecompressionFailed)?;
    let len = len as usize;
    let end = int_len.checked_add(len).ok_or(H3Error::QpackDecompressionFailed)?;
    let raw = buf.get(int_len..end).ok_or(H3Error::QpackDecompressionFailed)?;
    let data = if coded {
        huffman::decode(raw)?
    } else {
        raw.to_vec()
    };
    Ok((data, end))
}

// ── Field sections ──────────────────────────────────────────────────

/// Encode a field section: zero prefix (static table only), then each field
/// in its most compact static-table representation.
pub fn encode_block(fields: &[HeaderField], out: &mut Vec<u8>) {
    // Required Insert Count = 0, Delta Base = 0 (RFC 9204 Section 4.5.1).
    put_prefix_int(out, 0, 8, 0x00);
    put_prefix_int(out, 0, 7, 0x00);

    for field in fields {
        if let Some(index) = match_full(field) {
            // Indexed field line, static table (pattern 11xxxxxx).
            put_prefix_int(out, index, 6, 0xc0);
        } else if let Some(name_index) = match_name(&field.name) {
            // Literal with static name reference (pattern 01N1xxxx, N=0).
            put_prefix_int(out, name_index, 4, 0x50);
            put_string(out, &field.value, 7, 0x00, 0x80);
        } else {
            // Literal with literal name (pattern 001NHxxx, N=0).
            put_string(out, &field.name, 3, 0x20, 0x08);
            put_string(out, &field.value, 7, 0x00, 0x80);
        }
    }
}

/// Decode a field section, enforcing `max_section_size` (the advertised
/// MAX_FIELD_SECTION_SIZE, counted as name + value + 32 per field).
pub fn decode_block(block: &[u8], max_section_size: u64) -> Result<Vec<HeaderField>, H3Error> {
    let (ric, n) = get_prefix_int(block, 8).ok_or(H3Error::QpackDecompressionFailed)?;
    if ric != 0 {
        // Dynamic-table references cannot work with a zero-capacity table.
        return Err(H3Error::QpackDecompressionFailed);
    }
    let mut pos = n;
    let (_base, n) =
        get_prefix_int(&block[pos..], 7).ok_or(H3Error::QpackDecompressionFailed)?;
    pos += n;

    let mut fields = Vec::new();
    let mut section_size = 0usize;

    while pos < block.len() {
        let rest = &block[pos..];
        let first = rest[0];

        let field = if first & 0x80 != 0 {
            // Indexed field line. T (0x40) must point at the static table.
            if first & 0x40 == 0 {
                return Err(H3Error::QpackDecompressionFailed);
            }
            let (index, n) =
                get_prefix_int(rest, 6).ok_or(H3Error::QpackDecompressionFailed)?;
            pos += n;
            let (name, value) = STATIC_TABLE
                .get(index as usize)
                .ok_or(H3Error::QpackDecompressionFailed)?;
            HeaderField::new(*name, *value)
        } else if first & 0x40 != 0 {
            // Literal with name reference; T is 0x10 here.
            if first & 0x10 == 0 {
                return Err(H3Error::QpackDecompressionFailed);
            }
            let (index, n) =
                get_prefix_int(rest, 4).ok_or(H3Error::QpackDecompressionFailed)?;
            let (name, _) = STATIC_TABLE
                .get(index as usize)
                .ok_or(H3Error::QpackDecompressionFailed)?;
            let (value, m) = get_string(&rest[n..], 7, 0x80)?;
            pos += n + m;
            HeaderField {
                name: name.to_vec(),
                value,
            }
        } else if first & 0x20 != 0 {
            // Literal with literal name; H for the name is bit 3.
            let (name, n) = get_string(rest, 3, 0x08)?;
            let (value, m) = get_string(&rest[n..], 7, 0x80)?;
            pos += n + m;
            HeaderField { name, value }
        } else {
            // 0001xxxx / 0000xxxx: post-base forms need a dynamic table.
            return Err(H3Error::QpackDecompressionFailed);
        };

        section_size += field.size();
        if section_size as u64 > max_section_size {
            return Err(H3Error::FieldSectionTooLarge(section_size));
        }
        fields.push(field);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_LIMIT: u64 = u64::MAX;

    fn round_trip(fields: &[HeaderField]) -> Vec<HeaderField> {
        let mut block = Vec::new();
        encode_block(fields, &mut block);
        decode_block(&block, NO_LIMIT).unwrap()
    }

    #[test]
    fn fully_indexed_request() {
        let fields = vec![
            HeaderField::new(&b":method"[..], &b"GET"[..]),
            HeaderField::new(&b":scheme"[..], &b"https"[..]),
            HeaderField::new(&b":authority"[..], &b""[..]),
            HeaderField::new(&b":path"[..], &b"/"[..]),
        ];
        let mut block = Vec::new();
        encode_block(&fields, &mut block);
        // 2 prefix bytes + one indexed byte per field.
        assert_eq!(block.len(), 2 + fields.len());
        assert_eq!(decode_block(&block, NO_LIMIT).unwrap(), fields);
    }

    #[test]
    fn name_reference_and_literal() {
        let fields = vec![
            HeaderField::new(&b":status"[..], &b"418"[..]), // name in table, value not
            HeaderField::new(&b"x-replay-key"[..], &b"txn-00042"[..]), // neither
            HeaderField::new(&b"content-length"[..], &b"1234"[..]),
        ];
        assert_eq!(round_trip(&fields), fields);
    }

    #[test]
    fn huffman_friendly_values_round_trip() {
        let fields = vec![
            HeaderField::new(&b"user-agent"[..], &b"replay/0.1.0 (verification)"[..]),
            HeaderField::new(&b"date"[..], &b"Mon, 21 Oct 2013 20:13:21 GMT"[..]),
        ];
        assert_eq!(round_trip(&fields), fields);
    }

    #[test]
    fn empty_section() {
        assert_eq!(round_trip(&[]), Vec::<HeaderField>::new());
    }

    #[test]
    fn nonzero_required_insert_count_rejected() {
        let mut block = Vec::new();
        put_prefix_int(&mut block, 1, 8, 0x00);
        put_prefix_int(&mut block, 0, 7, 0x00);
        assert!(matches!(
            decode_block(&block, NO_LIMIT),
            Err(H3Error::QpackDecompressionFailed)
        ));
    }

    #[test]
    fn post_base_forms_rejected() {
        let mut block = Vec::new();
        put_prefix_int(&mut block, 0, 8, 0x00);
        put_prefix_int(&mut block, 0, 7, 0x00);
        block.push(0x10); // indexed field line with post-base index
        assert!(decode_block(&block, NO_LIMIT).is_err());
    }

    #[test]
    fn section_size_limit_enforced() {
        let fields = vec![HeaderField::new(&b"x-large"[..], vec![b'v'; 600])];
        let mut block = Vec::new();
        encode_block(&fields, &mut block);
        // 7 + 600 + 32 = 639 > 100.
        assert!(matches!(
            decode_block(&block, 100),
            Err(H3Error::FieldSectionTooLarge(_))
        ));
        assert!(decode_block(&block, 1024).is_ok());
    }

    #[test]
    fn prefix_int_boundaries() {
        for (value, bits) in [(0u64, 6u8), (62, 6), (63, 6), (64, 6), (1337, 5), (10, 5)] {
            let mut buf = Vec::new();
            put_prefix_int(&mut buf, value, bits, 0x00);
            assert_eq!(get_prefix_int(&buf, bits), Some((value, buf.len())));
        }
        // RFC 7541 Appendix C.1.2: 1337 with a 5-bit prefix.
        let mut buf = Vec::new();
        put_prefix_int(&mut buf, 1337, 5, 0x00);
        assert_eq!(buf, [0x1f, 0x9a, 0x0a]);
    }
}
