//! PROXY preamble wire format.
//!
//! Layouts follow haproxy's `proxy-protocol.txt`: v1 is a single ASCII line
//! terminated by CRLF (108 bytes max including the CRLF), v2 is a binary
//! header whose total size is `16 + be16(length)`.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::ProxyError;

/// The 12-byte v2 signature: `\r\n\r\n\0\r\nQUIT\n`.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Maximum v1 preamble length, CRLF included.
pub const V1_MAX_LEN: usize = 108;

/// v2 address family + transport bytes.
const V2_FAM_TCP4: u8 = 0x11;
const V2_FAM_TCP6: u8 = 0x21;

/// v2 address block sizes for the supported families.
const V2_ADDR_LEN_INET: usize = 12;
const V2_ADDR_LEN_INET6: usize = 36;

/// Which preamble version a session should emit ahead of its transport bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyVersion {
    /// No preamble.
    #[default]
    None,
    /// ASCII v1 line.
    V1,
    /// Binary v2 header.
    V2,
}

/// The advertised source and destination endpoints of a preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// The original client address.
    pub src: SocketAddr,
    /// The original server address.
    pub dst: SocketAddr,
}

/// A parsed (or to-be-serialized) PROXY preamble.
///
/// `endpoints` is `None` when the preamble carries no usable addresses: a v1
/// `UNKNOWN` line or a v2 `LOCAL` command. In both cases the receiver keeps
/// the transport-observed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHeader {
    /// The bytes do not start a PROXY preamble; nothing was consumed.
    None,
    /// Version 1 ASCII preamble.
    V1 { endpoints: Option<Endpoints> },
    /// Version 2 binary preamble.
    V2 { endpoints: Option<Endpoints> },
}

impl ProxyHeader {
    /// Build a v1 header advertising the given endpoints.
    pub fn v1(src: SocketAddr, dst: SocketAddr) -> Self {
        ProxyHeader::V1 {
            endpoints: Some(Endpoints { src, dst }),
        }
    }

    /// Build a v2 header advertising the given endpoints.
    pub fn v2(src: SocketAddr, dst: SocketAddr) -> Self {
        ProxyHeader::V2 {
            endpoints: Some(Endpoints { src, dst }),
        }
    }

    /// Build the header for a configured [`ProxyVersion`].
    pub fn for_version(version: ProxyVersion, src: SocketAddr, dst: SocketAddr) -> Self {
        match version {
            ProxyVersion::None => ProxyHeader::None,
            ProxyVersion::V1 => ProxyHeader::v1(src, dst),
            ProxyVersion::V2 => ProxyHeader::v2(src, dst),
        }
    }

    /// The version this header serializes as.
    pub fn version(&self) -> ProxyVersion {
        match self {
            ProxyHeader::None => ProxyVersion::None,
            ProxyHeader::V1 { .. } => ProxyVersion::V1,
            ProxyHeader::V2 { .. } => ProxyVersion::V2,
        }
    }

    /// The advertised endpoints, if the preamble carried any.
    pub fn endpoints(&self) -> Option<Endpoints> {
        match self {
            ProxyHeader::None => None,
            ProxyHeader::V1 { endpoints } | ProxyHeader::V2 { endpoints } => *endpoints,
        }
    }

    // ── Parsing ──────────────────────────────────────────────────────

    /// Parse a preamble from the head of `buf`.
    ///
    /// Returns the header and the number of bytes it occupied. Bytes that
    /// cannot begin a preamble at all return `(ProxyHeader::None, 0)`;
    /// plausible-but-incomplete input returns [`ProxyError::Truncated`] so
    /// the caller can buffer more and retry.
    pub fn parse(buf: &[u8]) -> Result<(ProxyHeader, usize), ProxyError> {
        if buf.is_empty() {
            return Err(ProxyError::Truncated);
        }

        // v2 first: its signature can never collide with "PROXY".
        let sig_len = buf.len().min(V2_SIGNATURE.len());
        if buf[..sig_len] == V2_SIGNATURE[..sig_len] {
            if buf.len() < V2_SIGNATURE.len() {
                return Err(ProxyError::Truncated);
            }
            if buf.len() < 16 {
                return Err(ProxyError::Truncated);
            }
            if buf[12] >> 4 == 0x2 {
                return Self::parse_v2(buf);
            }
            // Full signature with a foreign version nibble: not a preamble
            // this implementation recognizes. Fall through to the v1 check,
            // which cannot match either, and report None.
        }

        let tag_len = buf.len().min(5);
        if buf[..tag_len] == b"PROXY"[..tag_len] {
            if buf.len() < 8 {
                return Err(ProxyError::Truncated);
            }
            if &buf[..5] == b"PROXY" {
                return Self::parse_v1(buf);
            }
        }

        Ok((ProxyHeader::None, 0))
    }

    /// Parse a v2 binary preamble. `buf` starts with the signature and holds
    /// at least 16 bytes; the version nibble has been checked.
    fn parse_v2(buf: &[u8]) -> Result<(ProxyHeader, usize), ProxyError> {
        let command = buf[12] & 0x0f;
        let family = buf[13];
        let addr_len = usize::from(u16::from_be_bytes([buf[14], buf[15]]));
        let total = 16 + addr_len;

        if buf.len() < total {
            return Err(ProxyError::Truncated);
        }

        match command {
            // LOCAL: health-check traffic, keep the transport peer.
            0x0 => Ok((ProxyHeader::V2 { endpoints: None }, total)),
            0x1 => {
                let addr = &buf[16..total];
                let endpoints = match family {
                    V2_FAM_TCP4 => {
                        if addr_len < V2_ADDR_LEN_INET {
                            return Err(ProxyError::Invalid("short TCPv4 address block"));
                        }
                        Self::decode_inet(addr)
                    }
                    V2_FAM_TCP6 => {
                        if addr_len < V2_ADDR_LEN_INET6 {
                            return Err(ProxyError::Invalid("short TCPv6 address block"));
                        }
                        Self::decode_inet6(addr)
                    }
                    other => {
                        return Err(ProxyError::UnsupportedFamily {
                            family: other,
                            consumed: total,
                        });
                    }
                };
                // Bytes past the address block are TLVs; skipped.
                Ok((
                    ProxyHeader::V2 {
                        endpoints: Some(endpoints),
                    },
                    total,
                ))
            }
            _ => Err(ProxyError::Invalid("unsupported v2 command")),
        }
    }

    fn decode_inet(addr: &[u8]) -> Endpoints {
        let src_ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
        let dst_ip = Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7]);
        let src_port = u16::from_be_bytes([addr[8], addr[9]]);
        let dst_port = u16::from_be_bytes([addr[10], addr[11]]);
        Endpoints {
            src: SocketAddr::new(IpAddr::V4(src_ip), src_port),
            dst: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        }
    }

    fn decode_inet6(addr: &[u8]) -> Endpoints {
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&addr[..16]);
        dst.copy_from_slice(&addr[16..32]);
        let src_port = u16::from_be_bytes([addr[32], addr[33]]);
        let dst_port = u16::from_be_bytes([addr[34], addr[35]]);
        Endpoints {
            src: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
            dst: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
        }
    }

    /// Parse a v1 ASCII preamble. `buf` starts with `PROXY` and holds at
    /// least 8 bytes.
    fn parse_v1(buf: &[u8]) -> Result<(ProxyHeader, usize), ProxyError> {
        // The CR must appear within the first 107 bytes so that the LF still
        // fits inside the 108-byte bound.
        let scan = &buf[..buf.len().min(V1_MAX_LEN - 1)];
        let cr = match scan.iter().position(|&b| b == b'\r') {
            Some(i) => i,
            None if buf.len() >= V1_MAX_LEN => {
                return Err(ProxyError::Invalid("no CRLF within 108 bytes"));
            }
            None => return Err(ProxyError::Truncated),
        };
        if cr + 1 >= buf.len() {
            return Err(ProxyError::Truncated);
        }
        if buf[cr + 1] != b'\n' {
            return Err(ProxyError::Invalid("CR not followed by LF"));
        }

        let line = std::str::from_utf8(&buf[..cr])
            .map_err(|_| ProxyError::Invalid("non-ASCII v1 line"))?;
        let consumed = cr + 2;

        // Single-space delimited; empty tokens mean doubled separators.
        let mut tokens = line.split(' ');
        if tokens.next() != Some("PROXY") {
            return Err(ProxyError::Invalid("malformed v1 tag"));
        }
        let proto = tokens
            .next()
            .ok_or(ProxyError::Invalid("missing protocol token"))?;

        let endpoints = match proto {
            "UNKNOWN" => {
                // Anything up to the CRLF is allowed and ignored.
                None
            }
            "TCP4" | "TCP6" => {
                let fields: Vec<&str> = tokens.collect();
                if fields.len() != 4 || fields.iter().any(|f| f.is_empty()) {
                    return Err(ProxyError::Invalid("wrong v1 field count"));
                }
                let src_ip = Self::parse_v1_addr(fields[0], proto == "TCP6")?;
                let dst_ip = Self::parse_v1_addr(fields[1], proto == "TCP6")?;
                let src_port: u16 = fields[2]
                    .parse()
                    .map_err(|_| ProxyError::Invalid("bad source port"))?;
                let dst_port: u16 = fields[3]
                    .parse()
                    .map_err(|_| ProxyError::Invalid("bad destination port"))?;
                Some(Endpoints {
                    src: SocketAddr::new(src_ip, src_port),
                    dst: SocketAddr::new(dst_ip, dst_port),
                })
            }
            _ => return Err(ProxyError::Invalid("unknown v1 protocol tag")),
        };

        Ok((ProxyHeader::V1 { endpoints }, consumed))
    }

    fn parse_v1_addr(field: &str, v6: bool) -> Result<IpAddr, ProxyError> {
        if v6 {
            field
                .parse::<Ipv6Addr>()
                .map(IpAddr::V6)
                .map_err(|_| ProxyError::Invalid("bad IPv6 address"))
        } else {
            field
                .parse::<Ipv4Addr>()
                .map(IpAddr::V4)
                .map_err(|_| ProxyError::Invalid("bad IPv4 address"))
        }
    }

    // ── Serialization ────────────────────────────────────────────────

    /// Append this preamble's wire bytes to `buf`, returning the byte count.
    ///
    /// `ProxyHeader::None` writes nothing. Mixed-family endpoint pairs
    /// cannot be expressed in either version.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, ProxyError> {
        match self {
            ProxyHeader::None => Ok(0),
            ProxyHeader::V1 { endpoints: None } => {
                buf.extend_from_slice(b"PROXY UNKNOWN\r\n");
                Ok(15)
            }
            ProxyHeader::V1 {
                endpoints: Some(ep),
            } => Self::encode_v1(ep, buf),
            ProxyHeader::V2 { endpoints: None } => {
                // LOCAL command, AF_UNSPEC, empty address block.
                buf.extend_from_slice(&V2_SIGNATURE);
                buf.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
                Ok(16)
            }
            ProxyHeader::V2 {
                endpoints: Some(ep),
            } => Self::encode_v2(ep, buf),
        }
    }

    fn encode_v1(ep: &Endpoints, buf: &mut Vec<u8>) -> Result<usize, ProxyError> {
        let tag = match (ep.src.ip(), ep.dst.ip()) {
            (IpAddr::V4(_), IpAddr::V4(_)) => "TCP4",
            (IpAddr::V6(_), IpAddr::V6(_)) => "TCP6",
            _ => return Err(ProxyError::Invalid("mixed address families")),
        };
        let mut line = String::with_capacity(64);
        write!(
            line,
            "PROXY {tag} {} {} {} {}\r\n",
            ep.src.ip(),
            ep.dst.ip(),
            ep.src.port(),
            ep.dst.port()
        )
        .expect("writing to a String cannot fail");
        debug_assert!(line.len() <= V1_MAX_LEN);
        buf.extend_from_slice(line.as_bytes());
        Ok(line.len())
    }

    fn encode_v2(ep: &Endpoints, buf: &mut Vec<u8>) -> Result<usize, ProxyError> {
        buf.extend_from_slice(&V2_SIGNATURE);
        // ver_cmd: version 2, PROXY command.
        buf.push(0x21);
        match (ep.src.ip(), ep.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.push(V2_FAM_TCP4);
                buf.extend_from_slice(&(V2_ADDR_LEN_INET as u16).to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
                buf.extend_from_slice(&ep.src.port().to_be_bytes());
                buf.extend_from_slice(&ep.dst.port().to_be_bytes());
                Ok(16 + V2_ADDR_LEN_INET)
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                buf.push(V2_FAM_TCP6);
                buf.extend_from_slice(&(V2_ADDR_LEN_INET6 as u16).to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
                buf.extend_from_slice(&ep.src.port().to_be_bytes());
                buf.extend_from_slice(&ep.dst.port().to_be_bytes());
                Ok(16 + V2_ADDR_LEN_INET6)
            }
            _ => Err(ProxyError::Invalid("mixed address families")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v1_parse_tcp4() {
        let input = b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\n<rest>";
        let (header, consumed) = ProxyHeader::parse(input).unwrap();
        assert_eq!(consumed, 38);
        assert_eq!(input[consumed], b'<');
        let ep = header.endpoints().unwrap();
        assert_eq!(ep.src, sa("1.2.3.4:1111"));
        assert_eq!(ep.dst, sa("5.6.7.8:2222"));
        assert_eq!(header.version(), ProxyVersion::V1);
    }

    #[test]
    fn v1_parse_tcp6() {
        let input = b"PROXY TCP6 2001:db8::1 2001:db8::2 443 8443\r\n";
        let (header, consumed) = ProxyHeader::parse(input).unwrap();
        assert_eq!(consumed, input.len());
        let ep = header.endpoints().unwrap();
        assert_eq!(ep.src, sa("[2001:db8::1]:443"));
        assert_eq!(ep.dst, sa("[2001:db8::2]:8443"));
    }

    #[test]
    fn v1_parse_unknown_tag() {
        let input = b"PROXY UNKNOWN\r\npayload";
        let (header, consumed) = ProxyHeader::parse(input).unwrap();
        assert_eq!(consumed, 15);
        assert_eq!(header, ProxyHeader::V1 { endpoints: None });

        // UNKNOWN may carry trailing garbage up to the CRLF.
        let input = b"PROXY UNKNOWN ffff::1 ffff::2 1 2\r\n";
        let (header, consumed) = ProxyHeader::parse(input).unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(header.endpoints(), None);
    }

    #[test]
    fn v2_parse_inet() {
        let mut input = Vec::from(V2_SIGNATURE);
        input.extend_from_slice(&[0x21, 0x11, 0x00, 0x0c]);
        input.extend_from_slice(&[0x0a, 0x00, 0x00, 0x01]); // 10.0.0.1
        input.extend_from_slice(&[0x0a, 0x00, 0x00, 0x02]); // 10.0.0.2
        input.extend_from_slice(&[0x1f, 0x90]); // 8080
        input.extend_from_slice(&[0x00, 0x50]); // 80
        let (header, consumed) = ProxyHeader::parse(&input).unwrap();
        assert_eq!(consumed, 28);
        let ep = header.endpoints().unwrap();
        assert_eq!(ep.src, sa("10.0.0.1:8080"));
        assert_eq!(ep.dst, sa("10.0.0.2:80"));
        assert_eq!(header.version(), ProxyVersion::V2);
    }

    #[test]
    fn v2_parse_local_keeps_peer() {
        let mut input = Vec::from(V2_SIGNATURE);
        input.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
        input.extend_from_slice(b"quic-initial");
        let (header, consumed) = ProxyHeader::parse(&input).unwrap();
        assert_eq!(consumed, 16);
        assert_eq!(header, ProxyHeader::V2 { endpoints: None });
    }

    #[test]
    fn non_proxy_passthrough() {
        let (header, consumed) = ProxyHeader::parse(b"GET / HTTP/1.1\r\n").unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(header, ProxyHeader::None);

        // A QUIC long-header packet can never alias either magic.
        let (header, consumed) = ProxyHeader::parse(&[0xc3, 0x00, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(header, ProxyHeader::None);
    }

    #[test]
    fn v1_round_trip() {
        for (src, dst) in [
            (sa("1.2.3.4:1111"), sa("5.6.7.8:2222")),
            (sa("[2001:db8::a]:65535"), sa("[::1]:1")),
        ] {
            let header = ProxyHeader::v1(src, dst);
            let mut buf = Vec::new();
            let written = header.encode(&mut buf).unwrap();
            assert_eq!(written, buf.len());
            assert!(written <= V1_MAX_LEN);
            let (parsed, consumed) = ProxyHeader::parse(&buf).unwrap();
            assert_eq!(consumed, written);
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn v2_round_trip() {
        for (src, dst) in [
            (sa("10.0.0.1:8080"), sa("10.0.0.2:80")),
            (sa("[2001:db8::a]:443"), sa("[2001:db8::b]:8443")),
        ] {
            let header = ProxyHeader::v2(src, dst);
            let mut buf = Vec::new();
            let written = header.encode(&mut buf).unwrap();
            assert_eq!(written, buf.len());
            let (parsed, consumed) = ProxyHeader::parse(&buf).unwrap();
            assert_eq!(consumed, written);
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn v2_dst_is_not_src() {
        // The destination block must come from the destination endpoint.
        let header = ProxyHeader::v2(sa("[2001:db8::a]:1"), sa("[2001:db8::b]:2"));
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        let ep = ProxyHeader::parse(&buf).unwrap().0.endpoints().unwrap();
        assert_ne!(ep.src.ip(), ep.dst.ip());
        assert_eq!(ep.dst, sa("[2001:db8::b]:2"));
    }

    #[test]
    fn truncated_inputs() {
        // Prefixes of both magics.
        assert_eq!(ProxyHeader::parse(b"PRO"), Err(ProxyError::Truncated));
        assert_eq!(ProxyHeader::parse(b"PROXY T"), Err(ProxyError::Truncated));
        assert_eq!(
            ProxyHeader::parse(&V2_SIGNATURE[..7]),
            Err(ProxyError::Truncated)
        );
        // Full signature but no ver_cmd/fam/len yet.
        assert_eq!(
            ProxyHeader::parse(&V2_SIGNATURE),
            Err(ProxyError::Truncated)
        );
        // v1 line without its CRLF yet.
        assert_eq!(
            ProxyHeader::parse(b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222"),
            Err(ProxyError::Truncated)
        );
        // CR present, LF not yet received.
        assert_eq!(
            ProxyHeader::parse(b"PROXY UNKNOWN\r"),
            Err(ProxyError::Truncated)
        );
        // v2 header shorter than its advertised length.
        let mut short = Vec::from(V2_SIGNATURE);
        short.extend_from_slice(&[0x21, 0x11, 0x00, 0x0c, 0x0a]);
        assert_eq!(ProxyHeader::parse(&short), Err(ProxyError::Truncated));
    }

    #[test]
    fn invalid_inputs() {
        // No CRLF inside the 108-byte bound.
        let mut long = Vec::from(&b"PROXY TCP4 "[..]);
        long.resize(V1_MAX_LEN + 4, b'1');
        assert!(matches!(
            ProxyHeader::parse(&long),
            Err(ProxyError::Invalid(_))
        ));
        // CR followed by something other than LF.
        assert!(matches!(
            ProxyHeader::parse(b"PROXY UNKNOWN\rX"),
            Err(ProxyError::Invalid(_))
        ));
        // Port out of range.
        assert!(matches!(
            ProxyHeader::parse(b"PROXY TCP4 1.2.3.4 5.6.7.8 65536 1\r\n"),
            Err(ProxyError::Invalid(_))
        ));
        // Family/tag mismatch.
        assert!(matches!(
            ProxyHeader::parse(b"PROXY TCP6 1.2.3.4 5.6.7.8 1 2\r\n"),
            Err(ProxyError::Invalid(_))
        ));
        // Doubled separator.
        assert!(matches!(
            ProxyHeader::parse(b"PROXY TCP4  1.2.3.4 5.6.7.8 1 2\r\n"),
            Err(ProxyError::Invalid(_))
        ));
        // Unknown v2 command nibble.
        let mut bad_cmd = Vec::from(V2_SIGNATURE);
        bad_cmd.extend_from_slice(&[0x2f, 0x11, 0x00, 0x00]);
        assert!(matches!(
            ProxyHeader::parse(&bad_cmd),
            Err(ProxyError::Invalid(_))
        ));
    }

    #[test]
    fn v2_unsupported_family_consumes_whole_preamble() {
        // AF_UNIX (0x31), 216-byte address block.
        let mut input = Vec::from(V2_SIGNATURE);
        input.extend_from_slice(&[0x21, 0x31, 0x00, 0xd8]);
        input.resize(16 + 216, 0u8);
        input.extend_from_slice(b"payload");
        assert_eq!(
            ProxyHeader::parse(&input),
            Err(ProxyError::UnsupportedFamily {
                family: 0x31,
                consumed: 16 + 216,
            })
        );
    }

    #[test]
    fn v2_tlvs_are_skipped() {
        // Address length larger than the v4 block: the excess is TLV data.
        let mut input = Vec::from(V2_SIGNATURE);
        input.extend_from_slice(&[0x21, 0x11, 0x00, 0x10]);
        input.extend_from_slice(&[127, 0, 0, 1, 127, 0, 0, 2]);
        input.extend_from_slice(&[0x00, 0x07, 0x00, 0x08]);
        input.extend_from_slice(&[0x04, 0x00, 0x01, 0xff]); // NOOP TLV
        let (header, consumed) = ProxyHeader::parse(&input).unwrap();
        assert_eq!(consumed, 32);
        assert_eq!(header.endpoints().unwrap().src, sa("127.0.0.1:7"));
    }

    #[test]
    fn mixed_families_cannot_encode() {
        let header = ProxyHeader::v1(sa("1.2.3.4:1"), sa("[::1]:2"));
        assert!(header.encode(&mut Vec::new()).is_err());
        let header = ProxyHeader::v2(sa("[::1]:2"), sa("1.2.3.4:1"));
        assert!(header.encode(&mut Vec::new()).is_err());
    }

    #[test]
    fn none_encodes_nothing() {
        let mut buf = Vec::new();
        assert_eq!(ProxyHeader::None.encode(&mut buf).unwrap(), 0);
        assert!(buf.is_empty());
    }
}
