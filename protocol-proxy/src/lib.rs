//! PROXY protocol preamble support (haproxy `proxy-protocol.txt`).
//!
//! A PROXY preamble rides at the very head of a transport connection, before
//! TLS or QUIC bytes, and carries the original client/server addresses across
//! intermediaries. Two wire formats exist:
//!
//! - **v1**: a single human-readable ASCII line,
//!   `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`, at most 108 bytes.
//! - **v2**: a binary header with a fixed 12-byte signature, a version/command
//!   byte, an address family byte, a 16-bit big-endian length, and an address
//!   block.
//!
//! # Example
//!
//! ```
//! use protocol_proxy::ProxyHeader;
//!
//! let data = b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\nGET / HTTP/1.1\r\n";
//! let (header, consumed) = ProxyHeader::parse(data).unwrap();
//! let endpoints = header.endpoints().unwrap();
//! assert_eq!(endpoints.src.to_string(), "1.2.3.4:1111");
//! assert_eq!(&data[consumed..6 + consumed], b"GET / ");
//! ```
//!
//! Parsing is incremental: a buffer that could still grow into a valid
//! preamble yields [`ProxyError::Truncated`], and a buffer that cannot be a
//! preamble at all yields `(ProxyHeader::None, 0)` so the caller can treat
//! the bytes as ordinary transport payload.

mod error;
mod header;

pub use error::ProxyError;
pub use header::{Endpoints, ProxyHeader, ProxyVersion, V1_MAX_LEN, V2_SIGNATURE};
