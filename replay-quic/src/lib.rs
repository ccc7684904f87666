//! QUIC endpoint plumbing for the HTTP/3 traffic replayer.
//!
//! This crate wraps [quinn-proto](https://docs.rs/quinn-proto)'s sans-IO
//! QUIC state machine into a [`QuicEndpoint`] that owns a UDP socket and
//! exactly one connection, pumped cooperatively from the session thread:
//!
//! ```rust,ignore
//! let mut ep = QuicEndpoint::connect(QuicConfig::default(), None, peer, &ProxyHeader::None)?;
//! ep.drive_until_connected(Duration::from_secs(5))?;
//! let stream = ep.open_bi()?.expect("stream limit");
//! ep.stream_send(stream, b"...")?;
//! loop {
//!     ep.drive(Duration::from_millis(10))?;
//!     while let Some(event) = ep.poll_event() { /* ... */ }
//! }
//! ```
//!
//! Alongside the endpoint live the pieces a replay session needs around it:
//! process-wide TLS contexts with ALPN pinned to `h3` ([`tls`]), random
//! connection identifiers with process-wide uniqueness ([`cid`]), bounded
//! per-encryption-level handshake accounting ([`crypto`]), and the
//! serialized qlog sink ([`qlog`]).

pub mod cid;
pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod qlog;
pub mod tls;

pub use cid::ConnectionId;
pub use config::QuicConfig;
pub use crypto::{CryptoBuffer, CryptoLevel, HandshakeBuffers};
pub use endpoint::{QuicEndpoint, QuicEvent, Role};
pub use error::{Error, HandshakeError};
pub use tls::{ALPN_H3, TlsContext, TlsMaterial, VerifyMode};

// Re-export the quinn-proto types that cross this crate's API.
pub use quinn_proto::{Dir, StreamId};
