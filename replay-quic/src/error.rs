use std::io;

use quinn_proto::{ConnectError, ConnectionError, ReadError, ReadableError, WriteError};

use crate::crypto::CryptoLevel;

/// Why a QUIC handshake failed to complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    /// The peer (or the local TLS stack) raised a TLS alert.
    #[error("TLS alert {0}")]
    TlsAlert(u8),

    #[error("version negotiation failed")]
    VersionNegotiation,

    #[error("invalid transport parameters")]
    TransportParam,

    #[error("{0}")]
    Other(String),
}

impl HandshakeError {
    /// Classify a terminal quinn-proto connection error observed before the
    /// handshake completed.
    ///
    /// TLS alerts surface as CRYPTO_ERROR transport codes (0x0100-0x01ff,
    /// low byte = alert description, RFC 9001 Section 4.8).
    pub(crate) fn classify(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::TimedOut => HandshakeError::Timeout,
            ConnectionError::VersionMismatch => HandshakeError::VersionNegotiation,
            ConnectionError::TransportError(te) => {
                let code = u64::from(te.code);
                if (0x0100..=0x01ff).contains(&code) {
                    HandshakeError::TlsAlert((code & 0xff) as u8)
                } else if code == 0x08 {
                    HandshakeError::TransportParam
                } else {
                    HandshakeError::Other(te.to_string())
                }
            }
            other => HandshakeError::Other(other.to_string()),
        }
    }
}

/// Errors returned by replay-quic operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad endpoint or TLS configuration. Fatal at initialization.
    #[error("config: {0}")]
    Config(String),

    /// UDP socket failure.
    #[error("network: {0}")]
    Network(#[from] io::Error),

    #[error("handshake failed: {0}")]
    HandshakeFailed(HandshakeError),

    /// The handshake byte budget for one encryption level was exceeded.
    /// This is an internal invariant violation, fatal to the session.
    #[error("crypto buffer overflow at {0:?} level")]
    CryptoOverflow(CryptoLevel),

    #[error("no connection")]
    NoConnection,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("write: {0}")]
    Write(#[from] WriteError),

    #[error("read: {0}")]
    Read(#[from] ReadError),

    #[error("readable: {0}")]
    Readable(#[from] ReadableError),
}

impl Error {
    /// Whether this error must take the whole session down (as opposed to a
    /// single stream or a retryable I/O condition).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::HandshakeFailed(_)
                | Error::CryptoOverflow(_)
                | Error::Connection(_)
                | Error::ConnectionClosed
        )
    }
}
