//! Endpoint configuration.
//!
//! Transport parameters are fixed constants rather than tunables: replay
//! runs must be reproducible, so every endpoint advertises the same values.

use std::sync::Arc;
use std::time::Duration;

use quinn_proto::{IdleTimeout, TransportConfig};

use crate::tls::VerifyMode;

/// Connection-wide receive window (`initial_max_data`).
pub const INITIAL_MAX_DATA: u32 = 1024 * 1024;

/// Per-stream receive window (`initial_max_stream_data_bidi_local/remote`).
pub const INITIAL_MAX_STREAM_DATA: u32 = 256 * 1024;

/// Concurrent bidirectional streams offered to the peer.
pub const MAX_STREAMS_BIDI: u32 = 100;

/// Concurrent unidirectional streams offered to the peer (control + QPACK).
pub const MAX_STREAMS_UNI: u32 = 8;

/// Per-session endpoint options.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Certificate verification toward the peer (client role).
    pub verify: VerifyMode,
    /// SNI the client sends. Defaults to the target address rendered as a
    /// string, which suppresses the extension for bare IPs.
    pub sni: Option<String>,
    /// How long the QUIC+TLS handshake may take.
    pub handshake_timeout: Duration,
    /// Idle timeout advertised to the peer.
    pub idle_timeout: Duration,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            verify: VerifyMode::None,
            sni: None,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the deterministic transport configuration shared by both roles.
pub(crate) fn transport_config(config: &QuicConfig) -> Arc<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.receive_window(INITIAL_MAX_DATA.into());
    transport.stream_receive_window(INITIAL_MAX_STREAM_DATA.into());
    transport.max_concurrent_bidi_streams(MAX_STREAMS_BIDI.into());
    transport.max_concurrent_uni_streams(MAX_STREAMS_UNI.into());
    transport.max_idle_timeout(IdleTimeout::try_from(config.idle_timeout).ok());
    Arc::new(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QuicConfig::default();
        assert_eq!(config.verify, VerifyMode::None);
        assert!(config.sni.is_none());
        assert!(config.handshake_timeout < config.idle_timeout);
    }
}
