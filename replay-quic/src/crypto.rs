//! Per-encryption-level handshake byte accounting.
//!
//! TLS handshake bytes travel in CRYPTO frames segregated by encryption
//! level. Each level gets a bounded staging buffer; blowing through the
//! bound means the handshake is not the shape this tool expects and the
//! session must stop rather than replay garbage. The buffers observe the
//! TLS<->QUIC seam through a delegating [`quinn_proto::crypto::Session`]
//! wrapper around the rustls-backed session; quinn-proto keeps the
//! authoritative copy.

use std::any::Any;
use std::sync::{Arc, Mutex};

use quinn_proto::crypto::{
    ClientConfig, ExportKeyingMaterialError, HeaderKey, KeyPair, Keys, PacketKey, ServerConfig,
    Session, UnsupportedVersion,
};
use quinn_proto::transport_parameters::TransportParameters;
use quinn_proto::{ConnectError, ConnectionId, Side, TransportError};

/// QUIC encryption levels, in handshake order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoLevel {
    Initial,
    ZeroRtt,
    Handshake,
    Application,
}

impl CryptoLevel {
    pub const ALL: [CryptoLevel; 4] = [
        CryptoLevel::Initial,
        CryptoLevel::ZeroRtt,
        CryptoLevel::Handshake,
        CryptoLevel::Application,
    ];

    fn index(self) -> usize {
        match self {
            CryptoLevel::Initial => 0,
            CryptoLevel::ZeroRtt => 1,
            CryptoLevel::Handshake => 2,
            CryptoLevel::Application => 3,
        }
    }

    /// The level that follows when a key change is observed. 0-RTT never
    /// participates (it is out of scope for replay).
    fn next(self) -> CryptoLevel {
        match self {
            CryptoLevel::Initial => CryptoLevel::Handshake,
            CryptoLevel::ZeroRtt | CryptoLevel::Handshake | CryptoLevel::Application => {
                CryptoLevel::Application
            }
        }
    }
}

/// A bounded byte vector holding one encryption level's handshake bytes.
#[derive(Debug, Default)]
pub struct CryptoBuffer {
    data: Vec<u8>,
}

impl CryptoBuffer {
    /// The byte budget for one level. Large enough for any sane certificate
    /// chain; a handshake that exceeds it is treated as an invariant
    /// violation rather than silently grown.
    pub const CAPACITY: usize = 4 * 1024;

    /// Append `bytes`, failing (and leaving the buffer unchanged) if the
    /// capacity would be exceeded.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if self.data.len() + bytes.len() > Self::CAPACITY {
            return Err(());
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// The four per-level buffers plus the overflow latch.
#[derive(Debug, Default)]
pub struct HandshakeBuffers {
    levels: [CryptoBuffer; 4],
    overflowed: Option<CryptoLevel>,
}

impl HandshakeBuffers {
    /// Record handshake bytes observed at `level`. On overflow the latch is
    /// set once and further recording at that level stops; the handshake
    /// itself is never truncated (quinn-proto owns the real stream).
    fn record(&mut self, level: CryptoLevel, bytes: &[u8]) {
        if self.overflowed.is_some() {
            return;
        }
        if self.levels[level.index()].append(bytes).is_err() {
            self.overflowed = Some(level);
        }
    }

    /// The first level whose budget was exceeded, if any.
    pub fn overflowed(&self) -> Option<CryptoLevel> {
        self.overflowed
    }

    pub fn level(&self, level: CryptoLevel) -> &CryptoBuffer {
        &self.levels[level.index()]
    }
}

/// Shared handle between an endpoint and its tracking crypto session.
pub(crate) type SharedHandshake = Arc<Mutex<HandshakeBuffers>>;

pub(crate) fn shared_handshake() -> SharedHandshake {
    Arc::new(Mutex::new(HandshakeBuffers::default()))
}

// ── Delegating crypto wrappers ──────────────────────────────────────

/// Client crypto config that wraps the rustls-backed config and mirrors
/// handshake bytes into per-level buffers.
pub(crate) struct TrackingClientConfig {
    pub inner: Arc<dyn ClientConfig>,
    pub buffers: SharedHandshake,
}

impl ClientConfig for TrackingClientConfig {
    fn start_session(
        self: Arc<Self>,
        version: u32,
        server_name: &str,
        params: &TransportParameters,
    ) -> Result<Box<dyn Session>, ConnectError> {
        let inner = self.inner.clone().start_session(version, server_name, params)?;
        Ok(Box::new(TrackingSession {
            inner,
            buffers: self.buffers.clone(),
            level: CryptoLevel::Initial,
        }))
    }
}

/// Server-side counterpart of [`TrackingClientConfig`].
pub(crate) struct TrackingServerConfig {
    pub inner: Arc<dyn ServerConfig>,
    pub buffers: SharedHandshake,
}

impl ServerConfig for TrackingServerConfig {
    fn initial_keys(
        &self,
        version: u32,
        dst_cid: &ConnectionId,
    ) -> Result<Keys, UnsupportedVersion> {
        self.inner.initial_keys(version, dst_cid)
    }

    fn retry_tag(&self, version: u32, orig_dst_cid: &ConnectionId, packet: &[u8]) -> [u8; 16] {
        self.inner.retry_tag(version, orig_dst_cid, packet)
    }

    fn start_session(
        self: Arc<Self>,
        version: u32,
        params: &TransportParameters,
    ) -> Box<dyn Session> {
        let inner = self.inner.clone().start_session(version, params);
        Box::new(TrackingSession {
            inner,
            buffers: self.buffers.clone(),
            level: CryptoLevel::Initial,
        })
    }
}

/// Pass-through TLS session that counts handshake bytes per level.
///
/// The level advances when `write_handshake` hands back new keys; bytes
/// produced or consumed between key changes are attributed to the current
/// level. That matches how CRYPTO frames are segregated on the wire.
struct TrackingSession {
    inner: Box<dyn Session>,
    buffers: SharedHandshake,
    level: CryptoLevel,
}

impl TrackingSession {
    fn record(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.record(self.level, bytes);
    }
}

impl Session for TrackingSession {
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys {
        self.inner.initial_keys(dst_cid, side)
    }

    fn handshake_data(&self) -> Option<Box<dyn Any>> {
        self.inner.handshake_data()
    }

    fn peer_identity(&self) -> Option<Box<dyn Any>> {
        self.inner.peer_identity()
    }

    fn early_crypto(&self) -> Option<(Box<dyn HeaderKey>, Box<dyn PacketKey>)> {
        self.inner.early_crypto()
    }

    fn early_data_accepted(&self) -> Option<bool> {
        self.inner.early_data_accepted()
    }

    fn is_handshaking(&self) -> bool {
        self.inner.is_handshaking()
    }

    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError> {
        self.record(buf);
        self.inner.read_handshake(buf)
    }

    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError> {
        self.inner.transport_parameters()
    }

    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys> {
        let start = buf.len();
        let keys = self.inner.write_handshake(buf);
        if buf.len() > start {
            self.record(&buf[start..]);
        }
        if keys.is_some() {
            self.level = self.level.next();
        }
        keys
    }

    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>> {
        self.inner.next_1rtt_keys()
    }

    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool {
        self.inner.is_valid_retry(orig_dst_cid, header, payload)
    }

    fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> Result<(), ExportKeyingMaterialError> {
        self.inner.export_keying_material(output, label, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_accepts_up_to_capacity() {
        let mut buf = CryptoBuffer::default();
        assert!(buf.append(&[0u8; CryptoBuffer::CAPACITY - 1]).is_ok());
        assert!(buf.append(&[0u8]).is_ok());
        assert_eq!(buf.len(), CryptoBuffer::CAPACITY);
        assert!(buf.append(&[0u8]).is_err());
        // A failed append leaves the contents alone.
        assert_eq!(buf.len(), CryptoBuffer::CAPACITY);
    }

    #[test]
    fn overflow_latches_once() {
        let mut hs = HandshakeBuffers::default();
        hs.record(CryptoLevel::Initial, &[1u8; 100]);
        assert_eq!(hs.overflowed(), None);
        assert_eq!(hs.level(CryptoLevel::Initial).len(), 100);

        hs.record(CryptoLevel::Handshake, &[2u8; CryptoBuffer::CAPACITY + 1]);
        assert_eq!(hs.overflowed(), Some(CryptoLevel::Handshake));

        // After the latch, nothing further is recorded anywhere.
        hs.record(CryptoLevel::Application, &[3u8; 10]);
        assert!(hs.level(CryptoLevel::Application).is_empty());
        assert_eq!(hs.overflowed(), Some(CryptoLevel::Handshake));
    }

    #[test]
    fn level_progression_skips_zero_rtt() {
        assert_eq!(CryptoLevel::Initial.next(), CryptoLevel::Handshake);
        assert_eq!(CryptoLevel::Handshake.next(), CryptoLevel::Application);
        assert_eq!(CryptoLevel::Application.next(), CryptoLevel::Application);
    }
}
