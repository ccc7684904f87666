//! The socket-driving QUIC endpoint.
//!
//! One endpoint owns one UDP socket and exactly one QUIC connection, and is
//! pumped cooperatively from its session's thread: `drive()` performs a
//! single timed socket wait, feeds whatever arrived to quinn-proto, fires
//! expired loss-detection timers, queues application events, and flushes
//! outgoing datagrams. Nothing here blocks anywhere else.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use protocol_proxy::{Endpoints, ProxyError, ProxyHeader, ProxyVersion};
use quinn_proto::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn_proto::{
    ClientConfig, Connection, ConnectionHandle, DatagramEvent, Dir, Endpoint, EndpointConfig,
    Event, ServerConfig, StreamEvent, StreamId, VarInt,
};

use crate::cid::{ConnectionId, LocalCid};
use crate::config::{self, QuicConfig};
use crate::crypto::{self, SharedHandshake, TrackingClientConfig, TrackingServerConfig};
use crate::error::{Error, HandshakeError};
use crate::qlog::{EventData, QlogWriter};
use crate::tls::TlsContext;

/// Which side of the replay this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Application-facing events, drained via [`QuicEndpoint::poll_event`].
#[derive(Debug)]
pub enum QuicEvent {
    /// The handshake completed (either side).
    Connected,

    /// The peer opened a new stream.
    StreamOpened { stream: StreamId, bidi: bool },

    /// Data is available to read on a stream.
    StreamReadable { stream: StreamId },

    /// Flow control reopened a stream for writing.
    StreamWritable { stream: StreamId },

    /// The peer finished (or we fully delivered) a stream.
    StreamFinished { stream: StreamId },

    /// The peer sent STOP_SENDING for a stream.
    StreamStopped { stream: StreamId, error_code: u64 },

    /// The connection is gone.
    ConnectionClosed { reason: quinn_proto::ConnectionError },
}

struct ConnState {
    handle: ConnectionHandle,
    conn: Connection,
}

/// A UDP socket plus one quinn-proto connection, driven cooperatively.
pub struct QuicEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    role: Role,
    endpoint: Endpoint,
    conn: Option<ConnState>,
    scid: LocalCid,
    dcid: ConnectionId,
    handshake: SharedHandshake,
    qlog: QlogWriter,
    events: VecDeque<QuicEvent>,
    transmit_buf: Vec<u8>,
    response_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    established: bool,
    handshake_failure: Option<HandshakeError>,
    close_reason: Option<String>,
    /// Server side: the first datagram may carry a PROXY preamble.
    expect_preamble: bool,
    advertised_peer: Option<Endpoints>,
    datagrams_sent: u64,
    bytes_sent: u64,
    datagrams_received: u64,
    bytes_received: u64,
}

impl QuicEndpoint {
    /// Bind a socket on `local_iface` (any address of the peer's family when
    /// unset), optionally emit a PROXY preamble datagram advertising the
    /// bound local address, and initiate the QUIC handshake toward `peer`.
    ///
    /// The handshake is not complete on return; drive the endpoint (or call
    /// [`drive_until_connected`](Self::drive_until_connected)).
    pub fn connect(
        quic_config: QuicConfig,
        local_iface: Option<IpAddr>,
        peer: SocketAddr,
        preamble: ProxyVersion,
    ) -> Result<Self, Error> {
        let bind_ip = local_iface.unwrap_or(match peer {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
        let local_addr = socket.local_addr()?;

        let scid = LocalCid::acquire();
        let dcid = ConnectionId::random();
        let handshake = crypto::shared_handshake();

        let tls = TlsContext::client_config(quic_config.verify)?;
        let quic_tls = QuicClientConfig::try_from((*tls).clone())
            .map_err(|e| Error::Config(format!("client TLS config rejected: {e}")))?;
        let tracking = TrackingClientConfig {
            inner: Arc::new(quic_tls),
            buffers: handshake.clone(),
        };
        let mut client_config = ClientConfig::new(Arc::new(tracking));
        client_config.transport_config(config::transport_config(&quic_config));

        let mut endpoint = Endpoint::new(Arc::new(EndpointConfig::default()), None, true, None);

        // The preamble rides ahead of the first Initial packet, on the same
        // five-tuple the QUIC connection will use.
        let header = ProxyHeader::for_version(preamble, local_addr, peer);
        let mut preamble_bytes = Vec::new();
        let preamble_len = header
            .encode(&mut preamble_bytes)
            .map_err(|e| Error::Config(format!("cannot serialize PROXY preamble: {e}")))?;
        if preamble_len > 0 {
            socket.send_to(&preamble_bytes, peer)?;
        }

        let sni_fallback;
        let sni = match &quic_config.sni {
            Some(name) => name.as_str(),
            None => {
                sni_fallback = peer.ip().to_string();
                &sni_fallback
            }
        };
        let (handle, conn) = endpoint.connect(Instant::now(), client_config, peer, sni)?;

        let mut qlog = QlogWriter::create(&scid.id().hex());
        qlog.write(EventData::ConnectionStarted {
            src_cid: scid.id().hex(),
            dst_cid: dcid.hex(),
            local: local_addr.to_string(),
            remote: peer.to_string(),
        });

        let mut ep = Self {
            socket,
            local_addr,
            role: Role::Client,
            endpoint,
            conn: Some(ConnState { handle, conn }),
            scid,
            dcid,
            handshake,
            qlog,
            events: VecDeque::new(),
            transmit_buf: Vec::with_capacity(1500),
            response_buf: Vec::with_capacity(1500),
            recv_buf: vec![0u8; 65536],
            established: false,
            handshake_failure: None,
            close_reason: None,
            expect_preamble: false,
            advertised_peer: None,
            datagrams_sent: 0,
            bytes_sent: 0,
            datagrams_received: 0,
            bytes_received: 0,
        };
        ep.drain_transmits(Instant::now());
        Ok(ep)
    }

    /// Bind `listen` and wait (via `drive`) for exactly one inbound
    /// connection. Additional connection attempts are ignored; a replay
    /// session is strictly one connection.
    pub fn bind(quic_config: QuicConfig, listen: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(listen)?;
        let local_addr = socket.local_addr()?;

        let scid = LocalCid::acquire();
        let dcid = ConnectionId::random();
        let handshake = crypto::shared_handshake();

        let tls = TlsContext::server_config()?;
        let quic_tls = QuicServerConfig::try_from((*tls).clone())
            .map_err(|e| Error::Config(format!("server TLS config rejected: {e}")))?;
        let tracking = TrackingServerConfig {
            inner: Arc::new(quic_tls),
            buffers: handshake.clone(),
        };
        let mut server_config = ServerConfig::with_crypto(Arc::new(tracking));
        server_config.transport = config::transport_config(&quic_config);

        let endpoint = Endpoint::new(
            Arc::new(EndpointConfig::default()),
            Some(Arc::new(server_config)),
            true,
            None,
        );

        Ok(Self {
            socket,
            local_addr,
            role: Role::Server,
            endpoint,
            conn: None,
            qlog: QlogWriter::create(&scid.id().hex()),
            scid,
            dcid,
            handshake,
            events: VecDeque::new(),
            transmit_buf: Vec::with_capacity(1500),
            response_buf: Vec::with_capacity(1500),
            recv_buf: vec![0u8; 65536],
            established: false,
            handshake_failure: None,
            close_reason: None,
            expect_preamble: true,
            advertised_peer: None,
            datagrams_sent: 0,
            bytes_sent: 0,
            datagrams_received: 0,
            bytes_received: 0,
        })
    }

    // ── The pump ─────────────────────────────────────────────────────

    /// One cooperative tick: wait up to `timeout` for a datagram (bounded by
    /// the next loss-detection deadline), feed it to QUIC, fire timers,
    /// queue events, flush transmits.
    ///
    /// This is the session's only suspension point.
    pub fn drive(&mut self, timeout: Duration) -> Result<(), Error> {
        let now = Instant::now();

        let mut wait = timeout;
        if let Some(state) = &mut self.conn
            && let Some(deadline) = state.conn.poll_timeout()
        {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        // A zero read timeout means "blocking" to the OS; clamp up instead.
        self.socket
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;

        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, from)) => {
                self.datagrams_received += 1;
                self.bytes_received += len as u64;
                self.handle_datagram(Instant::now(), len, from);
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }

        let now = Instant::now();
        if let Some(state) = &mut self.conn
            && let Some(deadline) = state.conn.poll_timeout()
            && deadline <= now
        {
            state.conn.handle_timeout(now);
        }

        self.pump(now);

        // Harvest invariant violations latched by the TLS tracking session.
        let overflow = self
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .overflowed();
        if let Some(level) = overflow {
            return Err(Error::CryptoOverflow(level));
        }
        Ok(())
    }

    /// Drive until the handshake completes, fails, or `timeout` passes.
    pub fn drive_until_connected(&mut self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.established {
                return Ok(());
            }
            if let Some(kind) = self.handshake_failure.take() {
                return Err(Error::HandshakeFailed(kind));
            }
            if Instant::now() >= deadline {
                return Err(Error::HandshakeFailed(HandshakeError::Timeout));
            }
            self.drive(Duration::from_millis(25))?;
        }
    }

    /// Pop the next application event.
    pub fn poll_event(&mut self) -> Option<QuicEvent> {
        self.events.pop_front()
    }

    fn handle_datagram(&mut self, now: Instant, len: usize, from: SocketAddr) {
        let mut data = &self.recv_buf[..len];

        if self.expect_preamble {
            // Only the very first datagram is probed. The probe cannot
            // misfire: QUIC long-header packets set the top bit of their
            // first byte, which neither preamble magic does.
            self.expect_preamble = false;
            match ProxyHeader::parse(data) {
                Ok((header, consumed)) if consumed > 0 => {
                    self.advertised_peer = header.endpoints();
                    log::debug!(
                        "PROXY preamble ({consumed} bytes), advertised peer {:?}",
                        self.advertised_peer
                    );
                    data = &data[consumed..];
                }
                Ok(_) => {}
                Err(ProxyError::UnsupportedFamily { family, consumed }) => {
                    log::warn!(
                        "PROXY preamble with unsupported family {family:#04x}; \
                         keeping transport peer"
                    );
                    data = &data[consumed..];
                }
                Err(e) => {
                    log::warn!("malformed bytes at connection head treated as payload: {e}");
                }
            }
            if data.is_empty() {
                return;
            }
        }

        let datagram = BytesMut::from(data);
        let event = self.endpoint.handle(
            now,
            from,
            Some(self.local_addr.ip()),
            None, // ECN not used
            datagram,
            &mut self.response_buf,
        );

        match event {
            Some(DatagramEvent::ConnectionEvent(ch, event)) => {
                if let Some(state) = &mut self.conn
                    && state.handle == ch
                {
                    state.conn.handle_event(event);
                }
            }
            Some(DatagramEvent::NewConnection(incoming)) => {
                if self.conn.is_some() {
                    // One connection per session.
                    self.endpoint.ignore(incoming);
                } else {
                    match self
                        .endpoint
                        .accept(incoming, now, &mut self.response_buf, None)
                    {
                        Ok((handle, conn)) => {
                            self.qlog.write(EventData::ConnectionStarted {
                                src_cid: self.scid.id().hex(),
                                dst_cid: self.dcid.hex(),
                                local: self.local_addr.to_string(),
                                remote: from.to_string(),
                            });
                            self.conn = Some(ConnState { handle, conn });
                        }
                        Err(e) => {
                            log::warn!("inbound connection rejected: {e:?}");
                        }
                    }
                }
            }
            Some(DatagramEvent::Response(transmit)) => {
                // Stateless response (version negotiation, retry).
                let out = self.response_buf[..transmit.size].to_vec();
                self.send_raw(transmit.destination, &out);
            }
            None => {}
        }
    }

    /// Exchange endpoint/connection events, surface application events, and
    /// flush transmits.
    fn pump(&mut self, now: Instant) {
        if self.conn.is_none() {
            return;
        }

        loop {
            let state = self.conn.as_mut().expect("checked above");
            let Some(event) = state.conn.poll_endpoint_events() else {
                break;
            };
            if let Some(conn_event) = self.endpoint.handle_event(state.handle, event) {
                self.conn
                    .as_mut()
                    .expect("checked above")
                    .conn
                    .handle_event(conn_event);
            }
        }

        self.drain_transmits(now);

        loop {
            let Some(state) = self.conn.as_mut() else {
                break;
            };
            let Some(event) = state.conn.poll() else {
                break;
            };
            match event {
                Event::Connected => {
                    self.established = true;
                    self.events.push_back(QuicEvent::Connected);
                }
                Event::ConnectionLost { reason } => {
                    if !self.established {
                        self.handshake_failure = Some(HandshakeError::classify(&reason));
                    }
                    self.close_reason = Some(reason.to_string());
                    self.events.push_back(QuicEvent::ConnectionClosed { reason });
                }
                Event::Stream(stream_event) => match stream_event {
                    StreamEvent::Opened { dir } => {
                        while let Some(stream) = self
                            .conn
                            .as_mut()
                            .expect("connection present")
                            .conn
                            .streams()
                            .accept(dir)
                        {
                            self.events.push_back(QuicEvent::StreamOpened {
                                stream,
                                bidi: dir == Dir::Bi,
                            });
                        }
                    }
                    StreamEvent::Readable { id } => {
                        self.events.push_back(QuicEvent::StreamReadable { stream: id });
                    }
                    StreamEvent::Writable { id } => {
                        self.events.push_back(QuicEvent::StreamWritable { stream: id });
                    }
                    StreamEvent::Finished { id } => {
                        self.events.push_back(QuicEvent::StreamFinished { stream: id });
                    }
                    StreamEvent::Stopped { id, error_code } => {
                        self.events.push_back(QuicEvent::StreamStopped {
                            stream: id,
                            error_code: error_code.into_inner(),
                        });
                    }
                    StreamEvent::Available { .. } => {}
                },
                Event::HandshakeDataReady | Event::DatagramReceived | Event::DatagramsUnblocked => {
                }
            }
        }

        self.drain_transmits(now);
    }

    fn drain_transmits(&mut self, now: Instant) {
        let Some(state) = self.conn.as_mut() else {
            return;
        };
        loop {
            self.transmit_buf.clear();
            match state.conn.poll_transmit(now, 1, &mut self.transmit_buf) {
                Some(t) => {
                    match self.socket.send_to(&self.transmit_buf[..t.size], t.destination) {
                        Ok(_) => {
                            self.datagrams_sent += 1;
                            self.bytes_sent += t.size as u64;
                        }
                        Err(e) => log::warn!("udp send to {}: {e}", t.destination),
                    }
                }
                None => break,
            }
        }
    }

    fn send_raw(&mut self, destination: SocketAddr, data: &[u8]) {
        match self.socket.send_to(data, destination) {
            Ok(_) => {
                self.datagrams_sent += 1;
                self.bytes_sent += data.len() as u64;
            }
            Err(e) => log::warn!("udp send to {destination}: {e}"),
        }
    }

    // ── Stream operations ────────────────────────────────────────────

    fn state_mut(&mut self) -> Result<&mut ConnState, Error> {
        self.conn.as_mut().ok_or(Error::NoConnection)
    }

    /// Open a bidirectional stream. `None` when the peer's limit is reached.
    pub fn open_bi(&mut self) -> Result<Option<StreamId>, Error> {
        Ok(self.state_mut()?.conn.streams().open(Dir::Bi))
    }

    /// Open a unidirectional stream. `None` when the peer's limit is reached.
    pub fn open_uni(&mut self) -> Result<Option<StreamId>, Error> {
        Ok(self.state_mut()?.conn.streams().open(Dir::Uni))
    }

    /// Write to a stream; returns the bytes accepted under flow control.
    /// A fully-blocked window is a zero-length write, not an error.
    pub fn stream_send(&mut self, stream: StreamId, data: &[u8]) -> Result<usize, Error> {
        let written = match self.state_mut()?.conn.send_stream(stream).write(data) {
            Ok(n) => n,
            Err(quinn_proto::WriteError::Blocked) => 0,
            Err(e) => return Err(e.into()),
        };
        self.drain_transmits(Instant::now());
        Ok(written)
    }

    /// Read from a stream into `buf`. Returns `(bytes_read, finished)`.
    pub fn stream_recv(
        &mut self,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<(usize, bool), Error> {
        let state = self.state_mut()?;
        let mut recv = state.conn.recv_stream(stream);
        let mut chunks = recv.read(true)?;
        let mut total = 0;
        let mut finished = false;

        while total < buf.len() {
            match chunks.next(buf.len() - total) {
                Ok(Some(chunk)) => {
                    let len = chunk.bytes.len();
                    buf[total..total + len].copy_from_slice(&chunk.bytes);
                    total += len;
                }
                Ok(None) => {
                    finished = true;
                    break;
                }
                Err(quinn_proto::ReadError::Blocked) => break,
                Err(e) => {
                    let _ = chunks.finalize();
                    return Err(Error::Read(e));
                }
            }
        }
        let _ = chunks.finalize();
        self.drain_transmits(Instant::now());
        Ok((total, finished))
    }

    /// Send FIN: no more data on this stream.
    pub fn stream_finish(&mut self, stream: StreamId) -> Result<(), Error> {
        self.state_mut()?
            .conn
            .send_stream(stream)
            .finish()
            .map_err(|_| Error::ConnectionClosed)?;
        self.drain_transmits(Instant::now());
        Ok(())
    }

    /// Ask the peer to stop sending on a stream (transaction timeout path).
    pub fn stop_sending(&mut self, stream: StreamId, error_code: u32) {
        if let Ok(state) = self.state_mut() {
            let _ = state.conn.recv_stream(stream).stop(VarInt::from_u32(error_code));
        }
        self.drain_transmits(Instant::now());
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Send CONNECTION_CLOSE and drain until quinn-proto reports the
    /// connection gone or a conservative ceiling passes (quinn-proto runs
    /// the 3xPTO drain timer internally).
    pub fn close(&mut self, error_code: u32, reason: &[u8]) {
        let now = Instant::now();
        if let Some(state) = self.conn.as_mut()
            && self.close_reason.is_none()
        {
            state.conn.close(
                now,
                VarInt::from_u32(error_code),
                Bytes::copy_from_slice(reason),
            );
        }
        self.drain_transmits(now);

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let drained = self
                .conn
                .as_ref()
                .map(|s| s.conn.is_drained())
                .unwrap_or(true);
            if drained || Instant::now() >= deadline {
                break;
            }
            if self.drive(Duration::from_millis(50)).is_err() {
                break;
            }
        }

        self.qlog.write(EventData::DatagramsSent {
            count: self.datagrams_sent,
            raw_bytes: self.bytes_sent,
        });
        self.qlog.write(EventData::DatagramsReceived {
            count: self.datagrams_received,
            raw_bytes: self.bytes_received,
        });
        let trigger = if error_code == 0 {
            "clean".to_string()
        } else {
            format!("application({error_code})")
        };
        self.qlog.finish(EventData::ConnectionClosed { trigger });
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the handshake has completed.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Terminal close reason, if the connection is gone.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The connected peer, once known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(|s| s.conn.remote_address())
    }

    /// The local connection identifier (qlog stem).
    pub fn scid(&self) -> ConnectionId {
        self.scid.id()
    }

    /// Endpoints advertised by a PROXY preamble, if one arrived.
    pub fn advertised_peer(&self) -> Option<Endpoints> {
        self.advertised_peer
    }
}
