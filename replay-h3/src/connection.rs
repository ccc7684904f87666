//! HTTP/3 connection state machine, both roles.
//!
//! `H3Connection` sits between a [`QuicEndpoint`] and the replay session:
//! QUIC events go in via [`handle_quic_event`](H3Connection::handle_quic_event),
//! HTTP-level events come out of [`poll_event`](H3Connection::poll_event).
//! The client opens request streams with
//! [`send_request`](H3Connection::send_request); the server answers with
//! [`send_response`](H3Connection::send_response) and
//! [`send_data`](H3Connection::send_data).

use std::collections::{HashMap, VecDeque};

use replay_quic::{QuicEndpoint, QuicEvent, Role, StreamId};

use crate::error::H3Error;
use crate::frame::Frame;
use crate::qpack::{self, HeaderField};
use crate::settings::Settings;
use crate::stream::{RequestStream, SendQueue};
use crate::varint::{get_varint, put_varint};

/// Unidirectional stream type identifiers (RFC 9114 Section 6.2).
const UNI_CONTROL: u64 = 0x00;
const UNI_QPACK_ENCODER: u64 = 0x02;
const UNI_QPACK_DECODER: u64 = 0x03;

/// HTTP-level events for the session layer.
#[derive(Debug)]
pub enum H3Event {
    /// A leading (or interim 1xx) header section arrived.
    Headers {
        stream: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
    },

    /// A trailer section (HEADERS after DATA) arrived.
    Trailers {
        stream: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
    },

    /// Body bytes arrived.
    Data {
        stream: StreamId,
        payload: Vec<u8>,
        end_stream: bool,
    },

    /// The peer stopped or reset the stream.
    Stopped { stream: StreamId, error_code: u64 },

    /// Peer is shutting the connection down.
    GoAway { id: u64 },

    /// Connection-level protocol violation by the peer.
    Error(H3Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Waiting for the peer's control stream and SETTINGS.
    Initializing,
    /// SETTINGS exchanged in both directions.
    Ready,
    /// GOAWAY sent or received.
    Closing,
    Closed,
}

/// One HTTP/3 connection over one QUIC connection.
pub struct H3Connection {
    role: Role,
    state: ConnState,
    local_settings: Settings,
    peer_settings: Option<Settings>,
    settings_sent: bool,

    /// Request streams by stream-id bits: peer-opened (server role) and
    /// locally-opened (client role) both live here.
    streams: HashMap<u64, RequestStream>,

    /// Flow-control overflow queues for the send direction.
    send_queues: HashMap<u64, SendQueue>,

    peer_control: Option<StreamId>,
    local_control: Option<StreamId>,
    control_buf: Vec<u8>,

    /// Uni streams whose type varint has not arrived yet.
    pending_uni: Vec<StreamId>,

    events: VecDeque<H3Event>,

    read_buf: Vec<u8>,
}

impl H3Connection {
    pub fn new(role: Role, settings: Settings) -> Self {
        Self {
            role,
            state: ConnState::Initializing,
            local_settings: settings,
            peer_settings: None,
            settings_sent: false,
            streams: HashMap::new(),
            send_queues: HashMap::new(),
            peer_control: None,
            local_control: None,
            control_buf: Vec::new(),
            pending_uni: Vec::new(),
            events: VecDeque::new(),
            read_buf: vec![0u8; 65536],
        }
    }

    /// Open the local control stream and send SETTINGS. Runs automatically
    /// on the `Connected` event; safe to call again.
    pub fn start(&mut self, quic: &mut QuicEndpoint) -> Result<(), H3Error> {
        if self.settings_sent {
            return Ok(());
        }
        let stream = quic
            .open_uni()?
            .ok_or_else(|| H3Error::Internal("no uni stream credit for control".into()))?;
        self.local_control = Some(stream);

        let mut buf = Vec::new();
        put_varint(&mut buf, UNI_CONTROL);
        Frame::Settings(self.local_settings.clone()).encode(&mut buf);
        self.write_all(quic, stream, &buf)?;
        // The control stream stays open for the connection's lifetime
        // (RFC 9114 Section 6.2.1); no FIN, ever.

        self.settings_sent = true;
        if self.peer_settings.is_some() {
            self.state = ConnState::Ready;
        }
        Ok(())
    }

    /// Settings exchanged in both directions; requests may flow.
    pub fn is_ready(&self) -> bool {
        self.state == ConnState::Ready
    }

    /// The peer's SETTINGS, once seen.
    pub fn peer_settings(&self) -> Option<&Settings> {
        self.peer_settings.as_ref()
    }

    /// Pop the next HTTP-level event.
    pub fn poll_event(&mut self) -> Option<H3Event> {
        self.events.pop_front()
    }

    /// Feed one QUIC event through the HTTP/3 state machine.
    pub fn handle_quic_event(
        &mut self,
        quic: &mut QuicEndpoint,
        event: &QuicEvent,
    ) -> Result<(), H3Error> {
        match event {
            QuicEvent::Connected => self.start(quic)?,
            QuicEvent::StreamOpened { stream, bidi } => {
                if *bidi {
                    // A new request stream. Data may have arrived in the
                    // same packet that opened it, in which case no separate
                    // readable event fires; read eagerly.
                    self.streams.insert(u64::from(*stream), RequestStream::new());
                    self.read_request_stream(quic, *stream)?;
                } else {
                    self.identify_uni_stream(quic, *stream)?;
                }
            }
            QuicEvent::StreamReadable { stream } => self.stream_readable(quic, *stream)?,
            QuicEvent::StreamWritable { stream } => self.flush_send_queue(quic, *stream)?,
            QuicEvent::StreamStopped { stream, error_code } => {
                self.send_queues.remove(&u64::from(*stream));
                self.events.push_back(H3Event::Stopped {
                    stream: *stream,
                    error_code: *error_code,
                });
            }
            QuicEvent::ConnectionClosed { .. } => self.state = ConnState::Closed,
            QuicEvent::StreamFinished { .. } => {}
        }
        Ok(())
    }

    // ── Send paths ───────────────────────────────────────────────────

    /// Client: open a request stream and send the header section.
    pub fn send_request(
        &mut self,
        quic: &mut QuicEndpoint,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<StreamId, H3Error> {
        debug_assert_eq!(self.role, Role::Client);
        let stream = quic.open_bi()?.ok_or(H3Error::StreamsExhausted)?;
        self.streams.insert(u64::from(stream), RequestStream::new());
        self.send_field_section(quic, stream, fields, end_stream)?;
        Ok(stream)
    }

    /// Server: send the response header section on a request stream.
    pub fn send_response(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H3Error> {
        debug_assert_eq!(self.role, Role::Server);
        self.send_field_section(quic, stream, fields, end_stream)
    }

    /// Send body bytes on a request stream.
    pub fn send_data(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
        payload: &[u8],
        end_stream: bool,
    ) -> Result<(), H3Error> {
        let mut buf = Vec::with_capacity(payload.len() + 9);
        Frame::Data {
            payload: payload.to_vec(),
        }
        .encode(&mut buf);
        self.write_all(quic, stream, &buf)?;
        if end_stream {
            self.finish_stream(quic, stream)?;
        }
        Ok(())
    }

    /// Send a trailer section. Trailers are necessarily the last thing on
    /// the stream, so this always finishes it.
    pub fn send_trailers(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
        fields: &[HeaderField],
    ) -> Result<(), H3Error> {
        self.send_field_section(quic, stream, fields, true)
    }

    /// Send GOAWAY on the control stream.
    pub fn send_goaway(&mut self, quic: &mut QuicEndpoint, id: u64) -> Result<(), H3Error> {
        let control = self
            .local_control
            .ok_or_else(|| H3Error::Internal("control stream not open".into()))?;
        let mut buf = Vec::new();
        Frame::GoAway { id }.encode(&mut buf);
        self.write_all(quic, control, &buf)?;
        self.state = ConnState::Closing;
        Ok(())
    }

    fn send_field_section(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H3Error> {
        let mut block = Vec::new();
        qpack::encode_block(fields, &mut block);
        let mut buf = Vec::with_capacity(block.len() + 9);
        Frame::Headers { block }.encode(&mut buf);
        self.write_all(quic, stream, &buf)?;
        if end_stream {
            self.finish_stream(quic, stream)?;
        }
        Ok(())
    }

    /// Write through the per-stream overflow queue so that flow-control
    /// pushback never reorders or drops bytes.
    fn write_all(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
        bytes: &[u8],
    ) -> Result<(), H3Error> {
        let queue = self.send_queues.entry(u64::from(stream)).or_default();
        if !queue.data.is_empty() {
            queue.data.extend_from_slice(bytes);
            return Ok(());
        }
        let written = quic.stream_send(stream, bytes)?;
        if written < bytes.len() {
            queue.data.extend_from_slice(&bytes[written..]);
        }
        Ok(())
    }

    fn finish_stream(&mut self, quic: &mut QuicEndpoint, stream: StreamId) -> Result<(), H3Error> {
        let queue = self.send_queues.entry(u64::from(stream)).or_default();
        if queue.data.is_empty() {
            quic.stream_finish(stream)?;
        } else {
            queue.fin = true;
        }
        Ok(())
    }

    fn flush_send_queue(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        let Some(queue) = self.send_queues.get_mut(&u64::from(stream)) else {
            return Ok(());
        };
        while !queue.data.is_empty() {
            let written = quic.stream_send(stream, &queue.data)?;
            if written == 0 {
                return Ok(());
            }
            queue.data.drain(..written);
        }
        if queue.fin {
            queue.fin = false;
            quic.stream_finish(stream)?;
        }
        Ok(())
    }

    // ── Receive paths ────────────────────────────────────────────────

    fn stream_readable(&mut self, quic: &mut QuicEndpoint, stream: StreamId) -> Result<(), H3Error> {
        if let Some(pos) = self.pending_uni.iter().position(|s| *s == stream) {
            self.pending_uni.swap_remove(pos);
            return self.identify_uni_stream(quic, stream);
        }
        if self.peer_control == Some(stream) {
            return self.read_control_stream(quic, stream);
        }
        if self.streams.contains_key(&u64::from(stream)) {
            return self.read_request_stream(quic, stream);
        }
        // An untracked uni stream type; drain and drop.
        Ok(())
    }

    fn identify_uni_stream(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        let mut type_buf = [0u8; 8];
        let (n, _fin) = quic.stream_recv(stream, &mut type_buf)?;
        if n == 0 {
            self.pending_uni.push(stream);
            return Ok(());
        }
        let Some((stream_type, consumed)) = get_varint(&type_buf[..n]) else {
            self.pending_uni.push(stream);
            return Ok(());
        };

        match stream_type {
            UNI_CONTROL => {
                if self.peer_control.is_some() {
                    // A second control stream is a connection error.
                    self.events
                        .push_back(H3Event::Error(H3Error::FrameUnexpected(UNI_CONTROL)));
                    return Ok(());
                }
                self.peer_control = Some(stream);
                if consumed < n {
                    self.control_buf.extend_from_slice(&type_buf[consumed..n]);
                }
                self.read_control_stream(quic, stream)?;
            }
            UNI_QPACK_ENCODER | UNI_QPACK_DECODER => {
                // Static-table-only QPACK: both streams carry nothing of
                // interest and are ignored.
            }
            other => {
                // Unknown uni stream types must be ignored.
                log::trace!("ignoring uni stream {stream:?} of type {other:#x}");
            }
        }
        Ok(())
    }

    fn read_control_stream(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        loop {
            let (n, fin) = match quic.stream_recv(stream, &mut self.read_buf) {
                Ok(r) => r,
                Err(_) => break,
            };
            if n > 0 {
                self.control_buf.extend_from_slice(&self.read_buf[..n]);
            }
            if fin {
                self.events
                    .push_back(H3Event::Error(H3Error::ClosedCriticalStream));
                return Ok(());
            }
            if n == 0 {
                break;
            }
        }
        self.process_control_frames()
    }

    fn process_control_frames(&mut self) -> Result<(), H3Error> {
        let mut offset = 0;
        loop {
            let rest = &self.control_buf[offset..];
            if rest.is_empty() {
                break;
            }
            match Frame::decode(rest) {
                Ok(Some((frame, consumed))) => {
                    offset += consumed;
                    match frame {
                        Frame::Settings(settings) => {
                            if self.peer_settings.is_some() {
                                self.events.push_back(H3Event::Error(
                                    H3Error::FrameUnexpected(0x04),
                                ));
                                break;
                            }
                            log::debug!("peer SETTINGS: {settings:?}");
                            self.peer_settings = Some(settings);
                            if self.state == ConnState::Initializing && self.settings_sent {
                                self.state = ConnState::Ready;
                            }
                        }
                        Frame::GoAway { id } => {
                            if self.peer_settings.is_none() {
                                // SETTINGS must be first on the control stream.
                                self.events
                                    .push_back(H3Event::Error(H3Error::MissingSettings));
                                break;
                            }
                            self.state = ConnState::Closing;
                            self.events.push_back(H3Event::GoAway { id });
                        }
                        Frame::Data { .. } | Frame::Headers { .. } => {
                            self.events
                                .push_back(H3Event::Error(H3Error::FrameUnexpected(0x00)));
                            break;
                        }
                        Frame::Unknown { .. } => {
                            if self.peer_settings.is_none() {
                                self.events
                                    .push_back(H3Event::Error(H3Error::MissingSettings));
                                break;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.events.push_back(H3Event::Error(e));
                    break;
                }
            }
        }
        if offset > 0 {
            self.control_buf.drain(..offset);
        }
        Ok(())
    }

    fn read_request_stream(
        &mut self,
        quic: &mut QuicEndpoint,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        let mut fin_received = false;
        loop {
            let (n, fin) = match quic.stream_recv(stream, &mut self.read_buf) {
                Ok(r) => r,
                Err(_) => break,
            };
            if n > 0
                && let Some(rs) = self.streams.get_mut(&u64::from(stream))
            {
                rs.recv_buf.extend_from_slice(&self.read_buf[..n]);
            }
            if fin {
                fin_received = true;
            }
            if n == 0 || fin {
                break;
            }
        }
        if fin_received
            && let Some(rs) = self.streams.get_mut(&u64::from(stream))
        {
            rs.fin_received = true;
        }
        self.process_request_frames(stream)
    }

    fn process_request_frames(&mut self, stream: StreamId) -> Result<(), H3Error> {
        let key = u64::from(stream);
        let Some(rs) = self.streams.get_mut(&key) else {
            return Ok(());
        };
        let fin_received = rs.fin_received;
        let mut recv_buf = std::mem::take(&mut rs.recv_buf);
        let max_section = self.local_settings.max_field_section_size;

        let mut offset = 0;
        loop {
            let rest = &recv_buf[offset..];
            if rest.is_empty() {
                break;
            }
            match Frame::decode(rest) {
                Ok(Some((frame, consumed))) => {
                    offset += consumed;
                    let at_end = fin_received && offset == recv_buf.len();
                    match frame {
                        Frame::Headers { block } => {
                            let fields = match qpack::decode_block(&block, max_section) {
                                Ok(fields) => fields,
                                Err(e) => {
                                    self.events.push_back(H3Event::Error(e));
                                    break;
                                }
                            };
                            let rs = self.streams.get_mut(&key).expect("stream tracked");
                            if rs.saw_trailers {
                                self.events.push_back(H3Event::Error(
                                    H3Error::FrameUnexpected(0x01),
                                ));
                                break;
                            }
                            if at_end {
                                rs.fin_delivered = true;
                            }
                            if rs.saw_data {
                                rs.saw_trailers = true;
                                self.events.push_back(H3Event::Trailers {
                                    stream,
                                    fields,
                                    end_stream: at_end,
                                });
                            } else {
                                self.events.push_back(H3Event::Headers {
                                    stream,
                                    fields,
                                    end_stream: at_end,
                                });
                            }
                        }
                        Frame::Data { payload } => {
                            let rs = self.streams.get_mut(&key).expect("stream tracked");
                            if rs.saw_trailers {
                                self.events.push_back(H3Event::Error(
                                    H3Error::FrameUnexpected(0x00),
                                ));
                                break;
                            }
                            rs.saw_data = true;
                            if at_end {
                                rs.fin_delivered = true;
                            }
                            self.events.push_back(H3Event::Data {
                                stream,
                                payload,
                                end_stream: at_end,
                            });
                        }
                        Frame::Settings(_) => {
                            self.events
                                .push_back(H3Event::Error(H3Error::FrameUnexpected(0x04)));
                            break;
                        }
                        Frame::GoAway { .. } => {
                            self.events
                                .push_back(H3Event::Error(H3Error::FrameUnexpected(0x07)));
                            break;
                        }
                        Frame::Unknown { .. } => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.events.push_back(H3Event::Error(e));
                    break;
                }
            }
        }

        // FIN with no trailing frame: surface end_stream exactly once, as an
        // empty DATA event.
        if fin_received
            && offset == recv_buf.len()
            && let Some(rs) = self.streams.get_mut(&key)
            && !rs.fin_delivered
        {
            rs.fin_delivered = true;
            self.events.push_back(H3Event::Data {
                stream,
                payload: Vec::new(),
                end_stream: true,
            });
        }

        if offset > 0 {
            recv_buf.drain(..offset);
        }
        if let Some(rs) = self.streams.get_mut(&key) {
            rs.recv_buf = recv_buf;
        }
        Ok(())
    }
}
