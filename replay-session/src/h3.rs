//! The HTTP/3 session engine.
//!
//! `H3Session` binds one [`QuicEndpoint`] and one [`H3Connection`] to many
//! [`H3Stream`]s and replays a scripted transaction list against the peer:
//! the client opens a stream per transaction at its scripted time, the
//! server demuxes inbound requests to scripted responders, and both sides
//! compare what arrived with what the script expected.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use protocol_proxy::ProxyVersion;
use replay_h3::{
    H3_NO_ERROR, H3_REQUEST_CANCELLED, H3Connection, H3Event, HeaderField, Settings,
};
use replay_quic::{
    Error as QuicError, QuicConfig, QuicEndpoint, QuicEvent, Role, StreamId, TlsContext,
    TlsMaterial, qlog,
};

use crate::errata::{Errata, Rv};
use crate::message::{self, FieldSection, MessageSpec};
use crate::session::{RuleCheck, Session};
use crate::txn::Txn;

// ── Process-wide state ──────────────────────────────────────────────

fn exit_code_cell() -> &'static Mutex<Option<Arc<AtomicI32>>> {
    static CELL: OnceLock<Mutex<Option<Arc<AtomicI32>>>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(None))
}

// ── Streams ─────────────────────────────────────────────────────────

/// Which message this stream is waiting to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Server side: a peer request arrives here.
    ReceivesRequest,
    /// Client side: the peer's response arrives here.
    ReceivesResponse,
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDisposition {
    Complete,
    /// The connection died underneath the stream.
    Aborted,
    /// The peer reset or stopped the stream.
    Reset,
    /// The per-transaction response deadline expired.
    Timeout,
    /// END_STREAM arrived but delivered DATA disagreed with the declared
    /// content length. Reported, not fatal.
    ContentLengthMismatch,
}

/// Per-transaction state for one HTTP/3 request stream.
#[derive(Debug, Default)]
pub struct H3Stream {
    role: Option<StreamRole>,

    /// The transaction key correlating this stream to the script.
    pub key: String,

    /// Absolute-form URL composed from the request pseudo fields. Owned
    /// here so header parsing can borrow from it for the stream's lifetime.
    pub composed_url: String,

    /// Latches true when the peer's (final) header section arrives.
    pub have_received_headers: bool,

    quic_id: Option<StreamId>,
    stream_id: Option<i64>,
    stream_start: Option<Instant>,

    /// Scripted expectation snapshots. The C++ original borrowed these from
    /// the trace; here each stream carries its own copy.
    pub specified_request: Option<Box<MessageSpec>>,
    pub specified_response: Option<Box<MessageSpec>>,

    /// Server side: the scripted response to emit once the request is in.
    response_to_send: Option<Box<MessageSpec>>,

    /// Header sections actually received from the peer.
    pub request_from_client: Option<MessageSpec>,
    pub response_from_server: Option<MessageSpec>,

    /// Trailer section, kept apart from the leading headers.
    pub trailers_received: Option<FieldSection>,

    /// Accumulated DATA bytes.
    pub body_received: Vec<u8>,
    body_read_cursor: usize,

    /// Pending-100 latch: the request body is held until an interim 100
    /// response (or the final response) releases it.
    pub wait_for_continue: bool,
    held_body: Option<Vec<u8>>,
    held_trailers: Option<FieldSection>,

    /// DATA bytes written and not yet known-delivered.
    pub num_data_bytes_written: u64,

    /// Stream-scoped buffer arena: owned byte storage whose views stay
    /// valid for the stream's lifetime.
    arena: Vec<Vec<u8>>,

    /// END_STREAM surfaced (exactly once).
    ended: bool,

    pub disposition: Option<StreamDisposition>,

    /// Per-transaction response deadline.
    deadline: Option<Instant>,

    /// Server side: scripted delay before responding, and the resulting
    /// due time once the request completes.
    response_delay: Option<Duration>,
    respond_at: Option<Instant>,
}

impl H3Stream {
    pub fn new(role: StreamRole) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn will_receive_request(&self) -> bool {
        self.role == Some(StreamRole::ReceivesRequest)
    }

    pub fn will_receive_response(&self) -> bool {
        self.role == Some(StreamRole::ReceivesResponse)
    }

    /// One-time stream-id assignment; primes the timing clock.
    pub fn assign_stream_id(&mut self, id: StreamId) {
        debug_assert!(self.quic_id.is_none(), "stream id assigned twice");
        self.quic_id = Some(id);
        self.stream_id = Some(u64::from(id) as i64);
        self.stream_start = Some(Instant::now());
    }

    pub fn stream_id(&self) -> Option<i64> {
        self.stream_id
    }

    /// Adopt `buf` into the stream-scoped arena and return a view of it.
    /// The view lives as long as the stream.
    pub fn register_buf(&mut self, buf: Vec<u8>) -> &[u8] {
        self.arena.push(buf);
        self.arena.last().expect("just pushed").as_slice()
    }

    /// Build `<scheme>://<authority><path>` from the received request.
    pub fn compose_url_from_pseudos(&mut self) {
        if let Some(request) = &self.request_from_client {
            self.composed_url = request.compose_url();
        }
    }

    pub fn append_body(&mut self, bytes: &[u8]) {
        self.body_received.extend_from_slice(bytes);
    }

    /// Time since the stream was opened.
    pub fn elapsed(&self) -> Option<Duration> {
        self.stream_start.map(|start| start.elapsed())
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Per-session knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub quic: QuicConfig,
    /// Server role: the address to listen on.
    pub listen: Option<SocketAddr>,
    /// PROXY preamble version emitted ahead of the handshake.
    pub pp_version: ProxyVersion,
    /// Overall ceiling on a `run_transactions` call.
    pub run_deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quic: QuicConfig::default(),
            listen: None,
            pp_version: ProxyVersion::None,
            run_deadline: Duration::from_secs(30),
        }
    }
}

/// One HTTP/3 replay session over one QUIC connection.
pub struct H3Session {
    config: SessionConfig,
    role: Role,
    endpoint: Option<QuicEndpoint>,
    h3: Option<H3Connection>,

    /// stream id → stream state. BTreeMap keeps iteration in stream-id
    /// order, which matches open order (ids are allocated monotonically).
    stream_map: BTreeMap<i64, H3Stream>,

    /// Streams whose END_STREAM has been seen, in arrival order.
    ended_streams: VecDeque<i64>,

    /// Keys of transactions that have completed.
    finished_streams: HashSet<String>,

    /// Server role: the scripted transactions inbound requests match.
    server_script: Vec<Txn>,

    streams_opened: u64,
    last_added_stream: Option<i64>,
    current_stream: Option<i64>,

    target: Option<SocketAddr>,
    iface: Option<IpAddr>,

    connection_closed: bool,
    /// Session-fatal condition harvested from the event path.
    fatal: Option<String>,
}

impl H3Session {
    /// Process-wide initialization: the exit-code cell written by paths
    /// with no return channel, the qlog directory (empty = disabled), and
    /// the TLS material. Bracketed by [`terminate`](Self::terminate).
    pub fn init(
        exit_code: Arc<AtomicI32>,
        qlog_dir: &Path,
        material: Option<TlsMaterial>,
    ) -> Errata {
        let mut errata = Errata::new();
        *exit_code_cell().lock().unwrap_or_else(|e| e.into_inner()) = Some(exit_code);
        if let Err(e) = qlog::configure(qlog_dir) {
            errata.error(format!("qlog configuration failed: {e}"));
            return errata;
        }
        if let Err(e) = TlsContext::init(material) {
            errata.error(format!("TLS initialization failed: {e}"));
        }
        errata
    }

    /// Tear down the process-wide state.
    pub fn terminate() {
        TlsContext::terminate();
        *exit_code_cell().lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Flag a failure from a path that cannot return one. The session (and
    /// ultimately the process) reads this after each drive tick.
    pub fn set_non_zero_exit_status() {
        if let Some(code) = exit_code_cell()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = code.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    pub fn client(config: SessionConfig) -> Self {
        Self::new(config, Role::Client)
    }

    pub fn server(config: SessionConfig) -> Self {
        Self::new(config, Role::Server)
    }

    fn new(config: SessionConfig, role: Role) -> Self {
        Self {
            config,
            role,
            endpoint: None,
            h3: None,
            stream_map: BTreeMap::new(),
            ended_streams: VecDeque::new(),
            finished_streams: HashSet::new(),
            server_script: Vec::new(),
            streams_opened: 0,
            last_added_stream: None,
            current_stream: None,
            target: None,
            iface: None,
            connection_closed: false,
            fatal: None,
        }
    }

    /// Server role: bind the listening socket and report its address. Also
    /// called implicitly by [`Session::accept`].
    pub fn bind(&mut self) -> Result<SocketAddr, Errata> {
        let listen = match self.config.listen {
            Some(addr) => addr,
            None => {
                let mut errata = Errata::new();
                errata.error("server session has no listen address configured");
                return Err(errata);
            }
        };
        match QuicEndpoint::bind(self.config.quic.clone(), listen) {
            Ok(endpoint) => {
                let addr = endpoint.local_addr();
                self.endpoint = Some(endpoint);
                Ok(addr)
            }
            Err(e) => {
                let mut errata = Errata::new();
                errata.error(format!("cannot bind {listen}: {e}"));
                Err(errata)
            }
        }
    }

    // ── Stream bookkeeping ───────────────────────────────────────────

    /// Track a stream under its id.
    pub fn record_stream_state(&mut self, stream_id: i64, stream: H3Stream) {
        self.stream_map.insert(stream_id, stream);
        self.last_added_stream = Some(stream_id);
    }

    /// Note that `stream_id` saw END_STREAM for transaction `key`.
    /// Idempotent in both arguments: the key enters `finished_streams` at
    /// most once, the id enters the ended queue at most once.
    pub fn set_stream_has_ended(&mut self, stream_id: i64, key: &str) {
        if !key.is_empty() {
            self.finished_streams.insert(key.to_string());
        }
        if !self.ended_streams.contains(&stream_id) {
            self.ended_streams.push_back(stream_id);
        }
    }

    /// Whether a completed stream is waiting to be processed.
    pub fn get_a_stream_has_ended(&self) -> bool {
        !self.ended_streams.is_empty()
    }

    /// Keys of completed transactions.
    pub fn finished_keys(&self) -> &HashSet<String> {
        &self.finished_streams
    }

    /// Streams opened over the session's lifetime.
    pub fn streams_opened(&self) -> u64 {
        self.streams_opened
    }

    /// Streams currently tracked (opened and not yet retired).
    pub fn open_streams(&self) -> usize {
        self.stream_map.len()
    }

    /// Send GOAWAY and CONNECTION_CLOSE, then drain.
    pub fn close(&mut self) {
        if !self.connection_closed
            && let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut())
        {
            let _ = h3.send_goaway(endpoint, 0);
        }
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.close(H3_NO_ERROR, b"replay complete");
        }
        self.connection_closed = true;
    }

    // ── The event pump ───────────────────────────────────────────────

    /// One cooperative tick. Returns false when the session must stop.
    fn pump(&mut self, errata: &mut Errata) -> bool {
        if self.fatal.is_some() {
            return false;
        }
        let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut()) else {
            return false;
        };

        if let Err(e) = endpoint.drive(Duration::from_millis(10)) {
            return self.on_drive_error(e, errata);
        }

        // QUIC events feed the HTTP/3 state machine; HTTP-level events are
        // collected and applied once the borrows release.
        let mut closed: Option<String> = None;
        let mut h3_failure: Option<replay_h3::H3Error> = None;
        while let Some(event) = endpoint.poll_event() {
            if let QuicEvent::ConnectionClosed { reason } = &event {
                closed = Some(reason.to_string());
            }
            if let Err(e) = h3.handle_quic_event(endpoint, &event) {
                h3_failure = Some(e);
                break;
            }
        }
        let mut events = Vec::new();
        while let Some(event) = h3.poll_event() {
            events.push(event);
        }

        for event in events {
            self.on_h3_event(event, errata);
        }

        if let Some(e) = h3_failure {
            errata.error(format!("HTTP/3 failure: {e}"));
            self.fatal = Some(e.to_string());
            Self::set_non_zero_exit_status();
            return false;
        }
        if let Some(reason) = closed {
            self.connection_closed = true;
            let benign = reason.contains("closed by peer");
            if !benign {
                errata.warn(format!("connection closed: {reason}"));
            }
            self.abort_outstanding(StreamDisposition::Aborted, &reason, errata);
            return false;
        }
        true
    }

    fn on_drive_error(&mut self, error: QuicError, errata: &mut Errata) -> bool {
        match &error {
            QuicError::CryptoOverflow(level) => {
                // Invariant violation: fatal, and the exit code is the only
                // channel wide enough to reach the operator.
                errata.error(format!(
                    "internal invariant violated: crypto buffer overflow at {level:?} level"
                ));
                Self::set_non_zero_exit_status();
            }
            other => errata.error(format!("transport failure: {other}")),
        }
        self.fatal = Some(error.to_string());
        self.abort_outstanding(StreamDisposition::Aborted, "transport failure", errata);
        false
    }

    fn on_h3_event(&mut self, event: H3Event, errata: &mut Errata) {
        match event {
            H3Event::Headers {
                stream,
                fields,
                end_stream,
            } => self.on_headers(stream, &fields, end_stream, errata),
            H3Event::Data {
                stream,
                payload,
                end_stream,
            } => {
                let id = u64::from(stream) as i64;
                if let Some(state) = self.stream_map.get_mut(&id) {
                    state.append_body(&payload);
                }
                if end_stream {
                    self.on_end_stream(id, errata);
                }
            }
            H3Event::Trailers {
                stream,
                fields,
                end_stream,
            } => {
                let id = u64::from(stream) as i64;
                if let Some(state) = self.stream_map.get_mut(&id) {
                    let section = fields
                        .iter()
                        .map(|f| {
                            (
                                String::from_utf8_lossy(&f.name).into_owned(),
                                f.value.clone(),
                            )
                        })
                        .collect::<FieldSection>();
                    state.trailers_received = Some(section);
                }
                if end_stream {
                    self.on_end_stream(id, errata);
                }
            }
            H3Event::Stopped { stream, error_code } => {
                let id = u64::from(stream) as i64;
                // STOP_SENDING after a clean END_STREAM is just the peer
                // tidying up; only a live stream counts as reset.
                if self.stream_map.get(&id).is_some_and(|s| !s.ended) {
                    errata.warn(format!(
                        "stream {id} stopped by peer (code {error_code:#x})"
                    ));
                    self.retire_stream(id, StreamDisposition::Reset, errata);
                }
            }
            H3Event::GoAway { id } => {
                errata.diag(format!("peer GOAWAY, last id {id}"));
            }
            H3Event::Error(e) => {
                errata.error(format!("HTTP/3 protocol error from peer: {e}"));
                self.fatal = Some(e.to_string());
                Self::set_non_zero_exit_status();
            }
        }
    }

    fn on_headers(
        &mut self,
        stream: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
        errata: &mut Errata,
    ) {
        let id = u64::from(stream) as i64;
        let spec = spec_from_fields(fields);

        let receives_request = match self.stream_map.get(&id) {
            Some(state) => state.will_receive_request(),
            // An untracked stream carrying headers can only be a new
            // peer-opened request stream on the server side.
            None => {
                if self.role != Role::Server {
                    errata.warn(format!("headers on unknown stream {id}"));
                    return;
                }
                let mut state = H3Stream::new(StreamRole::ReceivesRequest);
                state.assign_stream_id(stream);
                self.streams_opened += 1;
                self.record_stream_state(id, state);
                true
            }
        };

        if receives_request {
            self.on_request_headers(id, stream, spec, end_stream, errata);
        } else {
            self.on_response_headers(id, stream, spec, end_stream, errata);
        }
    }

    /// Server side: a request header section arrived.
    fn on_request_headers(
        &mut self,
        id: i64,
        stream: StreamId,
        spec: MessageSpec,
        end_stream: bool,
        errata: &mut Errata,
    ) {
        let expects_continue = spec
            .fields
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case(b"100-continue"));

        let key;
        {
            let state = self.stream_map.get_mut(&id).expect("tracked above");
            state.request_from_client = Some(spec);
            state.compose_url_from_pseudos();
            state.have_received_headers = true;

            key = request_key(state.request_from_client.as_ref().expect("just set"));
            state.key = key.clone();
        }

        // Correlate to the script.
        let matched = self
            .server_script
            .iter()
            .position(|t| t.key == key)
            .or_else(|| {
                let spec = self.stream_map[&id]
                    .request_from_client
                    .as_ref()
                    .expect("just set");
                self.server_script.iter().position(|t| {
                    t.request.method == spec.method
                        && t.request.path == spec.path
                        && t.request.authority == spec.authority
                })
            });

        let state = self.stream_map.get_mut(&id).expect("tracked above");
        match matched {
            Some(index) => {
                let txn = &self.server_script[index];
                state.key = txn.key.clone();
                state.specified_request = Some(Box::new(txn.request.clone()));
                state.response_to_send = Some(Box::new(txn.response.clone()));
                state.response_delay = txn.response_delay;
            }
            None => {
                errata.error(format!(
                    "[{key}] expectation mismatch: no scripted transaction for {}",
                    state.composed_url
                ));
            }
        }

        if end_stream {
            self.on_end_stream(id, errata);
        } else if expects_continue && matched.is_some() {
            // Release the client's held body with an interim response.
            if let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut()) {
                let interim = [HeaderField::new(&b":status"[..], &b"100"[..])];
                if let Err(e) = h3.send_response(endpoint, stream, &interim, false) {
                    errata.warn(format!("[{key}] cannot send 100 continue: {e}"));
                }
            }
        }
    }

    /// Client side: a response header section arrived.
    fn on_response_headers(
        &mut self,
        id: i64,
        stream: StreamId,
        spec: MessageSpec,
        end_stream: bool,
        errata: &mut Errata,
    ) {
        let Some(state) = self.stream_map.get_mut(&id) else {
            return;
        };
        let key = state.key.clone();

        if let Some(status) = spec.status
            && (100..200).contains(&status)
        {
            errata.diag(format!("[{key}] interim response {status}"));
            if status == 100 && state.wait_for_continue {
                state.wait_for_continue = false;
                let body = state.held_body.take().unwrap_or_default();
                let trailers = state.held_trailers.take();
                let body_len = body.len() as u64;
                if let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut()) {
                    let fin = trailers.is_none();
                    if let Err(e) = h3.send_data(endpoint, stream, &body, fin) {
                        errata.error(format!("[{key}] body send failed: {e}"));
                    } else if let Some(trailers) = trailers {
                        let packed = pack_section(&trailers, errata);
                        if let Err(e) = h3.send_trailers(endpoint, stream, &packed) {
                            errata.error(format!("[{key}] trailer send failed: {e}"));
                        }
                    }
                }
                if let Some(state) = self.stream_map.get_mut(&id) {
                    state.num_data_bytes_written += body_len;
                }
            }
            if end_stream {
                self.on_end_stream(id, errata);
            }
            return;
        }

        // A final response while the 100 latch is still set: release the
        // body anyway so the stream can complete from our side.
        if state.wait_for_continue {
            state.wait_for_continue = false;
            let body = state.held_body.take().unwrap_or_default();
            let body_len = body.len() as u64;
            if let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut())
                && let Err(e) = h3.send_data(endpoint, stream, &body, true)
            {
                errata.warn(format!("[{key}] late body send failed: {e}"));
            }
            if let Some(state) = self.stream_map.get_mut(&id) {
                state.num_data_bytes_written += body_len;
            }
        }

        if let Some(state) = self.stream_map.get_mut(&id) {
            state.response_from_server = Some(spec);
            state.have_received_headers = true;
        }
        if end_stream {
            self.on_end_stream(id, errata);
        }
    }

    /// END_STREAM: run the message-level checks, mark the transaction
    /// finished, and (server side) emit the scripted response.
    fn on_end_stream(&mut self, id: i64, errata: &mut Errata) {
        let Some(state) = self.stream_map.get_mut(&id) else {
            return;
        };
        if state.ended {
            return;
        }
        state.ended = true;

        // Declared length vs delivered DATA bytes. Reported, not fatal.
        let received = if state.will_receive_request() {
            state.request_from_client.as_ref()
        } else {
            state.response_from_server.as_ref()
        };
        let declared = received.and_then(|m| m.content_length);
        if let Some(declared) = declared
            && declared != state.body_received.len() as u64
        {
            state.disposition = Some(StreamDisposition::ContentLengthMismatch);
            errata.warn(format!(
                "[{}] content-length {declared} disagrees with {} DATA bytes",
                state.key,
                state.body_received.len()
            ));
        } else {
            state.disposition = Some(StreamDisposition::Complete);
        }

        let key = state.key.clone();
        let respond = state.will_receive_request();
        if respond && let Some(delay) = state.response_delay {
            state.respond_at = Some(Instant::now() + delay);
        }
        self.set_stream_has_ended(id, &key);

        if respond && self.stream_map[&id].respond_at.is_none() {
            self.respond_to_request(id, errata);
        }
    }

    /// Server side: emit responses whose scripted delay has elapsed.
    fn emit_due_responses(&mut self, errata: &mut Errata) {
        let now = Instant::now();
        let due: Vec<i64> = self
            .stream_map
            .iter()
            .filter(|(_, s)| s.respond_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(state) = self.stream_map.get_mut(&id) {
                state.respond_at = None;
            }
            self.respond_to_request(id, errata);
        }
    }

    /// Server side: emit the scripted response for a completed request.
    fn respond_to_request(&mut self, id: i64, errata: &mut Errata) {
        let Some(state) = self.stream_map.get_mut(&id) else {
            return;
        };
        let Some(stream) = state.quic_id else {
            return;
        };
        let key = state.key.clone();
        let response = state.response_to_send.take();

        let (fields, body, trailers) = match &response {
            Some(spec) => (
                pack_response_fields(spec, errata),
                spec.body.clone(),
                spec.trailers.clone(),
            ),
            None => (
                vec![HeaderField::new(&b":status"[..], &b"404"[..])],
                Vec::new(),
                None,
            ),
        };

        let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut()) else {
            return;
        };
        let end_on_headers = body.is_empty() && trailers.is_none();
        if let Err(e) = h3.send_response(endpoint, stream, &fields, end_on_headers) {
            errata.error(format!("[{key}] response send failed: {e}"));
            return;
        }
        if !body.is_empty()
            && let Err(e) = h3.send_data(endpoint, stream, &body, trailers.is_none())
        {
            errata.error(format!("[{key}] response body send failed: {e}"));
            return;
        }
        if let Some(trailers) = trailers {
            let packed = pack_section(&trailers, errata);
            if let Err(e) = h3.send_trailers(endpoint, stream, &packed) {
                errata.error(format!("[{key}] response trailer send failed: {e}"));
            }
        }
        if let Some(state) = self.stream_map.get_mut(&id) {
            state.num_data_bytes_written += body.len() as u64;
        }
    }

    /// Terminal handling for a stream that will not complete normally.
    /// The key still enters `finished_streams` so dependents and the
    /// opened/retired arithmetic stay coherent.
    fn retire_stream(
        &mut self,
        id: i64,
        disposition: StreamDisposition,
        errata: &mut Errata,
    ) {
        let Some(mut state) = self.stream_map.remove(&id) else {
            return;
        };
        state.disposition = Some(disposition);
        if disposition == StreamDisposition::Timeout
            && let Some(stream) = state.quic_id
            && let Some(endpoint) = self.endpoint.as_mut()
        {
            endpoint.stop_sending(stream, H3_REQUEST_CANCELLED);
        }
        errata.error(format!(
            "[{}] stream {id} ended {:?} after {:?}",
            state.key,
            disposition,
            state.elapsed().unwrap_or_default()
        ));
        if !state.key.is_empty() {
            self.finished_streams.insert(state.key.clone());
        }
    }

    fn abort_outstanding(
        &mut self,
        disposition: StreamDisposition,
        reason: &str,
        errata: &mut Errata,
    ) {
        let pending: Vec<i64> = self
            .stream_map
            .iter()
            .filter(|(_, s)| !s.ended)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            errata.warn(format!("stream {id} outstanding at {reason}"));
            self.retire_stream(id, disposition, errata);
        }
    }

    /// Pop completed streams, compare them against their expectations, and
    /// retire them from the map. Server streams still owing a (delayed)
    /// response stay queued until it has been emitted.
    fn drain_ended(&mut self, errata: &mut Errata) {
        let mut requeue = Vec::new();
        while let Some(id) = self.ended_streams.pop_front() {
            let owes_response = self
                .stream_map
                .get(&id)
                .is_some_and(|s| s.respond_at.is_some() || s.response_to_send.is_some());
            if owes_response {
                requeue.push(id);
                continue;
            }
            let Some(state) = self.stream_map.remove(&id) else {
                continue;
            };
            if state.will_receive_response() {
                verify_response(&state, errata);
            } else {
                verify_request(&state, errata);
            }
        }
        self.ended_streams.extend(requeue);
    }

    /// Expire per-transaction response deadlines.
    fn expire_stream_deadlines(&mut self, errata: &mut Errata) {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .stream_map
            .iter()
            .filter(|(_, s)| !s.ended && s.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.retire_stream(id, StreamDisposition::Timeout, errata);
        }
    }

    /// Open the stream for one scripted transaction.
    fn start_transaction(&mut self, txn: &Txn, errata: &mut Errata) {
        let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut()) else {
            errata.error(format!("[{}] no connection to replay on", txn.key));
            return;
        };

        let fields = pack_request_fields(&txn.request, errata);
        let has_body = !txn.request.body.is_empty();
        let has_trailers = txn.request.trailers.is_some();
        let expects_continue = has_body
            && txn
                .request
                .fields
                .get("expect")
                .is_some_and(|v| v.eq_ignore_ascii_case(b"100-continue"));

        let end_on_headers = !has_body && !has_trailers;
        let stream = match h3.send_request(endpoint, &fields, end_on_headers) {
            Ok(stream) => stream,
            Err(e) => {
                errata.error(format!("[{}] cannot open stream: {e}", txn.key));
                return;
            }
        };

        let mut state = H3Stream::new(StreamRole::ReceivesResponse);
        state.key = txn.key.clone();
        state.composed_url = txn.request.compose_url();
        state.specified_response = Some(Box::new(txn.response.clone()));
        state.assign_stream_id(stream);
        state.deadline = txn.response_timeout.map(|t| Instant::now() + t);

        if expects_continue {
            state.wait_for_continue = true;
            state.held_body = Some(txn.request.body.clone());
            state.held_trailers = txn.request.trailers.clone();
        } else {
            if has_body {
                if let Err(e) = h3.send_data(endpoint, stream, &txn.request.body, !has_trailers)
                {
                    errata.error(format!("[{}] body send failed: {e}", txn.key));
                } else {
                    state.num_data_bytes_written = txn.request.body.len() as u64;
                }
            }
            if let Some(trailers) = &txn.request.trailers {
                let packed = pack_section(trailers, errata);
                if let Err(e) = h3.send_trailers(endpoint, stream, &packed) {
                    errata.error(format!("[{}] trailer send failed: {e}", txn.key));
                }
            }
        }

        let id = u64::from(stream) as i64;
        self.streams_opened += 1;
        self.record_stream_state(id, state);
        errata.diag(format!("[{}] opened stream {id}", txn.key));
    }
}

impl Drop for H3Session {
    fn drop(&mut self) {
        if !self.connection_closed && self.endpoint.is_some() {
            self.close();
        }
    }
}

// ── Connection bring-up and the Session surface ─────────────────────

impl H3Session {
    /// Drive until the HTTP/3 SETTINGS exchange settles.
    fn settle_h3(&mut self, deadline: Instant, errata: &mut Errata) -> bool {
        loop {
            if self.h3.as_ref().is_some_and(|h3| h3.is_ready()) {
                return true;
            }
            if Instant::now() >= deadline {
                errata.error("SETTINGS exchange did not settle in time");
                return false;
            }
            if !self.pump(errata) {
                return false;
            }
        }
    }

    fn handshake_deadline(&self) -> Instant {
        Instant::now() + self.config.quic.handshake_timeout
    }
}

impl Session for H3Session {
    /// Drain completed body bytes from the oldest finished stream. HTTP/3
    /// bodies are frame-delimited, so raw reads only make sense against a
    /// stream the session already collected.
    fn read(&mut self, span: &mut [u8]) -> Rv<usize> {
        let mut rv = Rv::new(0);
        let Some(&id) = self.ended_streams.front() else {
            return rv;
        };
        let Some(state) = self.stream_map.get_mut(&id) else {
            return rv;
        };
        let rest = &state.body_received[state.body_read_cursor..];
        let n = rest.len().min(span.len());
        span[..n].copy_from_slice(&rest[..n]);
        state.body_read_cursor += n;
        rv.value = n;
        rv
    }

    /// Append DATA to the most recently opened stream, without END_STREAM.
    fn write(&mut self, data: &[u8]) -> Rv<usize> {
        let mut rv = Rv::new(0);
        let Some(id) = self.last_added_stream else {
            rv.errata.error("no open stream to write to");
            return rv;
        };
        let Some(stream) = self.stream_map.get(&id).and_then(|s| s.quic_id) else {
            rv.errata.error(format!("stream {id} is gone"));
            return rv;
        };
        let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut()) else {
            rv.errata.error("no connection");
            return rv;
        };
        match h3.send_data(endpoint, stream, data, false) {
            Ok(()) => {
                rv.value = data.len();
                if let Some(state) = self.stream_map.get_mut(&id) {
                    state.num_data_bytes_written += data.len() as u64;
                }
            }
            Err(e) => rv.errata.error(format!("write failed: {e}")),
        }
        rv
    }

    /// Send a header section: a request (client) or a response on the
    /// stream most recently yielded by `read_and_parse_request` (server).
    fn write_header(&mut self, hdr: &MessageSpec) -> Rv<usize> {
        let mut rv = Rv::new(0);
        if hdr.is_request() {
            let txn = Txn::new(request_key(hdr), hdr.clone(), MessageSpec::default());
            self.start_transaction(&txn, &mut rv.errata);
            rv.value = 1;
            return rv;
        }

        let Some(id) = self.current_stream else {
            rv.errata.error("no current stream to respond on");
            return rv;
        };
        let Some(stream) = self.stream_map.get(&id).and_then(|s| s.quic_id) else {
            rv.errata.error(format!("stream {id} is gone"));
            return rv;
        };
        let fields = pack_response_fields(hdr, &mut rv.errata);
        let (Some(endpoint), Some(h3)) = (self.endpoint.as_mut(), self.h3.as_mut()) else {
            rv.errata.error("no connection");
            return rv;
        };
        match h3.send_response(endpoint, stream, &fields, hdr.body.is_empty()) {
            Ok(()) => rv.value = 1,
            Err(e) => rv.errata.error(format!("header send failed: {e}")),
        }
        rv
    }

    /// Pump until a whole stream has completed (HTTP/3 reads whole streams;
    /// framing already delimits the body).
    fn poll_for_headers(&mut self, timeout: Duration) -> Rv<usize> {
        let mut rv = Rv::new(0);
        let deadline = Instant::now() + timeout;
        while !self.get_a_stream_has_ended() {
            if Instant::now() >= deadline {
                rv.errata.warn("poll_for_headers timed out");
                return rv;
            }
            if !self.pump(&mut rv.errata) {
                return rv;
            }
        }
        rv.value = self.ended_streams.len();
        rv
    }

    /// Take the next completed inbound message. The composed URL text is
    /// appended to `buf`, whose storage backs later parsing.
    fn read_and_parse_request(&mut self, buf: &mut Vec<u8>) -> Rv<Option<MessageSpec>> {
        let mut rv = Rv::new(None);
        let Some(id) = self.ended_streams.pop_front() else {
            return rv;
        };
        let Some(state) = self.stream_map.get(&id) else {
            return rv;
        };
        self.current_stream = Some(id);
        buf.extend_from_slice(state.composed_url.as_bytes());
        rv.value = if state.will_receive_request() {
            state.request_from_client.clone()
        } else {
            state.response_from_server.clone()
        };
        rv
    }

    /// Verify and consume the current message's body, then retire the
    /// stream.
    fn drain_body(
        &mut self,
        _hdr: &MessageSpec,
        expected_size: usize,
        bytes_read: &[u8],
        rule_check: Option<&dyn RuleCheck>,
    ) -> Rv<usize> {
        let mut rv = Rv::new(0);
        let Some(id) = self.current_stream.take() else {
            rv.errata.error("no current stream to drain");
            return rv;
        };
        let Some(state) = self.stream_map.remove(&id) else {
            rv.errata.error(format!("stream {id} is gone"));
            return rv;
        };
        let total = state.body_received.len() + bytes_read.len();
        rv.value = state.body_received.len();
        if total != expected_size {
            rv.errata.warn(format!(
                "[{}] drained {total} body bytes where {expected_size} were expected",
                state.key
            ));
        }
        if let Some(check) = rule_check {
            check.check(&state.body_received, &mut rv.errata);
        }
        if !state.key.is_empty() {
            self.finished_streams.insert(state.key.clone());
        }
        rv
    }

    /// Server side: bind (if needed), wait for the peer's handshake, and
    /// settle SETTINGS.
    fn accept(&mut self) -> Errata {
        let mut errata = Errata::new();
        if self.endpoint.is_none()
            && let Err(bind_errata) = self.bind()
        {
            return bind_errata;
        }

        let endpoint = self.endpoint.as_mut().expect("bound above");
        // A server waits for its client; bound by the run deadline, not the
        // handshake timeout.
        if let Err(e) = endpoint.drive_until_connected(self.config.run_deadline) {
            errata.error(format!("accept failed: {e}"));
            Self::set_non_zero_exit_status();
            return errata;
        }
        if let Some(peer) = endpoint.advertised_peer() {
            errata.diag(format!(
                "PROXY preamble advertised {} -> {}",
                peer.src, peer.dst
            ));
        }
        self.h3 = Some(H3Connection::new(Role::Server, Settings::default()));
        let deadline = self.handshake_deadline();
        self.settle_h3(deadline, &mut errata);
        errata
    }

    /// Client side: connect to the previously configured target.
    fn connect(&mut self) -> Errata {
        match self.target {
            Some(target) => self.do_connect(self.iface, target, self.config.pp_version),
            None => {
                let mut errata = Errata::new();
                errata.error("no target configured");
                errata
            }
        }
    }

    /// Client side: PROXY preamble (optional), QUIC handshake, SETTINGS.
    fn do_connect(
        &mut self,
        iface: Option<IpAddr>,
        target: SocketAddr,
        pp_version: ProxyVersion,
    ) -> Errata {
        let mut errata = Errata::new();
        self.iface = iface;
        self.target = Some(target);

        let endpoint = match QuicEndpoint::connect(self.config.quic.clone(), iface, target, pp_version)
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                errata.error(format!("cannot reach {target}: {e}"));
                return errata;
            }
        };
        log::debug!("connecting to {target} (scid {})", endpoint.scid());
        self.endpoint = Some(endpoint);

        let timeout = self.config.quic.handshake_timeout;
        if let Err(e) = self
            .endpoint
            .as_mut()
            .expect("just set")
            .drive_until_connected(timeout)
        {
            errata.error(format!("handshake with {target} failed: {e}"));
            Self::set_non_zero_exit_status();
            return errata;
        }

        self.h3 = Some(H3Connection::new(Role::Client, Settings::default()));
        let deadline = self.handshake_deadline();
        self.settle_h3(deadline, &mut errata);
        errata
    }

    /// Replay the scripted list. The client schedules each transaction at
    /// `start_offset * rate_multiplier` and gates on dependencies; the
    /// server registers the script and serves inbound requests against it.
    fn run_transactions(
        &mut self,
        txns: &[Txn],
        iface: Option<IpAddr>,
        target: SocketAddr,
        rate_multiplier: f64,
    ) -> Errata {
        let mut errata = Errata::new();

        if self.endpoint.is_none() || self.h3.is_none() {
            let bring_up = match self.role {
                Role::Client => self.do_connect(iface, target, self.config.pp_version),
                Role::Server => self.accept(),
            };
            let failed = !bring_up.is_ok();
            errata.merge(bring_up);
            if failed {
                return errata;
            }
        }

        let started = Instant::now();
        let deadline = started + self.config.run_deadline;

        match self.role {
            Role::Client => self.run_client_transactions(txns, started, deadline, rate_multiplier, &mut errata),
            Role::Server => self.run_server_transactions(txns, deadline, &mut errata),
        }
        errata
    }

    /// Replay one transaction on the established connection and wait for
    /// its outcome.
    fn run_transaction(&mut self, txn: &Txn) -> Errata {
        let mut errata = Errata::new();
        self.start_transaction(txn, &mut errata);
        let deadline = Instant::now() + self.config.run_deadline;
        while self.stream_map.values().any(|s| !s.ended) {
            self.expire_stream_deadlines(&mut errata);
            if Instant::now() >= deadline {
                errata.error(format!("[{}] no outcome before the deadline", txn.key));
                break;
            }
            if !self.pump(&mut errata) {
                break;
            }
        }
        self.drain_ended(&mut errata);
        errata
    }
}

impl H3Session {
    fn run_client_transactions(
        &mut self,
        txns: &[Txn],
        started: Instant,
        deadline: Instant,
        rate_multiplier: f64,
        errata: &mut Errata,
    ) {
        let multiplier = if rate_multiplier.is_finite() && rate_multiplier > 0.0 {
            rate_multiplier
        } else {
            0.0
        };

        'txns: for txn in txns {
            let scheduled = started + txn.start_offset.mul_f64(multiplier);
            loop {
                self.drain_ended(errata);
                self.expire_stream_deadlines(errata);
                let deps_met = txn
                    .depends_on
                    .iter()
                    .all(|key| self.finished_streams.contains(key));
                if deps_met && Instant::now() >= scheduled {
                    break;
                }
                if Instant::now() >= deadline {
                    errata.error(format!(
                        "[{}] never launched: session deadline reached",
                        txn.key
                    ));
                    break 'txns;
                }
                if !self.pump(errata) {
                    break 'txns;
                }
            }
            if self.fatal.is_some() || self.connection_closed {
                break;
            }
            self.start_transaction(txn, errata);
        }

        // Await the outcomes of everything launched.
        loop {
            self.drain_ended(errata);
            self.expire_stream_deadlines(errata);
            if self.stream_map.is_empty() {
                break;
            }
            if self.fatal.is_some() || self.connection_closed {
                self.abort_outstanding(StreamDisposition::Aborted, "session stop", errata);
                self.drain_ended(errata);
                break;
            }
            if Instant::now() >= deadline {
                errata.error("session deadline reached with streams outstanding");
                self.abort_outstanding(StreamDisposition::Timeout, "session deadline", errata);
                self.drain_ended(errata);
                if let Some(endpoint) = self.endpoint.as_mut() {
                    endpoint.close(H3_NO_ERROR, b"session deadline");
                }
                self.connection_closed = true;
                break;
            }
            if !self.pump(errata) {
                continue;
            }
        }
    }

    fn run_server_transactions(&mut self, txns: &[Txn], deadline: Instant, errata: &mut Errata) {
        self.server_script = txns.to_vec();
        let expected: HashSet<&str> = txns.iter().map(|t| t.key.as_str()).collect();

        loop {
            self.emit_due_responses(errata);
            self.drain_ended(errata);
            let served = expected
                .iter()
                .filter(|key| self.finished_streams.contains(**key))
                .count();
            let owes_responses = self
                .stream_map
                .values()
                .any(|s| s.respond_at.is_some() || (s.ended && s.response_to_send.is_some()));
            if served == expected.len() && !owes_responses {
                break;
            }
            if self.connection_closed || self.fatal.is_some() {
                errata.error(format!(
                    "connection ended with {served}/{} scripted transactions replayed",
                    expected.len()
                ));
                return;
            }
            if Instant::now() >= deadline {
                errata.error(format!(
                    "deadline reached with {served}/{} scripted transactions replayed",
                    expected.len()
                ));
                return;
            }
            self.pump(errata);
        }

        // Everything served; linger until the client closes so the final
        // flights actually reach the wire.
        let linger = Instant::now() + Duration::from_secs(3);
        while !self.connection_closed && self.fatal.is_none() && Instant::now() < linger {
            if !self.pump(errata) {
                break;
            }
        }
        self.drain_ended(errata);
    }
}

// ── Header packing and message reconstruction ───────────────────────

/// Fixed pseudo-header order for requests, then the regular fields with
/// reserved names dropped and illegal values rejected.
fn pack_request_fields(spec: &MessageSpec, errata: &mut Errata) -> Vec<HeaderField> {
    let mut out = Vec::with_capacity(spec.fields.len() + 4);
    if let Some(method) = &spec.method {
        out.push(HeaderField::new(&b":method"[..], method.as_bytes()));
    }
    if let Some(scheme) = &spec.scheme {
        out.push(HeaderField::new(&b":scheme"[..], scheme.as_bytes()));
    }
    if let Some(authority) = &spec.authority {
        out.push(HeaderField::new(&b":authority"[..], authority.as_bytes()));
    }
    if let Some(path) = &spec.path {
        out.push(HeaderField::new(&b":path"[..], path.as_bytes()));
    }
    append_regular_fields(&spec.fields, &mut out, errata);
    out
}

fn pack_response_fields(spec: &MessageSpec, errata: &mut Errata) -> Vec<HeaderField> {
    let mut out = Vec::with_capacity(spec.fields.len() + 1);
    let status = spec.status.unwrap_or(200);
    out.push(HeaderField::new(
        &b":status"[..],
        status.to_string().into_bytes(),
    ));
    append_regular_fields(&spec.fields, &mut out, errata);
    out
}

fn pack_section(section: &FieldSection, errata: &mut Errata) -> Vec<HeaderField> {
    let mut out = Vec::with_capacity(section.len());
    append_regular_fields(section, &mut out, errata);
    out
}

fn append_regular_fields(
    section: &FieldSection,
    out: &mut Vec<HeaderField>,
    errata: &mut Errata,
) {
    for (name, value) in section.iter() {
        if message::is_reserved_field(name) {
            errata.diag(format!("dropping connection-specific field {name}"));
            continue;
        }
        if !message::value_is_legal(value) {
            errata.warn(format!("dropping field {name}: illegal bytes in value"));
            continue;
        }
        out.push(HeaderField::new(name.as_bytes(), value));
    }
}

/// Rebuild a message from a received header section.
fn spec_from_fields(fields: &[HeaderField]) -> MessageSpec {
    let mut spec = MessageSpec::default();
    for field in fields {
        match field.name.as_slice() {
            b":method" => spec.method = Some(String::from_utf8_lossy(&field.value).into_owned()),
            b":scheme" => spec.scheme = Some(String::from_utf8_lossy(&field.value).into_owned()),
            b":authority" => {
                spec.authority = Some(String::from_utf8_lossy(&field.value).into_owned())
            }
            b":path" => spec.path = Some(String::from_utf8_lossy(&field.value).into_owned()),
            b":status" => {
                spec.status = std::str::from_utf8(&field.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
            }
            name => {
                let name = String::from_utf8_lossy(name).into_owned();
                if name == "content-length" {
                    spec.content_length = std::str::from_utf8(&field.value)
                        .ok()
                        .and_then(|s| s.parse().ok());
                }
                spec.fields.push(&name, field.value.clone());
            }
        }
    }
    spec
}

/// The correlation key of a message: the `uuid` field when the trace
/// carries one, the method plus absolute URL otherwise.
fn request_key(spec: &MessageSpec) -> String {
    if let Some(uuid) = spec.fields.get("uuid") {
        return String::from_utf8_lossy(uuid).into_owned();
    }
    format!(
        "{} {}",
        spec.method.as_deref().unwrap_or("-"),
        spec.compose_url()
    )
}

// ── Expectation checking ────────────────────────────────────────────

fn verify_response(stream: &H3Stream, errata: &mut Errata) {
    let key = &stream.key;
    let Some(expected) = stream.specified_response.as_deref() else {
        return;
    };
    let Some(received) = stream.response_from_server.as_ref() else {
        errata.error(format!("[{key}] expectation mismatch: no response received"));
        return;
    };

    let mut clean = true;
    if let Some(want) = expected.status
        && received.status != Some(want)
    {
        clean = false;
        errata.error(format!(
            "[{key}] expectation mismatch: status {} where {want} was scripted",
            received
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
        ));
    }
    clean &= verify_fields(key, &expected.fields, &received.fields, errata);
    if let Some(expected_trailers) = &expected.trailers {
        match &stream.trailers_received {
            Some(received_trailers) => {
                clean &= verify_fields(key, expected_trailers, received_trailers, errata);
            }
            None => {
                clean = false;
                errata.error(format!("[{key}] expectation mismatch: trailers missing"));
            }
        }
    }
    if !expected.body.is_empty() && expected.body.len() != stream.body_received.len() {
        clean = false;
        errata.error(format!(
            "[{key}] expectation mismatch: body of {} bytes where {} were scripted",
            stream.body_received.len(),
            expected.body.len()
        ));
    }
    if clean {
        errata.diag(format!(
            "[{key}] matched in {:?}",
            stream.elapsed().unwrap_or_default()
        ));
    }
}

fn verify_request(stream: &H3Stream, errata: &mut Errata) {
    let key = &stream.key;
    let Some(expected) = stream.specified_request.as_deref() else {
        return;
    };
    let Some(received) = stream.request_from_client.as_ref() else {
        errata.error(format!("[{key}] expectation mismatch: no request received"));
        return;
    };

    let mut clean = true;
    for (label, want, got) in [
        ("method", &expected.method, &received.method),
        ("authority", &expected.authority, &received.authority),
        ("path", &expected.path, &received.path),
    ] {
        if want.is_some() && want != got {
            clean = false;
            errata.error(format!(
                "[{key}] expectation mismatch: {label} {:?} where {:?} was scripted",
                got, want
            ));
        }
    }
    clean &= verify_fields(key, &expected.fields, &received.fields, errata);
    if !expected.body.is_empty() && expected.body.len() != stream.body_received.len() {
        clean = false;
        errata.error(format!(
            "[{key}] expectation mismatch: request body of {} bytes where {} were scripted",
            stream.body_received.len(),
            expected.body.len()
        ));
    }
    if clean {
        errata.diag(format!(
            "[{key}] request matched in {:?}",
            stream.elapsed().unwrap_or_default()
        ));
    }
}

/// Every scripted field must be present with the scripted value. Fields
/// the script does not mention are free.
fn verify_fields(
    key: &str,
    expected: &FieldSection,
    received: &FieldSection,
    errata: &mut Errata,
) -> bool {
    let mut clean = true;
    for (name, want) in expected.iter() {
        if message::is_reserved_field(name) {
            continue;
        }
        match received.get(name) {
            None => {
                clean = false;
                errata.error(format!("[{key}] expectation mismatch: field {name} missing"));
            }
            Some(got) if got != want => {
                clean = false;
                errata.error(format!(
                    "[{key}] expectation mismatch: field {name} is {:?} where {:?} was scripted",
                    String::from_utf8_lossy(got),
                    String::from_utf8_lossy(want)
                ));
            }
            Some(_) => {}
        }
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField::new(name.as_bytes(), value.as_bytes())
    }

    #[test]
    fn request_packing_order_and_filtering() {
        let mut errata = Errata::new();
        let spec = MessageSpec::request("GET", "https", "replay.test", "/x")
            .with_field("Connection", &b"keep-alive"[..])
            .with_field("X-Custom", &b"ok"[..])
            .with_field("Upgrade", &b"h2c"[..])
            .with_field("bad-value", &b"a\r\nb"[..]);
        let packed = pack_request_fields(&spec, &mut errata);

        let names: Vec<&[u8]> = packed.iter().map(|f| f.name.as_slice()).collect();
        assert_eq!(
            names,
            vec![
                &b":method"[..],
                &b":scheme"[..],
                &b":authority"[..],
                &b":path"[..],
                &b"x-custom"[..],
            ]
        );
        // Two reserved drops (diag) and one illegal value (warn); no errors.
        assert!(errata.is_ok());
        assert_eq!(errata.len(), 3);
    }

    #[test]
    fn response_packing_has_status_first() {
        let mut errata = Errata::new();
        let spec = MessageSpec::response(503).with_field("retry-after", &b"1"[..]);
        let packed = pack_response_fields(&spec, &mut errata);
        assert_eq!(packed[0], field(":status", "503"));
        assert_eq!(packed[1], field("retry-after", "1"));
    }

    #[test]
    fn spec_reconstruction_from_wire_fields() {
        let fields = vec![
            field(":method", "POST"),
            field(":scheme", "https"),
            field(":authority", "replay.test:8443"),
            field(":path", "/submit"),
            field("content-length", "42"),
            field("uuid", "txn-7"),
        ];
        let spec = spec_from_fields(&fields);
        assert_eq!(spec.method.as_deref(), Some("POST"));
        assert_eq!(spec.content_length, Some(42));
        assert_eq!(spec.compose_url(), "https://replay.test:8443/submit");
        assert_eq!(request_key(&spec), "txn-7");

        let anonymous = spec_from_fields(&[field(":method", "GET"), field(":path", "/")]);
        assert_eq!(request_key(&anonymous), "GET :///");
    }

    #[test]
    fn ended_stream_bookkeeping_is_idempotent() {
        let mut session = H3Session::client(SessionConfig::default());
        let mut stream = H3Stream::new(StreamRole::ReceivesResponse);
        stream.key = "t1".to_string();
        session.record_stream_state(0, stream);
        session.streams_opened = 1;

        assert!(!session.get_a_stream_has_ended());
        session.set_stream_has_ended(0, "t1");
        session.set_stream_has_ended(0, "t1");
        session.set_stream_has_ended(0, "t1");

        assert!(session.get_a_stream_has_ended());
        assert_eq!(session.ended_streams.len(), 1);
        assert_eq!(session.finished_keys().len(), 1);
        assert!(session.finished_keys().contains("t1"));
    }

    #[test]
    fn opened_streams_split_between_map_and_finished() {
        let mut session = H3Session::client(SessionConfig::default());
        for (id, key) in [(0i64, "a"), (4, "b"), (8, "c")] {
            let mut stream = H3Stream::new(StreamRole::ReceivesResponse);
            stream.key = key.to_string();
            stream.specified_response = Some(Box::new(MessageSpec::response(200)));
            stream.response_from_server = Some(MessageSpec::response(200));
            session.record_stream_state(id, stream);
            session.streams_opened += 1;
        }

        let mut errata = Errata::new();
        session.set_stream_has_ended(0, "a");
        session.drain_ended(&mut errata);

        // At quiescence: retired keys + live streams account for every
        // stream ever opened, with no overlap.
        assert_eq!(session.open_streams(), 2);
        assert_eq!(session.finished_keys().len(), 1);
        assert_eq!(
            session.open_streams() + session.finished_keys().len(),
            session.streams_opened() as usize
        );
        for state in session.stream_map.values() {
            assert!(!session.finished_streams.contains(&state.key));
        }
    }

    #[test]
    fn stream_arena_views_live_with_the_stream() {
        let mut stream = H3Stream::new(StreamRole::ReceivesResponse);
        let view = stream.register_buf(b"held for the stream lifetime".to_vec());
        assert_eq!(&view[..4], b"held");
        stream.append_body(b"abc");
        stream.append_body(b"def");
        assert_eq!(stream.body_received, b"abcdef");
    }

    #[test]
    fn verify_response_reports_mismatches() {
        let mut stream = H3Stream::new(StreamRole::ReceivesResponse);
        stream.key = "t9".to_string();
        stream.specified_response = Some(Box::new(
            MessageSpec::response(200).with_field("server", &b"origin"[..]),
        ));
        stream.response_from_server =
            Some(MessageSpec::response(503).with_field("server", &b"proxy"[..]));

        let mut errata = Errata::new();
        verify_response(&stream, &mut errata);
        assert!(!errata.is_ok());
        let text = errata.to_string();
        assert!(text.contains("status 503"));
        assert!(text.contains("field server"));
    }

    #[test]
    fn verify_response_accepts_extra_unscripted_fields() {
        let mut stream = H3Stream::new(StreamRole::ReceivesResponse);
        stream.key = "t10".to_string();
        stream.specified_response = Some(Box::new(MessageSpec::response(200)));
        stream.response_from_server = Some(
            MessageSpec::response(200)
                .with_field("date", &b"today"[..])
                .with_field("via", &b"proxy"[..]),
        );
        let mut errata = Errata::new();
        verify_response(&stream, &mut errata);
        assert!(errata.is_ok());
    }
}
