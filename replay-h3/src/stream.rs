//! Per-request-stream framing state.

/// Receive-side bookkeeping for one request stream.
///
/// Header-section classification: every HEADERS frame seen before the first
/// DATA frame is a leading (or interim 1xx) section; a HEADERS frame after
/// DATA carries trailers; anything after trailers is a framing error.
#[derive(Debug, Default)]
pub(crate) struct RequestStream {
    /// Partial frame bytes between reads.
    pub recv_buf: Vec<u8>,
    /// A DATA frame has been seen.
    pub saw_data: bool,
    /// A trailer section has been seen.
    pub saw_trailers: bool,
    /// END_STREAM has been surfaced to the application (exactly once).
    pub fin_delivered: bool,
    /// Transport FIN observed for the peer's direction.
    pub fin_received: bool,
}

impl RequestStream {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Send-side queue for bytes the stream's flow-control window rejected.
#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    pub data: Vec<u8>,
    /// FIN once `data` drains.
    pub fin: bool,
}
