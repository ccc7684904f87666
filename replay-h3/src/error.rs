//! HTTP/3 layer errors and application error codes.

/// HTTP/3 application error codes carried in RESET_STREAM, STOP_SENDING and
/// CONNECTION_CLOSE (RFC 9114 Section 8.1).
pub const H3_NO_ERROR: u32 = 0x100;
pub const H3_GENERAL_PROTOCOL_ERROR: u32 = 0x101;
pub const H3_FRAME_UNEXPECTED: u32 = 0x105;
pub const H3_REQUEST_CANCELLED: u32 = 0x10c;

/// Errors produced by the HTTP/3 framing layer.
#[derive(Debug, thiserror::Error)]
pub enum H3Error {
    /// QUIC transport failure underneath.
    #[error("quic: {0}")]
    Quic(#[from] replay_quic::Error),

    /// A frame type that must not appear where it did (including the frame
    /// types reserved from HTTP/2).
    #[error("unexpected frame type {0:#x}")]
    FrameUnexpected(u64),

    /// Truncated varint, bad payload length, or similar framing damage.
    #[error("malformed frame")]
    FrameError,

    /// The peer's control stream did not begin with SETTINGS.
    #[error("SETTINGS missing on control stream")]
    MissingSettings,

    /// A SETTINGS identifier reserved from HTTP/2 appeared.
    #[error("reserved setting identifier {0:#x}")]
    InvalidSetting(u64),

    /// QPACK header block could not be decoded.
    #[error("QPACK decoding failed")]
    QpackDecompressionFailed,

    /// A received field section exceeds the advertised
    /// MAX_FIELD_SECTION_SIZE.
    #[error("field section of {0} bytes exceeds the advertised limit")]
    FieldSectionTooLarge(usize),

    /// A critical (control) stream was closed.
    #[error("critical stream closed")]
    ClosedCriticalStream,

    /// The peer's stream concurrency limit blocks a new request.
    #[error("stream limit reached")]
    StreamsExhausted,

    #[error("internal: {0}")]
    Internal(String),
}
