//! HTTP/3 framing layer for the traffic replayer.
//!
//! Sits on top of [`replay_quic::QuicEndpoint`] and turns QUIC stream events
//! into HTTP-level events:
//!
//! ```text
//!   UDP datagrams
//!        |
//!   +----v---------+
//!   | replay-quic  |  QUIC transport (quinn-proto wrapper)
//!   | QuicEndpoint |  QuicEvent: StreamOpened, StreamReadable, ...
//!   +----+---------+
//!        | stream_recv() / stream_send()
//!   +----v---------+
//!   |  replay-h3   |  frames + QPACK + SETTINGS
//!   | H3Connection |  H3Event: Headers, Data, Trailers, ...
//!   +--------------+
//! ```
//!
//! Both roles are supported: the client opens request streams and reads
//! responses, the server demuxes inbound requests and emits responses. QPACK
//! runs against the static table only, with Huffman string literals.

pub mod connection;
pub mod error;
pub mod frame;
mod huffman;
pub mod qpack;
pub mod settings;
mod stream;
pub mod varint;

pub use connection::{H3Connection, H3Event};
pub use error::{H3Error, H3_NO_ERROR, H3_REQUEST_CANCELLED};
pub use frame::{Frame, FrameType};
pub use qpack::HeaderField;
pub use settings::Settings;
