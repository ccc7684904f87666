//! HTTP/3 traffic-replay session engine.
//!
//! Replays scripted HTTP transactions against a live peer over QUIC+HTTP/3,
//! correlating every stream back to its scripted expectation and reporting
//! divergence as structured [`Errata`] rather than failures:
//!
//! ```rust,ignore
//! let mut session = H3Session::client(SessionConfig::default());
//! let errata = session.run_transactions(&txns, None, target, 1.0);
//! session.close();
//! if !errata.is_ok() {
//!     eprintln!("{errata}");
//! }
//! ```
//!
//! The engine is strictly single-threaded cooperative per session: each
//! session pumps its own endpoint on its own thread, and the only shared
//! state is the process-wide TLS contexts, the qlog sink, and the atomic
//! exit code, all behind [`H3Session::init`] / [`H3Session::terminate`].
//!
//! Trace loading, rule checks beyond sizes, and the HTTP/1 and HTTP/2
//! engines that share the [`Session`] trait live elsewhere.

pub mod errata;
pub mod h3;
pub mod message;
pub mod session;
pub mod txn;

pub use errata::{Errata, Note, Rv, Severity};
pub use h3::{H3Session, H3Stream, SessionConfig, StreamDisposition, StreamRole};
pub use message::{FieldSection, MessageSpec};
pub use session::{RuleCheck, Session};
pub use txn::Txn;
