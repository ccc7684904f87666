//! Scripted transactions.

use std::time::Duration;

use crate::message::MessageSpec;

/// One scripted request/response pair, pre-parsed by the trace loader.
#[derive(Debug, Clone)]
pub struct Txn {
    /// Unique correlation key for this transaction within its trace.
    pub key: String,
    /// Scripted start time, relative to the start of the session. Scaled by
    /// the session's rate multiplier.
    pub start_offset: Duration,
    /// Keys of transactions that must have completed before this one may
    /// open its stream.
    pub depends_on: Vec<String>,
    /// What the client sends / the server expects to receive.
    pub request: MessageSpec,
    /// What the server sends / the client expects to receive.
    pub response: MessageSpec,
    /// Per-transaction ceiling on waiting for the peer's message. `None`
    /// falls back to the session deadline alone.
    pub response_timeout: Option<Duration>,
    /// Server side: scripted delay between receiving the request and
    /// emitting the response.
    pub response_delay: Option<Duration>,
}

impl Txn {
    pub fn new(key: impl Into<String>, request: MessageSpec, response: MessageSpec) -> Self {
        Self {
            key: key.into(),
            start_offset: Duration::ZERO,
            depends_on: Vec::new(),
            request,
            response,
            response_timeout: None,
            response_delay: None,
        }
    }

    pub fn starting_at(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn depending_on(mut self, keys: &[&str]) -> Self {
        self.depends_on = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }
}
