//! Connection identifiers.
//!
//! Each endpoint labels its connection with an 8-byte identifier drawn from a
//! CSPRNG. The local identifier doubles as the qlog file stem, so it must be
//! unique among concurrently-open endpoints in this process; a process-wide
//! registry of live identifiers enforces that.

use std::collections::HashSet;
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Mutex, OnceLock};

use rand::RngCore;

/// An opaque 8-byte connection identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    bytes: [u8; Self::LEN],
}

impl ConnectionId {
    pub const LEN: usize = 8;

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex rendering, used as the qlog file stem.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(Self::LEN * 2);
        for b in self.bytes {
            write!(out, "{b:02x}").expect("writing to a String cannot fail");
        }
        out
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn live_set() -> &'static Mutex<HashSet<[u8; ConnectionId::LEN]>> {
    static LIVE: OnceLock<Mutex<HashSet<[u8; ConnectionId::LEN]>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// A locally-owned connection identifier, registered for process-wide
/// uniqueness. The registration is released on drop.
#[derive(Debug)]
pub struct LocalCid {
    id: ConnectionId,
}

impl LocalCid {
    /// Acquire a fresh identifier that no live endpoint in this process is
    /// using.
    pub fn acquire() -> Self {
        let mut live = live_set().lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id = ConnectionId::random();
            if live.insert(id.bytes) {
                return Self { id };
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for LocalCid {
    fn drop(&mut self) {
        let mut live = live_set().lock().unwrap_or_else(|e| e.into_inner());
        live.remove(&self.id.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_sixteen_lowercase_digits() {
        let id = ConnectionId::random();
        let hex = id.hex();
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_eq!(id.to_string(), hex);
    }

    #[test]
    fn fixed_bytes_render() {
        let id = ConnectionId {
            bytes: [0x00, 0x01, 0xab, 0xcd, 0xef, 0x10, 0x20, 0xff],
        };
        assert_eq!(id.hex(), "0001abcdef1020ff");
    }

    #[test]
    fn local_cids_are_distinct_while_live() {
        let cids: Vec<LocalCid> = (0..64).map(|_| LocalCid::acquire()).collect();
        let mut seen = HashSet::new();
        for cid in &cids {
            assert!(seen.insert(cid.id().hex()));
        }
    }

    #[test]
    fn registration_released_on_drop() {
        let cid = LocalCid::acquire();
        let bytes: [u8; ConnectionId::LEN] = cid.id().bytes;
        assert!(live_set().lock().unwrap().contains(&bytes));
        drop(cid);
        assert!(!live_set().lock().unwrap().contains(&bytes));
    }
}
