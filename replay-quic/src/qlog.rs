//! Process-wide qlog sink.
//!
//! When a qlog directory is configured at process init, every endpoint
//! appends one JSON event per line to `<dir>/<scid_hex>.sqlog`. Endpoints on
//! different threads may share the directory, so all writes are serialized
//! by one process-wide mutex. An unconfigured sink is inert and costs one
//! `Option` check per event.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use serde::Serialize;

use crate::error::Error;

fn sink_dir() -> &'static Mutex<Option<PathBuf>> {
    static DIR: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();
    DIR.get_or_init(|| Mutex::new(None))
}

/// Serializes qlog file writes across all endpoints in the process.
fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Configure the qlog directory. One-shot: an empty path leaves the sink
/// inert, re-configuring with the same path is a no-op, and re-configuring
/// with a different path is a configuration error.
pub fn configure(dir: &Path) -> Result<(), Error> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    let mut guard = sink_dir().lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        None => {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Config(format!("qlog dir {}: {e}", dir.display())))?;
            *guard = Some(dir.to_path_buf());
            Ok(())
        }
        Some(existing) if existing == dir => Ok(()),
        Some(existing) => Err(Error::Config(format!(
            "qlog dir already configured as {}",
            existing.display()
        ))),
    }
}

/// Whether a qlog directory has been configured.
pub fn is_enabled() -> bool {
    sink_dir()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_some()
}

// ── Events ──────────────────────────────────────────────────────────

/// One qlog event line. `time` is milliseconds since the trace started.
#[derive(Debug, Serialize)]
pub struct QlogEvent {
    pub time: f32,
    #[serde(flatten)]
    pub data: EventData,
}

/// The event vocabulary this endpoint emits (qlog QUIC event drafts).
#[derive(Debug, Serialize)]
#[serde(tag = "name", content = "data")]
pub enum EventData {
    #[serde(rename = "connectivity:connection_started")]
    ConnectionStarted {
        src_cid: String,
        dst_cid: String,
        local: String,
        remote: String,
    },

    #[serde(rename = "connectivity:connection_closed")]
    ConnectionClosed { trigger: String },

    #[serde(rename = "transport:datagrams_sent")]
    DatagramsSent { count: u64, raw_bytes: u64 },

    #[serde(rename = "transport:datagrams_received")]
    DatagramsReceived { count: u64, raw_bytes: u64 },
}

// ── Per-endpoint writer ─────────────────────────────────────────────

/// Per-endpoint qlog file handle, keyed by the endpoint's SCID.
///
/// The file is created on the first event (roughly the first handshake
/// byte) and closed by [`finish`](QlogWriter::finish) or drop.
#[derive(Debug)]
pub struct QlogWriter {
    path: Option<PathBuf>,
    file: Option<File>,
    start: Instant,
}

impl QlogWriter {
    /// Create a writer for the endpoint with the given SCID stem. Inert when
    /// no qlog directory is configured.
    pub(crate) fn create(scid_hex: &str) -> Self {
        let path = sink_dir()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|dir| dir.join(format!("{scid_hex}.sqlog")));
        Self {
            path,
            file: None,
            start: Instant::now(),
        }
    }

    /// Append one event line.
    pub(crate) fn write(&mut self, data: EventData) {
        let Some(path) = &self.path else {
            return;
        };

        let _guard = write_lock().lock().unwrap_or_else(|e| e.into_inner());

        if self.file.is_none() {
            match File::create(path) {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    log::warn!("qlog: cannot create {}: {e}", path.display());
                    self.path = None;
                    return;
                }
            }
        }

        let event = QlogEvent {
            time: self.start.elapsed().as_secs_f32() * 1000.0,
            data,
        };
        let file = self.file.as_mut().expect("file opened above");
        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    log::warn!("qlog: write failed: {e}");
                    self.path = None;
                    self.file = None;
                }
            }
            Err(e) => log::warn!("qlog: serialization failed: {e}"),
        }
    }

    /// Write a final event and close the file.
    pub(crate) fn finish(&mut self, data: EventData) {
        self.write(data);
        self.file = None;
        self.path = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // configure() is process-global, so the whole lifecycle lives in one test.
    #[test]
    fn sink_lifecycle() {
        // Inert until configured: writers swallow events.
        let mut inert = QlogWriter::create("00ff00ff00ff00ff");
        inert.write(EventData::DatagramsSent {
            count: 1,
            raw_bytes: 1200,
        });
        assert!(inert.path.is_none());

        // Empty path keeps the sink inert.
        configure(Path::new("")).unwrap();
        assert!(!is_enabled());

        let dir = std::env::temp_dir().join(format!("replay-qlog-{}", std::process::id()));
        configure(&dir).unwrap();
        assert!(is_enabled());
        // Same dir again is fine; a different dir is refused.
        configure(&dir).unwrap();
        assert!(configure(Path::new("/nonexistent-other")).is_err());

        let mut writer = QlogWriter::create("0102030405060708");
        writer.write(EventData::ConnectionStarted {
            src_cid: "0102030405060708".into(),
            dst_cid: "aaaaaaaaaaaaaaaa".into(),
            local: "127.0.0.1:1".into(),
            remote: "127.0.0.1:2".into(),
        });
        writer.finish(EventData::ConnectionClosed {
            trigger: "clean".into(),
        });

        let contents =
            std::fs::read_to_string(dir.join("0102030405060708.sqlog")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("name").is_some());
            assert!(v.get("time").is_some());
        }
        assert!(lines[0].contains("connectivity:connection_started"));
        assert!(lines[1].contains("connectivity:connection_closed"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
