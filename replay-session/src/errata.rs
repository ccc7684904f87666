//! Accumulated diagnostics.
//!
//! A replay run keeps going past most problems: a mismatched status is
//! worth reporting, not worth abandoning the remaining transactions over.
//! `Errata` collects severity-tagged notes in order; `Rv<T>` pairs a return
//! value with the notes the operation produced.

use std::fmt;

/// Note severities, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Replay narration, shown only at high verbosity.
    Diag,
    Info,
    /// Something off, replay continues.
    Warn,
    /// The run cannot be called clean.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Diag => "diag",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        })
    }
}

/// One diagnostic note.
#[derive(Debug, Clone)]
pub struct Note {
    pub severity: Severity,
    pub text: String,
}

/// An ordered accumulation of notes.
#[derive(Debug, Clone, Default)]
pub struct Errata {
    notes: Vec<Note>,
}

impl Errata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&mut self, severity: Severity, text: impl Into<String>) {
        self.notes.push(Note {
            severity,
            text: text.into(),
        });
    }

    pub fn diag(&mut self, text: impl Into<String>) {
        self.note(Severity::Diag, text);
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.note(Severity::Info, text);
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        self.note(Severity::Warn, text);
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.note(Severity::Error, text);
    }

    /// Append all of `other`'s notes, preserving order.
    pub fn merge(&mut self, other: Errata) {
        self.notes.extend(other.notes);
    }

    /// The most severe note, if any.
    pub fn severity(&self) -> Option<Severity> {
        self.notes.iter().map(|n| n.severity).max()
    }

    /// No error-severity notes recorded.
    pub fn is_ok(&self) -> bool {
        self.severity() < Some(Severity::Error)
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }
}

impl fmt::Display for Errata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for note in &self.notes {
            writeln!(f, "[{}] {}", note.severity, note.text)?;
        }
        Ok(())
    }
}

/// A return value together with the diagnostics producing it raised.
#[derive(Debug)]
pub struct Rv<T> {
    pub value: T,
    pub errata: Errata,
}

impl<T> Rv<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            errata: Errata::new(),
        }
    }

    pub fn with_errata(value: T, errata: Errata) -> Self {
        Self { value, errata }
    }

    pub fn is_ok(&self) -> bool {
        self.errata.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders() {
        assert!(Severity::Diag < Severity::Info);
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
    }

    #[test]
    fn empty_is_ok() {
        let errata = Errata::new();
        assert!(errata.is_ok());
        assert_eq!(errata.severity(), None);
        assert!(errata.is_empty());
    }

    #[test]
    fn error_note_flips_is_ok() {
        let mut errata = Errata::new();
        errata.warn("status drifted");
        assert!(errata.is_ok());
        errata.error("body mismatch");
        assert!(!errata.is_ok());
        assert_eq!(errata.severity(), Some(Severity::Error));
        assert_eq!(errata.len(), 2);
    }

    #[test]
    fn merge_preserves_order() {
        let mut a = Errata::new();
        a.info("first");
        let mut b = Errata::new();
        b.warn("second");
        a.merge(b);
        assert_eq!(a.notes()[0].text, "first");
        assert_eq!(a.notes()[1].text, "second");
    }

    #[test]
    fn display_renders_one_line_per_note() {
        let mut errata = Errata::new();
        errata.info("alpha");
        errata.error("beta");
        let rendered = errata.to_string();
        assert_eq!(rendered, "[info] alpha\n[error] beta\n");
    }
}
