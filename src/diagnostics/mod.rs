//! Per-conversion diagnostics
//!
//! Every fallback the converter takes (skipped character, rounded duration,
//! tie turned into a slur, synthesized percussion mapping, ...) is recorded
//! here and returned alongside the output. Warnings never abort a
//! conversion; only a grammar-level syntax error does.

use serde::{Deserialize, Serialize};

/// Severity level for diagnostics
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recoverable problem, conversion continued via a documented fallback
    Warning,
    /// Informational note (e.g. an element the target format cannot express)
    Info,
}

/// A single diagnostic entry
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Kind identifier (e.g. "lexical_skip", "cross_pitch_tie", "duration_rounded")
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Source line (1-indexed), when known
    pub line: Option<usize>,
    /// Source column (1-indexed), when known
    pub col: Option<usize>,
}

impl Diagnostic {
    pub fn new(severity: Severity, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind: kind.into(),
            message: message.into(),
            line: None,
            col: None,
        }
    }

    /// Attach a source position (1-indexed line/column)
    pub fn at(mut self, line: usize, col: usize) -> Self {
        self.line = Some(line);
        self.col = Some(col);
        self
    }
}

/// Collection of diagnostics for one conversion call
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Diagnostics {
    pub entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        let d = Diagnostic::new(Severity::Warning, kind, message);
        log::warn!("{}", d.message);
        self.entries.push(d);
    }

    pub fn warn_at(
        &mut self,
        kind: impl Into<String>,
        message: impl Into<String>,
        line: usize,
        col: usize,
    ) {
        let d = Diagnostic::new(Severity::Warning, kind, message).at(line, col);
        log::warn!("{}:{}: {}", line, col, d.message);
        self.entries.push(d);
    }

    pub fn info(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        let d = Diagnostic::new(Severity::Info, kind, message);
        log::info!("{}", d.message);
        self.entries.push(d);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render all entries as one newline-separated buffer (CLI error stream)
    pub fn to_buffer(&self) -> String {
        let mut out = String::new();
        for d in &self.entries {
            match (d.line, d.col) {
                (Some(l), Some(c)) => out.push_str(&format!("{}:{}: {}\n", l, c, d.message)),
                _ => {
                    out.push_str(&d.message);
                    out.push('\n');
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_position() {
        let d = Diagnostic::new(Severity::Warning, "lexical_skip", "skipped '@'").at(3, 14);
        assert_eq!(d.line, Some(3));
        assert_eq!(d.col, Some(14));
    }

    #[test]
    fn test_buffer_rendering() {
        let mut diags = Diagnostics::new();
        diags.warn_at("lexical_skip", "skipped '@'", 2, 5);
        diags.info("unsupported", "figured bass dropped");
        let buf = diags.to_buffer();
        assert!(buf.contains("2:5: skipped '@'"));
        assert!(buf.contains("figured bass dropped"));
    }
}
