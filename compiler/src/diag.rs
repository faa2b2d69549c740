// diag.rs — Diagnostics model for non-fatal compiler findings
//
// Optimization opportunities and race warnings found while lowering are
// collected as `Diagnostic`s and surfaced once generation has succeeded.
// Fatal conditions do not use this type; see `error.rs`.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0102`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // Optimization opportunities (informational).
    pub const INTERVAL_SIGN_UNKNOWN: DiagCode = DiagCode("W0101");
    pub const INTERVAL_MAY_BE_ZERO: DiagCode = DiagCode("W0102");
    pub const SET_MAY_RESIZE: DiagCode = DiagCode("W0103");
    pub const SET_COPIES_INPUT: DiagCode = DiagCode("W0104");

    // Parallelization findings.
    pub const PARALLEL_LOOP_DEPENDENCE: DiagCode = DiagCode("W0201");
    pub const SCHEDULE_FALLBACK: DiagCode = DiagCode("W0202");
}

pub use codes::*;

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
    Info,
}

// ── Related line ─────────────────────────────────────────────────────────

/// A secondary source line providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedLine {
    pub line: Option<u32>,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining a finding.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub line: Option<u32>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic. `line` is the source line of the last `Line`
/// marker seen before the instruction that produced it.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub line: Option<u32>,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<RelatedLine>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related lines, or causes.
    pub fn new(level: DiagLevel, line: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            line,
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    /// Shorthand for an informational optimization-opportunity finding.
    pub fn info(code: DiagCode, line: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Info, line, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related line.
    pub fn with_related(mut self, line: Option<u32>, label: impl Into<String>) -> Self {
        self.related.push(RelatedLine {
            line,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, line: Option<u32>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            line,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
            DiagLevel::Info => "info",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        for cause in &self.cause_chain {
            write!(f, "\n  cause: {}", cause.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, None, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_line() {
        let d = Diagnostic::info(codes::INTERVAL_MAY_BE_ZERO, Some(12), "interval may be 0");
        assert_eq!(format!("{d}"), "info[W0102]: interval may be 0 (line 12)");
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::new(DiagLevel::Warning, Some(4), "loop carries a dependence")
            .with_code(codes::PARALLEL_LOOP_DEPENDENCE)
            .with_hint("remove the parallel annotation")
            .with_related(Some(2), "loop declared here")
            .with_cause("`out` written at two iterations", None);

        assert_eq!(d.code, Some(DiagCode("W0201")));
        assert_eq!(d.hint.as_deref(), Some("remove the parallel annotation"));
        assert_eq!(d.related.len(), 1);
        assert_eq!(d.cause_chain.len(), 1);
        assert!(!d.is_error());
        assert_eq!(
            format!("{d}"),
            "warning[W0201]: loop carries a dependence (line 4)\n  cause: `out` written at two iterations\n  hint: remove the parallel annotation"
        );
    }
}
