// error.rs — Fatal lowering errors
//
// Two classes abort generation of the enclosing function or kernel:
// program-shape errors (the upstream SSA contract was violated) and
// unsupported-feature errors (no strategy exists for a requested
// combination). Optimization findings are not errors; see `diag.rs`.

use thiserror::Error;

use crate::diag::{DiagCode, DiagLevel, Diagnostic};
use crate::id::BlockId;
use crate::ssa::InstrTag;

/// Which side of the contract failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ProgramShape,
    UnsupportedFeature,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LowerError {
    // ── Program shape ──
    #[error("no type recorded for variable `{0}`")]
    MissingType(String),

    #[error("block {0} is referenced but not defined")]
    MissingBlock(BlockId),

    #[error("phi `{output}` (named `{output_name}`) merges `{input}` which was named `{input_name}`")]
    PhiNameMismatch {
        output: String,
        output_name: String,
        input: String,
        input_name: String,
    },

    #[error("phi `{output}` interferes with its input `{input}`; input is not in conventional SSA form")]
    PhiInterference { output: String, input: String },

    #[error("simple_set output `{output}` was not allocated together with its input `{input}`")]
    AllocationFailure { output: String, input: String },

    #[error("variable `{name}` needs extra copies to both `{first}` and `{second}`")]
    ConflictingExtraCopy {
        name: String,
        first: String,
        second: String,
    },

    #[error("call to unknown function `{0}`")]
    UnknownCallee(String),

    #[error("`{0}` instructions are only valid inside kernels")]
    ParallelOnly(InstrTag),

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    // ── Unsupported features ──
    #[error("no {scope} reduction strategy supports {kind} reductions under schedule({schedule})")]
    NoReductionStrategy {
        scope: &'static str,
        kind: String,
        schedule: String,
    },

    #[error("schedule({schedule}) does not support {feature}")]
    UnsupportedSchedule { schedule: String, feature: String },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl LowerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LowerError::NoReductionStrategy { .. }
            | LowerError::UnsupportedSchedule { .. }
            | LowerError::Unsupported(_) => ErrorClass::UnsupportedFeature,
            _ => ErrorClass::ProgramShape,
        }
    }

    pub fn code(&self) -> DiagCode {
        DiagCode(match self {
            LowerError::MissingType(_) => "E0101",
            LowerError::MissingBlock(_) => "E0102",
            LowerError::PhiNameMismatch { .. } => "E0103",
            LowerError::PhiInterference { .. } => "E0104",
            LowerError::AllocationFailure { .. } => "E0105",
            LowerError::ConflictingExtraCopy { .. } => "E0106",
            LowerError::UnknownCallee(_) => "E0107",
            LowerError::ParallelOnly(_) => "E0108",
            LowerError::Malformed { .. } => "E0109",
            LowerError::NoReductionStrategy { .. } => "E0201",
            LowerError::UnsupportedSchedule { .. } => "E0202",
            LowerError::Unsupported(_) => "E0203",
        })
    }

    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        LowerError::Malformed {
            what,
            detail: detail.into(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::new(DiagLevel::Error, None, self.to_string()).with_code(self.code());
        match self.class() {
            ErrorClass::ProgramShape => {
                diag.with_hint(
                    "internal compiler error: the SSA input violates the backend contract",
                )
            }
            ErrorClass::UnsupportedFeature => diag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_split_shape_from_unsupported() {
        assert_eq!(
            LowerError::MissingType("x".into()).class(),
            ErrorClass::ProgramShape
        );
        let e = LowerError::NoReductionStrategy {
            scope: "local",
            kind: "sum".into(),
            schedule: "direct".into(),
        };
        assert_eq!(e.class(), ErrorClass::UnsupportedFeature);
        assert_eq!(
            e.to_string(),
            "no local reduction strategy supports sum reductions under schedule(direct)"
        );
    }

    #[test]
    fn diagnostic_carries_code() {
        let d = LowerError::UnknownCallee("foo".into()).to_diagnostic();
        assert_eq!(d.code, Some(DiagCode("E0107")));
        assert!(d.is_error());
        assert!(d.hint.is_some());
    }
}
