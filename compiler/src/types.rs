// types.rs — Semantic variable types of the typed SSA input
//
// Scalars carry a numeric kind and an optional known-constant refinement.
// Matrices carry element kind, a partially known shape, and a storage class
// that decides how the backend materializes them (runtime heap matrix, fixed
// array, or device buffer).
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Numeric kinds ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Single,
    Double,
    Bool,
}

impl NumericKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "int8" => NumericKind::Int8,
            "int16" => NumericKind::Int16,
            "int32" => NumericKind::Int32,
            "int64" => NumericKind::Int64,
            "uint8" => NumericKind::UInt8,
            "uint16" => NumericKind::UInt16,
            "uint32" => NumericKind::UInt32,
            "uint64" => NumericKind::UInt64,
            "single" => NumericKind::Single,
            "double" => NumericKind::Double,
            "bool" => NumericKind::Bool,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            NumericKind::Int8 => "int8",
            NumericKind::Int16 => "int16",
            NumericKind::Int32 => "int32",
            NumericKind::Int64 => "int64",
            NumericKind::UInt8 => "uint8",
            NumericKind::UInt16 => "uint16",
            NumericKind::UInt32 => "uint32",
            NumericKind::UInt64 => "uint64",
            NumericKind::Single => "single",
            NumericKind::Double => "double",
            NumericKind::Bool => "bool",
        }
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    pub fn is_float(self) -> bool {
        matches!(self, NumericKind::Single | NumericKind::Double)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            NumericKind::Int8
                | NumericKind::Int16
                | NumericKind::Int32
                | NumericKind::Int64
                | NumericKind::Single
                | NumericKind::Double
        )
    }

    /// C spelling. Shared by the C and OpenCL targets except for 64-bit ints.
    pub fn c_name(self) -> &'static str {
        match self {
            NumericKind::Int8 => "int8_t",
            NumericKind::Int16 => "int16_t",
            NumericKind::Int32 => "int32_t",
            NumericKind::Int64 => "int64_t",
            NumericKind::UInt8 => "uint8_t",
            NumericKind::UInt16 => "uint16_t",
            NumericKind::UInt32 => "uint32_t",
            NumericKind::UInt64 => "uint64_t",
            NumericKind::Single => "float",
            NumericKind::Double => "double",
            NumericKind::Bool => "int",
        }
    }

    pub fn cl_name(self) -> &'static str {
        match self {
            NumericKind::Int8 => "char",
            NumericKind::Int16 => "short",
            NumericKind::Int32 => "int",
            NumericKind::Int64 => "long",
            NumericKind::UInt8 => "uchar",
            NumericKind::UInt16 => "ushort",
            NumericKind::UInt32 => "uint",
            NumericKind::UInt64 => "ulong",
            NumericKind::Single => "float",
            NumericKind::Double => "double",
            NumericKind::Bool => "int",
        }
    }

    /// Name fragment used by runtime helpers (`mat_double_zeros`).
    pub fn mangle(self) -> &'static str {
        match self {
            NumericKind::Single => "float",
            other => other.name(),
        }
    }

    /// Largest representable value, as emitted source text.
    pub fn max_literal(self) -> &'static str {
        match self {
            NumericKind::Int8 => "127",
            NumericKind::Int16 => "32767",
            NumericKind::Int32 => "2147483647",
            NumericKind::Int64 => "9223372036854775807L",
            NumericKind::UInt8 => "255",
            NumericKind::UInt16 => "65535",
            NumericKind::UInt32 => "4294967295u",
            NumericKind::UInt64 => "18446744073709551615uL",
            NumericKind::Single => "INFINITY",
            NumericKind::Double => "INFINITY",
            NumericKind::Bool => "1",
        }
    }

    /// Smallest representable value, as emitted source text.
    pub fn min_literal(self) -> &'static str {
        match self {
            NumericKind::Int8 => "(-128)",
            NumericKind::Int16 => "(-32768)",
            NumericKind::Int32 => "(-2147483647 - 1)",
            NumericKind::Int64 => "(-9223372036854775807L - 1)",
            NumericKind::UInt8
            | NumericKind::UInt16
            | NumericKind::UInt32
            | NumericKind::UInt64
            | NumericKind::Bool => "0",
            NumericKind::Single | NumericKind::Double => "(-INFINITY)",
        }
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Constants ───────────────────────────────────────────────────────────────

/// A compile-time known scalar value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
}

impl Constant {
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Constant::Int(v) => Some(v),
            Constant::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Some(v as i64),
            Constant::Float(_) => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Constant::Int(v) => v as f64,
            Constant::Float(v) => v,
        }
    }

    pub fn is_zero(self) -> bool {
        self.as_f64() == 0.0
    }

    pub fn is_negative(self) -> bool {
        self.as_f64() < 0.0
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{v}"),
            Constant::Float(v) => write!(f, "{v:?}"),
        }
    }
}

// ── Variable types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarType {
    pub kind: NumericKind,
    pub constant: Option<Constant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSpace {
    Global,
    Local,
    Private,
}

impl AddressSpace {
    pub fn qualifier(self) -> &'static str {
        match self {
            AddressSpace::Global => "__global",
            AddressSpace::Local => "__local",
            AddressSpace::Private => "__private",
        }
    }
}

/// How a matrix value is materialized in emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// Heap matrix managed by the runtime library (`mat_double*`).
    Dynamic,
    /// Fixed-size array; the shape must be fully known.
    Static,
    /// Raw device buffer without size information.
    Buffer,
    /// Device buffer accompanied by numel and per-dimension size arguments.
    Sized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixType {
    pub elem: NumericKind,
    /// One entry per dimension; `None` is unknown at compile time.
    pub shape: Vec<Option<u64>>,
    pub storage: Storage,
}

impl MatrixType {
    pub fn known_numel(&self) -> Option<u64> {
        self.shape.iter().try_fold(1u64, |acc, d| d.map(|d| acc * d))
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarType {
    Scalar(ScalarType),
    Matrix(MatrixType),
}

impl VarType {
    pub fn scalar(kind: NumericKind) -> Self {
        VarType::Scalar(ScalarType {
            kind,
            constant: None,
        })
    }

    pub fn constant(kind: NumericKind, value: Constant) -> Self {
        VarType::Scalar(ScalarType {
            kind,
            constant: Some(value),
        })
    }

    pub fn matrix(elem: NumericKind, shape: Vec<Option<u64>>, storage: Storage) -> Self {
        VarType::Matrix(MatrixType {
            elem,
            shape,
            storage,
        })
    }

    /// Element kind for matrices, value kind for scalars.
    pub fn elem(&self) -> NumericKind {
        match self {
            VarType::Scalar(s) => s.kind,
            VarType::Matrix(m) => m.elem,
        }
    }

    pub fn constant_value(&self) -> Option<Constant> {
        match self {
            VarType::Scalar(s) => s.constant,
            VarType::Matrix(_) => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&MatrixType> {
        match self {
            VarType::Matrix(m) => Some(m),
            VarType::Scalar(_) => None,
        }
    }

    pub fn is_matrix(&self) -> bool {
        matches!(self, VarType::Matrix(_))
    }

    /// Two types share storage iff they materialize to the same target type.
    /// Constant refinements are ignored.
    pub fn storage_compatible(&self, other: &VarType) -> bool {
        match (self, other) {
            (VarType::Scalar(a), VarType::Scalar(b)) => a.kind == b.kind,
            (VarType::Matrix(a), VarType::Matrix(b)) => {
                a.elem == b.elem
                    && a.storage == b.storage
                    && (a.storage != Storage::Static || a.shape == b.shape)
            }
            _ => false,
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::Scalar(s) => {
                write!(f, "{}", s.kind)?;
                if let Some(c) = s.constant {
                    write!(f, "({c})")?;
                }
                Ok(())
            }
            VarType::Matrix(m) => {
                write!(f, "{}[", m.elem)?;
                for (i, d) in m.shape.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match d {
                        Some(n) => write!(f, "{n}")?,
                        None => write!(f, "?")?,
                    }
                }
                write!(f, "]")?;
                match m.storage {
                    Storage::Dynamic => Ok(()),
                    Storage::Static => write!(f, " static"),
                    Storage::Buffer => write!(f, " buffer"),
                    Storage::Sized => write!(f, " sized"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(VarType::scalar(NumericKind::Double).to_string(), "double");
        assert_eq!(
            VarType::constant(NumericKind::Int32, Constant::Int(3)).to_string(),
            "int32(3)"
        );
        let m = VarType::matrix(NumericKind::Double, vec![None, Some(1)], Storage::Dynamic);
        assert_eq!(m.to_string(), "double[?, 1]");
        let s = VarType::matrix(NumericKind::Single, vec![Some(4)], Storage::Static);
        assert_eq!(s.to_string(), "single[4] static");
    }

    #[test]
    fn known_numel_requires_full_shape() {
        let full = MatrixType {
            elem: NumericKind::Double,
            shape: vec![Some(3), Some(4)],
            storage: Storage::Static,
        };
        assert_eq!(full.known_numel(), Some(12));
        let partial = MatrixType {
            shape: vec![Some(3), None],
            ..full
        };
        assert_eq!(partial.known_numel(), None);
    }

    #[test]
    fn constants_do_not_affect_storage_compatibility() {
        let a = VarType::constant(NumericKind::Int32, Constant::Int(1));
        let b = VarType::scalar(NumericKind::Int32);
        assert!(a.storage_compatible(&b));
        assert!(!a.storage_compatible(&VarType::scalar(NumericKind::Double)));
    }

    #[test]
    fn float_constants_convert_when_integral() {
        assert_eq!(Constant::Float(4.0).as_i64(), Some(4));
        assert_eq!(Constant::Float(4.5).as_i64(), None);
        assert!(Constant::Int(-2).is_negative());
    }
}
