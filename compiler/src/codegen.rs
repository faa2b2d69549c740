// codegen.rs — Rendering of LIR to C and OpenCL C source text
//
// Also owns the target selection and the user-facing `CodegenOptions`
// (deserialized from the CLI's `--config` JSON file).
//
// Preconditions: LIR produced by `lower` / `kernel` for the same target.
// Postconditions: returns source text; four-space indentation, nested binary
//                 operands parenthesized.
// Failure modes: none (rendering is total).
// Side effects: none.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::kernel::ClVersion;
use crate::lir::*;
use crate::reduce::{GlobalStrategyKind, LocalStrategyKind};
use crate::types::NumericKind;

// ── Targets and options ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    C,
    OpenCl,
}

impl Target {
    pub fn name(self) -> &'static str {
        match self {
            Target::C => "c",
            Target::OpenCl => "opencl",
        }
    }

    pub fn type_name(self, kind: NumericKind) -> &'static str {
        match self {
            Target::C => kind.c_name(),
            Target::OpenCl => kind.cl_name(),
        }
    }
}

/// Vectorization hint emitted before loops proven free of dependences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IvdepStyle {
    #[default]
    None,
    Gcc,
    Intel,
    Clang,
}

impl IvdepStyle {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "none" => IvdepStyle::None,
            "gcc" => IvdepStyle::Gcc,
            "intel" => IvdepStyle::Intel,
            "clang" => IvdepStyle::Clang,
            _ => return None,
        })
    }

    pub fn pragma(self) -> Option<&'static str> {
        match self {
            IvdepStyle::None => None,
            IvdepStyle::Gcc => Some("GCC ivdep"),
            IvdepStyle::Intel => Some("ivdep"),
            IvdepStyle::Clang => Some("clang loop vectorize(assume_safety)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenOptions {
    pub ivdep: IvdepStyle,
    pub line_comments: bool,
    /// Extra identifiers that emitted names must avoid.
    pub blacklist: Vec<String>,
    pub sub_group_size: u32,
    /// Emulate subgroups with work-group local memory instead of the
    /// `cl_khr_subgroups` builtins.
    pub warp_fallback: bool,
    /// Allow the `auto` schedule to pick cooperative schedules.
    pub try_cooperative: bool,
    pub prefer_subgroup: bool,
    pub default_local_size: u64,
    pub reduction_strategies: Vec<GlobalStrategyKind>,
    pub local_reduction_strategies: Vec<LocalStrategyKind>,
    pub max_cl_version: Option<ClVersion>,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            ivdep: IvdepStyle::None,
            line_comments: false,
            blacklist: Vec::new(),
            sub_group_size: 32,
            warp_fallback: false,
            try_cooperative: false,
            prefer_subgroup: false,
            default_local_size: 128,
            reduction_strategies: vec![
                GlobalStrategyKind::PerWorkItem,
                GlobalStrategyKind::LocalMemory,
                GlobalStrategyKind::MatrixSet,
            ],
            local_reduction_strategies: vec![
                LocalStrategyKind::Simple,
                LocalStrategyKind::Interleaved,
                LocalStrategyKind::SubGroupBuiltin,
                LocalStrategyKind::WarpLocalMemory,
            ],
            max_cl_version: None,
        }
    }
}

const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "main", "NULL", "INFINITY", "NAN",
];

const C_LIBRARY: &[&str] = &[
    "abs", "llabs", "fabs", "floor", "ceil", "sqrt", "fmin", "fmax", "memcpy", "size_t",
    "int8_t", "int16_t", "int32_t", "int64_t", "uint8_t", "uint16_t", "uint32_t", "uint64_t",
    "kcc_index_error",
];

const OPENCL_WORDS: &[&str] = &[
    "kernel", "global", "local", "private", "constant", "__kernel", "__global", "__local",
    "__private", "__constant", "bool", "half", "uchar", "ushort", "uint", "ulong", "min", "max",
    "barrier", "sub_group_barrier", "get_global_id", "get_local_id", "get_group_id",
    "get_global_size", "get_local_size", "get_num_groups", "get_sub_group_id",
    "get_sub_group_local_id", "get_sub_group_size", "get_num_sub_groups",
    "CLK_LOCAL_MEM_FENCE", "CLK_GLOBAL_MEM_FENCE",
];

/// Identifiers emitted names must never take for `target`.
pub fn reserved_names(target: Target, options: &CodegenOptions) -> HashSet<String> {
    let mut names: HashSet<String> = C_KEYWORDS
        .iter()
        .chain(C_LIBRARY)
        .map(|s| s.to_string())
        .collect();
    if target == Target::OpenCl {
        names.extend(OPENCL_WORDS.iter().map(|s| s.to_string()));
    }
    names.extend(options.blacklist.iter().cloned());
    names
}

// ── Types ───────────────────────────────────────────────────────────────────

pub fn render_type(ty: &CType, target: Target) -> String {
    match ty {
        CType::Void => "void".into(),
        CType::Scalar(k) | CType::Array(k, _) => target.type_name(*k).into(),
        CType::SizeT => "size_t".into(),
        CType::Matrix(k) => format!("mat_{}*", k.mangle()),
        CType::Pointer(space, k) => match target {
            Target::OpenCl => format!("{} {}*", space.qualifier(), k.cl_name()),
            Target::C => format!("{}*", k.c_name()),
        },
        CType::Ref(inner) => format!("{}*", render_type(inner, target)),
    }
}

fn render_decl_head(ty: &CType, name: &str, target: Target) -> String {
    match ty {
        CType::Array(_, n) => format!("{} {name}[{n}]", render_type(ty, target)),
        _ => format!("{} {name}", render_type(ty, target)),
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

fn render_float(v: f64) -> String {
    if v.is_nan() {
        "NAN".into()
    } else if v.is_infinite() {
        if v > 0.0 {
            "INFINITY".into()
        } else {
            "(-INFINITY)".into()
        }
    } else {
        format!("{v:?}")
    }
}

pub fn render_expr(e: &CExpr, target: Target) -> String {
    match e {
        CExpr::Var(name) => name.clone(),
        CExpr::Int(n) => n.to_string(),
        CExpr::Float(v) => render_float(*v),
        CExpr::Raw(text) => text.clone(),
        CExpr::Unary(op, a) => {
            let sym = match op {
                UnOp::Neg => "-",
                UnOp::Not => "!",
            };
            format!("{sym}{}", render_prefix_operand(a, target))
        }
        CExpr::Binary(op, a, b) => format!(
            "{} {} {}",
            render_operand(a, target),
            op.symbol(),
            render_operand(b, target)
        ),
        CExpr::Call(name, args) => {
            let args: Vec<String> = args.iter().map(|a| render_expr(a, target)).collect();
            format!("{name}({})", args.join(", "))
        }
        CExpr::Index(base, index) => format!(
            "{}[{}]",
            render_prefix_operand(base, target),
            render_expr(index, target)
        ),
        CExpr::Field(base, field) => format!("{}->{field}", render_prefix_operand(base, target)),
        CExpr::Cast(ty, a) => format!(
            "({}){}",
            render_type(ty, target),
            render_prefix_operand(a, target)
        ),
        CExpr::Ternary(c, a, b) => format!(
            "{} ? {} : {}",
            render_operand(c, target),
            render_operand(a, target),
            render_operand(b, target)
        ),
        CExpr::AddrOf(a) => format!("&{}", render_prefix_operand(a, target)),
        CExpr::Deref(a) => format!("*{}", render_prefix_operand(a, target)),
    }
}

/// Operand of a binary or ternary operator.
fn render_operand(e: &CExpr, target: Target) -> String {
    match e {
        CExpr::Binary(..) | CExpr::Ternary(..) => format!("({})", render_expr(e, target)),
        _ => render_expr(e, target),
    }
}

/// Operand of a prefix operator, cast, index or field access.
fn render_prefix_operand(e: &CExpr, target: Target) -> String {
    match e {
        CExpr::Binary(..) | CExpr::Ternary(..) | CExpr::Cast(..) | CExpr::Unary(..) => {
            format!("({})", render_expr(e, target))
        }
        CExpr::Int(n) if *n < 0 => format!("({n})"),
        CExpr::Float(v) if *v < 0.0 => format!("({})", render_float(*v)),
        _ => render_expr(e, target),
    }
}

// ── Statements ──────────────────────────────────────────────────────────────

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

/// A statement without its trailing `;`, for `for` headers.
fn render_inline(s: &CStmt, target: Target) -> String {
    match s {
        CStmt::Decl {
            ty, name, init, ..
        } => match init {
            Some(e) => format!(
                "{} = {}",
                render_decl_head(ty, name, target),
                render_expr(e, target)
            ),
            None => render_decl_head(ty, name, target),
        },
        CStmt::Assign { target: t, value } => {
            format!("{} = {}", render_expr(t, target), render_expr(value, target))
        }
        CStmt::AddAssign { target: t, value } => match value {
            CExpr::Int(1) => format!("{}++", render_expr(t, target)),
            _ => format!("{} += {}", render_expr(t, target), render_expr(value, target)),
        },
        CStmt::Expr(e) => render_expr(e, target),
        other => {
            let mut text = String::new();
            render_stmt(&mut text, other, 0, target);
            text.trim_end().trim_end_matches(';').to_string()
        }
    }
}

pub fn render_stmt(out: &mut String, s: &CStmt, level: usize, target: Target) {
    match s {
        CStmt::Decl { space, .. } => {
            indent(out, level);
            if let Some(space) = space {
                let _ = write!(out, "{} ", space.qualifier());
            }
            let _ = writeln!(out, "{};", render_inline(s, target));
        }
        CStmt::Assign { .. } | CStmt::AddAssign { .. } | CStmt::Expr(_) => {
            indent(out, level);
            let _ = writeln!(out, "{};", render_inline(s, target));
        }
        CStmt::If {
            cond,
            then_body,
            else_body,
        } => {
            indent(out, level);
            let _ = writeln!(out, "if ({}) {{", render_expr(cond, target));
            render_body(out, then_body, level + 1, target);
            if !else_body.is_empty() {
                indent(out, level);
                out.push_str("} else {\n");
                render_body(out, else_body, level + 1, target);
            }
            indent(out, level);
            out.push_str("}\n");
        }
        CStmt::For {
            init,
            cond,
            step,
            body,
        } => {
            indent(out, level);
            let init = init
                .as_deref()
                .map(|s| render_inline(s, target))
                .unwrap_or_default();
            let step = step
                .as_deref()
                .map(|s| render_inline(s, target))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "for ({init}; {}; {step}) {{",
                render_expr(cond, target)
            );
            render_body(out, body, level + 1, target);
            indent(out, level);
            out.push_str("}\n");
        }
        CStmt::While { cond, body } => {
            indent(out, level);
            let _ = writeln!(out, "while ({}) {{", render_expr(cond, target));
            render_body(out, body, level + 1, target);
            indent(out, level);
            out.push_str("}\n");
        }
        CStmt::Break => {
            indent(out, level);
            out.push_str("break;\n");
        }
        CStmt::Return(value) => {
            indent(out, level);
            match value {
                Some(e) => {
                    let _ = writeln!(out, "return {};", render_expr(e, target));
                }
                None => out.push_str("return;\n"),
            }
        }
        CStmt::Comment(text) => {
            indent(out, level);
            let _ = writeln!(out, "// {text}");
        }
        CStmt::Pragma(text) => {
            indent(out, level);
            let _ = writeln!(out, "#pragma {text}");
        }
        CStmt::Barrier { scope, fence } => {
            indent(out, level);
            let fence = match fence {
                Fence::Local => "CLK_LOCAL_MEM_FENCE",
                Fence::Global => "CLK_GLOBAL_MEM_FENCE",
            };
            let call = match scope {
                BarrierScope::WorkGroup => "barrier",
                BarrierScope::SubGroup => "sub_group_barrier",
            };
            let _ = writeln!(out, "{call}({fence});");
        }
        CStmt::Block(body) => {
            indent(out, level);
            out.push_str("{\n");
            render_body(out, body, level + 1, target);
            indent(out, level);
            out.push_str("}\n");
        }
    }
}

fn render_body(out: &mut String, body: &[CStmt], level: usize, target: Target) {
    for s in body {
        render_stmt(out, s, level, target);
    }
}

// ── Functions and translation units ─────────────────────────────────────────

pub fn render_signature(f: &CFunction, target: Target) -> String {
    let mut sig = String::new();
    for q in &f.qualifiers {
        let _ = write!(sig, "{q} ");
    }
    for attr in &f.attributes {
        let _ = write!(sig, "__attribute__(({attr})) ");
    }
    let params: Vec<String> = f
        .params
        .iter()
        .map(|p| render_decl_head(&p.ty, &p.name, target))
        .collect();
    let params = if params.is_empty() {
        "void".to_string()
    } else {
        params.join(", ")
    };
    let _ = write!(
        sig,
        "{} {}({params})",
        render_type(&f.ret, target),
        f.name
    );
    sig
}

pub fn render_function(f: &CFunction, target: Target) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {{", render_signature(f, target));
    render_body(&mut out, &f.body, 1, target);
    out.push_str("}\n");
    out
}

/// A C translation unit: runtime include, prototypes of `externs` (defined
/// elsewhere, e.g. kernel launchers) and `functions`, then definitions.
pub fn render_c_unit(externs: &[&CFunction], functions: &[&CFunction]) -> String {
    let mut out = String::from("#include \"kcc_runtime.h\"\n");
    if externs.is_empty() && functions.is_empty() {
        return out;
    }
    out.push('\n');
    for f in externs.iter().chain(functions) {
        let _ = writeln!(out, "{};", render_signature(f, Target::C));
    }
    for f in functions {
        out.push('\n');
        out.push_str(&render_function(f, Target::C));
    }
    out
}

/// One OpenCL program: extension pragmas, helper functions, then the kernel.
pub fn render_opencl_unit(
    extensions: &[&str],
    helpers: &[&CFunction],
    kernel: &CFunction,
) -> String {
    let mut out = String::new();
    for ext in extensions {
        let _ = writeln!(out, "#pragma OPENCL EXTENSION {ext} : enable");
    }
    if !extensions.is_empty() {
        out.push('\n');
    }
    for f in helpers {
        out.push_str(&render_function(f, Target::OpenCl));
        out.push('\n');
    }
    out.push_str(&render_function(kernel, Target::OpenCl));
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────
