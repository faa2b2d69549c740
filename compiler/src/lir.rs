// lir.rs — Low-level IR: a small C / OpenCL C statement tree
//
// Lowering rules build `CStmt` lists; `codegen.rs` renders them. The tree is
// deliberately close to the emitted text so that rendering is a direct walk.
//
// Preconditions: none (types and constructors only).
// Postconditions: none.
// Failure modes: none.
// Side effects: none.

use indexmap::IndexSet;

use crate::types::{AddressSpace, NumericKind};

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CType {
    Void,
    Scalar(NumericKind),
    SizeT,
    /// Runtime heap matrix handle, `mat_<elem>*`.
    Matrix(NumericKind),
    /// Pointer into an OpenCL address space, e.g. `__global double*`.
    Pointer(AddressSpace, NumericKind),
    /// Fixed-size array, e.g. `double x[12]`.
    Array(NumericKind, u64),
    /// Host-side pointer to another type (output parameters).
    Ref(Box<CType>),
}

impl CType {
    pub fn elem(&self) -> Option<NumericKind> {
        match self {
            CType::Scalar(k) | CType::Matrix(k) | CType::Pointer(_, k) | CType::Array(k, _) => {
                Some(*k)
            }
            CType::Ref(inner) => inner.elem(),
            CType::Void | CType::SizeT => None,
        }
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CExpr {
    Var(String),
    Int(i64),
    Float(f64),
    /// Literal text emitted verbatim (`DBL_MAX`, `NULL`).
    Raw(String),
    Unary(UnOp, Box<CExpr>),
    Binary(BinOp, Box<CExpr>, Box<CExpr>),
    Call(String, Vec<CExpr>),
    Index(Box<CExpr>, Box<CExpr>),
    /// `base->field`
    Field(Box<CExpr>, String),
    Cast(CType, Box<CExpr>),
    Ternary(Box<CExpr>, Box<CExpr>, Box<CExpr>),
    AddrOf(Box<CExpr>),
    Deref(Box<CExpr>),
}

impl CExpr {
    pub fn var(name: impl Into<String>) -> Self {
        CExpr::Var(name.into())
    }

    pub fn bin(op: BinOp, lhs: CExpr, rhs: CExpr) -> Self {
        CExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn call(name: impl Into<String>, args: Vec<CExpr>) -> Self {
        CExpr::Call(name.into(), args)
    }

    pub fn index(base: CExpr, index: CExpr) -> Self {
        CExpr::Index(Box::new(base), Box::new(index))
    }

    pub fn field(base: CExpr, field: &str) -> Self {
        CExpr::Field(Box::new(base), field.to_string())
    }

    pub fn ternary(cond: CExpr, then: CExpr, otherwise: CExpr) -> Self {
        CExpr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    pub fn cast(ty: CType, e: CExpr) -> Self {
        CExpr::Cast(ty, Box::new(e))
    }

    pub fn addr_of(e: CExpr) -> Self {
        CExpr::AddrOf(Box::new(e))
    }

    /// `e - 1`, folded when `e` is an integer literal.
    pub fn minus_one(e: CExpr) -> Self {
        match e {
            CExpr::Int(n) => CExpr::Int(n - 1),
            other => CExpr::bin(BinOp::Sub, other, CExpr::Int(1)),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CExpr::Int(n) => Some(*n),
            _ => None,
        }
    }
}

// ── Statements ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fence {
    Local,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierScope {
    WorkGroup,
    SubGroup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CStmt {
    Decl {
        ty: CType,
        name: String,
        init: Option<CExpr>,
        space: Option<AddressSpace>,
    },
    Assign {
        target: CExpr,
        value: CExpr,
    },
    /// `target += value`; rendered as `target++` when `value` is `1`.
    AddAssign {
        target: CExpr,
        value: CExpr,
    },
    Expr(CExpr),
    If {
        cond: CExpr,
        then_body: Vec<CStmt>,
        else_body: Vec<CStmt>,
    },
    For {
        init: Option<Box<CStmt>>,
        cond: CExpr,
        step: Option<Box<CStmt>>,
        body: Vec<CStmt>,
    },
    While {
        cond: CExpr,
        body: Vec<CStmt>,
    },
    Break,
    Return(Option<CExpr>),
    Comment(String),
    Pragma(String),
    Barrier {
        scope: BarrierScope,
        fence: Fence,
    },
    Block(Vec<CStmt>),
}

impl CStmt {
    pub fn assign(name: impl Into<String>, value: CExpr) -> Self {
        CStmt::Assign {
            target: CExpr::Var(name.into()),
            value,
        }
    }

    pub fn decl(ty: CType, name: impl Into<String>, init: Option<CExpr>) -> Self {
        CStmt::Decl {
            ty,
            name: name.into(),
            init,
            space: None,
        }
    }

    pub fn if_then(cond: CExpr, then_body: Vec<CStmt>) -> Self {
        CStmt::If {
            cond,
            then_body,
            else_body: Vec::new(),
        }
    }

    pub fn for_loop(init: CStmt, cond: CExpr, step: CStmt, body: Vec<CStmt>) -> Self {
        CStmt::For {
            init: Some(Box::new(init)),
            cond,
            step: Some(Box::new(step)),
            body,
        }
    }

    pub fn increment(name: impl Into<String>, by: CExpr) -> Self {
        CStmt::AddAssign {
            target: CExpr::Var(name.into()),
            value: by,
        }
    }
}

// ── Functions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CParam {
    pub ty: CType,
    pub name: String,
}

impl CParam {
    pub fn new(ty: CType, name: impl Into<String>) -> Self {
        Self {
            ty,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CFunction {
    /// Leading qualifiers, e.g. `__kernel` or `static`.
    pub qualifiers: Vec<String>,
    /// `__attribute__((...))` contents, e.g. `reqd_work_group_size(64, 1, 1)`.
    pub attributes: Vec<String>,
    pub ret: CType,
    pub name: String,
    pub params: Vec<CParam>,
    pub body: Vec<CStmt>,
}

// ── Queries ─────────────────────────────────────────────────────────────────

/// Variables referenced anywhere in `stmts`, in first-reference order.
/// Names introduced by `Decl` statements are excluded.
pub fn referenced_vars(stmts: &[CStmt]) -> IndexSet<String> {
    let mut refs = IndexSet::new();
    let mut declared = IndexSet::new();
    for s in stmts {
        collect_stmt(s, &mut refs, &mut declared);
    }
    refs.retain(|name| !declared.contains(name));
    refs
}

fn collect_stmt(s: &CStmt, refs: &mut IndexSet<String>, declared: &mut IndexSet<String>) {
    match s {
        CStmt::Decl { name, init, .. } => {
            declared.insert(name.clone());
            if let Some(e) = init {
                collect_expr(e, refs);
            }
        }
        CStmt::Assign { target, value } | CStmt::AddAssign { target, value } => {
            collect_expr(target, refs);
            collect_expr(value, refs);
        }
        CStmt::Expr(e) => collect_expr(e, refs),
        CStmt::If {
            cond,
            then_body,
            else_body,
        } => {
            collect_expr(cond, refs);
            for s in then_body.iter().chain(else_body) {
                collect_stmt(s, refs, declared);
            }
        }
        CStmt::For {
            init,
            cond,
            step,
            body,
        } => {
            if let Some(init) = init {
                collect_stmt(init, refs, declared);
            }
            collect_expr(cond, refs);
            if let Some(step) = step {
                collect_stmt(step, refs, declared);
            }
            for s in body {
                collect_stmt(s, refs, declared);
            }
        }
        CStmt::While { cond, body } => {
            collect_expr(cond, refs);
            for s in body {
                collect_stmt(s, refs, declared);
            }
        }
        CStmt::Return(Some(e)) => collect_expr(e, refs),
        CStmt::Block(body) => {
            for s in body {
                collect_stmt(s, refs, declared);
            }
        }
        CStmt::Return(None)
        | CStmt::Break
        | CStmt::Comment(_)
        | CStmt::Pragma(_)
        | CStmt::Barrier { .. } => {}
    }
}

fn collect_expr(e: &CExpr, refs: &mut IndexSet<String>) {
    match e {
        CExpr::Var(name) => {
            refs.insert(name.clone());
        }
        CExpr::Int(_) | CExpr::Float(_) | CExpr::Raw(_) => {}
        CExpr::Unary(_, a)
        | CExpr::Field(a, _)
        | CExpr::Cast(_, a)
        | CExpr::AddrOf(a)
        | CExpr::Deref(a) => collect_expr(a, refs),
        CExpr::Binary(_, a, b) | CExpr::Index(a, b) => {
            collect_expr(a, refs);
            collect_expr(b, refs);
        }
        CExpr::Call(_, args) => {
            for a in args {
                collect_expr(a, refs);
            }
        }
        CExpr::Ternary(c, a, b) => {
            collect_expr(c, refs);
            collect_expr(a, refs);
            collect_expr(b, refs);
        }
    }
}

/// Count barriers in a statement tree (used by kernel tests).
pub fn count_barriers(stmts: &[CStmt]) -> usize {
    stmts
        .iter()
        .map(|s| match s {
            CStmt::Barrier { .. } => 1,
            CStmt::If {
                then_body,
                else_body,
                ..
            } => count_barriers(then_body) + count_barriers(else_body),
            CStmt::For { body, .. } | CStmt::While { body, .. } | CStmt::Block(body) => {
                count_barriers(body)
            }
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minus_one_folds_literals() {
        assert_eq!(CExpr::minus_one(CExpr::Int(3)), CExpr::Int(2));
        assert_eq!(
            CExpr::minus_one(CExpr::var("i")),
            CExpr::bin(BinOp::Sub, CExpr::var("i"), CExpr::Int(1))
        );
    }

    #[test]
    fn referenced_vars_skips_declared_names() {
        let body = vec![
            CStmt::decl(
                CType::SizeT,
                "gid",
                Some(CExpr::call("get_global_id", vec![CExpr::Int(0)])),
            ),
            CStmt::assign("x", CExpr::bin(BinOp::Add, CExpr::var("gid"), CExpr::var("n"))),
            CStmt::if_then(
                CExpr::var("c"),
                vec![CStmt::assign("y", CExpr::var("x"))],
            ),
        ];
        let refs: Vec<String> = referenced_vars(&body).into_iter().collect();
        assert_eq!(refs, vec!["x", "n", "c", "y"]);
    }

    #[test]
    fn barriers_are_counted_through_nesting() {
        let body = vec![
            CStmt::Barrier {
                scope: BarrierScope::WorkGroup,
                fence: Fence::Local,
            },
            CStmt::if_then(
                CExpr::var("c"),
                vec![CStmt::Barrier {
                    scope: BarrierScope::SubGroup,
                    fence: Fence::Global,
                }],
            ),
        ];
        assert_eq!(count_barriers(&body), 2);
    }
}
