// interp.rs — Reference simulator for generated OpenCL kernels
//
// Executes kernel LIR directly: work-groups run one after another, and the
// work-items of a group run on their own threads so that barriers and
// collective builtins have lock-step semantics.
//
// Preconditions: `args` match the kernel parameters in order; global sizes
//                are multiples of local sizes.
// Postconditions: `SimOutput` holds the final contents of every global
//                 buffer, keyed by parameter name.
// Failure modes: `SimError` for unknown names, out-of-bounds indices,
//                unsupported calls, runaway loops and bad geometry. A failing
//                work-item poisons the barriers of its group instead of
//                leaving the others blocked.
// Side effects: spawns scoped threads; no I/O.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::lir::{BarrierScope, BinOp, CExpr, CFunction, CStmt, CType, UnOp};
use crate::types::{AddressSpace, NumericKind};

// ── Values and arguments ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Value::Int(v) => v,
            Value::Float(v) => v as i64,
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Int(v) => v != 0,
            Value::Float(v) => v != 0.0,
        }
    }

    fn zero(kind: NumericKind) -> Self {
        if kind.is_float() {
            Value::Float(0.0)
        } else {
            Value::Int(0)
        }
    }

    fn convert(self, kind: NumericKind) -> Self {
        if kind.is_float() {
            Value::Float(self.as_f64())
        } else {
            Value::Int(self.as_i64())
        }
    }
}

/// One kernel argument, in parameter order.
#[derive(Debug, Clone)]
pub enum SimArg {
    Scalar(Value),
    /// Contents of a `__global` buffer.
    Global(Vec<Value>),
    /// Element count of a `__local` buffer, allocated per work-group.
    Local(usize),
}

impl SimArg {
    pub fn int(v: i64) -> Self {
        SimArg::Scalar(Value::Int(v))
    }

    pub fn float(v: f64) -> Self {
        SimArg::Scalar(Value::Float(v))
    }

    pub fn floats(values: &[f64]) -> Self {
        SimArg::Global(values.iter().map(|v| Value::Float(*v)).collect())
    }

    pub fn zeros(len: usize) -> Self {
        SimArg::Global(vec![Value::Float(0.0); len])
    }
}

/// Launch geometry.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub global: Vec<u64>,
    pub local: Vec<u64>,
    pub sub_group_size: u32,
    /// Iterations a single loop may run before it counts as runaway.
    pub max_loop_iterations: u64,
}

impl LaunchConfig {
    pub fn new(global: Vec<u64>, local: Vec<u64>) -> Self {
        Self {
            global,
            local,
            sub_group_size: 32,
            max_loop_iterations: 1 << 24,
        }
    }

    pub fn with_sub_group_size(mut self, size: u32) -> Self {
        self.sub_group_size = size;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimOutput {
    pub globals: IndexMap<String, Vec<Value>>,
}

impl SimOutput {
    pub fn floats(&self, name: &str) -> Option<Vec<f64>> {
        self.globals
            .get(name)
            .map(|b| b.iter().map(|v| v.as_f64()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("unknown buffer `{0}`")]
    UnknownBuffer(String),

    #[error("index {index} out of bounds for `{buffer}` of length {len}")]
    OutOfBounds {
        buffer: String,
        index: i64,
        len: usize,
    },

    #[error("unsupported call `{0}`")]
    UnsupportedCall(String),

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("loop exceeded {limit} iterations")]
    RunawayLoop { limit: u64 },

    #[error("argument mismatch: {0}")]
    Arguments(String),

    #[error("invalid launch geometry: {0}")]
    Geometry(String),

    #[error("another work-item of the group failed")]
    Poisoned,

    #[error("work-item thread panicked")]
    Panicked,
}

// ── Synchronization ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fold {
    Add,
    Min,
    Max,
}

impl Fold {
    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Fold::Add),
            "min" => Some(Fold::Min),
            "max" => Some(Fold::Max),
            _ => None,
        }
    }

    fn apply(self, a: Value, b: Value) -> Value {
        match (self, a, b) {
            (Fold::Add, Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(y)),
            (Fold::Min, Value::Int(x), Value::Int(y)) => Value::Int(x.min(y)),
            (Fold::Max, Value::Int(x), Value::Int(y)) => Value::Int(x.max(y)),
            (Fold::Add, x, y) => Value::Float(x.as_f64() + y.as_f64()),
            (Fold::Min, x, y) => Value::Float(x.as_f64().min(y.as_f64())),
            (Fold::Max, x, y) => Value::Float(x.as_f64().max(y.as_f64())),
        }
    }
}

#[derive(Debug)]
struct RendezvousState {
    participants: usize,
    arrived: usize,
    generation: u64,
    slots: Vec<Option<Value>>,
    fold: Option<Fold>,
    result: Option<Value>,
    poisoned: bool,
}

impl RendezvousState {
    fn release(&mut self) {
        let fold = self.fold.take();
        self.result = fold.and_then(|f| {
            self.slots.iter().flatten().copied().reduce(|a, b| f.apply(a, b))
        });
        self.slots.iter_mut().for_each(|s| *s = None);
        self.arrived = 0;
        self.generation += 1;
    }
}

/// Barrier with an optional contributed value per member. Members that
/// finish retire, so the remaining ones are not left waiting.
#[derive(Debug)]
struct Rendezvous {
    state: Mutex<RendezvousState>,
    cv: Condvar,
}

impl Rendezvous {
    fn new(participants: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                participants,
                arrived: 0,
                generation: 0,
                slots: vec![None; participants],
                fold: None,
                result: None,
                poisoned: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RendezvousState>, SimError> {
        self.state.lock().map_err(|_| SimError::Poisoned)
    }

    fn arrive(
        &self,
        contribution: Option<(usize, Value, Fold)>,
    ) -> Result<Option<Value>, SimError> {
        let mut st = self.lock()?;
        if st.poisoned {
            return Err(SimError::Poisoned);
        }
        if let Some((slot, value, fold)) = contribution {
            if let Some(s) = st.slots.get_mut(slot) {
                *s = Some(value);
            }
            st.fold = Some(fold);
        }
        st.arrived += 1;
        let generation = st.generation;
        if st.arrived >= st.participants {
            st.release();
            self.cv.notify_all();
            return Ok(st.result);
        }
        while st.generation == generation && !st.poisoned {
            st = self.cv.wait(st).map_err(|_| SimError::Poisoned)?;
        }
        if st.generation == generation {
            return Err(SimError::Poisoned);
        }
        Ok(st.result)
    }

    fn retire(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.participants = st.participants.saturating_sub(1);
            if st.arrived > 0 && st.arrived >= st.participants {
                st.release();
                self.cv.notify_all();
            }
        }
    }

    fn poison(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.poisoned = true;
        }
        self.cv.notify_all();
    }
}

type Memory = Arc<Mutex<Vec<Value>>>;

fn memory(values: Vec<Value>) -> Memory {
    Arc::new(Mutex::new(values))
}

/// State shared by the work-items of one group.
struct GroupShared {
    work_group: Rendezvous,
    sub_groups: Vec<Rendezvous>,
    locals: HashMap<String, Memory>,
    /// `__local` arrays declared inside the kernel body.
    declared: Mutex<HashMap<String, Memory>>,
}

impl GroupShared {
    fn poison(&self) {
        self.work_group.poison();
        self.sub_groups.iter().for_each(Rendezvous::poison);
    }
}

// ── Work-items ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Ids {
    global: [u64; 3],
    local: [u64; 3],
    group: [u64; 3],
    global_size: [u64; 3],
    local_size: [u64; 3],
    num_groups: [u64; 3],
    linear_local: u64,
    sub_group_size: u64,
    num_sub_groups: u64,
}

impl Ids {
    fn sub_group_id(&self) -> u64 {
        self.linear_local / self.sub_group_size
    }

    fn sub_group_local_id(&self) -> u64 {
        self.linear_local % self.sub_group_size
    }

    /// Size of this item's subgroup; the last one may be partial.
    fn own_sub_group_size(&self) -> u64 {
        let total = self.local_size.iter().product::<u64>();
        let start = self.sub_group_id() * self.sub_group_size;
        (total - start).min(self.sub_group_size)
    }
}

enum Flow {
    Next,
    Break,
    Return,
}

struct WorkItem<'g> {
    ids: Ids,
    group: &'g GroupShared,
    scalars: HashMap<String, Value>,
    arrays: HashMap<String, Memory>,
    limit: u64,
}

impl<'g> WorkItem<'g> {
    fn lookup(&self, name: &str) -> Result<Value, SimError> {
        self.scalars
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownVariable(name.to_string()))
    }

    fn buffer<'a>(&'a self, base: &'a CExpr) -> Result<(&'a str, &'a Memory), SimError> {
        match base {
            CExpr::Var(name) => self
                .arrays
                .get(name)
                .map(|m| (name.as_str(), m))
                .ok_or_else(|| SimError::UnknownBuffer(name.clone())),
            other => Err(SimError::Unsupported(format!("indexing into {other:?}"))),
        }
    }

    fn slot(name: &str, index: Value, len: usize) -> Result<usize, SimError> {
        let i = index.as_i64();
        if i < 0 || i as usize >= len {
            return Err(SimError::OutOfBounds {
                buffer: name.to_string(),
                index: i,
                len,
            });
        }
        Ok(i as usize)
    }

    fn dim(args: &[Value]) -> usize {
        args.first().map(|v| v.as_i64()).unwrap_or(0).clamp(0, 3) as usize
    }

    fn builtin(&self, name: &str, args: &[Value]) -> Result<Option<Value>, SimError> {
        let ids = &self.ids;
        let at = |a: &[u64; 3], fallback: u64| {
            let d = Self::dim(args);
            Value::Int(if d < 3 { a[d] as i64 } else { fallback as i64 })
        };
        let v = match name {
            "get_global_id" => at(&ids.global, 0),
            "get_local_id" => at(&ids.local, 0),
            "get_group_id" => at(&ids.group, 0),
            "get_global_size" => at(&ids.global_size, 1),
            "get_local_size" => at(&ids.local_size, 1),
            "get_num_groups" => at(&ids.num_groups, 1),
            "get_sub_group_size" => Value::Int(ids.own_sub_group_size() as i64),
            "get_num_sub_groups" => Value::Int(ids.num_sub_groups as i64),
            "get_sub_group_id" => Value::Int(ids.sub_group_id() as i64),
            "get_sub_group_local_id" => Value::Int(ids.sub_group_local_id() as i64),
            "min" | "fmin" | "max" | "fmax" => {
                let [a, b] = args else {
                    return Err(SimError::Arguments(format!("`{name}` takes two arguments")));
                };
                let fold = if name.ends_with("min") { Fold::Min } else { Fold::Max };
                fold.apply(*a, *b)
            }
            "fabs" | "abs" => match args.first() {
                Some(Value::Int(x)) => Value::Int(x.wrapping_abs()),
                Some(x) => Value::Float(x.as_f64().abs()),
                None => return Err(SimError::Arguments(format!("`{name}` takes one argument"))),
            },
            "sqrt" | "floor" | "ceil" => {
                let x = args
                    .first()
                    .ok_or_else(|| SimError::Arguments(format!("`{name}` takes one argument")))?
                    .as_f64();
                Value::Float(match name {
                    "sqrt" => x.sqrt(),
                    "floor" => x.floor(),
                    _ => x.ceil(),
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(v))
    }

    fn collective(&self, name: &str, args: &[Value]) -> Result<Option<Value>, SimError> {
        let (rendezvous, slot, op) = if let Some(op) = name.strip_prefix("work_group_reduce_") {
            (&self.group.work_group, self.ids.linear_local, op)
        } else if let Some(op) = name.strip_prefix("sub_group_reduce_") {
            let sg = self.ids.sub_group_id() as usize;
            let r = self
                .group
                .sub_groups
                .get(sg)
                .ok_or_else(|| SimError::Geometry(format!("no subgroup {sg}")))?;
            (r, self.ids.sub_group_local_id(), op)
        } else {
            return Ok(None);
        };
        let fold =
            Fold::from_suffix(op).ok_or_else(|| SimError::UnsupportedCall(name.to_string()))?;
        let value = *args
            .first()
            .ok_or_else(|| SimError::Arguments(format!("`{name}` takes one argument")))?;
        rendezvous
            .arrive(Some((slot as usize, value, fold)))?
            .map(Some)
            .ok_or(SimError::Poisoned)
    }

    fn eval(&self, e: &CExpr) -> Result<Value, SimError> {
        Ok(match e {
            CExpr::Var(name) => self.lookup(name)?,
            CExpr::Int(n) => Value::Int(*n),
            CExpr::Float(v) => Value::Float(*v),
            CExpr::Raw(text) => raw_literal(text)?,
            CExpr::Unary(op, a) => {
                let a = self.eval(a)?;
                match (op, a) {
                    (UnOp::Neg, Value::Int(x)) => Value::Int(x.wrapping_neg()),
                    (UnOp::Neg, Value::Float(x)) => Value::Float(-x),
                    (UnOp::Not, v) => Value::Int(i64::from(!v.truthy())),
                }
            }
            CExpr::Binary(op, a, b) => match op {
                BinOp::And => {
                    Value::Int(i64::from(self.eval(a)?.truthy() && self.eval(b)?.truthy()))
                }
                BinOp::Or => {
                    Value::Int(i64::from(self.eval(a)?.truthy() || self.eval(b)?.truthy()))
                }
                _ => binary(*op, self.eval(a)?, self.eval(b)?)?,
            },
            CExpr::Call(name, args) => {
                let args: Vec<Value> = args.iter().map(|a| self.eval(a)).collect::<Result<_, _>>()?;
                if let Some(v) = self.builtin(name, &args)? {
                    return Ok(v);
                }
                if let Some(v) = self.collective(name, &args)? {
                    return Ok(v);
                }
                return Err(SimError::UnsupportedCall(name.clone()));
            }
            CExpr::Index(base, index) => {
                let index = self.eval(index)?;
                let (name, mem) = self.buffer(base)?;
                let data = mem.lock().map_err(|_| SimError::Poisoned)?;
                let value = data[Self::slot(name, index, data.len())?];
                value
            }
            CExpr::Cast(ty, a) => {
                let v = self.eval(a)?;
                match ty {
                    CType::Scalar(k) => v.convert(*k),
                    CType::SizeT => Value::Int(v.as_i64()),
                    other => return Err(SimError::Unsupported(format!("cast to {other:?}"))),
                }
            }
            CExpr::Ternary(c, a, b) => {
                if self.eval(c)?.truthy() {
                    self.eval(a)?
                } else {
                    self.eval(b)?
                }
            }
            CExpr::Field(..) | CExpr::AddrOf(..) | CExpr::Deref(..) => {
                return Err(SimError::Unsupported(format!("{e:?}")))
            }
        })
    }

    fn store(&mut self, target: &CExpr, value: Value) -> Result<(), SimError> {
        match target {
            CExpr::Var(name) => {
                self.scalars.insert(name.clone(), value);
                Ok(())
            }
            CExpr::Index(base, index) => {
                let index = self.eval(index)?;
                let (name, mem) = self.buffer(base)?;
                let mut data = mem.lock().map_err(|_| SimError::Poisoned)?;
                let i = Self::slot(name, index, data.len())?;
                data[i] = value;
                Ok(())
            }
            other => Err(SimError::Unsupported(format!("store to {other:?}"))),
        }
    }

    fn declare(
        &mut self,
        ty: &CType,
        name: &str,
        init: Option<&CExpr>,
        space: Option<AddressSpace>,
    ) -> Result<(), SimError> {
        match ty {
            CType::Array(kind, len) => {
                let fresh = || memory(vec![Value::zero(*kind); *len as usize]);
                let mem = if space == Some(AddressSpace::Local) {
                    let mut declared = self.group.declared.lock().map_err(|_| SimError::Poisoned)?;
                    Arc::clone(declared.entry(name.to_string()).or_insert_with(fresh))
                } else {
                    fresh()
                };
                self.arrays.insert(name.to_string(), mem);
            }
            _ => {
                let value = match init {
                    Some(e) => {
                        let v = self.eval(e)?;
                        match ty {
                            CType::Scalar(k) => v.convert(*k),
                            _ => v,
                        }
                    }
                    None => Value::zero(ty.elem().unwrap_or(NumericKind::Int64)),
                };
                self.scalars.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    fn run(&mut self, body: &[CStmt]) -> Result<Flow, SimError> {
        for s in body {
            match self.exec(s)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, s: &CStmt) -> Result<Flow, SimError> {
        match s {
            CStmt::Decl {
                ty,
                name,
                init,
                space,
            } => self.declare(ty, name, init.as_ref(), *space)?,
            CStmt::Assign { target, value } => {
                let v = self.eval(value)?;
                self.store(target, v)?;
            }
            CStmt::AddAssign { target, value } => {
                let current = self.eval(target)?;
                let v = binary(BinOp::Add, current, self.eval(value)?)?;
                self.store(target, v)?;
            }
            CStmt::Expr(e) => {
                self.eval(e)?;
            }
            CStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let branch = if self.eval(cond)?.truthy() {
                    then_body
                } else {
                    else_body
                };
                return self.run(branch);
            }
            CStmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.exec(init)?;
                }
                let mut n = 0;
                while self.eval(cond)?.truthy() {
                    n += 1;
                    if n > self.limit {
                        return Err(SimError::RunawayLoop { limit: self.limit });
                    }
                    match self.run(body)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Next => {}
                    }
                    if let Some(step) = step {
                        self.exec(step)?;
                    }
                }
            }
            CStmt::While { cond, body } => {
                let mut n = 0;
                while self.eval(cond)?.truthy() {
                    n += 1;
                    if n > self.limit {
                        return Err(SimError::RunawayLoop { limit: self.limit });
                    }
                    match self.run(body)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Next => {}
                    }
                }
            }
            CStmt::Break => return Ok(Flow::Break),
            CStmt::Return(_) => return Ok(Flow::Return),
            CStmt::Comment(_) | CStmt::Pragma(_) => {}
            CStmt::Barrier { scope, .. } => {
                let r = match scope {
                    BarrierScope::WorkGroup => &self.group.work_group,
                    BarrierScope::SubGroup => {
                        let sg = self.ids.sub_group_id() as usize;
                        self.group
                            .sub_groups
                            .get(sg)
                            .ok_or_else(|| SimError::Geometry(format!("no subgroup {sg}")))?
                    }
                };
                r.arrive(None)?;
            }
            CStmt::Block(body) => return self.run(body),
        }
        Ok(Flow::Next)
    }
}

fn raw_literal(text: &str) -> Result<Value, SimError> {
    let t = text.trim().trim_start_matches('(').trim_end_matches(')');
    match t {
        "INFINITY" => return Ok(Value::Float(f64::INFINITY)),
        "-INFINITY" => return Ok(Value::Float(f64::NEG_INFINITY)),
        "NULL" => return Ok(Value::Int(0)),
        _ => {}
    }
    let digits = t.trim_end_matches(['u', 'U', 'l', 'L']);
    if let Ok(v) = digits.parse::<i64>() {
        return Ok(Value::Int(v));
    }
    if digits.parse::<u64>().is_ok() {
        return Ok(Value::Int(i64::MAX));
    }
    digits
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| SimError::Unsupported(format!("literal `{text}`")))
}

fn binary(op: BinOp, a: Value, b: Value) -> Result<Value, SimError> {
    if op.is_comparison() {
        let r = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match op {
                BinOp::Lt => x < y,
                BinOp::Le => x <= y,
                BinOp::Gt => x > y,
                BinOp::Ge => x >= y,
                BinOp::Eq => x == y,
                _ => x != y,
            },
            (x, y) => {
                let (x, y) = (x.as_f64(), y.as_f64());
                match op {
                    BinOp::Lt => x < y,
                    BinOp::Le => x <= y,
                    BinOp::Gt => x > y,
                    BinOp::Ge => x >= y,
                    BinOp::Eq => x == y,
                    _ => x != y,
                }
            }
        };
        return Ok(Value::Int(i64::from(r)));
    }
    Ok(match (a, b) {
        (Value::Int(x), Value::Int(y)) => Value::Int(match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div => x.checked_div(y).ok_or(SimError::DivisionByZero)?,
            BinOp::Rem => x.checked_rem(y).ok_or(SimError::DivisionByZero)?,
            BinOp::And => i64::from(x != 0 && y != 0),
            _ => i64::from(x != 0 || y != 0),
        }),
        (x, y) => {
            let (x, y) = (x.as_f64(), y.as_f64());
            Value::Float(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / y,
                BinOp::Rem => x % y,
                BinOp::And => f64::from(u8::from(x != 0.0 && y != 0.0)),
                _ => f64::from(u8::from(x != 0.0 || y != 0.0)),
            })
        }
    })
}

// ── Launch ──────────────────────────────────────────────────────────────────

fn dims3(v: &[u64], fill: u64) -> [u64; 3] {
    let mut out = [fill; 3];
    for (d, x) in v.iter().take(3).enumerate() {
        out[d] = *x;
    }
    out
}

/// Run `kernel` over the launch geometry.
pub fn simulate(
    kernel: &CFunction,
    launch: &LaunchConfig,
    args: Vec<SimArg>,
) -> Result<SimOutput, SimError> {
    if args.len() != kernel.params.len() {
        return Err(SimError::Arguments(format!(
            "`{}` takes {} arguments, got {}",
            kernel.name,
            kernel.params.len(),
            args.len()
        )));
    }
    if launch.global.len() != launch.local.len()
        || launch.global.is_empty()
        || launch.global.len() > 3
    {
        return Err(SimError::Geometry(
            "global and local sizes need 1 to 3 matching dimensions".into(),
        ));
    }
    for (g, l) in launch.global.iter().zip(&launch.local) {
        if *l == 0 || g % l != 0 {
            return Err(SimError::Geometry(format!(
                "global size {g} is not a multiple of local size {l}"
            )));
        }
    }
    if launch.sub_group_size == 0 {
        return Err(SimError::Geometry("subgroup size must be positive".into()));
    }

    let mut scalars = HashMap::new();
    let mut globals: IndexMap<String, Memory> = IndexMap::new();
    let mut locals: Vec<(String, usize)> = Vec::new();
    for (param, arg) in kernel.params.iter().zip(args) {
        match (&param.ty, arg) {
            (CType::Pointer(AddressSpace::Local, _), SimArg::Local(len)) => {
                locals.push((param.name.clone(), len))
            }
            (CType::Pointer(_, _), SimArg::Global(values)) => {
                globals.insert(param.name.clone(), memory(values));
            }
            (CType::Scalar(k), SimArg::Scalar(v)) => {
                scalars.insert(param.name.clone(), v.convert(*k));
            }
            (CType::SizeT, SimArg::Scalar(v)) => {
                scalars.insert(param.name.clone(), Value::Int(v.as_i64()));
            }
            (ty, arg) => {
                return Err(SimError::Arguments(format!(
                    "parameter `{}` of type {ty:?} cannot take {arg:?}",
                    param.name
                )))
            }
        }
    }

    let global_size = dims3(&launch.global, 1);
    let local_size = dims3(&launch.local, 1);
    let num_groups: [u64; 3] = [0, 1, 2].map(|d| global_size[d] / local_size[d]);
    let items = local_size.iter().product::<u64>() as usize;
    let sg = u64::from(launch.sub_group_size);
    let num_sub_groups = (items as u64).div_ceil(sg);
    debug!(
        kernel = %kernel.name,
        groups = num_groups.iter().product::<u64>(),
        items,
        "simulating"
    );

    for gz in 0..num_groups[2] {
        for gy in 0..num_groups[1] {
            for gx in 0..num_groups[0] {
                let group = [gx, gy, gz];
                let shared = GroupShared {
                    work_group: Rendezvous::new(items),
                    sub_groups: (0..num_sub_groups)
                        .map(|k| Rendezvous::new((items as u64 - k * sg).min(sg) as usize))
                        .collect(),
                    locals: locals
                        .iter()
                        .map(|(name, len)| (name.clone(), memory(vec![Value::Int(0); *len])))
                        .collect(),
                    declared: Mutex::new(HashMap::new()),
                };
                run_group(kernel, launch, &shared, &scalars, &globals, group, Ids {
                    group,
                    global_size,
                    local_size,
                    num_groups,
                    sub_group_size: sg,
                    num_sub_groups,
                    ..Ids::default()
                })?;
            }
        }
    }

    let mut out = SimOutput::default();
    for (name, mem) in globals {
        let data = mem.lock().map_err(|_| SimError::Poisoned)?;
        out.globals.insert(name, data.clone());
    }
    Ok(out)
}

fn run_group(
    kernel: &CFunction,
    launch: &LaunchConfig,
    shared: &GroupShared,
    scalars: &HashMap<String, Value>,
    globals: &IndexMap<String, Memory>,
    group: [u64; 3],
    base: Ids,
) -> Result<(), SimError> {
    let [lx, ly, lz] = base.local_size;
    let results: Vec<Result<(), SimError>> = thread::scope(|scope| {
        let mut handles = Vec::new();
        for z in 0..lz {
            for y in 0..ly {
                for x in 0..lx {
                    let local = [x, y, z];
                    let mut ids = base;
                    ids.local = local;
                    ids.global = [0, 1, 2].map(|d| group[d] * base.local_size[d] + local[d]);
                    ids.linear_local = x + y * lx + z * lx * ly;
                    let mut arrays: HashMap<String, Memory> =
                        globals.iter().map(|(n, m)| (n.clone(), Arc::clone(m))).collect();
                    arrays.extend(shared.locals.iter().map(|(n, m)| (n.clone(), Arc::clone(m))));
                    let mut item = WorkItem {
                        ids,
                        group: shared,
                        scalars: scalars.clone(),
                        arrays,
                        limit: launch.max_loop_iterations,
                    };
                    handles.push(scope.spawn(move || {
                        let result = item.run(&kernel.body).map(|_| ());
                        if result.is_err() {
                            shared.poison();
                        }
                        shared.work_group.retire();
                        if let Some(r) = shared.sub_groups.get(item.ids.sub_group_id() as usize) {
                            r.retire();
                        }
                        result
                    }));
                }
            }
        }
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(SimError::Panicked)))
            .collect()
    });
    trace!(?group, "work-group finished");
    let mut poisoned = false;
    for r in results {
        match r {
            Err(SimError::Poisoned) => poisoned = true,
            Err(e) => return Err(e),
            Ok(()) => {}
        }
    }
    if poisoned {
        return Err(SimError::Poisoned);
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
