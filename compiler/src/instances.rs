// instances.rs — Generated function instances shared across a compilation
//
// Every call to a program function is served by an instance specialized to
// the argument types at the call site. Instances are keyed by a SHA-256
// digest of callee, target and parameter types (constants stripped), so a
// function called with the same types from several places is emitted once.
//
// Preconditions: callers pass one argument type per declared parameter.
// Postconditions: a key is marked in progress before its body is lowered, so
//                 recursive calls terminate (C) or fail cleanly (OpenCL).
// Failure modes: `Unsupported` for recursion on the OpenCL target; any
//                `LowerError` from lowering the instance body.
// Side effects: lowers instance bodies on first request.

use std::collections::HashSet;
use std::fmt::Write as _;

use indexmap::{IndexMap, IndexSet};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::codegen::{CodegenOptions, Target};
use crate::diag::Diagnostic;
use crate::error::LowerError;
use crate::kernel::LaunchTable;
use crate::lir::CFunction;
use crate::lower::lower_function;
use crate::ssa::{TypedFunction, TypedProgram};
use crate::types::{ScalarType, VarType};

/// Handle returned to a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub key: String,
    /// Program function this instance specializes.
    pub callee: String,
    pub target: Target,
    pub function: CFunction,
    /// Keys of the instances this one calls.
    pub dependencies: IndexSet<String>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
enum Entry {
    InProgress { name: String },
    Done(Instance),
}

#[derive(Debug, Clone, Default)]
pub struct InstanceSet {
    entries: IndexMap<String, Entry>,
    names: HashSet<String>,
    /// Launch tables of host functions, applied to their declared-type
    /// instances on the C target.
    launches: IndexMap<String, LaunchTable>,
}

/// Type as it participates in instance identity.
pub fn strip_constant(ty: &VarType) -> VarType {
    match ty {
        VarType::Scalar(s) => VarType::Scalar(ScalarType {
            kind: s.kind,
            constant: None,
        }),
        other => other.clone(),
    }
}

pub fn instance_key(callee: &str, target: Target, arg_types: &[VarType]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(callee.as_bytes());
    hasher.update([0]);
    hasher.update(target.name().as_bytes());
    for ty in arg_types {
        hasher.update([0]);
        hasher.update(strip_constant(ty).to_string().as_bytes());
    }
    bytes_to_hex(&hasher.finalize())
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

impl InstanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launches(launches: IndexMap<String, LaunchTable>) -> Self {
        Self {
            launches,
            ..Self::default()
        }
    }

    /// Install the launch tables once kernels are generated.
    pub fn set_launches(&mut self, launches: IndexMap<String, LaunchTable>) {
        self.launches = launches;
    }

    /// Reserve an emitted name, e.g. for kernels sharing the namespace.
    pub fn reserve_name(&mut self, base: &str) -> String {
        let base = base.replace('$', "");
        if self.names.insert(base.clone()) {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}_{n}");
            if self.names.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// The instance of `callee` for `arg_types`, lowering it on first use.
    pub fn request(
        &mut self,
        program: &TypedProgram,
        options: &CodegenOptions,
        callee: &TypedFunction,
        arg_types: &[VarType],
        target: Target,
    ) -> Result<InstanceRef, LowerError> {
        if arg_types.len() != callee.params.len() {
            return Err(LowerError::malformed(
                "call",
                format!(
                    "`{}` takes {} inputs, got {}",
                    callee.name,
                    callee.params.len(),
                    arg_types.len()
                ),
            ));
        }
        let key = instance_key(&callee.name, target, arg_types);
        match self.entries.get(&key) {
            Some(Entry::Done(instance)) => {
                return Ok(InstanceRef {
                    key,
                    name: instance.function.name.clone(),
                })
            }
            Some(Entry::InProgress { name }) => {
                if target == Target::OpenCl {
                    return Err(LowerError::Unsupported(format!(
                        "recursive call to `{}` inside a kernel",
                        callee.name
                    )));
                }
                return Ok(InstanceRef {
                    key,
                    name: name.clone(),
                });
            }
            None => {}
        }

        let name = self.reserve_name(&callee.name);
        self.entries
            .insert(key.clone(), Entry::InProgress { name: name.clone() });

        let mut specialized = callee.clone();
        let mut declared = true;
        for (param, ty) in callee.params.iter().zip(arg_types) {
            let ty = strip_constant(ty);
            if callee.raw_type(param).map(strip_constant).as_ref() != Some(&ty) {
                declared = false;
            }
            specialized.types.insert(param.clone(), ty);
        }
        let launches = if declared && target == Target::C {
            self.launches.get(&callee.name).cloned()
        } else {
            None
        };
        debug!(callee = %callee.name, %name, target = target.name(), "lowering instance");
        let lowered = lower_function(
            &specialized,
            program,
            options,
            target,
            &name,
            launches.as_ref(),
            self,
        )?;
        self.entries.insert(
            key.clone(),
            Entry::Done(Instance {
                key: key.clone(),
                callee: callee.name.clone(),
                target,
                function: lowered.function,
                dependencies: lowered.dependencies,
                diagnostics: lowered.diagnostics,
            }),
        );
        Ok(InstanceRef { key, name })
    }

    pub fn get(&self, key: &str) -> Option<&Instance> {
        match self.entries.get(key)? {
            Entry::Done(instance) => Some(instance),
            Entry::InProgress { .. } => None,
        }
    }

    /// Finished instances for `target`, in request order.
    pub fn for_target(&self, target: Target) -> Vec<&Instance> {
        self.entries
            .values()
            .filter_map(|e| match e {
                Entry::Done(i) if i.target == target => Some(i),
                _ => None,
            })
            .collect()
    }

    /// `roots` and everything they call, callees before callers.
    pub fn closure(&self, roots: &IndexSet<String>) -> Vec<&Instance> {
        fn visit<'s>(
            set: &'s InstanceSet,
            key: &str,
            seen: &mut HashSet<String>,
            out: &mut Vec<&'s Instance>,
        ) {
            if !seen.insert(key.to_string()) {
                return;
            }
            if let Some(instance) = set.get(key) {
                for dep in &instance.dependencies {
                    visit(set, dep, seen, out);
                }
                out.push(instance);
            }
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in roots {
            visit(self, key, &mut seen, &mut out);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::render_function;
    use crate::parser::parse;
    use crate::types::{Constant, NumericKind};

    const PROGRAM: &str = "\
function twice(x$1) -> (y$1)
  types {
    x$1: double
    y$1: double
  }
  block #0 {
    x$1 = arg 0
    y$1 = call plus(x$1, x$1)
  }
end

function main(a$1) -> (b$2)
  types {
    a$1: double
    b$1: double
    b$2: double
  }
  block #0 {
    a$1 = arg 0
    b$1 = call twice(a$1)
    b$2 = call twice(b$1)
  }
end
";

    fn program() -> TypedProgram {
        let result = parse(PROGRAM);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        result.program.unwrap()
    }

    #[test]
    fn keys_ignore_constant_refinements() {
        let plain = VarType::scalar(NumericKind::Double);
        let known = VarType::constant(NumericKind::Double, Constant::Float(2.0));
        assert_eq!(
            instance_key("f", Target::C, &[plain.clone()]),
            instance_key("f", Target::C, &[known])
        );
        assert_ne!(
            instance_key("f", Target::C, &[plain.clone()]),
            instance_key("f", Target::OpenCl, &[plain])
        );
    }

    #[test]
    fn repeated_calls_share_one_instance() {
        let program = program();
        let main = program.function("main").unwrap();
        let mut set = InstanceSet::new();
        let options = CodegenOptions::default();
        let types = vec![VarType::scalar(NumericKind::Double)];
        let entry = set
            .request(&program, &options, main, &types, Target::C)
            .unwrap();
        assert_eq!(entry.name, "main");
        assert_eq!(set.len(), 2);
        let main_instance = set.get(&entry.key).unwrap();
        assert_eq!(main_instance.dependencies.len(), 1);
        let text = render_function(&main_instance.function, Target::C);
        assert!(text.contains(" = twice(a);"), "{text}");
        assert!(text.contains(" = twice(b);"), "{text}");
    }

    #[test]
    fn kernel_instances_get_distinct_names() {
        let program = program();
        let twice = program.function("twice").unwrap();
        let mut set = InstanceSet::new();
        let options = CodegenOptions::default();
        let types = vec![VarType::scalar(NumericKind::Double)];
        let host = set.request(&program, &options, twice, &types, Target::C).unwrap();
        let device = set
            .request(&program, &options, twice, &types, Target::OpenCl)
            .unwrap();
        assert_eq!(host.name, "twice");
        assert_eq!(device.name, "twice_1");
        assert_eq!(set.for_target(Target::OpenCl).len(), 1);
    }

    #[test]
    fn recursion_terminates_on_c() {
        let src = "\
function rec(x$1) -> (y$1)
  types {
    x$1: double
    y$1: double
  }
  block #0 {
    x$1 = arg 0
    y$1 = call rec(x$1)
  }
end
";
        let result = parse(src);
        assert!(result.errors.is_empty(), "parse errors: {:?}", result.errors);
        let program = result.program.unwrap();
        let f = program.function("rec").unwrap();
        let types = vec![VarType::scalar(NumericKind::Double)];
        let options = CodegenOptions::default();

        let mut set = InstanceSet::new();
        let r = set.request(&program, &options, f, &types, Target::C).unwrap();
        let text = render_function(&set.get(&r.key).unwrap().function, Target::C);
        assert!(text.contains("y = rec(x);"), "{text}");

        let mut set = InstanceSet::new();
        let err = set
            .request(&program, &options, f, &types, Target::OpenCl)
            .unwrap_err();
        assert!(matches!(err, LowerError::Unsupported(_)));
    }
}
