// alloc.rs — Variable allocation (out-of-SSA coalescing and naming)
//
// Partitions SSA names into groups that share one emitted variable, then
// assigns each group a unique identifier. Phi outputs are forced together
// with their inputs; copies and sets are merged when liveness allows it.
//
// Preconditions: the body is in conventional SSA form (phi operands do not
//                interfere); every merged name has a recorded type.
// Postconditions: every name read or written by the body has a group, and
//                 every group has a name not in the blacklist.
// Failure modes: `PhiInterference` when a phi and its input are live at the
//                same time; `ConflictingExtraCopy` from reduction merging.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::error::LowerError;
use crate::id::{GroupId, IdAllocator};
use crate::liveness::{Interference, Liveness};
use crate::ssa::{Instruction, Operand, TypedFunction};

// ── Groups ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct VariableAllocation {
    group_of: IndexMap<String, GroupId>,
    members: IndexMap<GroupId, Vec<String>>,
    extra_copies: IndexMap<String, String>,
    ids: IdAllocator,
}

impl VariableAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `name` its own group unless it already has one.
    pub fn add_isolated(&mut self, name: &str) -> GroupId {
        if let Some(&g) = self.group_of.get(name) {
            return g;
        }
        let g = self.ids.alloc_group();
        self.group_of.insert(name.to_string(), g);
        self.members.insert(g, vec![name.to_string()]);
        g
    }

    pub fn group_of(&self, name: &str) -> Option<GroupId> {
        self.group_of.get(name).copied()
    }

    pub fn members(&self, group: GroupId) -> &[String] {
        self.members.get(&group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &[String])> {
        self.members.iter().map(|(g, m)| (*g, m.as_slice()))
    }

    pub fn same_group(&self, a: &str, b: &str) -> bool {
        match (self.group_of(a), self.group_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Unconditionally merge the groups of `a` and `b`. The older group id
    /// survives so that group order stays first-appearance order.
    pub fn merge(&mut self, a: &str, b: &str) -> GroupId {
        let ga = self.add_isolated(a);
        let gb = self.add_isolated(b);
        if ga == gb {
            return ga;
        }
        let (keep, gone) = if ga < gb { (ga, gb) } else { (gb, ga) };
        let moved = self.members.shift_remove(&gone).unwrap_or_default();
        for name in &moved {
            self.group_of.insert(name.clone(), keep);
        }
        if let Some(list) = self.members.get_mut(&keep) {
            list.extend(moved);
        }
        keep
    }

    /// Record that `name` needs an explicit copy from/to `partner`.
    pub fn record_extra_copy(&mut self, name: &str, partner: &str) -> Result<(), LowerError> {
        match self.extra_copies.get(name) {
            Some(existing) if existing != partner => Err(LowerError::ConflictingExtraCopy {
                name: name.to_string(),
                first: existing.clone(),
                second: partner.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.extra_copies
                    .insert(name.to_string(), partner.to_string());
                Ok(())
            }
        }
    }

    pub fn extra_copy_of(&self, name: &str) -> Option<&str> {
        self.extra_copies.get(name).map(String::as_str)
    }

    pub fn extra_copies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra_copies
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str()))
    }

    /// Force a reduction's names into one group. If `initial` already
    /// belongs to a different group, it is left alone and an extra copy is
    /// recorded instead. Phi merging in base allocation normally joins the
    /// initial first; a recorded copy shows up in `--emit alloc` listings.
    pub fn merge_reduction(
        &mut self,
        anchor: &str,
        names: &[String],
        initial: &str,
    ) -> Result<(), LowerError> {
        for name in names {
            self.merge(anchor, name);
        }
        match self.group_of(initial) {
            None => {
                self.merge(anchor, initial);
            }
            Some(_) if self.same_group(anchor, initial) => {}
            Some(_) => {
                debug!(anchor, initial, "reduction initial value keeps its own group");
                self.record_extra_copy(initial, anchor)?;
            }
        }
        Ok(())
    }
}

// ── Efficient allocator ─────────────────────────────────────────────────────

fn base_name(name: &str) -> &str {
    name.split('$').next().unwrap_or("")
}

fn is_temporary(name: &str) -> bool {
    name.starts_with('$')
}

struct Allocator<'a> {
    function: &'a TypedFunction,
    interference: Interference,
    alloc: VariableAllocation,
}

impl<'a> Allocator<'a> {
    fn groups_interfere(&self, a: &str, b: &str) -> bool {
        let (Some(ga), Some(gb)) = (self.alloc.group_of(a), self.alloc.group_of(b)) else {
            return false;
        };
        if ga == gb {
            return false;
        }
        let ma = self.alloc.members(ga);
        let mb = self.alloc.members(gb);
        ma.iter()
            .any(|x| mb.iter().any(|y| self.interference.interferes(x, y)))
    }

    fn types_compatible(&self, a: &str, b: &str) -> bool {
        match (self.function.raw_type(a), self.function.raw_type(b)) {
            (Some(ta), Some(tb)) => ta.storage_compatible(tb),
            _ => false,
        }
    }

    fn try_merge(&mut self, a: &str, b: &str, reason: &str) -> bool {
        if self.alloc.same_group(a, b) {
            return true;
        }
        if self.groups_interfere(a, b) || !self.types_compatible(a, b) {
            trace!(a, b, reason, "merge rejected");
            return false;
        }
        trace!(a, b, reason, "merge");
        self.alloc.merge(a, b);
        true
    }

    fn instructions(&self) -> impl Iterator<Item = &'a Instruction> {
        self.function
            .body
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
    }

    fn base_allocation(&mut self) -> Result<(), LowerError> {
        for p in &self.function.params {
            self.alloc.add_isolated(p);
        }
        let instrs: Vec<&Instruction> = self.instructions().collect();
        for instr in &instrs {
            for out in instr.outputs() {
                self.alloc.add_isolated(out);
            }
            for input in instr.inputs() {
                self.alloc.add_isolated(input);
            }
        }
        for out in &self.function.outputs {
            self.alloc.add_isolated(out);
        }
        for instr in &instrs {
            if let Instruction::Phi { output, sources } = instr {
                for (_, input) in sources {
                    if self.groups_interfere(output, input) {
                        return Err(LowerError::PhiInterference {
                            output: output.clone(),
                            input: input.clone(),
                        });
                    }
                    self.alloc.merge(output, input);
                }
            }
        }
        Ok(())
    }

    fn high_priority_merges(&mut self) {
        let instrs: Vec<&Instruction> = self.instructions().collect();
        for instr in instrs {
            match instr {
                Instruction::Assignment {
                    output,
                    input: Operand::Var(src),
                } if is_temporary(output) || base_name(output) == base_name(src) => {
                    self.try_merge(output, src, "assignment");
                }
                Instruction::ParallelCopy { copies } => {
                    for (dst, src) in copies {
                        self.try_merge(dst, src, "parallel copy");
                    }
                }
                Instruction::SimpleSet { output, matrix, .. } => {
                    self.try_merge(output, matrix, "simple_set");
                }
                _ => {}
            }
        }
    }

    fn medium_priority_merges(&mut self) {
        let instrs: Vec<&Instruction> = self.instructions().collect();
        for instr in instrs {
            if let Instruction::MatrixSet { output, matrix, .. } = instr {
                self.try_merge(output, matrix, "set");
            }
        }
    }
}

/// Reductions whose names must share storage regardless of interference.
#[derive(Debug, Clone)]
pub struct ForcedGroup {
    pub anchor: String,
    pub names: Vec<String>,
    pub initial: String,
}

/// Run the efficient allocator over `function`.
pub fn allocate(function: &TypedFunction) -> Result<VariableAllocation, LowerError> {
    allocate_with(function, &[])
}

/// Run the allocator, forcing the given reduction groups after base
/// allocation.
pub fn allocate_with(
    function: &TypedFunction,
    forced: &[ForcedGroup],
) -> Result<VariableAllocation, LowerError> {
    let liveness = Liveness::analyze(&function.body, &function.outputs)?;
    let interference = Interference::build(&function.body, &liveness)?;
    let mut a = Allocator {
        function,
        interference,
        alloc: VariableAllocation::new(),
    };
    a.base_allocation()?;
    for f in forced {
        a.alloc.merge_reduction(&f.anchor, &f.names, &f.initial)?;
    }
    a.high_priority_merges();
    a.medium_priority_merges();
    debug!(
        function = %function.name,
        groups = a.alloc.members.len(),
        edges = a.interference.len(),
        "variables allocated"
    );
    Ok(a.alloc)
}

// ── Naming ──────────────────────────────────────────────────────────────────

/// Final emitted names of allocation groups.
#[derive(Debug, Clone, Default)]
pub struct VariableNames {
    group_of: HashMap<String, GroupId>,
    name_of: IndexMap<GroupId, String>,
    used: HashSet<String>,
}

fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 'v');
    }
    out
}

fn candidate(members: &[String]) -> String {
    let chosen = members
        .iter()
        .find(|m| !is_temporary(m))
        .map(|m| base_name(m).to_string())
        .unwrap_or_else(|| {
            members
                .first()
                .map(|m| m.trim_start_matches('$').split('$').next().unwrap_or("").to_string())
                .unwrap_or_default()
        });
    sanitize(&chosen)
}

impl VariableNames {
    pub fn assign(alloc: &VariableAllocation, blacklist: &HashSet<String>) -> Self {
        let mut names = VariableNames {
            used: blacklist.clone(),
            ..Default::default()
        };
        for (group, members) in alloc.groups() {
            let name = names.fresh(&candidate(members));
            names.name_of.insert(group, name);
            for m in members {
                names.group_of.insert(m.clone(), group);
            }
        }
        names
    }

    /// Reserve a unique identifier based on `base`.
    pub fn fresh(&mut self, base: &str) -> String {
        let base = sanitize(base);
        if self.used.insert(base.clone()) {
            return base;
        }
        let mut n = 1;
        loop {
            let name = format!("{base}_{n}");
            if self.used.insert(name.clone()) {
                return name;
            }
            n += 1;
        }
    }

    /// Whether `name` is taken by a group or a reserved identifier.
    pub fn is_used(&self, name: &str) -> bool {
        self.used.contains(name)
    }

    /// Emitted name of an allocated SSA name.
    ///
    /// Panics if `ssa` was never allocated; that is a backend bug.
    pub fn final_name(&self, ssa: &str) -> &str {
        match self.try_final_name(ssa) {
            Some(name) => name,
            None => panic!("variable `{ssa}` was not allocated"),
        }
    }

    pub fn try_final_name(&self, ssa: &str) -> Option<&str> {
        let g = self.group_of.get(ssa)?;
        self.name_of.get(g).map(String::as_str)
    }

    pub fn group_of(&self, ssa: &str) -> Option<GroupId> {
        self.group_of.get(ssa).copied()
    }

    /// Number of SSA names sharing `ssa`'s group.
    pub fn group_size(&self, ssa: &str) -> usize {
        match self.group_of(ssa) {
            Some(g) => self.group_of.values().filter(|x| **x == g).count(),
            None => 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &str)> {
        self.name_of.iter().map(|(g, n)| (*g, n.as_str()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn function(source: &str) -> TypedFunction {
        let result = parse(source);
        assert!(result.errors.is_empty(), "parse errors: {:?}", result.errors);
        result.program.unwrap().functions.remove(0)
    }

    const SUM: &str = "\
function total(n$1) -> (acc$4)
  types {
    n$1: int32
    acc$1: double(0.0)
    acc$2: double
    acc$3: double
    acc$4: double
    $one: int32(1)
    i$1: int32
    $x: double
  }
  block #0 {
    n$1 = arg 0
    acc$1 = 0.0
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }
  block #1 {
    acc$2 = phi #0:acc$1, #1:acc$3
    i$1 = iter
    $x = i$1
    acc$3 = call plus(acc$2, $x)
  }
  block #2 {
    acc$4 = phi #0:acc$1, #1:acc$3
  }
end
";

    #[test]
    fn phi_webs_share_one_name() {
        let f = function(SUM);
        let alloc = allocate(&f).unwrap();
        assert!(alloc.same_group("acc$1", "acc$2"));
        assert!(alloc.same_group("acc$2", "acc$3"));
        assert!(alloc.same_group("acc$3", "acc$4"));
        let names = VariableNames::assign(&alloc, &HashSet::new());
        assert_eq!(names.final_name("acc$4"), "acc");
        assert_eq!(names.final_name("n$1"), "n");
        assert_eq!(names.final_name("$one"), "one");
    }

    #[test]
    fn incompatible_types_are_not_merged() {
        let f = function(SUM);
        let alloc = allocate(&f).unwrap();
        // `$x` (double) is assigned from `i$1` (int32).
        assert!(!alloc.same_group("$x", "i$1"));
    }

    #[test]
    fn interfering_phi_is_rejected() {
        let source = "\
function bad(a$1) -> (b$1)
  types {
    a$1: int32
    b$1: int32
    c$1: int32
  }
  block #0 {
    a$1 = arg 0
    c$1 = call plus(a$1, a$1)
    branch c$1 then #1 else #2 end #3
  }
  block #1 {
  }
  block #2 {
  }
  block #3 {
    b$1 = phi #1:a$1, #2:c$1
    d$1 = call plus(b$1, a$1)
  }
end
";
        let f = function(source);
        let err = allocate(&f).unwrap_err();
        assert!(matches!(err, LowerError::PhiInterference { .. }));
    }

    #[test]
    fn blacklist_and_collisions_get_suffixes() {
        let mut alloc = VariableAllocation::new();
        alloc.add_isolated("int$1");
        alloc.add_isolated("x$1");
        alloc.add_isolated("x$2");
        alloc.add_isolated("$3");
        let blacklist: HashSet<String> = ["int".to_string()].into();
        let names = VariableNames::assign(&alloc, &blacklist);
        assert_eq!(names.final_name("int$1"), "int_1");
        assert_eq!(names.final_name("x$1"), "x");
        assert_eq!(names.final_name("x$2"), "x_1");
        assert_eq!(names.final_name("$3"), "v3");
    }

    #[test]
    #[should_panic(expected = "was not allocated")]
    fn unallocated_name_panics() {
        let names = VariableNames::assign(&VariableAllocation::new(), &HashSet::new());
        names.final_name("ghost");
    }

    #[test]
    fn reduction_merge_records_extra_copy_once() {
        let mut alloc = VariableAllocation::new();
        alloc.add_isolated("s$0");
        alloc.add_isolated("s$1");
        alloc
            .merge_reduction("s$1", &["s$2".to_string()], "s$0")
            .unwrap();
        assert!(alloc.same_group("s$1", "s$2"));
        assert!(!alloc.same_group("s$0", "s$1"));
        assert_eq!(alloc.extra_copy_of("s$0"), Some("s$1"));

        alloc.add_isolated("t$1");
        let err = alloc
            .merge_reduction("t$1", &[], "s$0")
            .unwrap_err();
        assert!(matches!(err, LowerError::ConflictingExtraCopy { .. }));
    }

    #[test]
    fn phi_connected_initial_needs_no_extra_copy() {
        let f = function(SUM);
        let forced = [ForcedGroup {
            anchor: "acc$2".to_string(),
            names: vec!["acc$3".to_string()],
            initial: "acc$1".to_string(),
        }];
        let alloc = allocate_with(&f, &forced).unwrap();
        assert!(alloc.same_group("acc$1", "acc$2"));
        assert!(alloc.same_group("acc$2", "acc$4"));
        assert_eq!(alloc.extra_copies().count(), 0);
    }

    #[test]
    fn fresh_initial_joins_the_reduction_group() {
        let mut alloc = VariableAllocation::new();
        alloc
            .merge_reduction("s$1", &["s$2".to_string()], "s$0")
            .unwrap();
        assert!(alloc.same_group("s$0", "s$2"));
        assert!(alloc.extra_copy_of("s$0").is_none());
    }
}
