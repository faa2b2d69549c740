// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the backend's passes (reading the SSA listing is outside the
// runner), their dependency edges and the artifacts they produce. The
// pipeline runner uses them to compute the minimal pass subset for each
// emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each backend pass (reading excluded, handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Plan,
    GenerateKernels,
    Allocate,
    LowerFunctions,
    Render,
}

/// Machine-readable artifact identifiers. Each maps to a field of
/// `CompilationState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Plans,       // Vec<KernelPlan>
    Kernels,     // Vec<GeneratedKernel>
    Launches,    // launch tables, installed in the InstanceSet
    Allocations, // per-function allocation listings
    Instances,   // InstanceSet entries for host functions
    Sources,     // Rendered
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a backend pass.
pub struct PassDescriptor {
    /// Human-readable name for logs.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// Conditions that hold once the pass has succeeded.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Plan => PassDescriptor {
            name: "plan",
            inputs: &[],
            outputs: &[ArtifactId::Plans],
            invariants: "every descriptor is a perfect nest with unit intervals; reductions traced",
        },
        PassId::GenerateKernels => PassDescriptor {
            name: "generate_kernels",
            inputs: &[PassId::Plan],
            outputs: &[ArtifactId::Kernels, ArtifactId::Launches],
            invariants: "kernel and launch arguments share one order; version covers every feature",
        },
        PassId::Allocate => PassDescriptor {
            name: "allocate",
            inputs: &[],
            outputs: &[ArtifactId::Allocations],
            invariants: "every body name has a group; group names avoid the blacklist",
        },
        PassId::LowerFunctions => PassDescriptor {
            name: "lower_functions",
            inputs: &[PassId::GenerateKernels],
            outputs: &[ArtifactId::Instances],
            invariants: "planned loops replaced by launcher calls; helpers lowered once per key",
        },
        PassId::Render => PassDescriptor {
            name: "render",
            inputs: &[PassId::LowerFunctions],
            outputs: &[ArtifactId::Sources],
            invariants: "one C unit, one OpenCL unit per kernel, one manifest",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 5] = [
    PassId::Plan,
    PassId::GenerateKernels,
    PassId::Allocate,
    PassId::LowerFunctions,
    PassId::Render,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
