// dot.rs — Graphviz DOT output for SSA block structure
//
// Renders each function as a cluster of blocks linked by ownership edges
// (loop, end, then, else). Blocks of planned parallel nests are filled so
// the regions a kernel replaces stand out.
//
// Preconditions: every block referenced by an instruction exists.
// Postconditions: returns a valid DOT string; node ids are unique per
//                 function.
// Failure modes: none (pure string formatting; missing blocks are skipped).
// Side effects: none.

use std::collections::HashSet;
use std::fmt::Write;

use crate::id::BlockId;
use crate::ssa::{Instruction, TypedFunction, TypedProgram};

/// Emit the block structure of every function as a Graphviz DOT string.
pub fn emit_dot(program: &TypedProgram) -> String {
    let mut buf = String::new();
    let _ = writeln!(buf, "digraph kcc {{");
    let _ = writeln!(buf, "    node [shape=box, fontname=\"Helvetica\", fontsize=10];");
    let _ = writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];");
    for f in &program.functions {
        let _ = writeln!(buf);
        write_function(&mut buf, f);
    }
    let _ = writeln!(buf, "}}");
    buf
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn node_id(function: &str, block: BlockId) -> String {
    format!("{}_b{}", sanitize(function), block.0)
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Blocks inside a parallel nest, including the `For` blocks themselves.
fn parallel_blocks(f: &TypedFunction) -> HashSet<BlockId> {
    let mut out = HashSet::new();
    for d in &f.parallel {
        for b in &d.loops {
            out.insert(*b);
        }
        let inner = d.loops.last().and_then(|b| f.body.block(*b).ok()).and_then(|b| b.ending());
        if let Some(Instruction::For { loop_block, .. }) = inner {
            if let Ok(closure) = f.body.owned_closure(*loop_block) {
                out.extend(closure);
            }
        }
    }
    out
}

fn block_label(f: &TypedFunction, id: BlockId) -> String {
    let mut label = format!("{id}");
    if let Ok(block) = f.body.block(id) {
        for instr in &block.instructions {
            if matches!(instr, Instruction::Comment(_) | Instruction::Line(_)) {
                continue;
            }
            let _ = write!(label, "\\l{}", escape(&instr.to_string()));
        }
    }
    label.push_str("\\l");
    label
}

fn write_function(buf: &mut String, f: &TypedFunction) {
    let name = sanitize(&f.name);
    let parallel = parallel_blocks(f);
    let _ = writeln!(buf, "    subgraph cluster_{name} {{");
    let _ = writeln!(buf, "        label=\"function: {}\";", escape(&f.name));
    let _ = writeln!(buf, "        style=rounded;");
    let _ = writeln!(buf, "        color=gray50;");
    for id in f.body.block_ids() {
        let fill = if parallel.contains(&id) {
            ", style=filled, fillcolor=\"#dbe9f6\""
        } else {
            ""
        };
        let _ = writeln!(
            buf,
            "        {} [label=\"{}\"{fill}];",
            node_id(&f.name, id),
            block_label(f, id)
        );
    }
    for id in f.body.block_ids() {
        let Some(ending) = f.body.block(id).ok().and_then(|b| b.ending()) else {
            continue;
        };
        let edges: Vec<(BlockId, &str)> = match ending {
            Instruction::Branch {
                true_block,
                false_block,
                end_block,
                ..
            } => vec![(*true_block, "then"), (*false_block, "else"), (*end_block, "end")],
            Instruction::For {
                loop_block,
                end_block,
                ..
            }
            | Instruction::While {
                loop_block,
                end_block,
            } => vec![(*loop_block, "loop"), (*end_block, "end")],
            _ => Vec::new(),
        };
        for (to, label) in edges {
            let style = if label == "end" { ", style=dashed" } else { "" };
            let _ = writeln!(
                buf,
                "        {} -> {} [label=\"{label}\"{style}];",
                node_id(&f.name, id),
                node_id(&f.name, to)
            );
        }
    }
    let _ = writeln!(buf, "    }}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    const LOOP: &str = "\
function count(n$1) -> (c$3)
  types {
    n$1: int32
    c$1: int32(0)
    c$2: int32
    c$3: int32
    c$4: int32
    $one: int32(1)
  }
  parallel #0 reduce sum(c$1 -> c$3)
  block #0 {
    n$1 = arg 0
    c$1 = 0
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }
  block #1 {
    c$2 = phi #0:c$1, #1:c$4
    c$4 = call plus(c$2, $one)
  }
  block #2 {
    c$3 = phi #0:c$1, #1:c$4
  }
end
";

    fn dot() -> String {
        let result = parse(LOOP);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        emit_dot(&result.program.unwrap())
    }

    #[test]
    fn emits_one_cluster_per_function() {
        let text = dot();
        assert!(text.starts_with("digraph kcc {\n"));
        assert!(text.contains("subgraph cluster_count {"));
        assert!(text.trim_end().ends_with('}'));
    }

    #[test]
    fn ownership_edges_are_labelled() {
        let text = dot();
        assert!(text.contains("count_b0 -> count_b1 [label=\"loop\"];"), "{text}");
        assert!(text.contains("count_b0 -> count_b2 [label=\"end\", style=dashed];"), "{text}");
    }

    #[test]
    fn parallel_nest_blocks_are_filled() {
        let text = dot();
        let line = |id: &str| {
            text.lines()
                .find(|l| l.trim_start().starts_with(&format!("{id} [")))
                .unwrap()
                .to_string()
        };
        assert!(line("count_b0").contains("fillcolor"));
        assert!(line("count_b1").contains("fillcolor"));
        assert!(!line("count_b2").contains("fillcolor"));
    }
}
