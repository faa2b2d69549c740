// liveness.rs — Block-level liveness and interference over the ownership tree
//
// Derives a control-flow graph from the structured block tree, runs a
// backward dataflow to a fixed point, and scans every block backwards to
// build the interference relation used by the variable allocator.
//
// Preconditions: `body` is well formed (every referenced block exists).
// Postconditions: `live_out[b]` holds every name read on some path after `b`.
// Failure modes: missing blocks and a `break` outside any `while` are
//                program-shape errors.
// Side effects: none.

use std::collections::HashSet;

use crate::error::LowerError;
use crate::id::BlockId;
use crate::ssa::{FunctionBody, Instruction};

// ── CFG ─────────────────────────────────────────────────────────────────────

/// Successor edges plus names that must stay live across loop back edges.
#[derive(Debug, Clone)]
pub struct BlockGraph {
    pub succs: Vec<Vec<BlockId>>,
    /// Extra live-out names per block (loop header operands).
    pub loop_carried: Vec<Vec<String>>,
}

impl BlockGraph {
    pub fn build(body: &FunctionBody) -> Result<Self, LowerError> {
        let n = body.blocks.len();
        let mut graph = BlockGraph {
            succs: vec![Vec::new(); n],
            loop_carried: vec![Vec::new(); n],
        };
        if n > 0 {
            graph.link(body, BlockId::ENTRY, &[], None)?;
        }
        Ok(graph)
    }

    fn link(
        &mut self,
        body: &FunctionBody,
        block: BlockId,
        after: &[BlockId],
        break_target: Option<BlockId>,
    ) -> Result<(), LowerError> {
        match body.block(block)?.ending() {
            Some(Instruction::For {
                start: _,
                interval,
                end,
                loop_block,
                end_block,
            }) => {
                let (l, e) = (*loop_block, *end_block);
                self.succs[block.index()] = vec![l, e];
                self.link(body, l, &[l, e], break_target)?;
                let last = body.chain_end(l)?;
                let carried = &mut self.loop_carried[last.index()];
                carried.push(interval.clone());
                carried.push(end.clone());
                if let Some(iter) = iter_output(body, l)? {
                    carried.push(iter);
                }
                self.link(body, e, after, break_target)
            }
            Some(Instruction::While {
                loop_block,
                end_block,
            }) => {
                let (l, e) = (*loop_block, *end_block);
                self.succs[block.index()] = vec![l];
                self.link(body, l, &[l], Some(e))?;
                self.link(body, e, after, break_target)
            }
            Some(Instruction::Branch {
                true_block,
                false_block,
                end_block,
                ..
            }) => {
                let e = *end_block;
                self.succs[block.index()] = vec![*true_block, *false_block];
                self.link(body, *true_block, &[e], break_target)?;
                self.link(body, *false_block, &[e], break_target)?;
                self.link(body, e, after, break_target)
            }
            Some(Instruction::Break) => {
                let target = break_target.ok_or_else(|| {
                    LowerError::malformed("break", format!("{block} is not inside a while loop"))
                })?;
                self.succs[block.index()] = vec![target];
                Ok(())
            }
            _ => {
                self.succs[block.index()] = after.to_vec();
                Ok(())
            }
        }
    }
}

/// Output of the `Iter` instruction in a `For` loop block, if any.
pub fn iter_output(body: &FunctionBody, loop_block: BlockId) -> Result<Option<String>, LowerError> {
    Ok(body
        .block(loop_block)?
        .instructions
        .iter()
        .find_map(|i| match i {
            Instruction::Iter { output } => Some(output.clone()),
            _ => None,
        }))
}

/// The block a phi source actually flows from. A source naming the block
/// that declares the construct stands for that block itself; any other
/// source names the head of a chain and flows from the chain's last block.
pub fn phi_predecessor(
    body: &FunctionBody,
    phi_block: BlockId,
    source: BlockId,
) -> Result<BlockId, LowerError> {
    let owns = body
        .block(source)?
        .ending()
        .map(|i| i.owned_blocks().contains(&phi_block))
        .unwrap_or(false);
    if owns {
        Ok(source)
    } else {
        body.chain_end(source)
    }
}

// ── Liveness ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Liveness {
    pub graph: BlockGraph,
    pub live_in: Vec<HashSet<String>>,
    pub live_out: Vec<HashSet<String>>,
}

impl Liveness {
    pub fn analyze(body: &FunctionBody, outputs: &[String]) -> Result<Self, LowerError> {
        let graph = BlockGraph::build(body)?;
        let n = body.blocks.len();

        // Phi uses attributed to predecessor blocks.
        let mut phi_uses: Vec<HashSet<String>> = vec![HashSet::new(); n];
        // Upward-exposed non-phi uses and all definitions per block.
        let mut gen: Vec<HashSet<String>> = vec![HashSet::new(); n];
        let mut kill: Vec<HashSet<String>> = vec![HashSet::new(); n];

        for id in body.block_ids() {
            let block = body.block(id)?;
            for instr in block.instructions.iter().rev() {
                if let Instruction::Phi { output, sources } = instr {
                    gen[id.index()].remove(output);
                    kill[id.index()].insert(output.clone());
                    for (src, value) in sources {
                        let pred = phi_predecessor(body, id, *src)?;
                        phi_uses[pred.index()].insert(value.clone());
                    }
                    continue;
                }
                for out in instr.outputs() {
                    gen[id.index()].remove(out);
                    kill[id.index()].insert(out.to_string());
                }
                for input in instr.inputs() {
                    gen[id.index()].insert(input.to_string());
                }
            }
        }

        let mut live_in: Vec<HashSet<String>> = vec![HashSet::new(); n];
        let mut live_out: Vec<HashSet<String>> = vec![HashSet::new(); n];
        let mut changed = true;
        while changed {
            changed = false;
            for b in (0..n).rev() {
                let mut out: HashSet<String> = phi_uses[b].clone();
                out.extend(graph.loop_carried[b].iter().cloned());
                if graph.succs[b].is_empty() && !ends_with_break(body, b) {
                    out.extend(outputs.iter().cloned());
                }
                for s in &graph.succs[b] {
                    out.extend(live_in[s.index()].iter().cloned());
                }
                let mut inn = gen[b].clone();
                inn.extend(out.iter().filter(|v| !kill[b].contains(*v)).cloned());
                if out != live_out[b] || inn != live_in[b] {
                    live_out[b] = out;
                    live_in[b] = inn;
                    changed = true;
                }
            }
        }

        Ok(Liveness {
            graph,
            live_in,
            live_out,
        })
    }
}

fn ends_with_break(body: &FunctionBody, b: usize) -> bool {
    matches!(body.blocks[b].ending(), Some(Instruction::Break))
}

// ── Interference ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Interference {
    edges: HashSet<(String, String)>,
}

impl Interference {
    fn add(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        let key = if a < b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        self.edges.insert(key);
    }

    pub fn interferes(&self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        let key = if a < b { (a, b) } else { (b, a) };
        self.edges
            .contains(&(key.0.to_string(), key.1.to_string()))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Build the relation from a liveness solution. A copy's destination does
    /// not interfere with its own source at the copy.
    pub fn build(body: &FunctionBody, liveness: &Liveness) -> Result<Self, LowerError> {
        let mut graph = Interference::default();
        for id in body.block_ids() {
            let block = body.block(id)?;
            let mut live: HashSet<String> = liveness.live_out[id.index()].clone();
            let mut phi_outputs = Vec::new();

            for instr in block.instructions.iter().rev() {
                match instr {
                    Instruction::Phi { output, .. } => phi_outputs.push(output.clone()),
                    Instruction::Assignment {
                        output,
                        input: crate::ssa::Operand::Var(src),
                    } => {
                        for v in &live {
                            if v != src {
                                graph.add(output, v);
                            }
                        }
                        live.remove(output);
                        live.insert(src.clone());
                    }
                    Instruction::ParallelCopy { copies } => {
                        for (dst, src) in copies {
                            for v in &live {
                                let same_value = copies
                                    .iter()
                                    .any(|(d, s)| d == v && s == src);
                                if v != src && !same_value {
                                    graph.add(dst, v);
                                }
                            }
                        }
                        for (dst, _) in copies {
                            live.remove(dst);
                        }
                        for (_, src) in copies {
                            live.insert(src.clone());
                        }
                    }
                    other => {
                        let outs = other.outputs();
                        for out in &outs {
                            for v in &live {
                                graph.add(out, v);
                            }
                        }
                        for (i, a) in outs.iter().enumerate() {
                            for b in &outs[i + 1..] {
                                graph.add(a, b);
                            }
                        }
                        for out in &outs {
                            live.remove(*out);
                        }
                        for input in other.inputs() {
                            live.insert(input.to_string());
                        }
                    }
                }
            }

            // Phis define their outputs simultaneously at block entry.
            for (i, p) in phi_outputs.iter().enumerate() {
                for v in &live {
                    graph.add(p, v);
                }
                for q in &phi_outputs[i + 1..] {
                    graph.add(p, q);
                }
            }
        }
        Ok(graph)
    }
}
