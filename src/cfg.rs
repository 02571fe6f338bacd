//! Basic-block recovery, CFG construction, and linearization (spec.md §4.F).

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::tac::{Instr, Opcode, Operand};

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: u32,
    /// Instructions after the leading label, always ending in `jmp`/`ret`
    /// once block recovery has run (spec.md §8 invariant 4).
    pub instrs: Vec<Instr>,
}

impl BasicBlock {
    pub fn terminated(&self) -> bool {
        self.instrs.last().is_some_and(|i| i.opcode.is_terminator())
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub entry: u32,
    pub blocks: BTreeMap<u32, BasicBlock>,
    pub fwd: HashMap<u32, Vec<u32>>,
    pub bwd: HashMap<u32, Vec<u32>>,
}

fn next_label(body: &[Instr]) -> u32 {
    let mut max = None;
    for instr in body {
        for operand in instr.args.iter().chain(instr.result.iter()) {
            if let Operand::Label(l) = operand {
                max = Some(max.map_or(*l, |m: u32| m.max(*l)));
            }
        }
    }
    max.map_or(0, |m| m + 1)
}

/// Step 1+2: insert synthetic labels so every jump (conditional or not) is
/// immediately followed by one, and the body starts with one.
fn insert_synthetic_labels(body: &[Instr], label_counter: &mut u32) -> Vec<Instr> {
    let mut fresh = || {
        let l = *label_counter;
        *label_counter += 1;
        l
    };

    let mut out = Vec::with_capacity(body.len() + 4);
    if body.first().map(|i| i.opcode) != Some(Opcode::Label) {
        out.push(Instr::label(fresh()));
    }
    for (i, instr) in body.iter().enumerate() {
        out.push(instr.clone());
        if instr.opcode == Opcode::Jmp || instr.opcode.is_conditional_jump() {
            let next_is_label = body.get(i + 1).map(|n| n.opcode) == Some(Opcode::Label);
            if !next_is_label {
                out.push(Instr::label(fresh()));
            }
        }
    }
    out
}

/// Step 3: slice the synthetic-label-annotated stream at each label.
/// Instructions between a terminator and the following label (if any) are
/// unreachable and dropped — they belong to no block.
fn slice_blocks(linear: &[Instr]) -> Vec<BasicBlock> {
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < linear.len() {
        let label = match &linear[i] {
            Instr { opcode: Opcode::Label, args, .. } => match args[0] {
                Operand::Label(l) => l,
                _ => unreachable!("label instruction without a Label operand"),
            },
            _ => unreachable!("slice_blocks: expected a label at position {i}"),
        };
        i += 1;
        let mut instrs = Vec::new();
        while i < linear.len() && linear[i].opcode != Opcode::Label {
            let terminates = linear[i].opcode.is_terminator();
            instrs.push(linear[i].clone());
            i += 1;
            if terminates {
                break;
            }
        }
        while i < linear.len() && linear[i].opcode != Opcode::Label {
            i += 1; // drop unreachable tail before the next label
        }
        blocks.push(BasicBlock { label, instrs });
    }
    blocks
}

/// Step 4: every block must end in `jmp`/`ret`; make fall-through explicit,
/// synthesizing a `ret` for a trailing block with no successor (spec.md §9,
/// open question b).
fn close_blocks(mut blocks: Vec<BasicBlock>) -> Vec<BasicBlock> {
    for idx in 0..blocks.len() {
        if !blocks[idx].terminated() {
            let filler = match blocks.get(idx + 1) {
                Some(next) => Instr::jmp(next.label),
                None => Instr::new(Opcode::Ret, vec![], None),
            };
            blocks[idx].instrs.push(filler);
        }
    }
    blocks
}

/// Recover basic blocks from a straight-line TAC procedure body.
pub fn recover_blocks(body: &[Instr]) -> Vec<BasicBlock> {
    let mut label_counter = next_label(body);
    let linear = insert_synthetic_labels(body, &mut label_counter);
    close_blocks(slice_blocks(&linear))
}

/// Build the CFG (`fwd`/`bwd` edge sets) over a recovered block list. The
/// entry is the first block's label.
pub fn build_cfg(blocks: Vec<BasicBlock>) -> Cfg {
    let entry = blocks.first().map(|b| b.label).unwrap_or(0);
    let mut fwd: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut bwd: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut map = BTreeMap::new();

    for block in &blocks {
        let mut succs = Vec::new();
        for instr in &block.instrs {
            if let Some(target) = instr.jump_target() {
                if !succs.contains(&target) {
                    succs.push(target);
                }
            }
        }
        fwd.insert(block.label, succs);
    }
    for block in &blocks {
        bwd.entry(block.label).or_default();
    }
    for (&from, tos) in &fwd {
        for &to in tos {
            bwd.entry(to).or_default().push(from);
        }
    }
    for block in blocks {
        map.insert(block.label, block);
    }
    Cfg { entry, blocks: map, fwd, bwd }
}

/// Schedule blocks so a block's unique not-yet-emitted successor follows it
/// immediately when possible; unreached blocks are appended in label order.
pub fn linearize(cfg: &Cfg) -> Vec<u32> {
    let mut order = vec![cfg.entry];
    let mut visited = HashSet::new();
    visited.insert(cfg.entry);

    loop {
        let cur = *order.last().unwrap();
        let succs = cfg.fwd.get(&cur).map(Vec::as_slice).unwrap_or(&[]);
        let next = if succs.len() == 1 && !visited.contains(&succs[0]) {
            Some(succs[0])
        } else {
            succs.iter().find(|s| !visited.contains(s)).copied()
        };
        match next {
            Some(n) => {
                order.push(n);
                visited.insert(n);
            }
            None => break,
        }
    }

    for &label in cfg.blocks.keys() {
        if visited.insert(label) {
            order.push(label);
        }
    }
    order
}

/// Re-linearize a schedule into a flat instruction stream, dropping a
/// block-final `jmp` to the block immediately following it in the order.
pub fn emit(cfg: &Cfg, order: &[u32]) -> Vec<Instr> {
    let mut out = Vec::new();
    for (idx, label) in order.iter().enumerate() {
        let Some(block) = cfg.blocks.get(label) else { continue };
        out.push(Instr::label(*label));
        for (j, instr) in block.instrs.iter().enumerate() {
            let is_last = j == block.instrs.len() - 1;
            if is_last && instr.opcode == Opcode::Jmp {
                if let (Some(&next_label), Some(Operand::Label(target))) = (order.get(idx + 1), instr.args.last()) {
                    if *target == next_label {
                        continue;
                    }
                }
            }
            out.push(instr.clone());
        }
    }
    out
}

/// Full recover → CFG → linearize → emit round trip for one procedure body.
pub fn linearize_proc(body: &[Instr]) -> Vec<Instr> {
    let blocks = recover_blocks(body);
    let cfg = build_cfg(blocks);
    let order = linearize(&cfg);
    emit(&cfg, &order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::lower;
    use crate::parser::parse;
    use crate::typechecker::check;

    fn tac_body(src: &str) -> Vec<Instr> {
        let mut prog = parse("t.bx", src).unwrap();
        check("t.bx", &mut prog).unwrap();
        let tac = lower("t.bx", &prog).unwrap();
        tac.procs().find(|(n, ..)| *n == "@main").unwrap().2.to_vec()
    }

    #[test]
    fn every_block_ends_in_jmp_or_ret() {
        let body = tac_body("def main() { var x = 0 : int; while (x < 3) { x = x + 1; } }");
        for block in recover_blocks(&body) {
            assert!(block.terminated(), "block {} not terminated: {:?}", block.label, block.instrs);
        }
    }

    #[test]
    fn every_jump_target_is_a_defined_label() {
        let body = tac_body("def main() { if (true) { var x = 1 : int; } else { var y = 2 : int; } }");
        let blocks = recover_blocks(&body);
        let cfg = build_cfg(blocks);
        let defined: HashSet<u32> = cfg.blocks.keys().copied().collect();
        for succs in cfg.fwd.values() {
            for s in succs {
                assert!(defined.contains(s), "undefined successor label {s}");
            }
        }
    }

    #[test]
    fn unreachable_blocks_are_absent_from_fwd_star() {
        // Dead code after an early return in one branch is dropped during
        // slicing, so it never becomes its own reachable block.
        let body = tac_body("def main() { if (true) { return; } print(1); }");
        let blocks = recover_blocks(&body);
        let cfg = build_cfg(blocks);
        let order = linearize(&cfg);
        let reachable: HashSet<u32> = order.into_iter().collect();
        assert!(cfg.blocks.keys().all(|l| reachable.contains(l)));
    }

    #[test]
    fn linearize_drops_redundant_trailing_jmp() {
        let body = tac_body("def main() { var x = 1 : int; }");
        let linear = linearize_proc(&body);
        // No two consecutive instructions should be a jmp immediately
        // followed by the label it targets.
        for w in linear.windows(2) {
            if w[0].opcode == Opcode::Jmp {
                if let (Some(Operand::Label(t)), Opcode::Label) = (w[0].args.last(), w[1].opcode) {
                    if let Some(Operand::Label(l)) = w[1].args.last() {
                        assert_ne!(t, l, "redundant jmp to immediately following label was not dropped");
                    }
                }
            }
        }
    }

    #[test]
    fn round_trip_linearization_is_a_fixed_point() {
        let body = tac_body("def main() { var x = 0 : int; while (x < 3) { x = x + 1; } }");
        let once = linearize_proc(&body);
        let twice = linearize_proc(&once);
        assert_eq!(once.len(), twice.len());
    }
}
