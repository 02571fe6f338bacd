//! Control-flow optimizations applied to a recovered CFG (spec.md §4.G):
//! linear-chain coalescing, unreachable-code elimination, and unconditional
//! + conditional jump threading, iterated to a fixed point.

use std::collections::HashSet;

use crate::cfg::{build_cfg, emit, linearize, BasicBlock, Cfg};
use crate::tac::{Instr, Opcode, Operand};

/// The conditional-jump implication table from spec.md §4.G: if `cc` was
/// true, which relations on the *same* comparison temporary are guaranteed
/// true too.
fn implied_by(cc: Opcode) -> &'static [Opcode] {
    match cc {
        Opcode::Je => &[Opcode::Je, Opcode::Jle, Opcode::Jge],
        Opcode::Jne => &[Opcode::Jne],
        Opcode::Jl => &[Opcode::Jl, Opcode::Jne, Opcode::Jle],
        Opcode::Jle => &[Opcode::Jle],
        Opcode::Jg => &[Opcode::Jg, Opcode::Jne, Opcode::Jge],
        Opcode::Jge => &[Opcode::Jge],
        _ => &[],
    }
}

/// Rebuild `fwd`/`bwd` from the current block map, preserving the original
/// entry label (which needn't be the lowest label once blocks are deleted).
fn rebuild(cfg: &Cfg) -> Cfg {
    let entry = cfg.entry;
    let blocks: Vec<BasicBlock> = cfg.blocks.values().cloned().collect();
    let mut fresh = build_cfg(blocks);
    fresh.entry = entry;
    fresh
}

/// Depth-first reachability from `entry` over `fwd`; delete unvisited
/// blocks.
fn uce_pass(cfg: &mut Cfg) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![cfg.entry];
    while let Some(b) = stack.pop() {
        if visited.insert(b) {
            if let Some(succs) = cfg.fwd.get(&b) {
                for &s in succs {
                    if !visited.contains(&s) {
                        stack.push(s);
                    }
                }
            }
        }
    }
    let before = cfg.blocks.len();
    cfg.blocks.retain(|label, _| visited.contains(label));
    if cfg.blocks.len() != before {
        *cfg = rebuild(cfg);
        true
    } else {
        false
    }
}

/// Merge `b1` into `b2` when `b1`'s only successor is `b2` and `b1` is
/// `b2`'s only predecessor (and `b2` isn't the entry). One merge per call;
/// the outer fixed-point loop retries.
fn coalesce_pass(cfg: &mut Cfg) -> bool {
    let labels: Vec<u32> = cfg.blocks.keys().copied().collect();
    for b1 in labels {
        let Some(succs) = cfg.fwd.get(&b1) else { continue };
        if succs.len() != 1 {
            continue;
        }
        let b2 = succs[0];
        if b2 == cfg.entry || b2 == b1 {
            continue;
        }
        let preds = cfg.bwd.get(&b2).cloned().unwrap_or_default();
        if preds.len() != 1 || preds[0] != b1 {
            continue;
        }

        let mut merged = cfg.blocks[&b1].instrs.clone();
        merged.pop(); // drop b1's jmp to b2
        merged.extend(cfg.blocks[&b2].instrs.clone());
        cfg.blocks.insert(b1, BasicBlock { label: b1, instrs: merged });
        cfg.blocks.remove(&b2);
        *cfg = rebuild(cfg);
        uce_pass(cfg);
        return true;
    }
    false
}

/// If `b1` ends in `jmp -> b2` and `b2` is an empty relay block (a single
/// `jmp`), rewrite `b1`'s terminator to `b2`'s target; repeat through
/// chains of relays.
fn thread_unconditional_pass(cfg: &mut Cfg) -> bool {
    let labels: Vec<u32> = cfg.blocks.keys().copied().collect();
    let mut changed = false;
    for b1 in labels {
        loop {
            let Some(last) = cfg.blocks.get(&b1).and_then(|b| b.instrs.last()) else { break };
            if last.opcode != Opcode::Jmp {
                break;
            }
            let Some(Operand::Label(b2)) = last.args.last().cloned() else { break };
            if b2 == b1 {
                break;
            }
            let Some(b2_block) = cfg.blocks.get(&b2) else { break };
            let is_relay = b2_block.instrs.len() == 1 && b2_block.instrs[0].opcode == Opcode::Jmp;
            if !is_relay {
                break;
            }
            let Some(Operand::Label(new_target)) = b2_block.instrs[0].args.first().cloned() else { break };
            if new_target == b2 {
                break;
            }
            let b1_block = cfg.blocks.get_mut(&b1).expect("b1 present");
            let idx = b1_block.instrs.len() - 1;
            b1_block.instrs[idx] = Instr::jmp(new_target);
            changed = true;
        }
    }
    if changed {
        *cfg = rebuild(cfg);
    }
    changed
}

/// If `b1` has a conditional jump `cc t -> b2`, and `b2` (before any
/// redefinition of `t`) has a conditional jump on the same `t` whose
/// relation is implied by `cc`, remove the redundant check in `b2` and
/// thread `b1`'s jump straight to its target.
fn thread_conditional_pass(cfg: &mut Cfg) -> bool {
    let labels: Vec<u32> = cfg.blocks.keys().copied().collect();
    let mut changed = false;
    for b1 in labels {
        let candidates: Vec<(usize, Opcode, Operand, u32)> = match cfg.blocks.get(&b1) {
            Some(block) => block
                .instrs
                .iter()
                .enumerate()
                .filter_map(|(idx, instr)| {
                    if instr.opcode.is_conditional_jump() {
                        if let (Some(t), Some(&Operand::Label(b2))) = (instr.args.first(), instr.args.last()) {
                            return Some((idx, instr.opcode, t.clone(), b2));
                        }
                    }
                    None
                })
                .collect(),
            None => continue,
        };

        for (idx, cc, t, b2) in candidates {
            if b2 == b1 {
                continue;
            }
            let Some(b2_block) = cfg.blocks.get(&b2) else { continue };
            let mut found: Option<(usize, u32)> = None;
            for (j, instr) in b2_block.instrs.iter().enumerate() {
                if instr.opcode.is_conditional_jump() {
                    if let (Some(arg_t), Some(&Operand::Label(inner))) = (instr.args.first(), instr.args.last()) {
                        if *arg_t == t && implied_by(cc).contains(&instr.opcode) {
                            found = Some((j, inner));
                            break;
                        }
                    }
                }
                if instr.result.as_ref() == Some(&t) {
                    break;
                }
            }
            let Some((j, new_target)) = found else { continue };
            cfg.blocks.get_mut(&b2).expect("b2 present").instrs.remove(j);
            let b1_block = cfg.blocks.get_mut(&b1).expect("b1 present");
            if let Some(Operand::Label(lbl)) = b1_block.instrs[idx].args.last_mut() {
                *lbl = new_target;
            }
            changed = true;
        }
    }
    if changed {
        *cfg = rebuild(cfg);
    }
    changed
}

/// Run all four optimizations to a fixed point, then re-linearize.
pub fn optimize_proc(body: &[Instr]) -> Vec<Instr> {
    let blocks = crate::cfg::recover_blocks(body);
    let mut cfg = build_cfg(blocks);
    loop {
        let mut changed = false;
        changed |= coalesce_pass(&mut cfg);
        changed |= uce_pass(&mut cfg);
        changed |= thread_unconditional_pass(&mut cfg);
        changed |= thread_conditional_pass(&mut cfg);
        if !changed {
            break;
        }
    }
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
        proc_body(src, "@main")
    }

    fn proc_body(src: &str, name: &str) -> Vec<Instr> {
        let mut prog = parse("t.bx", src).unwrap();
        check("t.bx", &mut prog).unwrap();
        let tac = lower("t.bx", &prog).unwrap();
        tac.procs().find(|(n, ..)| *n == name).unwrap().2.to_vec()
    }

    #[test]
    fn optimized_program_still_ends_every_block_in_jmp_or_ret() {
        let body = tac_body("def main() { var x = 0 : int; while (x < 3) { x = x + 1; } }");
        let optimized = optimize_proc(&body);
        let blocks = crate::cfg::recover_blocks(&optimized);
        for b in blocks {
            assert!(b.terminated());
        }
    }

    #[test]
    fn dead_branch_after_unconditional_true_is_removed() {
        let body = tac_body("def main() { if (true) { var x = 1 : int; } else { var y = 2 : int; } }");
        let optimized = optimize_proc(&body);
        // UCE should shrink the block count relative to the unoptimized CFG.
        let raw_blocks = crate::cfg::recover_blocks(&body).len();
        let opt_blocks = crate::cfg::recover_blocks(&optimized).len();
        assert!(opt_blocks <= raw_blocks);
    }

    #[test]
    fn unconditional_threading_removes_relay_jumps() {
        let body = tac_body("def main() { var x = 0 : int; while (x < 3) { x = x + 1; } }");
        let optimized = optimize_proc(&body);
        let blocks = crate::cfg::recover_blocks(&optimized);
        let relay_blocks = blocks.iter().filter(|b| b.instrs.len() == 1 && b.instrs[0].opcode == Opcode::Jmp).count();
        assert_eq!(relay_blocks, 0);
    }

    #[test]
    fn optimization_is_idempotent_on_block_count() {
        let body = proc_body("def f(n: int): int { if (n <= 1) return 1; return n * f(n - 1); } def main() { }", "@f");
        let once = optimize_proc(&body);
        let twice = optimize_proc(&once);
        assert_eq!(crate::cfg::recover_blocks(&once).len(), crate::cfg::recover_blocks(&twice).len());
    }
}
