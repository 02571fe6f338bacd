//! Crude SSA construction, liveness, global DSE, global copy propagation,
//! and SSA deconstruction (spec.md §4.H).
//!
//! `phi` instructions are encoded within the existing [`Instr`] shape: args
//! alternate `Label(pred), src` pairs, one pair per predecessor, and
//! `result` is the destination temporary — no separate IR node is needed.

use std::collections::{HashMap, HashSet};

use crate::cfg::{build_cfg, emit, linearize, BasicBlock, Cfg};
use crate::tac::{Instr, Opcode, Operand};

pub struct Liveness {
    pub live_in: HashMap<u32, HashSet<Operand>>,
    pub live_out: HashMap<u32, HashSet<Operand>>,
    pub per_instr: HashMap<u32, Vec<(HashSet<Operand>, HashSet<Operand>)>>,
}

fn phi_src_for_pred(instr: &Instr, pred: u32) -> Option<Operand> {
    let mut it = instr.args.iter();
    while let (Some(p), Some(src)) = (it.next(), it.next()) {
        if let Operand::Label(l) = p {
            if *l == pred {
                return Some(src.clone());
            }
        }
    }
    None
}

/// Backward per-instruction liveness within one block, seeded by the
/// block's live-out set. `phi` args are not generic uses of the block (the
/// predecessor-indexed values are attributed to the edge instead), so they
/// are skipped here.
fn liveness_for_block(
    block: &BasicBlock,
    live_out_of_block: &HashSet<Operand>,
) -> (Vec<(HashSet<Operand>, HashSet<Operand>)>, HashSet<Operand>) {
    let mut live = live_out_of_block.clone();
    let mut per_instr = vec![(HashSet::new(), HashSet::new()); block.instrs.len()];

    for (i, instr) in block.instrs.iter().enumerate().rev() {
        let live_out_i = live.clone();
        if let Some(dest @ (Operand::Temp(_) | Operand::Param(_))) = &instr.result {
            live.remove(dest);
        }
        if instr.opcode != Opcode::Phi {
            for a in &instr.args {
                if matches!(a, Operand::Temp(_) | Operand::Param(_)) {
                    live.insert(a.clone());
                }
            }
        }
        per_instr[i] = (live.clone(), live_out_i);
    }
    (per_instr, live)
}

/// Fixed-point liveness over the whole CFG (spec.md §4.H).
pub fn compute_liveness(cfg: &Cfg) -> Liveness {
    let mut live_in: HashMap<u32, HashSet<Operand>> = cfg.blocks.keys().map(|&l| (l, HashSet::new())).collect();

    loop {
        let mut changed = false;
        for &b in cfg.blocks.keys() {
            let live_out_b = successor_contribution(cfg, b, &live_in);
            let (_, new_live_in) = liveness_for_block(&cfg.blocks[&b], &live_out_b);
            if live_in[&b] != new_live_in {
                live_in.insert(b, new_live_in);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut live_out = HashMap::new();
    let mut per_instr = HashMap::new();
    for &b in cfg.blocks.keys() {
        let live_out_b = successor_contribution(cfg, b, &live_in);
        let (instrs, _) = liveness_for_block(&cfg.blocks[&b], &live_out_b);
        live_out.insert(b, live_out_b);
        per_instr.insert(b, instrs);
    }

    Liveness { live_in, live_out, per_instr }
}

fn successor_contribution(cfg: &Cfg, b: u32, live_in: &HashMap<u32, HashSet<Operand>>) -> HashSet<Operand> {
    let mut out = HashSet::new();
    for succ in cfg.fwd.get(&b).into_iter().flatten() {
        out.extend(live_in.get(succ).into_iter().flatten().cloned());
        for instr in &cfg.blocks[succ].instrs {
            if instr.opcode == Opcode::Phi {
                if let Some(src) = phi_src_for_pred(instr, b) {
                    out.insert(src);
                }
            }
        }
    }
    out
}

fn rebuild(cfg: &Cfg) -> Cfg {
    let entry = cfg.entry;
    let blocks: Vec<BasicBlock> = cfg.blocks.values().cloned().collect();
    let mut fresh = build_cfg(blocks);
    fresh.entry = entry;
    fresh
}

/// Insert `phi`s at join blocks for every live-in temporary that some
/// predecessor actually redefines. Crude: over-approximates rather than
/// computing minimal dominance-frontier placement (spec.md §4.H).
pub fn construct_ssa(cfg: &mut Cfg) {
    let liveness = compute_liveness(cfg);
    let preds_map = cfg.bwd.clone();
    let labels: Vec<u32> = cfg.blocks.keys().copied().collect();

    for b in labels {
        let preds = preds_map.get(&b).cloned().unwrap_or_default();
        if preds.len() < 2 {
            continue;
        }
        let mut candidates: Vec<u32> = liveness
            .live_in
            .get(&b)
            .into_iter()
            .flatten()
            .filter_map(|op| if let Operand::Temp(n) = op { Some(*n) } else { None })
            .collect();
        candidates.sort_unstable();

        let mut phis = Vec::new();
        for n in candidates {
            let t = Operand::Temp(n);
            let defined_in_some_pred = preds
                .iter()
                .any(|p| cfg.blocks.get(p).is_some_and(|blk| blk.instrs.iter().any(|i| i.result.as_ref() == Some(&t))));
            if !defined_in_some_pred {
                continue;
            }
            let mut args = Vec::new();
            for &p in &preds {
                args.push(Operand::Label(p));
                args.push(t.clone());
            }
            phis.push(Instr::new(Opcode::Phi, args, Some(t)));
        }
        if let Some(block) = cfg.blocks.get_mut(&b) {
            let mut new_instrs = phis;
            new_instrs.append(&mut block.instrs);
            block.instrs = new_instrs;
        }
    }
}

/// Global dead-store elimination: drop any non-(`div`/`mod`/`call`)
/// instruction whose temp dest is not in its own live-out set, rebuilding
/// the CFG after every removal, until no more apply.
pub fn dse(cfg: &mut Cfg) -> bool {
    let mut any_changed = false;
    loop {
        let liveness = compute_liveness(cfg);
        let labels: Vec<u32> = cfg.blocks.keys().copied().collect();
        let mut removed = None;
        'search: for b in &labels {
            let per_instr = &liveness.per_instr[b];
            let block = &cfg.blocks[b];
            for (i, instr) in block.instrs.iter().enumerate() {
                if matches!(instr.opcode, Opcode::Div | Opcode::Mod | Opcode::Call) {
                    continue;
                }
                if let Some(dest @ Operand::Temp(_)) = &instr.result {
                    let (_, live_out_i) = &per_instr[i];
                    if !live_out_i.contains(dest) {
                        removed = Some((*b, i));
                        break 'search;
                    }
                }
            }
        }
        match removed {
            Some((b, i)) => {
                cfg.blocks.get_mut(&b).expect("block present").instrs.remove(i);
                *cfg = rebuild(cfg);
                any_changed = true;
            }
            None => break,
        }
    }
    any_changed
}

fn resolve_chain(subs: &HashMap<Operand, Operand>, start: &Operand) -> Operand {
    let mut cur = start.clone();
    let mut seen = HashSet::new();
    while let Some(next) = subs.get(&cur) {
        if !seen.insert(cur.clone()) {
            break;
        }
        cur = next.clone();
    }
    cur
}

/// Global copy propagation: substitute every `copy src -> dst`'s `src` for
/// uses of `dst` everywhere (including `phi` predecessor-indexed operands),
/// then delete the copy.
pub fn gcp(cfg: &mut Cfg) -> bool {
    let mut subs: HashMap<Operand, Operand> = HashMap::new();
    for block in cfg.blocks.values() {
        for instr in &block.instrs {
            if instr.opcode == Opcode::Copy {
                if let (Some(src), Some(dst)) = (instr.args.first(), &instr.result) {
                    subs.insert(dst.clone(), src.clone());
                }
            }
        }
    }
    if subs.is_empty() {
        return false;
    }
    let resolved: HashMap<Operand, Operand> = subs.keys().map(|k| (k.clone(), resolve_chain(&subs, k))).collect();

    let mut changed = false;
    for block in cfg.blocks.values_mut() {
        block.instrs.retain_mut(|instr| {
            if instr.opcode == Opcode::Copy {
                if let Some(dst) = &instr.result {
                    if resolved.contains_key(dst) {
                        changed = true;
                        return false;
                    }
                }
            }
            for arg in instr.args.iter_mut() {
                if let Some(r) = resolved.get(arg) {
                    if r != arg {
                        *arg = r.clone();
                        changed = true;
                    }
                }
            }
            true
        });
    }
    if changed {
        *cfg = rebuild(cfg);
    }
    changed
}

/// Remove `phi` instructions by inserting equivalent `copy`s at the tail of
/// each predecessor block, before its terminator.
pub fn deconstruct_ssa(cfg: &mut Cfg) {
    let labels: Vec<u32> = cfg.blocks.keys().copied().collect();
    let mut inserts: HashMap<u32, Vec<Instr>> = HashMap::new();

    for b in &labels {
        for instr in &cfg.blocks[b].instrs {
            if instr.opcode != Opcode::Phi {
                continue;
            }
            let dest = instr.result.clone().expect("phi must have a dest");
            let mut it = instr.args.iter();
            while let (Some(&Operand::Label(pred)), Some(src)) = (it.next(), it.next()) {
                if *src == dest {
                    continue;
                }
                inserts.entry(pred).or_default().push(Instr::new(Opcode::Copy, vec![src.clone()], Some(dest.clone())));
            }
        }
    }

    for b in &labels {
        if let Some(block) = cfg.blocks.get_mut(b) {
            block.instrs.retain(|i| i.opcode != Opcode::Phi);
        }
    }

    for (pred, copies) in inserts {
        if let Some(block) = cfg.blocks.get_mut(&pred) {
            let insert_at = if block.terminated() { block.instrs.len() - 1 } else { block.instrs.len() };
            for (offset, c) in copies.into_iter().enumerate() {
                block.instrs.insert(insert_at + offset, c);
            }
        }
    }
    *cfg = rebuild(cfg);
}

/// Run the full SSA-based data-flow optimization pipeline over one
/// procedure body: construct, optimize to a fixed point, deconstruct.
pub fn optimize_proc(body: &[Instr]) -> Vec<Instr> {
    let blocks = crate::cfg::recover_blocks(body);
    let mut cfg = build_cfg(blocks);
    construct_ssa(&mut cfg);
    loop {
        let mut changed = false;
        changed |= dse(&mut cfg);
        changed |= gcp(&mut cfg);
        if !changed {
            break;
        }
    }
    deconstruct_ssa(&mut cfg);
    let order = linearize(&cfg);
    emit(&cfg, &order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::lower;
    use crate::parser::parse;
    use crate::typechecker::check;

    fn proc_body(src: &str, name: &str) -> Vec<Instr> {
        let mut prog = parse("t.bx", src).unwrap();
        check("t.bx", &mut prog).unwrap();
        let tac = lower("t.bx", &prog).unwrap();
        tac.procs().find(|(n, ..)| *n == name).unwrap().2.to_vec()
    }

    #[test]
    fn no_phi_remains_after_deconstruction() {
        let body = proc_body("def main() { var x = 0 : int; while (x < 3) { x = x + 1; } }", "@main");
        let optimized = optimize_proc(&body);
        assert!(!optimized.iter().any(|i| i.opcode == Opcode::Phi));
    }

    #[test]
    fn dse_drops_unused_temp() {
        let blocks = crate::cfg::recover_blocks(&[
            Instr::new(Opcode::Const, vec![Operand::Imm(1)], Some(Operand::Temp(0))),
            Instr::new(Opcode::Const, vec![Operand::Imm(2)], Some(Operand::Temp(1))),
            Instr::new(Opcode::Ret, vec![Operand::Temp(1)], None),
        ]);
        let mut cfg = build_cfg(blocks);
        let changed = dse(&mut cfg);
        assert!(changed);
        let all: Vec<_> = cfg.blocks.values().flat_map(|b| b.instrs.iter()).collect();
        assert!(!all.iter().any(|i| i.result == Some(Operand::Temp(0))));
    }

    #[test]
    fn dse_never_drops_div_mod_or_call() {
        let blocks = crate::cfg::recover_blocks(&[
            Instr::new(Opcode::Const, vec![Operand::Imm(6)], Some(Operand::Temp(0))),
            Instr::new(Opcode::Const, vec![Operand::Imm(3)], Some(Operand::Temp(1))),
            Instr::new(Opcode::Div, vec![Operand::Temp(0), Operand::Temp(1)], Some(Operand::Temp(2))),
            Instr::new(Opcode::Ret, vec![], None),
        ]);
        let mut cfg = build_cfg(blocks);
        dse(&mut cfg);
        let all: Vec<_> = cfg.blocks.values().flat_map(|b| b.instrs.iter()).collect();
        assert!(all.iter().any(|i| i.opcode == Opcode::Div));
    }

    #[test]
    fn gcp_eliminates_copy_and_rewrites_uses() {
        let blocks = crate::cfg::recover_blocks(&[
            Instr::new(Opcode::Const, vec![Operand::Imm(5)], Some(Operand::Temp(0))),
            Instr::new(Opcode::Copy, vec![Operand::Temp(0)], Some(Operand::Temp(1))),
            Instr::new(Opcode::Ret, vec![Operand::Temp(1)], None),
        ]);
        let mut cfg = build_cfg(blocks);
        let changed = gcp(&mut cfg);
        assert!(changed);
        let all: Vec<_> = cfg.blocks.values().flat_map(|b| b.instrs.iter()).collect();
        assert!(!all.iter().any(|i| i.opcode == Opcode::Copy));
        let ret = all.iter().find(|i| i.opcode == Opcode::Ret).unwrap();
        assert_eq!(ret.args, vec![Operand::Temp(0)]);
    }

    #[test]
    fn dse_is_idempotent_once_converged() {
        let blocks = crate::cfg::recover_blocks(&[
            Instr::new(Opcode::Const, vec![Operand::Imm(1)], Some(Operand::Temp(0))),
            Instr::new(Opcode::Ret, vec![], None),
        ]);
        let mut cfg = build_cfg(blocks);
        dse(&mut cfg);
        let changed_again = dse(&mut cfg);
        assert!(!changed_again);
    }
}
