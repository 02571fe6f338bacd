//! TAC → x86-64 System V assembly (spec.md §4.I).
//!
//! Mirrors `tac2x64.py`'s per-procedure `temp_map`/`asm: List[str]`
//! accumulator shape, generalized from its single-`@main` assumption to
//! every procedure in the program and to calls between them.

use std::collections::HashMap;

use crate::tac::{Instr, Opcode, Operand, TacDecl, TacProgram};

const ARG_REGS: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

fn bare(name: &str) -> &str {
    name.trim_start_matches('@')
}

/// Assign each `%N`/`%name` operand appearing in a procedure body the next
/// stack slot `-8*(k+1)(%rbp)`, parameters first in declaration order, then
/// every other temporary in order of first appearance.
fn allocate_slots(params: &[String], body: &[Instr]) -> (HashMap<Operand, i32>, i32) {
    let mut slots = HashMap::new();
    let mut next = 0i32;
    for p in params {
        next += 1;
        slots.insert(Operand::Param(p.trim_start_matches('%').to_string()), -8 * next);
    }
    for instr in body {
        for operand in instr.args.iter().chain(instr.result.iter()) {
            if matches!(operand, Operand::Temp(_)) && !slots.contains_key(operand) {
                next += 1;
                slots.insert(operand.clone(), -8 * next);
            }
        }
    }
    (slots, next)
}

struct ProcCodegen<'a> {
    name: &'a str,
    slots: HashMap<Operand, i32>,
    out: Vec<String>,
    /// Staged `param i, t` values awaiting the following `call`.
    pending_params: Vec<Option<Operand>>,
}

impl<'a> ProcCodegen<'a> {
    fn new(name: &'a str, params: &[String], body: &[Instr]) -> Self {
        let (slots, _) = allocate_slots(params, body);
        ProcCodegen { name, slots, out: Vec::new(), pending_params: Vec::new() }
    }

    fn emit(&mut self, line: impl Into<String>) {
        self.out.push(line.into());
    }

    fn mem(&self, op: &Operand) -> String {
        match op {
            Operand::Global(n) => format!("{n}(%rip)"),
            Operand::Temp(_) | Operand::Param(_) => {
                format!("{}(%rbp)", self.slots[op])
            }
            other => unreachable!("codegen: {other} has no memory location"),
        }
    }

    fn block_label(&self, n: u32) -> String {
        format!(".L{}_{}", self.name, n)
    }

    fn ret_label(&self) -> String {
        format!(".L{}_ret", self.name)
    }

    fn slot_count(&self) -> i32 {
        self.slots.len() as i32
    }

    fn prologue(&mut self, params: &[String]) {
        self.emit(format!("{}:", self.name));
        self.emit("    pushq %rbp");
        self.emit("    movq %rsp, %rbp");
        // Round the reserved frame up to an even slot count: %rsp is 16-byte
        // aligned here (post-pushq), and `lower_call`'s padding logic assumes
        // it stays that way up to the next `callq`, so an odd slot count
        // would misalign every call in this procedure's body.
        let reserved = self.slot_count() + (self.slot_count() % 2);
        if reserved > 0 {
            self.emit(format!("    subq ${}, %rsp", 8 * reserved));
        }
        for (i, p) in params.iter().enumerate() {
            let dest = self.mem(&Operand::Param(p.trim_start_matches('%').to_string()));
            if i < 6 {
                self.emit(format!("    movq {}, {}", ARG_REGS[i], dest));
            } else {
                let stack_off = 16 + 8 * (i as i32 - 6);
                self.emit(format!("    movq {stack_off}(%rbp), %r11"));
                self.emit(format!("    movq %r11, {dest}"));
            }
        }
    }

    fn epilogue(&mut self) {
        self.emit(format!("{}:", self.ret_label()));
        self.emit("    movq %rbp, %rsp");
        self.emit("    popq %rbp");
        self.emit("    xorq %rax, %rax");
        self.emit("    retq");
    }

    fn lower_instr(&mut self, instr: &Instr) {
        match instr.opcode {
            Opcode::Const => {
                let &Operand::Imm(k) = &instr.args[0] else { unreachable!("const arg must be an immediate") };
                let d = self.mem(instr.result.as_ref().expect("const has a dest"));
                self.emit(format!("    movq ${k}, {d}"));
            }
            Opcode::Copy => {
                let s = self.mem(&instr.args[0]);
                let d = self.mem(instr.result.as_ref().expect("copy has a dest"));
                self.emit(format!("    movq {s}, %r11"));
                self.emit(format!("    movq %r11, {d}"));
            }
            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor => {
                let mnemonic = match instr.opcode {
                    Opcode::Add => "addq",
                    Opcode::Sub => "subq",
                    Opcode::And => "andq",
                    Opcode::Or => "orq",
                    Opcode::Xor => "xorq",
                    _ => unreachable!(),
                };
                let a = self.mem(&instr.args[0]);
                let b = self.mem(&instr.args[1]);
                let d = self.mem(instr.result.as_ref().expect("binop has a dest"));
                self.emit(format!("    movq {a}, %r11"));
                self.emit(format!("    {mnemonic} {b}, %r11"));
                self.emit(format!("    movq %r11, {d}"));
            }
            Opcode::Mul => {
                let a = self.mem(&instr.args[0]);
                let b = self.mem(&instr.args[1]);
                let d = self.mem(instr.result.as_ref().expect("mul has a dest"));
                self.emit(format!("    movq {a}, %rax"));
                self.emit(format!("    movq {b}, %r11"));
                self.emit("    imulq %r11, %rax");
                self.emit(format!("    movq %rax, {d}"));
            }
            Opcode::Div | Opcode::Mod => {
                let a = self.mem(&instr.args[0]);
                let b = self.mem(&instr.args[1]);
                let d = self.mem(instr.result.as_ref().expect("div/mod has a dest"));
                self.emit(format!("    movq {a}, %rax"));
                self.emit("    cqto");
                self.emit(format!("    movq {b}, %r11"));
                self.emit("    idivq %r11");
                let src = if instr.opcode == Opcode::Div { "%rax" } else { "%rdx" };
                self.emit(format!("    movq {src}, {d}"));
            }
            Opcode::Shl | Opcode::Shr => {
                let v = self.mem(&instr.args[0]);
                let c = self.mem(&instr.args[1]);
                let d = self.mem(instr.result.as_ref().expect("shift has a dest"));
                let mnemonic = if instr.opcode == Opcode::Shl { "salq" } else { "sarq" };
                self.emit(format!("    movq {v}, %r11"));
                self.emit(format!("    movq {c}, %rcx"));
                self.emit(format!("    {mnemonic} %cl, %r11"));
                self.emit(format!("    movq %r11, {d}"));
            }
            Opcode::Neg | Opcode::Not => {
                let a = self.mem(&instr.args[0]);
                let d = self.mem(instr.result.as_ref().expect("unop has a dest"));
                let mnemonic = if instr.opcode == Opcode::Neg { "negq" } else { "notq" };
                self.emit(format!("    movq {a}, %r11"));
                self.emit(format!("    {mnemonic} %r11"));
                self.emit(format!("    movq %r11, {d}"));
            }
            Opcode::Label => {
                let &Operand::Label(n) = &instr.args[0] else { unreachable!("label arg must be a label") };
                self.emit(format!("{}:", self.block_label(n)));
            }
            Opcode::Jmp => {
                let &Operand::Label(n) = &instr.args[0] else { unreachable!("jmp arg must be a label") };
                self.emit(format!("    jmp {}", self.block_label(n)));
            }
            Opcode::Je | Opcode::Jne | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge => {
                let t = self.mem(&instr.args[0]);
                let &Operand::Label(n) = &instr.args[1] else { unreachable!("jcc target must be a label") };
                let mnemonic = match instr.opcode {
                    Opcode::Je => "je",
                    Opcode::Jne => "jne",
                    Opcode::Jl => "jl",
                    Opcode::Jle => "jle",
                    Opcode::Jg => "jg",
                    Opcode::Jge => "jge",
                    _ => unreachable!(),
                };
                self.emit("    movq $0, %r11");
                self.emit(format!("    cmpq %r11, {t}"));
                self.emit(format!("    {mnemonic} {}", self.block_label(n)));
            }
            Opcode::Jz => {
                let t = self.mem(&instr.args[0]);
                let &Operand::Label(n) = &instr.args[1] else { unreachable!("jz target must be a label") };
                self.emit("    movq $0, %r11");
                self.emit(format!("    cmpq %r11, {t}"));
                self.emit(format!("    je {}", self.block_label(n)));
            }
            Opcode::Param => {
                let &Operand::Imm(i) = &instr.args[0] else { unreachable!("param position must be an immediate") };
                let idx = i as usize;
                if self.pending_params.len() <= idx {
                    self.pending_params.resize(idx + 1, None);
                }
                self.pending_params[idx] = Some(instr.args[1].clone());
            }
            Opcode::Call => self.lower_call(instr),
            Opcode::Ret => {
                if let Some(arg) = instr.args.first() {
                    let s = self.mem(arg);
                    self.emit(format!("    movq {s}, %rax"));
                }
                self.emit(format!("    jmp {}", self.ret_label()));
            }
            Opcode::Print => {
                // Retained for compatibility with an earlier lowering path;
                // type-check now retargets `print` through `call`.
                let t = self.mem(&instr.args[0]);
                self.emit("    pushq %rdi");
                self.emit("    pushq %rax");
                self.emit(format!("    movq {t}, %rdi"));
                self.emit("    callq bx_print_int");
                self.emit("    popq %rax");
                self.emit("    popq %rdi");
            }
            Opcode::Phi => unreachable!("codegen: phi must be removed by SSA deconstruction before lowering"),
            Opcode::Nop => {}
        }
    }

    fn lower_call(&mut self, instr: &Instr) {
        let Operand::Global(callee) = &instr.args[0] else { unreachable!("call target must be a global") };
        let &Operand::Imm(n) = &instr.args[1] else { unreachable!("call arg count must be an immediate") };
        let n = n as usize;
        let params = std::mem::take(&mut self.pending_params);
        let reg_count = n.min(6);

        for i in 0..reg_count {
            let src = self.mem(params[i].as_ref().expect("missing staged param"));
            self.emit(format!("    movq {src}, {}", ARG_REGS[i]));
        }
        let stack_count = n.saturating_sub(6);
        let pad = stack_count % 2;
        if pad == 1 {
            self.emit("    pushq $0");
        }
        for i in (reg_count..n).rev() {
            let src = self.mem(params[i].as_ref().expect("missing staged param"));
            self.emit(format!("    movq {src}, %r11"));
            self.emit("    pushq %r11");
        }
        self.emit(format!("    callq {}", bare(callee)));
        let to_pop = stack_count + pad;
        if to_pop > 0 {
            self.emit(format!("    addq ${}, %rsp", 8 * to_pop));
        }
        if let Some(d) = &instr.result {
            let dest = self.mem(d);
            self.emit(format!("    movq %rax, {dest}"));
        }
    }
}

/// Lower a whole TAC program to a complete `.s` file: a `.data` section for
/// global variables followed by a `.text` section with one label per
/// procedure.
pub fn codegen_program(tac: &TacProgram) -> String {
    let mut out = Vec::new();

    let globals: Vec<(&str, i64)> = tac
        .decls
        .iter()
        .filter_map(|d| match d {
            TacDecl::GlobalVar { name, init } => Some((name.as_str(), *init)),
            TacDecl::Proc { .. } => None,
        })
        .collect();
    if !globals.is_empty() {
        out.push("    .data".to_string());
        for (name, init) in globals {
            out.push(format!("{}: .quad {init}", bare(name)));
        }
    }

    out.push("    .section .rodata".to_string());
    out.push("    .text".to_string());
    for (name, ..) in tac.procs() {
        out.push(format!("    .globl {}", bare(name)));
    }

    for (name, params, body) in tac.procs() {
        let bare_name = bare(name).to_string();
        let mut gen = ProcCodegen::new(&bare_name, params, body);
        gen.prologue(params);
        for instr in body {
            gen.lower_instr(instr);
        }
        gen.epilogue();
        out.extend(gen.out);
    }

    out.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::linearize_proc;
    use crate::lower::lower;
    use crate::parser::parse;
    use crate::typechecker::check;

    fn codegen_src(src: &str) -> String {
        let mut prog = parse("t.bx", src).unwrap();
        check("t.bx", &mut prog).unwrap();
        let mut tac = lower("t.bx", &prog).unwrap();
        for decl in &mut tac.decls {
            if let TacDecl::Proc { body, .. } = decl {
                *body = linearize_proc(body);
            }
        }
        codegen_program(&tac)
    }

    #[test]
    fn emits_prologue_and_epilogue_for_main() {
        let asm = codegen_src("def main() { var x = 1 : int; }");
        assert!(asm.contains("main:"));
        assert!(asm.contains("pushq %rbp"));
        assert!(asm.contains(".Lmain_ret:"));
        assert!(asm.contains("retq"));
    }

    #[test]
    fn div_mod_use_cqto_and_idivq() {
        let asm = codegen_src("def main() { print(7 / 2); print(7 % 2); }");
        assert!(asm.contains("cqto"));
        assert!(asm.contains("idivq %r11"));
    }

    #[test]
    fn global_var_becomes_data_symbol() {
        let asm = codegen_src("var g = 5 : int; def main() { print(g); }");
        assert!(asm.contains("    .data"));
        assert!(asm.contains("g: .quad 5"));
        assert!(asm.contains("g(%rip)"));
    }

    #[test]
    fn seven_argument_call_pads_stack_for_alignment() {
        let src = "def f(a:int,b:int,c:int,d:int,e:int,g:int,h:int): int { return a; } \
                   def main() { print(f(1,2,3,4,5,6,7)); }";
        let asm = codegen_src(src);
        assert!(asm.contains("pushq $0"));
        assert!(asm.contains("callq f"));
        assert!(asm.contains("addq $16, %rsp"));
    }

    #[test]
    fn six_argument_call_needs_no_stack_padding() {
        let src = "def f(a:int,b:int,c:int,d:int,e:int,g:int): int { return a; } \
                   def main() { print(f(1,2,3,4,5,6)); }";
        let asm = codegen_src(src);
        assert!(!asm.contains("pushq $0"));
        assert!(asm.contains("callq f"));
    }

    #[test]
    fn print_call_lowers_through_bx_print_int() {
        let asm = codegen_src("def main() { print(1); }");
        assert!(asm.contains("callq __bx_print_int"));
    }

    // An odd slot count must not leave %rsp misaligned at the following
    // `callq` (spec.md §8 Testable Property 7, scenario 1).
    #[test]
    fn odd_slot_count_still_aligns_stack_before_call() {
        let asm = codegen_src("def main() { print(2 + 3 * 4); }");
        let sub = asm.lines().find(|l| l.trim_start().starts_with("subq") && l.contains("%rsp")).expect("a subq reserving the frame");
        let bytes: i64 = sub.trim_start().trim_start_matches("subq $").split(',').next().unwrap().parse().unwrap();
        assert_eq!(bytes % 16, 0, "frame reservation must keep %rsp a multiple of 16: {sub}");
    }
}
