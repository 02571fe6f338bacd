//! AST → TAC lowering: top-down maximal munch (spec.md §4.E).
//!
//! Mirrors `ast2tac.py`'s shape closely: a
//! scope stack from source name to TAC operand, per-procedure monotonic
//! temp/label counters, and a pair of stacks threading `break`/`continue`
//! targets through nested `while` bodies. Integer and boolean expressions
//! take separate lowering paths (`tmm_expr` vs `tmm_bool`) so boolean values
//! are short-circuited via jumps and only materialized to a 0/1 temporary
//! when something needs them as data.

use std::collections::HashMap;

use crate::ast::*;
use crate::error::{bug, CompileResult};
use crate::tac::{Instr, Opcode, Operand, TacDecl, TacProgram};

fn arithmetic_opcode(op: Op) -> Option<Opcode> {
    Some(match op {
        Op::Plus => Opcode::Add,
        Op::Minus => Opcode::Sub,
        Op::Times => Opcode::Mul,
        Op::Div => Opcode::Div,
        Op::Modulus => Opcode::Mod,
        Op::BitAnd => Opcode::And,
        Op::BitOr => Opcode::Or,
        Op::BitXor => Opcode::Xor,
        Op::BitShl => Opcode::Shl,
        Op::BitShr => Opcode::Shr,
        Op::BitCompl => Opcode::Not,
        Op::Uminus => Opcode::Neg,
        _ => return None,
    })
}

fn relational_opcode(op: Op) -> Opcode {
    match op {
        Op::Equality => Opcode::Je,
        Op::Disequality => Opcode::Jne,
        Op::Lt => Opcode::Jl,
        Op::Leq => Opcode::Jle,
        Op::Gt => Opcode::Jg,
        Op::Geq => Opcode::Jge,
        _ => unreachable!("relational_opcode called on non-relational op"),
    }
}

fn literal_value(file: &str, expr: &Expr) -> CompileResult<i64> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Bool(b) => Ok(if *b { 1 } else { 0 }),
        _ => bug!(file, expr.line(), "global initializer is not a literal after type-check"),
    }
}

struct ProcLowerer<'a> {
    file: &'a str,
    scopes: Vec<HashMap<String, Operand>>,
    temp_counter: u32,
    label_counter: u32,
    break_targets: Vec<u32>,
    continue_targets: Vec<u32>,
    body: Vec<Instr>,
}

impl<'a> ProcLowerer<'a> {
    fn new(file: &'a str, global_scope: HashMap<String, Operand>) -> Self {
        ProcLowerer {
            file,
            scopes: vec![global_scope],
            temp_counter: 0,
            label_counter: 0,
            break_targets: Vec::new(),
            continue_targets: Vec::new(),
            body: Vec::new(),
        }
    }

    fn fresh_temp(&mut self) -> Operand {
        let t = Operand::Temp(self.temp_counter);
        self.temp_counter += 1;
        t
    }

    fn fresh_label(&mut self) -> u32 {
        let l = self.label_counter;
        self.label_counter += 1;
        l
    }

    fn emit(&mut self, instr: Instr) {
        self.body.push(instr);
    }

    fn lookup(&self, name: &str) -> CompileResult<Operand> {
        for scope in self.scopes.iter().rev() {
            if let Some(op) = scope.get(name) {
                return Ok(op.clone());
            }
        }
        bug!(self.file, 0, "unresolved variable '{name}' survived type-checking")
    }

    fn bind(&mut self, name: &str, op: Operand) {
        self.scopes.last_mut().expect("ProcLowerer: no active scope").insert(name.to_string(), op);
    }

    // ---- expressions ----

    fn tmm_expr(&mut self, expr: &Expr, dest: Operand) -> CompileResult<()> {
        match expr {
            Expr::Number(n) => self.emit(Instr::new(Opcode::Const, vec![Operand::Imm(*n)], Some(dest))),
            Expr::Bool(b) => {
                self.emit(Instr::new(Opcode::Const, vec![Operand::Imm(if *b { 1 } else { 0 })], Some(dest)))
            }
            Expr::Var { name, .. } => {
                let src = self.lookup(name)?;
                self.emit(Instr::new(Opcode::Copy, vec![src], Some(dest)));
            }
            Expr::OpApp { ty, .. } if ty.expect("OpApp.ty filled by type-check") == crate::types::Type::Bool => {
                let lt = self.fresh_label();
                let lf = self.fresh_label();
                self.emit(Instr::new(Opcode::Const, vec![Operand::Imm(0)], Some(dest.clone())));
                self.tmm_bool(expr, lt, lf)?;
                self.emit(Instr::label(lt));
                self.emit(Instr::new(Opcode::Const, vec![Operand::Imm(1)], Some(dest)));
                self.emit(Instr::label(lf));
            }
            Expr::OpApp { op, args, .. } => {
                let opcode = arithmetic_opcode(*op)
                    .unwrap_or_else(|| unreachable!("non-arithmetic, non-bool OpApp in tmm_expr"));
                let mut arg_temps = Vec::with_capacity(args.len());
                for a in args {
                    let t = self.fresh_temp();
                    self.tmm_expr(a, t.clone())?;
                    arg_temps.push(t);
                }
                self.emit(Instr::new(opcode, arg_temps, Some(dest)));
            }
            Expr::Call { callee, args, .. } => self.tmm_call(callee, args, Some(dest))?,
        }
        Ok(())
    }

    /// Short-circuit boolean lowering: jumps to `lt`/`lf`, never to data.
    fn tmm_bool(&mut self, expr: &Expr, lt: u32, lf: u32) -> CompileResult<()> {
        match expr {
            Expr::Bool(true) => self.emit(Instr::jmp(lt)),
            Expr::Bool(false) => self.emit(Instr::jmp(lf)),
            Expr::Var { name, .. } => {
                let v = self.lookup(name)?;
                self.emit(Instr::new(Opcode::Jz, vec![v, Operand::Label(lf)], None));
                self.emit(Instr::jmp(lt));
            }
            Expr::OpApp { op, args, .. } if op.is_relational() => {
                let ta = self.fresh_temp();
                self.tmm_expr(&args[0], ta.clone())?;
                let tb = self.fresh_temp();
                self.tmm_expr(&args[1], tb.clone())?;
                self.emit(Instr::new(Opcode::Sub, vec![ta.clone(), tb], Some(ta.clone())));
                self.emit(Instr::new(relational_opcode(*op), vec![ta, Operand::Label(lt)], None));
                self.emit(Instr::jmp(lf));
            }
            Expr::OpApp { op: Op::BoolAnd, args, .. } => {
                let li = self.fresh_label();
                self.tmm_bool(&args[0], li, lf)?;
                self.emit(Instr::label(li));
                self.tmm_bool(&args[1], lt, lf)?;
            }
            Expr::OpApp { op: Op::BoolOr, args, .. } => {
                let li = self.fresh_label();
                self.tmm_bool(&args[0], lt, li)?;
                self.emit(Instr::label(li));
                self.tmm_bool(&args[1], lt, lf)?;
            }
            Expr::OpApp { op: Op::BoolNeg, args, .. } => self.tmm_bool(&args[0], lf, lt)?,
            Expr::OpApp { .. } => bug!(self.file, expr.line(), "non-bool OpApp reached tmm_bool"),
            Expr::Call { callee, args, .. } => {
                let t = self.fresh_temp();
                self.tmm_call(callee, args, Some(t.clone()))?;
                self.emit(Instr::new(Opcode::Jz, vec![t, Operand::Label(lf)], None));
                self.emit(Instr::jmp(lt));
            }
            Expr::Number(_) => bug!(self.file, expr.line(), "int literal reached tmm_bool"),
        }
        Ok(())
    }

    fn tmm_call(&mut self, callee: &str, args: &[Expr], dest: Option<Operand>) -> CompileResult<()> {
        let mut arg_temps = Vec::with_capacity(args.len());
        for a in args {
            let t = self.fresh_temp();
            self.tmm_expr(a, t.clone())?;
            arg_temps.push(t);
        }
        for (i, t) in arg_temps.iter().enumerate() {
            self.emit(Instr::new(Opcode::Param, vec![Operand::Imm(i as i64), t.clone()], None));
        }
        let call_args = vec![Operand::Global(callee.to_string()), Operand::Imm(args.len() as i64)];
        self.emit(Instr::new(Opcode::Call, call_args, dest));
        Ok(())
    }

    // ---- statements ----

    fn tmm_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::VarDecl { inits, .. } => {
                for init in inits {
                    let t = self.fresh_temp();
                    self.tmm_expr(&init.expr, t.clone())?;
                    self.bind(&init.name, t);
                }
            }
            Stmt::Assign { name, expr, .. } => {
                let dest = self.lookup(name)?;
                self.tmm_expr(expr, dest)?;
            }
            Stmt::Eval { expr, .. } => self.tmm_eval(expr)?,
            Stmt::IfElse { cond, then_block, else_rest, .. } => {
                let lt = self.fresh_label();
                let lf = self.fresh_label();
                let lo = self.fresh_label();
                self.tmm_bool(cond, lt, lf)?;
                self.emit(Instr::label(lt));
                self.tmm_stmt(then_block)?;
                self.emit(Instr::jmp(lo));
                self.emit(Instr::label(lf));
                self.tmm_stmt(else_rest)?;
                self.emit(Instr::label(lo));
            }
            Stmt::While { cond, body, .. } => {
                let lhead = self.fresh_label();
                let lbody = self.fresh_label();
                let lend = self.fresh_label();
                self.break_targets.push(lend);
                self.continue_targets.push(lhead);
                self.emit(Instr::label(lhead));
                self.tmm_bool(cond, lbody, lend)?;
                self.emit(Instr::label(lbody));
                self.tmm_stmt(body)?;
                self.emit(Instr::jmp(lhead));
                self.emit(Instr::label(lend));
                self.break_targets.pop();
                self.continue_targets.pop();
            }
            Stmt::Jump { kind, line } => {
                let target = match kind {
                    JumpKind::Break => self.break_targets.last(),
                    JumpKind::Continue => self.continue_targets.last(),
                };
                match target {
                    Some(l) => self.emit(Instr::jmp(*l)),
                    None => bug!(self.file, *line, "break/continue outside a loop survived type-checking"),
                }
            }
            Stmt::Return { expr, .. } => match expr {
                Some(e) => {
                    let t = self.fresh_temp();
                    self.tmm_expr(e, t.clone())?;
                    self.emit(Instr::new(Opcode::Ret, vec![t], None));
                }
                None => self.emit(Instr::new(Opcode::Ret, vec![], None)),
            },
            Stmt::Block { stmts, .. } => {
                self.scopes.push(HashMap::new());
                for s in stmts {
                    self.tmm_stmt(s)?;
                }
                self.scopes.pop();
            }
        }
        Ok(())
    }

    /// `Eval(e)`: evaluate with no destination, still emitting side effects.
    fn tmm_eval(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Number(_) | Expr::Bool(_) | Expr::Var { .. } => {}
            Expr::Call { callee, args, .. } => self.tmm_call(callee, args, None)?,
            Expr::OpApp { .. } => {
                let t = self.fresh_temp();
                self.tmm_expr(expr, t)?;
            }
        }
        Ok(())
    }
}

fn global_name(name: &str) -> String {
    format!("@{name}")
}

/// Lower a fully type-checked [`Program`] into a [`TacProgram`].
pub fn lower(file: &str, program: &Program) -> CompileResult<TacProgram> {
    let mut global_scope = HashMap::new();
    for decl in &program.decls {
        match decl {
            Decl::VarDecl { inits, .. } => {
                for init in inits {
                    global_scope.insert(init.name.clone(), Operand::Global(init.name.clone()));
                }
            }
            Decl::ProcDecl { name, .. } => {
                global_scope.insert(name.clone(), Operand::Global(name.clone()));
            }
        }
    }

    let mut decls = Vec::new();
    for decl in &program.decls {
        match decl {
            Decl::VarDecl { inits, .. } => {
                for init in inits {
                    let init_val = literal_value(file, &init.expr)?;
                    decls.push(TacDecl::GlobalVar { name: global_name(&init.name), init: init_val });
                }
            }
            Decl::ProcDecl { name, params, body, .. } => {
                let mut lowerer = ProcLowerer::new(file, global_scope.clone());
                lowerer.scopes.push(HashMap::new());
                let mut flat_params = Vec::new();
                for p in params {
                    for pname in &p.names {
                        lowerer.bind(pname, Operand::Param(pname.clone()));
                        flat_params.push(format!("%{pname}"));
                    }
                }
                lowerer.tmm_stmt(body)?;
                decls.push(TacDecl::Proc { name: global_name(name), params: flat_params, body: lowerer.body });
            }
        }
    }
    Ok(TacProgram { decls })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::typechecker::check;

    fn lower_src(src: &str) -> TacProgram {
        let mut prog = parse("t.bx", src).unwrap();
        check("t.bx", &mut prog).unwrap();
        lower("t.bx", &prog).unwrap()
    }

    fn main_body(tac: &TacProgram) -> &[Instr] {
        tac.procs().find(|(name, ..)| *name == "@main").unwrap().2
    }

    #[test]
    fn number_literal_lowers_to_const() {
        let tac = lower_src("def main() { var x = 5 : int; }");
        let body = main_body(&tac);
        assert!(matches!(body[0].opcode, Opcode::Const));
        assert_eq!(body[0].args, vec![Operand::Imm(5)]);
    }

    #[test]
    fn global_var_lowers_to_global_decl() {
        let tac = lower_src("var g = 7 : int; def main() { }");
        let g = tac.decls.iter().find_map(|d| match d {
            TacDecl::GlobalVar { name, init } => Some((name.clone(), *init)),
            _ => None,
        });
        assert_eq!(g, Some(("@g".to_string(), 7)));
    }

    #[test]
    fn print_call_lowers_to_param_then_call() {
        let tac = lower_src("def main() { print(1); }");
        let body = main_body(&tac);
        let opcodes: Vec<_> = body.iter().map(|i| i.opcode).collect();
        assert!(opcodes.contains(&Opcode::Param));
        assert!(opcodes.contains(&Opcode::Call));
    }

    #[test]
    fn while_loop_uses_three_fresh_labels() {
        let tac = lower_src("def main() { var x = 0 : int; while (x < 3) { x = x + 1; } }");
        let body = main_body(&tac);
        let labels = body.iter().filter(|i| i.opcode == Opcode::Label).count();
        assert!(labels >= 3);
    }

    #[test]
    fn relational_in_bool_context_emits_sub_then_jcc() {
        let tac = lower_src("def main() { if (1 < 2) { print(1); } }");
        let body = main_body(&tac);
        let opcodes: Vec<_> = body.iter().map(|i| i.opcode).collect();
        let sub_pos = opcodes.iter().position(|o| *o == Opcode::Sub).unwrap();
        assert_eq!(opcodes[sub_pos + 1], Opcode::Jl);
    }

    #[test]
    fn break_jumps_to_loop_end_label() {
        let tac = lower_src("def main() { while (true) { break; } }");
        let body = main_body(&tac);
        assert!(body.iter().any(|i| i.opcode == Opcode::Jmp));
    }

    #[test]
    fn void_return_has_no_args() {
        let tac = lower_src("def f() { } def main() { f(); }");
        let (_, _, body) = tac.procs().find(|(n, ..)| *n == "@f").unwrap();
        let ret = body.iter().find(|i| i.opcode == Opcode::Ret).unwrap();
        assert!(ret.args.is_empty());
    }

    #[test]
    fn bool_and_short_circuits_through_labels() {
        let tac = lower_src("def main() { if (true && false) { print(1); } }");
        let body = main_body(&tac);
        assert!(body.iter().any(|i| i.opcode == Opcode::Label));
    }
}
