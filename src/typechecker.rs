//! Two-phase type checker: global declarations, then procedure bodies.
//!
//! Mutates the AST in place to fill every `Expr`'s resolved type, canonicalize
//! `print` calls to their built-in callee name, and append a synthesized
//! `Return` to void procedures whose body doesn't already end in one (spec.md
//! §4.C, §3 "Ownership/lifecycle").

use std::collections::HashMap;

use crate::ast::*;
use crate::error::{CompileResult, Diagnostic, DiagnosticKind};
use crate::types::Type;

#[derive(Debug, Clone)]
struct ProcSig {
    params: Vec<Type>,
    ret: Type,
    line: u32,
}

type Scope = HashMap<String, (Type, u32)>;

pub struct TypeChecker<'a> {
    file: &'a str,
    globals: Scope,
    procs: HashMap<String, ProcSig>,
    scopes: Vec<Scope>,
    loop_depth: u32,
}

impl<'a> TypeChecker<'a> {
    pub fn new(file: &'a str) -> Self {
        TypeChecker { file, globals: HashMap::new(), procs: HashMap::new(), scopes: Vec::new(), loop_depth: 0 }
    }

    fn err(&self, line: u32, kind: DiagnosticKind, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.file, line, kind, message.into())
    }

    fn decl_err(&self, line: u32, message: impl Into<String>) -> Diagnostic {
        self.err(line, DiagnosticKind::Declaration, message)
    }

    fn type_err(&self, line: u32, message: impl Into<String>) -> Diagnostic {
        self.err(line, DiagnosticKind::Type, message)
    }

    /// Run both phases over `program`, mutating it in place.
    pub fn check_program(&mut self, program: &mut Program) -> CompileResult<()> {
        self.check_globals(program)?;
        for decl in &mut program.decls {
            if let Decl::ProcDecl { name, params, ret, body, line } = decl {
                self.check_proc(name, params, *ret, body, *line)?;
            }
        }
        Ok(())
    }

    // ---- phase 1: global declarations ----

    fn check_globals(&mut self, program: &Program) -> CompileResult<()> {
        for decl in &program.decls {
            match decl {
                Decl::VarDecl { ty, inits, .. } => {
                    for init in inits {
                        if let Some((_, prev_line)) = self.globals.get(&init.name) {
                            return Err(self
                                .decl_err(init.line, format!("redeclaration of global '{}'", init.name))
                                .with_note(format!("earlier declaration of '{}' at line {}", init.name, prev_line)));
                        }
                        let lit_ty = literal_type(&init.expr).ok_or_else(|| {
                            self.decl_err(
                                init.line,
                                format!("global '{}' must be initialized with a literal", init.name),
                            )
                        })?;
                        if lit_ty != *ty {
                            return Err(self.type_err(
                                init.line,
                                format!("global '{}' declared {ty} but initialized with a {lit_ty} literal", init.name),
                            ));
                        }
                        self.globals.insert(init.name.clone(), (*ty, init.line));
                    }
                }
                Decl::ProcDecl { name, params, ret, line, .. } => {
                    if let Some(prev) = self.procs.get(name) {
                        return Err(self
                            .decl_err(*line, format!("redeclaration of procedure '{name}'"))
                            .with_note(format!("earlier declaration of '{name}' at line {}", prev.line)));
                    }
                    let param_types: Vec<Type> = params.iter().flat_map(|p| p.names.iter().map(move |_| p.ty)).collect();
                    self.procs.insert(name.clone(), ProcSig { params: param_types, ret: *ret, line: *line });
                }
            }
        }

        match self.procs.get("main") {
            None => return Err(self.decl_err(0, "program has no 'main' procedure")),
            Some(sig) => {
                if !sig.params.is_empty() || sig.ret != Type::Void {
                    return Err(self.decl_err(
                        sig.line,
                        "'main' must take no parameters and return void",
                    ));
                }
            }
        }
        Ok(())
    }

    // ---- phase 2: procedure bodies ----

    fn check_proc(&mut self, name: &str, params: &[Param], ret: Type, body: &mut Stmt, line: u32) -> CompileResult<()> {
        let mut scope = Scope::new();
        for param in params {
            for pname in &param.names {
                if let Some((_, prev_line)) = scope.get(pname) {
                    return Err(self
                        .decl_err(line, format!("duplicate parameter '{pname}' in '{name}'"))
                        .with_note(format!("earlier declaration of '{pname}' at line {prev_line}")));
                }
                scope.insert(pname.clone(), (param.ty, line));
            }
        }
        self.scopes.push(scope);
        let returns = self.check_stmt(body, ret)?;
        self.scopes.pop();

        if ret != Type::Void && !returns {
            return Err(self.type_err(line, format!("procedure '{name}' does not return on every path")));
        }
        if ret == Type::Void {
            ensure_trailing_return(body);
        }
        Ok(())
    }

    fn lookup_var(&self, name: &str) -> Option<Type> {
        for scope in self.scopes.iter().rev() {
            if let Some((ty, _)) = scope.get(name) {
                return Some(*ty);
            }
        }
        self.globals.get(name).map(|(ty, _)| *ty)
    }

    /// Type-check `stmt`; returns whether it guarantees a return on every
    /// control path (spec.md §3 invariant 3).
    fn check_stmt(&mut self, stmt: &mut Stmt, ret: Type) -> CompileResult<bool> {
        match stmt {
            Stmt::VarDecl { ty, inits, .. } => {
                for init in inits.iter_mut() {
                    let got = self.check_expr(&mut init.expr)?;
                    if got != *ty {
                        return Err(self.type_err(
                            init.line,
                            format!("variable '{}' declared {ty} but initialized with {got}", init.name),
                        ));
                    }
                    let scope = self.scopes.last_mut().expect("check_stmt: no active scope");
                    if let Some((_, prev_line)) = scope.get(&init.name) {
                        return Err(self
                            .decl_err(init.line, format!("redeclaration of '{}'", init.name))
                            .with_note(format!("earlier declaration of '{}' at line {prev_line}", init.name)));
                    }
                    scope.insert(init.name.clone(), (*ty, init.line));
                }
                Ok(false)
            }
            Stmt::Assign { name, expr, line } => {
                let var_ty = self
                    .lookup_var(name)
                    .ok_or_else(|| self.decl_err(*line, format!("assignment to undeclared variable '{name}'")))?;
                let got = self.check_expr(expr)?;
                if got != var_ty {
                    return Err(self.type_err(*line, format!("cannot assign {got} to '{name}' of type {var_ty}")));
                }
                Ok(false)
            }
            Stmt::Eval { expr, .. } => {
                self.check_expr(expr)?;
                Ok(false)
            }
            Stmt::IfElse { cond, then_block, else_rest, line } => {
                let cty = self.check_expr(cond)?;
                if cty != Type::Bool {
                    return Err(self.type_err(*line, format!("if condition must be bool, found {cty}")));
                }
                let then_returns = self.check_stmt(then_block, ret)?;
                let else_returns = self.check_stmt(else_rest, ret)?;
                Ok(then_returns && else_returns)
            }
            Stmt::While { cond, body, line } => {
                let cty = self.check_expr(cond)?;
                if cty != Type::Bool {
                    return Err(self.type_err(*line, format!("while condition must be bool, found {cty}")));
                }
                self.loop_depth += 1;
                self.check_stmt(body, ret)?;
                self.loop_depth -= 1;
                Ok(false)
            }
            Stmt::Jump { line, .. } => {
                if self.loop_depth == 0 {
                    return Err(self.type_err(*line, "'break'/'continue' outside of a loop"));
                }
                Ok(false)
            }
            Stmt::Return { expr, line } => match (expr, ret) {
                (None, Type::Void) => Ok(true),
                (None, want) => Err(self.type_err(*line, format!("bare return in procedure returning {want}"))),
                (Some(e), want) => {
                    let got = self.check_expr(e)?;
                    if got != want {
                        Err(self.type_err(*line, format!("return type mismatch: expected {want}, found {got}")))
                    } else {
                        Ok(true)
                    }
                }
            },
            Stmt::Block { stmts, .. } => {
                self.scopes.push(Scope::new());
                let mut returns = false;
                for s in stmts.iter_mut() {
                    if self.check_stmt(s, ret)? {
                        returns = true;
                    }
                }
                self.scopes.pop();
                Ok(returns)
            }
        }
    }

    fn check_expr(&mut self, expr: &mut Expr) -> CompileResult<Type> {
        match expr {
            Expr::Number(_) => Ok(Type::Int),
            Expr::Bool(_) => Ok(Type::Bool),
            Expr::Var { name, ty } => {
                let found = self
                    .lookup_var(name)
                    .ok_or_else(|| self.decl_err(0, format!("undeclared variable '{name}'")))?;
                *ty = Some(found);
                Ok(found)
            }
            Expr::OpApp { op, args, ty, line } => {
                let line = *line;
                let arg_tys: Vec<Type> =
                    args.iter_mut().map(|a| self.check_expr(a)).collect::<CompileResult<_>>()?;
                let result = if op.is_relational() {
                    for t in &arg_tys {
                        if *t != Type::Int {
                            return Err(self.type_err(line, format!("operator requires int operands, found {t}")));
                        }
                    }
                    Type::Bool
                } else if op.is_boolean() {
                    for t in &arg_tys {
                        if *t != Type::Bool {
                            return Err(self.type_err(line, format!("operator requires bool operands, found {t}")));
                        }
                    }
                    Type::Bool
                } else {
                    for t in &arg_tys {
                        if *t != Type::Int {
                            return Err(self.type_err(line, format!("operator requires int operands, found {t}")));
                        }
                    }
                    Type::Int
                };
                *ty = Some(result);
                Ok(result)
            }
            Expr::Call { callee, args, ty, line } => {
                let line = *line;
                if callee == "print" {
                    if args.len() != 1 {
                        return Err(self.type_err(line, format!("'print' takes 1 argument, found {}", args.len())));
                    }
                    let arg_ty = self.check_expr(&mut args[0])?;
                    *callee = match arg_ty {
                        Type::Int => PRINT_INT.to_string(),
                        Type::Bool => PRINT_BOOL.to_string(),
                        Type::Void => {
                            return Err(self.type_err(line, "'print' requires an int or bool argument, found void"))
                        }
                    };
                    *ty = Some(Type::Void);
                    return Ok(Type::Void);
                }

                let sig = self
                    .procs
                    .get(callee.as_str())
                    .cloned()
                    .ok_or_else(|| self.decl_err(line, format!("call to undeclared procedure '{callee}'")))?;
                if args.len() != sig.params.len() {
                    return Err(self.type_err(
                        line,
                        format!("'{callee}' expects {} argument(s), found {}", sig.params.len(), args.len()),
                    ));
                }
                for (arg, want) in args.iter_mut().zip(sig.params.iter()) {
                    let got = self.check_expr(arg)?;
                    if got != *want {
                        return Err(self.type_err(line, format!("argument type mismatch: expected {want}, found {got}")));
                    }
                }
                *ty = Some(sig.ret);
                Ok(sig.ret)
            }
        }
    }
}

fn literal_type(expr: &Expr) -> Option<Type> {
    match expr {
        Expr::Number(_) => Some(Type::Int),
        Expr::Bool(_) => Some(Type::Bool),
        _ => None,
    }
}

/// Append a synthesized `Return` if `body`'s last top-level statement isn't
/// already one (spec.md §3: "the checker also appends an implicit Return to
/// void procedures whose last statement is not already one").
fn ensure_trailing_return(body: &mut Stmt) {
    if let Stmt::Block { stmts, line } = body {
        let already = matches!(stmts.last(), Some(Stmt::Return { .. }));
        if !already {
            stmts.push(Stmt::Return { expr: None, line: *line });
        }
    }
}

/// Run the two-phase checker over a freshly parsed program.
pub fn check(file: &str, program: &mut Program) -> CompileResult<()> {
    TypeChecker::new(file).check_program(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn check_src(src: &str) -> CompileResult<Program> {
        let mut prog = parse("t.bx", src).expect("parse");
        check("t.bx", &mut prog)?;
        Ok(prog)
    }

    #[test]
    fn accepts_well_typed_program() {
        check_src("def main() { print(2 + 3 * 4); }").unwrap();
    }

    #[test]
    fn retargets_print_by_argument_type() {
        let prog = check_src("def main() { print(1); print(true); }").unwrap();
        let Decl::ProcDecl { body, .. } = &prog.decls[0] else { panic!() };
        let Stmt::Block { stmts, .. } = body else { panic!() };
        let Stmt::Eval { expr: Expr::Call { callee, .. }, .. } = &stmts[0] else { panic!() };
        assert_eq!(callee, PRINT_INT);
        let Stmt::Eval { expr: Expr::Call { callee, .. }, .. } = &stmts[1] else { panic!() };
        assert_eq!(callee, PRINT_BOOL);
    }

    #[test]
    fn rejects_break_outside_loop() {
        let err = check_src("def main() { break; }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Type);
    }

    #[test]
    fn accepts_break_inside_while() {
        check_src("def main() { while (true) { break; } }").unwrap();
    }

    #[test]
    fn rejects_missing_return_on_non_void_proc() {
        let err = check_src("def f(): int { if (true) { return 1; } } def main() { }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Type);
    }

    #[test]
    fn accepts_return_on_every_branch() {
        check_src("def f(): int { if (true) { return 1; } else { return 2; } } def main() { }").unwrap();
    }

    #[test]
    fn synthesizes_trailing_return_for_void_proc() {
        let prog = check_src("def f() { var x = 1 : int; } def main() { f(); }").unwrap();
        let Decl::ProcDecl { body, .. } = &prog.decls[0] else { panic!() };
        let Stmt::Block { stmts, .. } = body else { panic!() };
        assert!(matches!(stmts.last(), Some(Stmt::Return { expr: None, .. })));
    }

    #[test]
    fn rejects_wrong_main_signature() {
        let err = check_src("def main(): int { return 0; }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Declaration);
    }

    #[test]
    fn rejects_main_returning_wrong_type() {
        let err = check_src("def main() { return 1; }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Type);
    }

    #[test]
    fn rejects_redeclaration_with_note() {
        let err = check_src("var x = 1 : int; var x = 2 : int; def main() { }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Declaration);
        assert!(err.note.is_some());
    }

    #[test]
    fn rejects_non_constant_global_initializer() {
        let err = check_src("var x = 1 + 1 : int; def main() { }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Declaration);
    }

    #[test]
    fn shadowing_across_scopes_is_allowed() {
        check_src("def main() { var x = 1 : int; { var x = true : bool; } }").unwrap();
    }

    #[test]
    fn call_arity_mismatch_is_type_error() {
        let err = check_src("def f(a: int): int { return a; } def main() { f(); }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Type);
    }
}
