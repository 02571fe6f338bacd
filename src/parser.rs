//! Recursive-descent parser for BX, producing an AST [`Program`] or a
//! located [`Diagnostic`].
//!
//! The expression grammar is implemented as one function per precedence
//! tier (spec.md §4.B) rather than a generic Pratt loop, so the nonassoc
//! tiers (equality, relational) are nonassoc by construction: they parse at
//! most one operator at their level and simply don't loop.

use crate::ast::*;
use crate::error::{CompileResult, Diagnostic, DiagnosticKind};
use crate::lexer::{TokKind, Token};
use crate::types::Type;

pub struct Parser<'a> {
    file: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(file: &'a str, tokens: Vec<Token>) -> Self {
        Parser { file, tokens, pos: 0 }
    }

    fn cur(&self) -> &TokKind {
        &self.tokens[self.pos].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.file, self.line(), DiagnosticKind::Syntax, message.into())
    }

    fn expect(&mut self, kind: &TokKind) -> CompileResult<Token> {
        if self.cur() == kind {
            Ok(self.advance())
        } else {
            Err(self.err(format!("expected {kind:?}, found {:?}", self.cur())))
        }
    }

    fn eat(&mut self, kind: &TokKind) -> bool {
        if self.cur() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> CompileResult<String> {
        match self.cur().clone() {
            TokKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.err(format!("expected identifier, found {other:?}"))),
        }
    }

    fn ty(&mut self) -> CompileResult<Type> {
        match self.cur() {
            TokKind::Int => {
                self.advance();
                Ok(Type::Int)
            }
            TokKind::Bool => {
                self.advance();
                Ok(Type::Bool)
            }
            other => Err(self.err(format!("expected a type, found {other:?}"))),
        }
    }

    pub fn parse_program(&mut self) -> CompileResult<Program> {
        let mut decls = Vec::new();
        while *self.cur() != TokKind::Eof {
            decls.push(self.parse_decl()?);
        }
        Ok(Program { decls })
    }

    fn parse_decl(&mut self) -> CompileResult<Decl> {
        match self.cur() {
            TokKind::Var => self.parse_vardecl_top(),
            TokKind::Def => self.parse_procdecl(),
            other => Err(self.err(format!("expected a declaration, found {other:?}"))),
        }
    }

    fn parse_varinits(&mut self) -> CompileResult<Vec<VarInit>> {
        let mut inits = Vec::new();
        loop {
            let line = self.line();
            let name = self.ident()?;
            self.expect(&TokKind::Equal)?;
            let expr = self.parse_expr()?;
            inits.push(VarInit { name, expr, line });
            if !self.eat(&TokKind::Comma) {
                break;
            }
        }
        Ok(inits)
    }

    fn parse_vardecl_top(&mut self) -> CompileResult<Decl> {
        let line = self.line();
        self.expect(&TokKind::Var)?;
        let inits = self.parse_varinits()?;
        self.expect(&TokKind::Colon)?;
        let ty = self.ty()?;
        self.expect(&TokKind::Semicolon)?;
        Ok(Decl::VarDecl { ty, inits, line })
    }

    fn parse_vardecl_stmt(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        self.expect(&TokKind::Var)?;
        let inits = self.parse_varinits()?;
        self.expect(&TokKind::Colon)?;
        let ty = self.ty()?;
        self.expect(&TokKind::Semicolon)?;
        Ok(Stmt::VarDecl { ty, inits, line })
    }

    fn parse_params(&mut self) -> CompileResult<Vec<Param>> {
        let mut params = Vec::new();
        if *self.cur() == TokKind::RParen {
            return Ok(params);
        }
        loop {
            let mut names = vec![self.ident()?];
            while self.eat(&TokKind::Comma) {
                // A comma could start either another name in this group or
                // the next `param` entirely; both share the same leading
                // token (`IDENT`), so we speculatively grab an ident and
                // decide by what follows.
                let name = self.ident()?;
                if *self.cur() == TokKind::Colon {
                    names.push(name);
                } else {
                    // This identifier belongs to the next param group; undo.
                    self.pos -= 1;
                    break;
                }
            }
            self.expect(&TokKind::Colon)?;
            let ty = self.ty()?;
            params.push(Param { names, ty });
            if !self.eat(&TokKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_procdecl(&mut self) -> CompileResult<Decl> {
        let line = self.line();
        self.expect(&TokKind::Def)?;
        let name = self.ident()?;
        self.expect(&TokKind::LParen)?;
        let params = self.parse_params()?;
        self.expect(&TokKind::RParen)?;
        let ret = if self.eat(&TokKind::Colon) { self.ty()? } else { Type::Void };
        let body = self.parse_block()?;
        Ok(Decl::ProcDecl { name, params, ret, body, line })
    }

    fn parse_block(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        self.expect(&TokKind::LBrace)?;
        let mut stmts = Vec::new();
        while *self.cur() != TokKind::RBrace {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(&TokKind::RBrace)?;
        Ok(Stmt::Block { stmts, line })
    }

    fn parse_stmt(&mut self) -> CompileResult<Stmt> {
        match self.cur() {
            TokKind::Var => self.parse_vardecl_stmt(),
            TokKind::LBrace => self.parse_block(),
            TokKind::If => self.parse_ifelse(),
            TokKind::While => self.parse_while(),
            TokKind::Break | TokKind::Continue => self.parse_jump(),
            TokKind::Return => self.parse_return(),
            TokKind::Ident(_) => self.parse_assign_or_eval(),
            _ => self.parse_eval(),
        }
    }

    fn parse_ifelse(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        self.expect(&TokKind::If)?;
        self.expect(&TokKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&TokKind::RParen)?;
        let then_block = self.parse_block()?;
        let else_rest = if self.eat(&TokKind::Else) {
            if *self.cur() == TokKind::If {
                self.parse_ifelse()?
            } else {
                self.parse_block()?
            }
        } else {
            Stmt::Block { stmts: Vec::new(), line: self.line() }
        };
        Ok(Stmt::IfElse { cond, then_block: Box::new(then_block), else_rest: Box::new(else_rest), line })
    }

    fn parse_while(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        self.expect(&TokKind::While)?;
        self.expect(&TokKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&TokKind::RParen)?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body: Box::new(body), line })
    }

    fn parse_jump(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        let kind = match self.advance().kind {
            TokKind::Break => JumpKind::Break,
            TokKind::Continue => JumpKind::Continue,
            _ => unreachable!(),
        };
        self.expect(&TokKind::Semicolon)?;
        Ok(Stmt::Jump { kind, line })
    }

    fn parse_return(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        self.expect(&TokKind::Return)?;
        let expr = if *self.cur() == TokKind::Semicolon { None } else { Some(self.parse_expr()?) };
        self.expect(&TokKind::Semicolon)?;
        Ok(Stmt::Return { expr, line })
    }

    fn parse_assign_or_eval(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        let save = self.pos;
        let name = self.ident()?;
        if self.eat(&TokKind::Equal) {
            let expr = self.parse_expr()?;
            self.expect(&TokKind::Semicolon)?;
            return Ok(Stmt::Assign { name, expr, line });
        }
        self.pos = save;
        self.parse_eval()
    }

    fn parse_eval(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        let expr = self.parse_expr()?;
        self.expect(&TokKind::Semicolon)?;
        Ok(Stmt::Eval { expr, line })
    }

    // ---- expressions, by precedence tier, lowest to highest ----

    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_bool_or()
    }

    fn parse_bool_or(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_bool_and()?;
        while *self.cur() == TokKind::BoolOr {
            let line = self.line();
            self.advance();
            let rhs = self.parse_bool_and()?;
            lhs = Expr::OpApp { op: Op::BoolOr, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    fn parse_bool_and(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_bitor()?;
        while *self.cur() == TokKind::BoolAnd {
            let line = self.line();
            self.advance();
            let rhs = self.parse_bitor()?;
            lhs = Expr::OpApp { op: Op::BoolAnd, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_bitxor()?;
        while *self.cur() == TokKind::BitOr {
            let line = self.line();
            self.advance();
            let rhs = self.parse_bitxor()?;
            lhs = Expr::OpApp { op: Op::BitOr, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_bitand()?;
        while *self.cur() == TokKind::BitXor {
            let line = self.line();
            self.advance();
            let rhs = self.parse_bitand()?;
            lhs = Expr::OpApp { op: Op::BitXor, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_equality()?;
        while *self.cur() == TokKind::BitAnd {
            let line = self.line();
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::OpApp { op: Op::BitAnd, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    /// `EQUALITY, DISEQUALITY` — nonassoc: at most one operator at this tier.
    fn parse_equality(&mut self) -> CompileResult<Expr> {
        let lhs = self.parse_relational()?;
        let op = match self.cur() {
            TokKind::Equality => Op::Equality,
            TokKind::Disequality => Op::Disequality,
            _ => return Ok(lhs),
        };
        let line = self.line();
        self.advance();
        let rhs = self.parse_relational()?;
        Ok(Expr::OpApp { op, args: vec![lhs, rhs], ty: None, line })
    }

    /// `LT, LEQ, GT, GEQ` — nonassoc: at most one operator at this tier.
    fn parse_relational(&mut self) -> CompileResult<Expr> {
        let lhs = self.parse_shift()?;
        let op = match self.cur() {
            TokKind::Lt => Op::Lt,
            TokKind::Leq => Op::Leq,
            TokKind::Gt => Op::Gt,
            TokKind::Geq => Op::Geq,
            _ => return Ok(lhs),
        };
        let line = self.line();
        self.advance();
        let rhs = self.parse_shift()?;
        Ok(Expr::OpApp { op, args: vec![lhs, rhs], ty: None, line })
    }

    fn parse_shift(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.cur() {
                TokKind::BitShl => Op::BitShl,
                TokKind::BitShr => Op::BitShr,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::OpApp { op, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.cur() {
                TokKind::Plus => Op::Plus,
                TokKind::Minus => Op::Minus,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::OpApp { op, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.cur() {
                TokKind::Times => Op::Times,
                TokKind::Div => Op::Div,
                TokKind::Modulus => Op::Modulus,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::OpApp { op, args: vec![lhs, rhs], ty: None, line };
        }
        Ok(lhs)
    }

    /// Unary `MINUS`/`BOOLNEG` (right-assoc) then `BITCOMPL` (right-assoc,
    /// binds tighter still).
    fn parse_unary(&mut self) -> CompileResult<Expr> {
        let line = self.line();
        match self.cur() {
            TokKind::Minus => {
                self.advance();
                let arg = self.parse_unary()?;
                Ok(Expr::OpApp { op: Op::Uminus, args: vec![arg], ty: None, line })
            }
            TokKind::BoolNeg => {
                self.advance();
                let arg = self.parse_unary()?;
                Ok(Expr::OpApp { op: Op::BoolNeg, args: vec![arg], ty: None, line })
            }
            TokKind::BitCompl => {
                self.advance();
                let arg = self.parse_unary()?;
                Ok(Expr::OpApp { op: Op::BitCompl, args: vec![arg], ty: None, line })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_call_args(&mut self) -> CompileResult<Vec<Expr>> {
        let mut args = Vec::new();
        if *self.cur() == TokKind::RParen {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if !self.eat(&TokKind::Comma) {
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> CompileResult<Expr> {
        let line = self.line();
        match self.cur().clone() {
            TokKind::Number(n) => {
                self.advance();
                if n >= (1u64 << 63) {
                    return Err(Diagnostic::new(
                        self.file,
                        line,
                        DiagnosticKind::Type,
                        format!("numeric literal {n} out of range for a 64-bit signed integer"),
                    ));
                }
                Ok(Expr::Number(n as i64))
            }
            TokKind::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokKind::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokKind::LParen => {
                self.advance();
                let e = self.parse_expr()?;
                self.expect(&TokKind::RParen)?;
                Ok(e)
            }
            TokKind::Ident(name) => {
                self.advance();
                if self.eat(&TokKind::LParen) {
                    let args = self.parse_call_args()?;
                    self.expect(&TokKind::RParen)?;
                    Ok(Expr::Call { callee: name, args, ty: None, line })
                } else {
                    Ok(Expr::Var { name, ty: None })
                }
            }
            other => Err(self.err(format!("expected an expression, found {other:?}"))),
        }
    }
}

/// Parse a complete BX source file into an AST [`Program`].
pub fn parse(file: &str, source: &str) -> CompileResult<Program> {
    let tokens = crate::lexer::tokenize(file, source)?;
    Parser::new(file, tokens).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        parse("t.bx", src).expect("expected parse to succeed")
    }

    #[test]
    fn parses_minimal_main() {
        let prog = parse_ok("def main() { print(1); }");
        assert_eq!(prog.decls.len(), 1);
    }

    #[test]
    fn parses_global_vardecl_and_proc_with_params() {
        let prog = parse_ok(
            "var x = 1, y = 2 : int; def f(a, b: int, c: bool): int { return a; } def main() { }",
        );
        assert_eq!(prog.decls.len(), 3);
        match &prog.decls[1] {
            Decl::ProcDecl { params, ret, .. } => {
                assert_eq!(params.len(), 2);
                assert_eq!(params[0].names, vec!["a", "b"]);
                assert_eq!(params[1].names, vec!["c"]);
                assert_eq!(*ret, Type::Int);
            }
            _ => panic!("expected ProcDecl"),
        }
    }

    #[test]
    fn precedence_matches_spec_table() {
        // `2 + 3 * 4` parses as `2 + (3 * 4)`.
        let prog = parse_ok("def main() { var x = 2 + 3 * 4 : int; }");
        let Decl::ProcDecl { body, .. } = &prog.decls[0] else { panic!() };
        let Stmt::Block { stmts, .. } = body else { panic!() };
        let Stmt::VarDecl { inits, .. } = &stmts[0] else { panic!() };
        match &inits[0].expr {
            Expr::OpApp { op: Op::Plus, args, .. } => match &args[1] {
                Expr::OpApp { op: Op::Times, .. } => {}
                other => panic!("expected nested Times, got {other:?}"),
            },
            other => panic!("expected top-level Plus, got {other:?}"),
        }
    }

    #[test]
    fn relational_is_nonassoc() {
        // `1 < 2 < 3` is a syntax error: after parsing `1 < 2` at the
        // relational tier, a trailing `< 3` is left dangling with no
        // enclosing production to consume it.
        let err = parse("t.bx", "def main() { var x = 1 < 2 < 3 : bool; }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Syntax);
    }

    #[test]
    fn unary_minus_is_uminus() {
        let prog = parse_ok("def main() { var x = -1 : int; }");
        let Decl::ProcDecl { body, .. } = &prog.decls[0] else { panic!() };
        let Stmt::Block { stmts, .. } = body else { panic!() };
        let Stmt::VarDecl { inits, .. } = &stmts[0] else { panic!() };
        assert!(matches!(inits[0].expr, Expr::OpApp { op: Op::Uminus, .. }));
    }

    #[test]
    fn rejects_unparseable_construct_with_line() {
        let err = parse("t.bx", "def main() { var ; }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Syntax);
        assert_eq!(err.line, 1);
    }

    #[test]
    fn rejects_oversized_literal() {
        let err = parse("t.bx", "def main() { var x = 9223372036854775808 : int; }").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Type);
    }
}
