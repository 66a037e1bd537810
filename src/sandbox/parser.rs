// =============================================================================
// Strategy language parser and compile-time validation
// =============================================================================
//
// Recursive descent over the token stream. The validator that runs after
// parsing enforces the capability whitelist: every call must name a host
// function with correct arity, and every variable must be a declared local.
// Anything else is a structured compile error carrying source location. This
// is the only gate between user source and the evaluator, so there is no way
// to name I/O, the filesystem, the network, or the clock from strategy code.
// =============================================================================

use std::collections::HashSet;

use crate::errors::CompileError;

use super::lexer::{lex, Tok, Token};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Var {
        name: String,
        line: u32,
        col: u32,
    },
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
        line: u32,
        col: u32,
    },
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Declare(String, Expr),
    Assign {
        name: String,
        expr: Expr,
        line: u32,
        col: u32,
    },
    If {
        cond: Expr,
        then_block: Vec<Stmt>,
        else_block: Option<Vec<Stmt>>,
    },
    For {
        cond: Option<Expr>,
        body: Vec<Stmt>,
    },
    Return(Expr),
    Break {
        line: u32,
        col: u32,
    },
}

/// A parsed and whitelist-validated strategy body.
#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
}

// ---------------------------------------------------------------------------
// Host function table (the capability whitelist)
// ---------------------------------------------------------------------------

/// (name, arity). Resolution is compile-time; there is no dynamic lookup at
/// run time.
pub const HOST_FUNCTIONS: &[(&str, usize)] = &[
    // ticker reads
    ("price", 0),
    ("change24h", 0),
    ("volume24h", 0),
    ("symbol", 0),
    // evaluation context
    ("close_time", 0),
    // candle field access: (timeframe, bars-ago)
    ("open", 2),
    ("high", 2),
    ("low", 2),
    ("close", 2),
    ("volume", 2),
    ("candle_count", 1),
    // indicators
    ("sma", 2),
    ("ema", 2),
    ("rsi", 2),
    ("macd", 4),
    ("macd_signal", 4),
    ("macd_hist", 4),
    ("bollinger_upper", 3),
    ("bollinger_middle", 3),
    ("bollinger_lower", 3),
    ("atr", 2),
    ("vwap", 1),
    ("stoch_k", 3),
    ("stoch_d", 3),
    ("highest", 2),
    ("lowest", 2),
    ("avg_volume", 2),
    ("engulfing", 1),
    // numeric utilities
    ("abs", 1),
    ("min", 2),
    ("max", 2),
    ("floor", 1),
    ("ceil", 1),
    ("round", 1),
];

fn host_arity(name: &str) -> Option<usize> {
    HOST_FUNCTIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, a)| *a)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse and validate strategy source into a runnable program.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let body = parser.parse_block_until(&Tok::Eof)?;
    let program = Program { body };
    validate(&program)?;
    Ok(program)
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn skip_newlines(&mut self) {
        while self.peek().tok == Tok::Newline {
            self.advance();
        }
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> Result<Token, CompileError> {
        let t = self.peek().clone();
        if std::mem::discriminant(&t.tok) == std::mem::discriminant(expected) {
            Ok(self.advance())
        } else {
            Err(err_at(&t, &format!("expected {what}")))
        }
    }

    /// Parse statements until `end` (consumed by the caller for braces, left
    /// in place for Eof).
    fn parse_block_until(&mut self, end: &Tok) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if &self.peek().tok == end || self.peek().tok == Tok::Eof {
                break;
            }
            stmts.push(self.parse_stmt()?);
            // A statement must end at a terminator or the block end.
            let tok = self.peek().tok.clone();
            if tok == Tok::Newline {
                self.advance();
            } else if &tok != end && tok != Tok::Eof {
                let t = self.peek().clone();
                return Err(err_at(&t, "expected end of statement"));
            }
        }
        Ok(stmts)
    }

    fn parse_braced_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect(&Tok::LBrace, "'{'")?;
        let block = self.parse_block_until(&Tok::RBrace)?;
        self.expect(&Tok::RBrace, "'}'")?;
        Ok(block)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let t = self.peek().clone();
        match &t.tok {
            Tok::Return => {
                self.advance();
                let expr = self.parse_expr()?;
                Ok(Stmt::Return(expr))
            }
            Tok::Break => {
                self.advance();
                Ok(Stmt::Break {
                    line: t.line,
                    col: t.col,
                })
            }
            Tok::If => {
                self.advance();
                self.parse_if()
            }
            Tok::For => {
                self.advance();
                let cond = if self.peek().tok == Tok::LBrace {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                let body = self.parse_braced_block()?;
                Ok(Stmt::For { cond, body })
            }
            Tok::Ident(name) => {
                let name = name.clone();
                // Lookahead distinguishes declaration/assignment from a bare
                // expression (which is not a statement in this language).
                let next = self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
                    .tok
                    .clone();
                match next {
                    Tok::Declare => {
                        self.advance();
                        self.advance();
                        let expr = self.parse_expr()?;
                        Ok(Stmt::Declare(name, expr))
                    }
                    Tok::Assign => {
                        self.advance();
                        self.advance();
                        let expr = self.parse_expr()?;
                        Ok(Stmt::Assign {
                            name,
                            expr,
                            line: t.line,
                            col: t.col,
                        })
                    }
                    _ => Err(err_at(&t, "expected ':=', '=' or a statement keyword")),
                }
            }
            _ => Err(err_at(&t, "expected a statement")),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        let cond = self.parse_expr()?;
        let then_block = self.parse_braced_block()?;
        let else_block = if self.peek().tok == Tok::Else {
            self.advance();
            if self.peek().tok == Tok::If {
                self.advance();
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_braced_block()?)
            }
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_block,
            else_block,
        })
    }

    // --- expressions, precedence climbing --------------------------------

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while self.peek().tok == Tok::Or {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_comparison()?;
        while self.peek().tok == Tok::And {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_additive()?;
        let op = match self.peek().tok {
            Tok::Eq => BinOp::Eq,
            Tok::Ne => BinOp::Ne,
            Tok::Lt => BinOp::Lt,
            Tok::Le => BinOp::Le,
            Tok::Gt => BinOp::Gt,
            Tok::Ge => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().tok {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().tok {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        match self.peek().tok {
            Tok::Minus => {
                self.advance();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            Tok::Not => {
                self.advance();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let t = self.advance();
        match t.tok {
            Tok::Number(n) => Ok(Expr::Num(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::True => Ok(Expr::Bool(true)),
            Tok::False => Ok(Expr::Bool(false)),
            Tok::LParen => {
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(e)
            }
            Tok::Ident(name) => {
                if self.peek().tok == Tok::LParen {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek().tok != Tok::RParen {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.peek().tok == Tok::Comma {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    Ok(Expr::Call {
                        name,
                        args,
                        line: t.line,
                        col: t.col,
                    })
                } else {
                    Ok(Expr::Var {
                        name,
                        line: t.line,
                        col: t.col,
                    })
                }
            }
            _ => Err(err_at(&t, "expected an expression")),
        }
    }
}

fn err_at(t: &Token, message: &str) -> CompileError {
    CompileError {
        line: t.line,
        col: t.col,
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Compile-time validation
// ---------------------------------------------------------------------------

fn validate(program: &Program) -> Result<(), CompileError> {
    let mut locals: HashSet<String> = HashSet::new();
    validate_block(&program.body, &mut locals, false)
}

fn validate_block(
    block: &[Stmt],
    locals: &mut HashSet<String>,
    in_loop: bool,
) -> Result<(), CompileError> {
    for stmt in block {
        match stmt {
            Stmt::Declare(name, expr) => {
                validate_expr(expr, locals)?;
                locals.insert(name.clone());
            }
            Stmt::Assign {
                name,
                expr,
                line,
                col,
            } => {
                validate_expr(expr, locals)?;
                if !locals.contains(name) {
                    return Err(CompileError {
                        line: *line,
                        col: *col,
                        message: format!("assignment to undeclared variable '{name}'"),
                    });
                }
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                validate_expr(cond, locals)?;
                validate_block(then_block, locals, in_loop)?;
                if let Some(eb) = else_block {
                    validate_block(eb, locals, in_loop)?;
                }
            }
            Stmt::For { cond, body } => {
                if let Some(c) = cond {
                    validate_expr(c, locals)?;
                }
                validate_block(body, locals, true)?;
            }
            Stmt::Return(expr) => validate_expr(expr, locals)?,
            Stmt::Break { line, col } => {
                if !in_loop {
                    return Err(CompileError {
                        line: *line,
                        col: *col,
                        message: "break outside of a loop".to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn validate_expr(expr: &Expr, locals: &HashSet<String>) -> Result<(), CompileError> {
    match expr {
        Expr::Num(_) | Expr::Str(_) | Expr::Bool(_) => Ok(()),
        Expr::Var { name, line, col } => {
            if locals.contains(name) {
                Ok(())
            } else {
                Err(CompileError {
                    line: *line,
                    col: *col,
                    message: format!("unknown identifier '{name}'"),
                })
            }
        }
        Expr::Unary(_, inner) => validate_expr(inner, locals),
        Expr::Binary(_, lhs, rhs) => {
            validate_expr(lhs, locals)?;
            validate_expr(rhs, locals)
        }
        Expr::Call {
            name,
            args,
            line,
            col,
        } => {
            match host_arity(name) {
                None => {
                    return Err(CompileError {
                        line: *line,
                        col: *col,
                        message: format!("unknown function '{name}'"),
                    })
                }
                Some(arity) if arity != args.len() => {
                    return Err(CompileError {
                        line: *line,
                        col: *col,
                        message: format!(
                            "function '{name}' takes {arity} argument(s), got {}",
                            args.len()
                        ),
                    })
                }
                Some(_) => {}
            }
            for arg in args {
                validate_expr(arg, locals)?;
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_trivial_predicate() {
        assert!(compile("return true").is_ok());
    }

    #[test]
    fn compiles_realistic_strategy() {
        let src = r#"
            // oversold bounce with volume confirmation
            r := rsi("5m", 14)
            v := volume("5m", 0)
            if r < 30 && v > avg_volume("5m", 20) * 1.5 {
                return true
            }
            return false
        "#;
        assert!(compile(src).is_ok());
    }

    #[test]
    fn rejects_unknown_function_with_location() {
        let e = compile("return fetch(\"http://x\")").unwrap_err();
        assert!(e.message.contains("unknown function 'fetch'"));
        assert_eq!(e.line, 1);
    }

    #[test]
    fn rejects_unknown_identifier() {
        let e = compile("return secret_balance").unwrap_err();
        assert!(e.message.contains("unknown identifier"));
    }

    #[test]
    fn rejects_wrong_arity() {
        let e = compile("return rsi(\"5m\")").unwrap_err();
        assert!(e.message.contains("takes 2 argument(s)"));
    }

    #[test]
    fn rejects_assignment_to_undeclared() {
        let e = compile("x = 1").unwrap_err();
        assert!(e.message.contains("undeclared variable 'x'"));
    }

    #[test]
    fn rejects_break_outside_loop() {
        let e = compile("break").unwrap_err();
        assert!(e.message.contains("break outside"));
    }

    #[test]
    fn parses_for_loop_with_break() {
        let src = r#"
            i := 0
            for {
                i = i + 1
                if i > 10 {
                    break
                }
            }
            return i == 11
        "#;
        assert!(compile(src).is_ok());
    }

    #[test]
    fn parses_else_if_chain() {
        let src = r#"
            r := rsi("1h", 14)
            if r < 30 {
                return true
            } else if r > 70 {
                return false
            } else {
                return false
            }
        "#;
        assert!(compile(src).is_ok());
    }

    #[test]
    fn operator_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let p = compile("return 1 + 2 * 3 == 7").unwrap();
        assert_eq!(p.body.len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(compile("if {").is_err());
        assert!(compile("return (1 + ").is_err());
    }
}
