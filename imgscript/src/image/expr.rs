//! Math expression lexer, AST, parser, and evaluator.
//!
//! Used by the reference library for `{…}` substitutions, conditions and
//! per-pixel `fill` formulas.
//!
//! Operator precedence (lowest → highest):
//!   ternary  →  `||`  →  `&&`  →  equality  →  relational  →  `|`  →  `&`  →
//!   shift  →  additive  →  multiplicative  →  unary  →  `^` (power)  →  primary
//!
//! `%` is the floored remainder and `^` is exponentiation, right-associative.
//! `[a,b,…]` builds a vector; arithmetic on vectors is componentwise with
//! scalar broadcast.

use crate::script::value::{floored_rem, Value};

// ── EvalContext ───────────────────────────────────────────────────────────────

/// Variable lookup for identifiers that are not constants or functions.
pub trait EvalContext {
    fn variable(&self, name: &str) -> Option<Value>;
}

/// Context with no variables at all.
pub struct NoVars;

impl EvalContext for NoVars {
    fn variable(&self, _name: &str) -> Option<Value> {
        None
    }
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Bang,
    Ampersand,
    Pipe,
    ShiftLeft,
    ShiftRight,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,

    Question,
    Colon,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Unknown(char),
    Eof,
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { src: src.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn read_number(&mut self, start: usize) -> Result<Token, String> {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E'))
            && matches!(self.peek2(), Some(b'0'..=b'9' | b'+' | b'-'))
        {
            self.pos += 2;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        text.parse()
            .map(Token::Num)
            .map_err(|_| format!("invalid number '{text}'"))
    }

    fn read_ident(&mut self, start: usize) -> Token {
        while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.pos += 1;
        }
        Token::Ident(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn next_token(&mut self) -> Result<Token, String> {
        self.skip_ws();
        let start = self.pos;
        let Some(ch) = self.peek() else {
            return Ok(Token::Eof);
        };
        self.pos += 1;

        Ok(match ch {
            b'0'..=b'9' | b'.' => return self.read_number(start),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.read_ident(start),
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'^' => Token::Caret,
            b'!' => {
                if self.eat(b'=') {
                    Token::Ne
                } else {
                    Token::Bang
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    Token::And
                } else {
                    Token::Ampersand
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    Token::Or
                } else {
                    Token::Pipe
                }
            }
            b'<' => {
                if self.eat(b'<') {
                    Token::ShiftLeft
                } else if self.eat(b'=') {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            b'>' => {
                if self.eat(b'>') {
                    Token::ShiftRight
                } else if self.eat(b'=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    Token::Eq
                } else {
                    Token::Unknown('=')
                }
            }
            b'?' => Token::Question,
            b':' => Token::Colon,
            b',' => Token::Comma,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            c => Token::Unknown(c as char),
        })
    }

    fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            let t = self.next_token()?;
            let done = t == Token::Eof;
            tokens.push(t);
            if done {
                return Ok(tokens);
            }
        }
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Var(String),
    Vector(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, String>,
        ops: &[(Token, BinOp)],
    ) -> Result<Expr, String> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.eat(tok) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    // ── Grammar ───────────────────────────────────────────────────────────────

    fn parse_ternary(&mut self) -> Result<Expr, String> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_ternary()?;
            if !self.eat(&Token::Colon) {
                return Err("expected ':' in ternary".into());
            }
            let else_ = self.parse_ternary()?;
            Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(else_)))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        self.binary_level(Self::parse_and, &[(Token::Or, BinOp::Or)])
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        self.binary_level(Self::parse_equality, &[(Token::And, BinOp::And)])
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        self.binary_level(
            Self::parse_relational,
            &[(Token::Eq, BinOp::Eq), (Token::Ne, BinOp::Ne)],
        )
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        self.binary_level(
            Self::parse_bitor,
            &[
                (Token::Le, BinOp::Le),
                (Token::Ge, BinOp::Ge),
                (Token::Lt, BinOp::Lt),
                (Token::Gt, BinOp::Gt),
            ],
        )
    }

    fn parse_bitor(&mut self) -> Result<Expr, String> {
        self.binary_level(Self::parse_bitand, &[(Token::Pipe, BinOp::BitOr)])
    }

    fn parse_bitand(&mut self) -> Result<Expr, String> {
        self.binary_level(Self::parse_shift, &[(Token::Ampersand, BinOp::BitAnd)])
    }

    fn parse_shift(&mut self) -> Result<Expr, String> {
        self.binary_level(
            Self::parse_additive,
            &[(Token::ShiftLeft, BinOp::Shl), (Token::ShiftRight, BinOp::Shr)],
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        self.binary_level(
            Self::parse_multiplicative,
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(
            Self::parse_unary,
            &[
                (Token::Star, BinOp::Mul),
                (Token::Slash, BinOp::Div),
                (Token::Percent, BinOp::Rem),
            ],
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Token::Minus => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Token::Plus => {
                self.pos += 1;
                self.parse_unary()
            }
            Token::Bang => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if self.eat(&Token::Caret) {
            // -2^2 == -4, 2^-1 == 0.5
            let exp = self.parse_unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_list(&mut self, close: &Token) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_ternary()?);
            if self.eat(close) {
                return Ok(items);
            }
            if !self.eat(&Token::Comma) {
                return Err(format!("expected ',' or {close:?}"));
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Num(x) => Ok(Expr::Literal(x)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.parse_list(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Token::LParen => {
                let inner = self.parse_ternary()?;
                if !self.eat(&Token::RParen) {
                    return Err("expected ')'".into());
                }
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::Vector(self.parse_list(&Token::RBracket)?)),
            Token::Eof => Err("unexpected end of expression".into()),
            Token::Unknown(c) => Err(format!("unexpected character '{c}'")),
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Parse an expression string into an AST.
pub fn parse_expr(src: &str) -> Result<Expr, String> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_ternary()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(format!("unexpected trailing {other:?}")),
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// Evaluate an [`Expr`] AST node against the given context.
pub fn eval_expr(expr: &Expr, ctx: &dyn EvalContext) -> Result<Value, String> {
    match expr {
        Expr::Literal(x) => Ok(Value::Scalar(*x)),

        Expr::Var(name) => constant(name)
            .map(Value::Scalar)
            .or_else(|| ctx.variable(name))
            .ok_or_else(|| format!("undefined variable '{name}'")),

        Expr::Vector(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match eval_expr(item, ctx)? {
                    Value::Scalar(x) => out.push(x),
                    Value::Vector(v) => out.extend(v),
                }
            }
            Ok(Value::Vector(out))
        }

        Expr::Unary(op, inner) => {
            let v = eval_expr(inner, ctx)?;
            Ok(match op {
                UnaryOp::Neg => v.map(|x| -x),
                UnaryOp::Not => Value::from(!v.as_bool()),
            })
        }

        Expr::Binary(BinOp::And, lhs, rhs) => {
            if !eval_expr(lhs, ctx)?.as_bool() {
                return Ok(Value::from(false));
            }
            Ok(Value::from(eval_expr(rhs, ctx)?.as_bool()))
        }

        Expr::Binary(BinOp::Or, lhs, rhs) => {
            if eval_expr(lhs, ctx)?.as_bool() {
                return Ok(Value::from(true));
            }
            Ok(Value::from(eval_expr(rhs, ctx)?.as_bool()))
        }

        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, ctx)?;
            let r = eval_expr(rhs, ctx)?;
            match op {
                BinOp::Eq => Ok(Value::from(l == r)),
                BinOp::Ne => Ok(Value::from(l != r)),
                _ => l.zip_with(&r, |a, b| binary(*op, a, b)),
            }
        }

        Expr::Ternary(cond, then, else_) => {
            if eval_expr(cond, ctx)?.as_bool() {
                eval_expr(then, ctx)
            } else {
                eval_expr(else_, ctx)
            }
        }

        Expr::Call(name, args) => {
            let vals = args
                .iter()
                .map(|a| eval_expr(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call_fn(name, &vals)
        }
    }
}

fn binary(op: BinOp, a: f64, b: f64) -> f64 {
    let flag = |c: bool| if c { 1.0 } else { 0.0 };
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => floored_rem(a, b),
        BinOp::Pow => a.powf(b),
        BinOp::Lt => flag(a < b),
        BinOp::Le => flag(a <= b),
        BinOp::Gt => flag(a > b),
        BinOp::Ge => flag(a >= b),
        BinOp::Eq => flag(a == b),
        BinOp::Ne => flag(a != b),
        BinOp::And => flag(a != 0.0 && b != 0.0),
        BinOp::Or => flag(a != 0.0 || b != 0.0),
        BinOp::BitAnd => ((a as i64) & (b as i64)) as f64,
        BinOp::BitOr => ((a as i64) | (b as i64)) as f64,
        BinOp::Shl => (a as i64).checked_shl(b as u32).unwrap_or(0) as f64,
        BinOp::Shr => (a as i64).checked_shr(b as u32).unwrap_or(0) as f64,
    }
}

fn constant(name: &str) -> Option<f64> {
    Some(match name {
        "pi" => std::f64::consts::PI,
        "e" => std::f64::consts::E,
        "inf" => f64::INFINITY,
        "nan" => f64::NAN,
        _ => return None,
    })
}

fn call_fn(name: &str, args: &[Value]) -> Result<Value, String> {
    let arity = |n: usize| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("{name}() takes {n} argument(s), got {}", args.len()))
        }
    };
    let unary = |f: fn(f64) -> f64| -> Result<Value, String> {
        arity(1)?;
        Ok(args[0].map(f))
    };
    match name {
        "abs" => unary(f64::abs),
        "sqrt" => unary(f64::sqrt),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "round" => unary(f64::round),
        "cos" => unary(f64::cos),
        "sin" => unary(f64::sin),
        "tan" => unary(f64::tan),
        "exp" => unary(f64::exp),
        "log" => unary(f64::ln),
        "log2" => unary(f64::log2),
        "log10" => unary(f64::log10),
        "isnan" => unary(|x| if x.is_nan() { 1.0 } else { 0.0 }),
        "isinf" => unary(|x| if x.is_infinite() { 1.0 } else { 0.0 }),
        "pow" => {
            arity(2)?;
            args[0].zip_with(&args[1], f64::powf)
        }
        "atan2" => {
            arity(2)?;
            args[0].zip_with(&args[1], f64::atan2)
        }
        "min" | "max" => {
            let flat: Vec<f64> = args
                .iter()
                .flat_map(|v| match v {
                    Value::Scalar(x) => vec![*x],
                    Value::Vector(v) => v.clone(),
                })
                .collect();
            if flat.is_empty() {
                return Err(format!("{name}() needs at least one argument"));
            }
            let pick = if name == "min" { f64::min } else { f64::max };
            Ok(Value::Scalar(flat.iter().copied().fold(flat[0], pick)))
        }
        "size" => {
            arity(1)?;
            Ok(Value::Scalar(match &args[0] {
                Value::Scalar(_) => 1.0,
                Value::Vector(v) => v.len() as f64,
            }))
        }
        _ => Err(format!("unknown function '{name}'")),
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(src: &str, ctx: &dyn EvalContext) -> Result<Value, String> {
    eval_expr(&parse_expr(src)?, ctx)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Value {
        evaluate(src, &NoVars).unwrap()
    }

    fn num(src: &str) -> f64 {
        eval(src).as_scalar()
    }

    #[test]
    fn precedence() {
        assert_eq!(num("1+2*3"), 7.0);
        assert_eq!(num("(1+2)*3"), 9.0);
        assert_eq!(num("2^3^2"), 512.0);
        assert_eq!(num("-2^2"), -4.0);
        assert_eq!(num("1<<4|1"), 17.0);
    }

    #[test]
    fn floored_mod() {
        assert_eq!(num("-7%3"), 2.0);
    }

    #[test]
    fn comparison_and_logic() {
        assert_eq!(num("3>2&&2>1"), 1.0);
        assert_eq!(num("0||0"), 0.0);
        assert_eq!(num("!0"), 1.0);
        assert_eq!(num("1==1?10:20"), 10.0);
    }

    #[test]
    fn functions_and_constants() {
        assert_eq!(num("max(1,5,3)"), 5.0);
        assert_eq!(num("min([4,2],3)"), 2.0);
        assert_eq!(num("round(2.6)"), 3.0);
        assert!((num("cos(pi)") + 1.0).abs() < 1e-12);
        assert_eq!(num("isnan(nan)"), 1.0);
    }

    #[test]
    fn vectors_broadcast() {
        assert_eq!(eval("[1,2]*2"), Value::Vector(vec![2.0, 4.0]));
        assert_eq!(eval("[1,2]+[3,4]"), Value::Vector(vec![4.0, 6.0]));
        assert!(evaluate("[1,2]+[1]", &NoVars).is_err());
    }

    #[test]
    fn variables_from_context() {
        struct Ctx;
        impl EvalContext for Ctx {
            fn variable(&self, name: &str) -> Option<Value> {
                (name == "w").then_some(Value::Scalar(640.0))
            }
        }
        assert_eq!(evaluate("w/2", &Ctx).unwrap(), Value::Scalar(320.0));
        assert!(evaluate("h", &Ctx).is_err());
    }

    #[test]
    fn parse_errors() {
        assert!(parse_expr("1+").is_err());
        assert!(parse_expr("(1").is_err());
        assert!(parse_expr("1 2").is_err());
        assert!(parse_expr("a=1").is_err());
        assert!(parse_expr("foo bar").is_err());
    }
}
