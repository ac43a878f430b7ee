//! # Rule Expression Language
//!
//! A small typed predicate language evaluated against the diagnostic
//! environment. It supports:
//!
//! - literals: numbers, strings (`"..."`), `true` / `false` / `null`
//! - identifiers with dotted field access and `[index]` over the
//!   environment (`metrics.used_memory`, `slowlogs[0].duration_us`)
//! - arithmetic `+ - * / %`, comparison `< <= > >=`, equality `== !=`,
//!   boolean `&& || !` (short-circuiting, boolean operands required)
//! - higher-order builtins over lists: `len`, `any`, `all`, `filter`,
//!   `map` with single-parameter lambdas (`any(slowlogs, |e|
//!   e.duration_us > 1000000)`), plus scalar helpers `abs`, `min`,
//!   `max`, `contains`
//!
//! Evaluation is strict about types: a missing field, a non-boolean
//! condition result or a type mismatch is an [`ExprError`], which the
//! rule engine treats as a per-rule failure (logged and skipped) rather
//! than aborting the diagnosis.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct ExprError {
    pub message: String,
}

impl ExprError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExprError {}

/// Runtime values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_bool(&self) -> Result<bool, ExprError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ExprError::new(format!(
                "expected bool, got {}",
                other.type_name()
            ))),
        }
    }

    fn as_number(&self) -> Result<f64, ExprError> {
        match self {
            Value::Number(n) => Ok(*n),
            other => Err(ExprError::new(format!(
                "expected number, got {}",
                other.type_name()
            ))),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Compiled expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Lambda(String, Box<Expr>),
}

// ---------------------------------------------------------------- lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Pipe,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::new("single '=' is not an operator; use '=='"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ExprError::new("single '&' is not an operator; use '&&'"));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    tokens.push(Token::Pipe);
                    i += 1;
                }
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('"') => value.push('"'),
                                Some('\\') => value.push('\\'),
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some(other) => {
                                    return Err(ExprError::new(format!(
                                        "unknown escape: \\{other}"
                                    )))
                                }
                                None => return Err(ExprError::new("unterminated string")),
                            }
                            i += 2;
                        }
                        Some(other) => {
                            value.push(*other);
                            i += 1;
                        }
                        None => return Err(ExprError::new("unterminated string")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A digit followed by `.` followed by a non-digit is
                    // field access on a number literal, which we do not
                    // support; stop before the dot.
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::new(format!("invalid number: {text}")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            other => return Err(ExprError::new(format!("unexpected character: {other}"))),
        }
    }
    Ok(tokens)
}

// --------------------------------------------------------------- parser

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if &token == expected => Ok(()),
            other => Err(ExprError::new(format!(
                "expected {expected:?}, got {other:?}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.next();
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.next();
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.next();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.next();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.next();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(field)) => {
                            expr = Expr::Field(Box::new(expr), field);
                        }
                        other => {
                            return Err(ExprError::new(format!(
                                "expected field name after '.', got {other:?}"
                            )))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.parse_expr()?;
                    self.eat(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.eat(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Pipe) => {
                // Lambda: |param| body
                let param = match self.next() {
                    Some(Token::Ident(name)) => name,
                    other => {
                        return Err(ExprError::new(format!(
                            "expected lambda parameter, got {other:?}"
                        )))
                    }
                };
                self.eat(&Token::Pipe)?;
                let body = self.parse_expr()?;
                Ok(Expr::Lambda(param, Box::new(body)))
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.eat(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(ExprError::new(format!("unexpected token: {other:?}"))),
        }
    }
}

/// Compile a source string into an expression tree.
pub fn compile(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExprError::new("empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::new(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(expr)
}

// ------------------------------------------------------------ evaluator

struct EvalCtx<'a> {
    env: &'a Value,
    bindings: Vec<(String, Value)>,
}

impl EvalCtx<'_> {
    fn lookup(&self, name: &str) -> Result<Value, ExprError> {
        for (bound, value) in self.bindings.iter().rev() {
            if bound == name {
                return Ok(value.clone());
            }
        }
        match self.env {
            Value::Map(map) => map
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::new(format!("unknown identifier: {name}"))),
            _ => Err(ExprError::new("environment is not a map")),
        }
    }
}

fn eval(expr: &Expr, ctx: &mut EvalCtx<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Ident(name) => ctx.lookup(name),
        Expr::Field(base, field) => {
            let base = eval(base, ctx)?;
            match base {
                Value::Map(map) => map
                    .get(field)
                    .cloned()
                    .ok_or_else(|| ExprError::new(format!("no field '{field}'"))),
                Value::Null => Err(ExprError::new(format!(
                    "field access '{field}' on null value"
                ))),
                other => Err(ExprError::new(format!(
                    "field access on {}, expected map",
                    other.type_name()
                ))),
            }
        }
        Expr::Index(base, index) => {
            let base = eval(base, ctx)?;
            let index = eval(index, ctx)?.as_number()?;
            match base {
                Value::List(items) => {
                    let i = index as usize;
                    items
                        .get(i)
                        .cloned()
                        .ok_or_else(|| ExprError::new(format!("index {i} out of bounds")))
                }
                other => Err(ExprError::new(format!(
                    "indexing into {}, expected list",
                    other.type_name()
                ))),
            }
        }
        Expr::Unary(op, operand) => {
            let value = eval(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.as_bool()?)),
                UnaryOp::Neg => Ok(Value::Number(-value.as_number()?)),
            }
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, ctx),
        Expr::Lambda(_, _) => Err(ExprError::new(
            "lambda outside of a higher-order builtin call",
        )),
        Expr::Call(name, args) => eval_call(name, args, ctx),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &mut EvalCtx<'_>,
) -> Result<Value, ExprError> {
    // Short-circuit boolean operators first.
    match op {
        BinaryOp::And => {
            let l = eval(left, ctx)?.as_bool()?;
            if !l {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(eval(right, ctx)?.as_bool()?));
        }
        BinaryOp::Or => {
            let l = eval(left, ctx)?.as_bool()?;
            if l {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(eval(right, ctx)?.as_bool()?));
        }
        _ => {}
    }

    let l = eval(left, ctx)?;
    let r = eval(right, ctx)?;
    match op {
        BinaryOp::Add => Ok(Value::Number(l.as_number()? + r.as_number()?)),
        BinaryOp::Sub => Ok(Value::Number(l.as_number()? - r.as_number()?)),
        BinaryOp::Mul => Ok(Value::Number(l.as_number()? * r.as_number()?)),
        BinaryOp::Div => Ok(Value::Number(l.as_number()? / r.as_number()?)),
        BinaryOp::Rem => Ok(Value::Number(l.as_number()? % r.as_number()?)),
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::Ne => Ok(Value::Bool(l != r)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => a
                    .partial_cmp(b)
                    .ok_or_else(|| ExprError::new("NaN is not comparable"))?,
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                (a, b) => {
                    return Err(ExprError::new(format!(
                        "cannot compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    )))
                }
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &mut EvalCtx<'_>) -> Result<Value, ExprError> {
    let arity = |expected: usize| -> Result<(), ExprError> {
        if args.len() != expected {
            Err(ExprError::new(format!(
                "{name}() expects {expected} argument(s), got {}",
                args.len()
            )))
        } else {
            Ok(())
        }
    };

    match name {
        "len" => {
            arity(1)?;
            let value = eval(&args[0], ctx)?;
            let length = match value {
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Str(s) => s.chars().count(),
                other => {
                    return Err(ExprError::new(format!(
                        "len() of {}, expected list, map or string",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Number(length as f64))
        }
        "abs" => {
            arity(1)?;
            Ok(Value::Number(eval(&args[0], ctx)?.as_number()?.abs()))
        }
        "min" => {
            arity(2)?;
            let a = eval(&args[0], ctx)?.as_number()?;
            let b = eval(&args[1], ctx)?.as_number()?;
            Ok(Value::Number(a.min(b)))
        }
        "max" => {
            arity(2)?;
            let a = eval(&args[0], ctx)?.as_number()?;
            let b = eval(&args[1], ctx)?.as_number()?;
            Ok(Value::Number(a.max(b)))
        }
        "contains" => {
            arity(2)?;
            let haystack = eval(&args[0], ctx)?;
            let needle = eval(&args[1], ctx)?;
            match (&haystack, &needle) {
                (Value::Str(h), Value::Str(n)) => Ok(Value::Bool(h.contains(n.as_str()))),
                (Value::List(items), n) => Ok(Value::Bool(items.contains(n))),
                (h, n) => Err(ExprError::new(format!(
                    "contains({}, {}) is not supported",
                    h.type_name(),
                    n.type_name()
                ))),
            }
        }
        "any" | "all" | "filter" | "map" => {
            arity(2)?;
            let list = match eval(&args[0], ctx)? {
                Value::List(items) => items,
                other => {
                    return Err(ExprError::new(format!(
                        "{name}() over {}, expected list",
                        other.type_name()
                    )))
                }
            };
            let Expr::Lambda(param, body) = &args[1] else {
                return Err(ExprError::new(format!(
                    "{name}() expects a lambda as its second argument"
                )));
            };

            match name {
                "any" => {
                    for item in list {
                        ctx.bindings.push((param.clone(), item));
                        let keep = eval(body, ctx)?.as_bool();
                        ctx.bindings.pop();
                        if keep? {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                }
                "all" => {
                    for item in list {
                        ctx.bindings.push((param.clone(), item));
                        let keep = eval(body, ctx)?.as_bool();
                        ctx.bindings.pop();
                        if !keep? {
                            return Ok(Value::Bool(false));
                        }
                    }
                    Ok(Value::Bool(true))
                }
                "filter" => {
                    let mut out = Vec::new();
                    for item in list {
                        ctx.bindings.push((param.clone(), item.clone()));
                        let keep = eval(body, ctx)?.as_bool();
                        ctx.bindings.pop();
                        if keep? {
                            out.push(item);
                        }
                    }
                    Ok(Value::List(out))
                }
                "map" => {
                    let mut out = Vec::new();
                    for item in list {
                        ctx.bindings.push((param.clone(), item));
                        let mapped = eval(body, ctx)?;
                        ctx.bindings.pop();
                        out.push(mapped);
                    }
                    Ok(Value::List(out))
                }
                _ => unreachable!(),
            }
        }
        other => Err(ExprError::new(format!("unknown function: {other}"))),
    }
}

/// Evaluate a compiled expression against the environment.
pub fn evaluate(expr: &Expr, env: &Value) -> Result<Value, ExprError> {
    let mut ctx = EvalCtx {
        env,
        bindings: Vec::new(),
    };
    eval(expr, &mut ctx)
}

/// Evaluate, requiring a boolean result. A non-boolean result is an
/// evaluation error.
pub fn evaluate_bool(expr: &Expr, env: &Value) -> Result<bool, ExprError> {
    match evaluate(expr, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::new(format!(
            "condition evaluated to {}, expected bool",
            other.type_name()
        ))),
    }
}
