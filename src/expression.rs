//! Computed expressions - a small boolean/arithmetic language over node paths.
//!
//! Expressions are parsed once when a schema is compiled. Evaluation reads
//! other nodes through a [`PathResolver`] and never fails: missing paths and
//! ill-typed operands evaluate to `null`.
//!
//! # Paths
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `@`, `@.a.b` | the node owning the expression, then its children |
//! | `../a` | a sibling (parent's child `a`) |
//! | `./a` | a child of the owning node |
//! | `$.a[0].b`, `#/a/0/b` | absolute from the root |
//!
//! # Operators
//!
//! `!`, unary `-`, `* / %`, `+ -`, `< <= > >=`, `=== !== == !=`, `&&`, `||`,
//! `cond ? a : b`, and the postfix forms `.includes(x)` and `.length`.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Number, Value};

use crate::types::{loose_eq, ConditionEntry, ConditionValue};

/// One step of a node path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Root,
    Parent,
    Current,
    Key(String),
}

/// A relative or absolute path through the node tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePath {
    pub segments: Vec<PathSegment>,
}

impl NodePath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Parse a `find` pointer: `#` or a leading `/` is the root, `.` the
    /// current node, `..` the parent, anything else a child key
    /// (JSON Pointer escaped).
    pub fn parse_pointer(pointer: &str) -> Self {
        let mut segments = Vec::new();
        let rest = if let Some(rest) = pointer.strip_prefix('#') {
            segments.push(PathSegment::Root);
            rest
        } else if pointer.starts_with('/') {
            segments.push(PathSegment::Root);
            pointer
        } else {
            segments.push(PathSegment::Current);
            pointer
        };

        for part in rest.split('/') {
            match part {
                "" | "." | "@" => {}
                ".." => segments.push(PathSegment::Parent),
                "#" => segments.push(PathSegment::Root),
                key => segments.push(PathSegment::Key(
                    key.replace("~1", "/").replace("~0", "~"),
                )),
            }
        }
        Self { segments }
    }

    /// True for `../key`, the shape static conditions can index.
    fn sibling_key(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [PathSegment::Parent, PathSegment::Key(key)] => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            let part = match segment {
                PathSegment::Root => "#",
                PathSegment::Parent => "..",
                PathSegment::Current => ".",
                PathSegment::Key(key) => key.as_str(),
            };
            if !first {
                f.write_str("/")?;
            }
            f.write_str(part)?;
            first = false;
        }
        Ok(())
    }
}

/// Looks up the current value at a path.
pub trait PathResolver {
    fn resolve(&self, path: &NodePath) -> Option<Value>;
}

/// Parse failure with the byte offset where it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
    dependencies: Vec<NodePath>,
}

impl Expression {
    /// Parse an expression string.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` on any lexical or syntax error.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let ast = parser.parse_expr()?;
        if let Some((_, offset)) = parser.tokens.get(parser.pos) {
            return Err(ParseError {
                message: "unexpected trailing input".to_string(),
                offset: *offset,
            });
        }

        let mut dependencies = Vec::new();
        ast.collect_paths(&mut dependencies);

        Ok(Self {
            source: source.to_string(),
            ast,
            dependencies,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct paths this expression reads, in order of first appearance.
    pub fn dependencies(&self) -> &[NodePath] {
        &self.dependencies
    }

    pub fn evaluate(&self, resolver: &dyn PathResolver) -> Value {
        let value = self.ast.eval(resolver);
        tracing::trace!(expression = %self.source, result = %value, "evaluated expression");
        value
    }

    /// Evaluate and coerce to a boolean with JavaScript truthiness.
    pub fn test(&self, resolver: &dyn PathResolver) -> bool {
        truthy(&self.evaluate(resolver))
    }

    /// Convert to a static sibling condition when the expression is a
    /// conjunction of `../field === literal` or `[..].includes(../field)`.
    pub fn as_sibling_condition(&self) -> Option<ConditionEntry> {
        let (condition, inverse) = static_condition(&self.ast)?;
        Some(ConditionEntry::new(condition, inverse))
    }
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(NodePath),
    Literal(Value),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%",
];

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            offset: self.pos,
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, ParseError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            let start = self.pos;
            let token = match c {
                '$' | '@' | '#' => Token::Path(self.lex_path()),
                '.' if self.rest().starts_with("..") || self.rest().starts_with("./") => {
                    Token::Path(self.lex_path())
                }
                '.' => {
                    self.bump();
                    Token::Dot
                }
                '\'' | '"' => Token::Literal(Value::String(self.lex_string(c)?)),
                '0'..='9' => Token::Literal(self.lex_number()?),
                '(' | ')' | '[' | ']' | ',' | '?' | ':' => {
                    self.bump();
                    match c {
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        '[' => Token::LBracket,
                        ']' => Token::RBracket,
                        ',' => Token::Comma,
                        '?' => Token::Question,
                        _ => Token::Colon,
                    }
                }
                c if is_ident_start(c) => Token::Ident(self.lex_ident()),
                _ => {
                    let op = OPERATORS
                        .iter()
                        .find(|op| self.rest().starts_with(**op))
                        .ok_or_else(|| self.error(format!("unexpected character '{}'", c)))?;
                    self.pos += op.len();
                    Token::Op(*op)
                }
            };
            tokens.push((token, start));
        }
        Ok(tokens)
    }

    fn lex_ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    fn lex_path(&mut self) -> NodePath {
        let mut segments = Vec::new();
        match self.peek() {
            Some('$') | Some('#') => {
                self.bump();
                segments.push(PathSegment::Root);
            }
            Some('@') => {
                self.bump();
                segments.push(PathSegment::Current);
            }
            _ => {}
        }

        loop {
            let rest = self.rest();
            if rest.starts_with("../") {
                self.pos += 3;
                segments.push(PathSegment::Parent);
                self.lex_bare_segment(&mut segments);
            } else if rest.starts_with("./") {
                self.pos += 2;
                segments.push(PathSegment::Current);
                self.lex_bare_segment(&mut segments);
            } else if rest.starts_with("..") {
                self.pos += 2;
                segments.push(PathSegment::Parent);
            } else if rest.starts_with('/') {
                self.pos += 1;
                if !self.lex_bare_segment(&mut segments) {
                    break;
                }
            } else if rest.starts_with('.') && self.peek_at(1).is_some_and(is_ident_start) {
                // `.name(` is a method call on the path, not a segment
                let save = self.pos;
                self.pos += 1;
                self.lex_ident();
                let is_call = self.peek() == Some('(');
                self.pos = save;
                if is_call {
                    break;
                }
                self.pos += 1;
                let key = self.lex_ident();
                segments.push(PathSegment::Key(key));
            } else if rest.starts_with('[') {
                let save = self.pos;
                self.pos += 1;
                match self.lex_bracket_key() {
                    Some(key) => segments.push(PathSegment::Key(key)),
                    None => {
                        self.pos = save;
                        break;
                    }
                }
            } else {
                break;
            }
        }

        NodePath::new(segments)
    }

    fn lex_bare_segment(&mut self, segments: &mut Vec<PathSegment>) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        if self.pos > start {
            segments.push(PathSegment::Key(self.src[start..self.pos].to_string()));
            true
        } else {
            false
        }
    }

    /// `[0]` or `['key']`, cursor just past the `[`.
    fn lex_bracket_key(&mut self) -> Option<String> {
        let key = match self.peek()? {
            q @ ('\'' | '"') => self.lex_string(q).ok()?,
            c if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.bump();
                }
                self.src[start..self.pos].to_string()
            }
            _ => return None,
        };
        if self.bump()? != ']' {
            return None;
        }
        Some(key)
    }

    fn lex_string(&mut self, quote: char) -> Result<String, ParseError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn lex_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = &self.src[start..self.pos];
        if !is_float {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::from(n));
            }
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| self.error(format!("invalid number '{}'", text)))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

// --- Parser ---

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    StrictEq,
    StrictNe,
    LooseEq,
    LooseNe,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(NodePath),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Includes(Box<Expr>, Box<Expr>),
    Length(Box<Expr>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            offset: self.offset(),
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let condition = self.parse_or()?;
        if self.peek() != Some(&Token::Question) {
            return Ok(condition);
        }
        self.pos += 1;
        let then = self.parse_expr()?;
        self.expect(Token::Colon, "':'")?;
        let otherwise = self.parse_expr()?;
        Ok(Expr::Conditional(
            Box::new(condition),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_binary(0)?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.parse_binary(0)?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// Left-associative binary levels, loosest first.
    fn parse_binary(&mut self, level: usize) -> Result<Expr, ParseError> {
        const LEVELS: &[&[&str]] = &[
            &["===", "!==", "==", "!="],
            &["<=", ">=", "<", ">"],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        let Some(ops) = LEVELS.get(level) else {
            return self.parse_unary();
        };
        let mut lhs = self.parse_binary(level + 1)?;
        while let Some(op) = self.eat_op(ops) {
            let rhs = self.parse_binary(level + 1)?;
            let op = match op {
                "===" => BinaryOp::StrictEq,
                "!==" => BinaryOp::StrictNe,
                "==" => BinaryOp::LooseEq,
                "!=" => BinaryOp::LooseNe,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.eat_op(&["!", "-"]) {
            Some("!") => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some(_) => Ok(Expr::Neg(Box::new(self.parse_unary()?))),
            None => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                _ => return Err(self.error("expected member name after '.'")),
            };
            expr = match name.as_str() {
                "length" => Expr::Length(Box::new(expr)),
                "includes" => {
                    self.expect(Token::LParen, "'('")?;
                    let item = self.parse_expr()?;
                    self.expect(Token::RParen, "')'")?;
                    Expr::Includes(Box::new(expr), Box::new(item))
                }
                other => return Err(self.error(format!("unsupported member '{}'", other))),
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Path(path)) => Ok(Expr::Path(path)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                other => Err(ParseError {
                    message: format!("unknown identifier '{}'", other),
                    offset,
                }),
            },
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            Some(_) => Err(ParseError {
                message: "unexpected token".to_string(),
                offset,
            }),
            None => Err(ParseError {
                message: "unexpected end of expression".to_string(),
                offset,
            }),
        }
    }
}

// --- Evaluation ---

impl Expr {
    fn collect_paths(&self, out: &mut Vec<NodePath>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(path) => {
                if !out.contains(path) {
                    out.push(path.clone());
                }
            }
            Expr::Array(items) => items.iter().for_each(|i| i.collect_paths(out)),
            Expr::Not(e) | Expr::Neg(e) | Expr::Length(e) => e.collect_paths(out),
            Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) | Expr::Includes(a, b) => {
                a.collect_paths(out);
                b.collect_paths(out);
            }
            Expr::Conditional(c, a, b) => {
                c.collect_paths(out);
                a.collect_paths(out);
                b.collect_paths(out);
            }
        }
    }

    fn eval(&self, resolver: &dyn PathResolver) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Path(path) => resolver.resolve(path).unwrap_or(Value::Null),
            Expr::Array(items) => Value::Array(items.iter().map(|i| i.eval(resolver)).collect()),
            Expr::Not(e) => Value::Bool(!truthy(&e.eval(resolver))),
            Expr::Neg(e) => match e.eval(resolver).as_f64() {
                Some(n) => number_value(-n),
                None => Value::Null,
            },
            Expr::And(a, b) => {
                let lhs = a.eval(resolver);
                if truthy(&lhs) {
                    b.eval(resolver)
                } else {
                    lhs
                }
            }
            Expr::Or(a, b) => {
                let lhs = a.eval(resolver);
                if truthy(&lhs) {
                    lhs
                } else {
                    b.eval(resolver)
                }
            }
            Expr::Conditional(c, a, b) => {
                if truthy(&c.eval(resolver)) {
                    a.eval(resolver)
                } else {
                    b.eval(resolver)
                }
            }
            Expr::Includes(target, item) => {
                let item = item.eval(resolver);
                let found = match target.eval(resolver) {
                    Value::Array(items) => items.iter().any(|i| loose_eq(i, &item)),
                    Value::String(s) => item.as_str().is_some_and(|needle| s.contains(needle)),
                    _ => false,
                };
                Value::Bool(found)
            }
            Expr::Length(target) => match target.eval(resolver) {
                Value::Array(items) => Value::from(items.len()),
                Value::String(s) => Value::from(s.chars().count()),
                _ => Value::Null,
            },
            Expr::Binary(op, a, b) => binary(*op, &a.eval(resolver), &b.eval(resolver)),
        }
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinaryOp::StrictEq => Value::Bool(loose_eq(lhs, rhs)),
        BinaryOp::StrictNe => Value::Bool(!loose_eq(lhs, rhs)),
        BinaryOp::LooseEq => Value::Bool(abstract_eq(lhs, rhs)),
        BinaryOp::LooseNe => Value::Bool(!abstract_eq(lhs, rhs)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => {
                    a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Value::Bool(false);
            };
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => number_value(a + b),
                _ => Value::Null,
            },
            (Value::String(_), _) | (_, Value::String(_)) => {
                Value::String(format!("{}{}", display_value(lhs), display_value(rhs)))
            }
            _ => Value::Null,
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Value::Null;
            };
            number_value(match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            })
        }
    }
}

/// `==`: like `===`, plus numeric strings compare equal to numbers.
fn abstract_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        _ => loose_eq(lhs, rhs),
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// JavaScript truthiness for JSON values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn static_condition(expr: &Expr) -> Option<(BTreeMap<String, ConditionValue>, bool)> {
    match expr {
        Expr::Binary(op, a, b) => {
            let inverse = match op {
                BinaryOp::StrictEq | BinaryOp::LooseEq => false,
                BinaryOp::StrictNe | BinaryOp::LooseNe => true,
                _ => return None,
            };
            let (key, literal) = match (a.as_ref(), b.as_ref()) {
                (Expr::Path(path), Expr::Literal(value)) | (Expr::Literal(value), Expr::Path(path)) => {
                    (path.sibling_key()?, value)
                }
                _ => return None,
            };
            Some((
                BTreeMap::from([(key.to_string(), ConditionValue::Equals(literal.clone()))]),
                inverse,
            ))
        }
        Expr::Includes(target, item) => {
            let (Expr::Array(items), Expr::Path(path)) = (target.as_ref(), item.as_ref()) else {
                return None;
            };
            let options = items
                .iter()
                .map(|i| match i {
                    Expr::Literal(value) => Some(value.clone()),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Some((
                BTreeMap::from([(path.sibling_key()?.to_string(), ConditionValue::OneOf(options))]),
                false,
            ))
        }
        Expr::And(a, b) => {
            let (mut lhs, lhs_inverse) = static_condition(a)?;
            let (rhs, rhs_inverse) = static_condition(b)?;
            if lhs_inverse || rhs_inverse {
                return None;
            }
            for (key, value) in rhs {
                if lhs.insert(key, value).is_some() {
                    return None;
                }
            }
            Some((lhs, false))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, Value>);

    impl PathResolver for MapResolver {
        fn resolve(&self, path: &NodePath) -> Option<Value> {
            self.0.get(&path.to_string()).cloned()
        }
    }

    fn resolver(pairs: &[(&str, Value)]) -> MapResolver {
        MapResolver(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn eval(src: &str, r: &MapResolver) -> Value {
        Expression::parse(src).unwrap().evaluate(r)
    }

    #[test]
    fn parses_path_forms() {
        let expr = Expression::parse("../type === 'adult' && $.meta.flags[0] && @.tags && #/a/b").unwrap();
        let deps: Vec<String> = expr.dependencies().iter().map(|p| p.to_string()).collect();
        assert_eq!(deps, vec!["../type", "#/meta/flags/0", "./tags", "#/a/b"]);
    }

    #[test]
    fn parent_chain() {
        let expr = Expression::parse("../../x > 1").unwrap();
        assert_eq!(expr.dependencies()[0].to_string(), "../../x");
    }

    #[test]
    fn method_call_ends_path() {
        let r = resolver(&[("./tags", json!(["a", "b"]))]);
        assert_eq!(eval("@.tags.includes('b')", &r), json!(true));
        assert_eq!(eval("(@.tags).length", &r), json!(2));
        assert_eq!(eval("['x'].length", &r), json!(1));
    }

    #[test]
    fn equality_and_logic() {
        let r = resolver(&[("../type", json!("adult")), ("../age", json!(20))]);
        assert_eq!(eval("../type === 'adult'", &r), json!(true));
        assert_eq!(eval("../type !== 'adult' || ../age >= 18", &r), json!(true));
        assert_eq!(eval("!(../age < 18)", &r), json!(true));
        assert_eq!(eval("../missing === undefined", &r), json!(true));
        assert_eq!(eval("../age == '20'", &r), json!(true));
        assert_eq!(eval("../age === '20'", &r), json!(false));
    }

    #[test]
    fn arithmetic_and_ternary() {
        let r = resolver(&[("../a", json!(4)), ("../b", json!(0.5))]);
        assert_eq!(eval("../a + 1", &r), json!(5));
        assert_eq!(eval("../a * ../b", &r), json!(2));
        assert_eq!(eval("-../a % 3", &r), json!(-1));
        assert_eq!(eval("../a > 3 ? 'big' : 'small'", &r), json!("big"));
        assert_eq!(eval("'n=' + ../a", &r), json!("n=4"));
        assert_eq!(eval("../missing + 1", &r), Value::Null);
    }

    #[test]
    fn array_literal_includes() {
        let r = resolver(&[("../kind", json!("movie"))]);
        assert_eq!(eval("['game', 'movie'].includes(../kind)", &r), json!(true));
        assert_eq!(eval("[].includes(../kind)", &r), json!(false));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!("x")));
    }

    #[test]
    fn parse_errors() {
        assert!(Expression::parse("../a ===").is_err());
        assert!(Expression::parse("foo").is_err());
        assert!(Expression::parse("(../a").is_err());
        assert!(Expression::parse("'open").is_err());
        assert!(Expression::parse("../a.trim()").is_err());
        assert!(Expression::parse("../a ../b").is_err());
    }

    #[test]
    fn sibling_condition_equality() {
        let entry = Expression::parse("../type === 'adult'")
            .unwrap()
            .as_sibling_condition()
            .unwrap();
        assert!(!entry.inverse);
        assert_eq!(
            entry.condition.get("type"),
            Some(&ConditionValue::Equals(json!("adult")))
        );
    }

    #[test]
    fn sibling_condition_conjunction_and_membership() {
        let entry = Expression::parse("['a', 'b'].includes(../kind) && ../on === true")
            .unwrap()
            .as_sibling_condition()
            .unwrap();
        assert_eq!(entry.condition.len(), 2);
        assert_eq!(
            entry.condition.get("kind"),
            Some(&ConditionValue::OneOf(vec![json!("a"), json!("b")]))
        );
    }

    #[test]
    fn sibling_condition_inverse() {
        let entry = Expression::parse("../type !== 'none'")
            .unwrap()
            .as_sibling_condition()
            .unwrap();
        assert!(entry.inverse);
    }

    #[test]
    fn non_static_conditions() {
        for src in ["$.type === 'a'", "../a === ../b", "../a > 1", "../a === 1 || ../b === 2"] {
            assert!(
                Expression::parse(src).unwrap().as_sibling_condition().is_none(),
                "{} should not be static",
                src
            );
        }
    }

    #[test]
    fn pointer_parsing() {
        assert_eq!(NodePath::parse_pointer("#/a/b").to_string(), "#/a/b");
        assert_eq!(NodePath::parse_pointer("/a/0").to_string(), "#/a/0");
        assert_eq!(NodePath::parse_pointer("../x").to_string(), "./../x");
        assert_eq!(NodePath::parse_pointer("a~1b").segments[1], PathSegment::Key("a/b".into()));
        assert_eq!(NodePath::parse_pointer("#").segments, vec![PathSegment::Root]);
    }
}
