//! Guard and filter expression evaluation.
//!
//! Implements the restricted condition grammar used by connection guards,
//! event filters, and condition triggers:
//!
//! ```text
//! expr       := and_expr ( "||" and_expr )*
//! and_expr   := primary ( "&&" primary )*
//! primary    := "(" expr ")" | comparison
//! comparison := field op literal
//! op         := "=" | "!=" | ">" | ">=" | "<" | "<=" | "contains"
//! ```
//!
//! Fields are dotted paths resolved against the evaluation context (variable
//! bindings plus the current step's result payload). Literals are quoted
//! strings, numbers, or `true`/`false`. `&&` binds tighter than `||`.
//!
//! An unknown field fails closed: the comparison evaluates false and a
//! tracing warning is emitted, but no error is raised. Ordering comparisons
//! on type-incompatible operands are a hard `EvalError::TypeMismatch`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from parsing or evaluating a condition expression.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

/// Literal operand on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cmp {
        field: String,
        op: CmpOp,
        literal: Literal,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    AndAnd,
    OrOr,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(EvalError::Parse("expected '&&'".to_string()));
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(EvalError::Parse("expected '||'".to_string()));
                }
                tokens.push(Token::OrOr);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(EvalError::Parse("expected '!='".to_string()));
                }
                tokens.push(Token::Op(CmpOp::Ne));
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(EvalError::Parse("unterminated string literal".to_string()));
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num: f64 = s
                    .parse()
                    .map_err(|_| EvalError::Parse(format!("invalid number '{s}'")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match s.as_str() {
                    "contains" => tokens.push(Token::Op(CmpOp::Contains)),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => {
                return Err(EvalError::Parse(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.parse_primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EvalError::Parse("expected ')'".to_string())),
                }
            }
            Some(Token::Ident(ident)) if ident == "true" || ident == "false" => {
                // Bare boolean shorthand: `active` style fields still need a
                // comparison, but a literal true/false is accepted as-is.
                Ok(Expr::Cmp {
                    field: String::new(),
                    op: CmpOp::Eq,
                    literal: Literal::Bool(ident == "true"),
                })
            }
            Some(Token::Ident(field)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(EvalError::Parse(format!(
                            "expected comparison operator after '{field}', got {other:?}"
                        )));
                    }
                };
                let literal = match self.next() {
                    Some(Token::Str(s)) => Literal::Str(s),
                    Some(Token::Num(n)) => Literal::Num(n),
                    Some(Token::Ident(b)) if b == "true" => Literal::Bool(true),
                    Some(Token::Ident(b)) if b == "false" => Literal::Bool(false),
                    other => {
                        return Err(EvalError::Parse(format!(
                            "expected literal after operator, got {other:?}"
                        )));
                    }
                };
                Ok(Expr::Cmp { field, op, literal })
            }
            other => Err(EvalError::Parse(format!(
                "expected comparison or '(', got {other:?}"
            ))),
        }
    }
}

/// Parse an expression string into its AST without evaluating it.
///
/// Publish-time validation uses this to reject malformed guards early.
pub fn parse(input: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(EvalError::Parse("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Parse(format!(
            "trailing tokens after expression at position {}",
            parser.pos
        )));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// Field-resolution context: variable bindings merged with the current
/// step's result payload.
///
/// Object results contribute their top-level fields directly (shadowing
/// bindings of the same name) and the whole payload is also reachable under
/// the `result` root for explicit paths like `result.approved`.
pub struct EvalContext {
    root: Map<String, Value>,
}

impl EvalContext {
    pub fn new(bindings: &HashMap<String, Value>, step_result: Option<&Value>) -> Self {
        let mut root = Map::new();
        for (k, v) in bindings {
            root.insert(k.clone(), v.clone());
        }
        if let Some(result) = step_result {
            if let Value::Object(fields) = result {
                for (k, v) in fields {
                    root.insert(k.clone(), v.clone());
                }
            }
            root.insert("result".to_string(), result.clone());
        }
        Self { root }
    }

    /// Build a context from a bare JSON object (event filter evaluation).
    pub fn from_payload(payload: &Value) -> Self {
        let mut root = Map::new();
        if let Value::Object(fields) = payload {
            root = fields.clone();
        }
        Self { root }
    }

    fn resolve(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Parse and evaluate an expression against a context.
pub fn evaluate(input: &str, ctx: &EvalContext) -> Result<bool, EvalError> {
    let expr = parse(input)?;
    eval_expr(&expr, ctx)
}

fn eval_expr(expr: &Expr, ctx: &EvalContext) -> Result<bool, EvalError> {
    match expr {
        Expr::And(left, right) => Ok(eval_expr(left, ctx)? && eval_expr(right, ctx)?),
        Expr::Or(left, right) => Ok(eval_expr(left, ctx)? || eval_expr(right, ctx)?),
        Expr::Cmp { field, op, literal } => {
            // Bare boolean literal.
            if field.is_empty() {
                return Ok(matches!(literal, Literal::Bool(true)));
            }
            let Some(value) = ctx.resolve(field) else {
                tracing::warn!(field = %field, "unknown field in condition, evaluating false");
                return Ok(false);
            };
            eval_cmp(field, value, *op, literal)
        }
    }
}

fn eval_cmp(field: &str, value: &Value, op: CmpOp, literal: &Literal) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_equal(value, literal)),
        CmpOp::Ne => Ok(!values_equal(value, literal)),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let ordering = compare_ordered(field, value, literal)?;
            Ok(match op {
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                _ => unreachable!(),
            })
        }
        CmpOp::Contains => eval_contains(field, value, literal),
    }
}

fn values_equal(value: &Value, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::String(s), Literal::Str(lit)) => s == lit,
        (Value::Number(n), Literal::Num(lit)) => {
            n.as_f64().is_some_and(|n| (n - lit).abs() < f64::EPSILON)
        }
        (Value::Bool(b), Literal::Bool(lit)) => b == lit,
        _ => false,
    }
}

/// Ordered comparison: numbers against numbers, or RFC 3339 date strings
/// against each other. Anything else is a type mismatch.
fn compare_ordered(
    field: &str,
    value: &Value,
    literal: &Literal,
) -> Result<std::cmp::Ordering, EvalError> {
    match (value, literal) {
        (Value::Number(n), Literal::Num(lit)) => {
            let n = n.as_f64().ok_or_else(|| {
                EvalError::TypeMismatch(format!("field '{field}' is not a finite number"))
            })?;
            Ok(n.partial_cmp(lit).unwrap_or(std::cmp::Ordering::Equal))
        }
        (Value::String(s), Literal::Str(lit)) => {
            match (parse_date(s), parse_date(lit)) {
                (Some(a), Some(b)) => Ok(a.cmp(&b)),
                _ => Err(EvalError::TypeMismatch(format!(
                    "ordered comparison on field '{field}' requires numbers or RFC 3339 dates"
                ))),
            }
        }
        _ => Err(EvalError::TypeMismatch(format!(
            "cannot order field '{field}' ({}) against {literal:?}",
            value_kind(value)
        ))),
    }
}

fn eval_contains(field: &str, value: &Value, literal: &Literal) -> Result<bool, EvalError> {
    match value {
        Value::String(haystack) => match literal {
            Literal::Str(needle) => Ok(haystack.contains(needle.as_str())),
            _ => Err(EvalError::TypeMismatch(format!(
                "'contains' on string field '{field}' needs a string literal"
            ))),
        },
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, literal))),
        _ => Err(EvalError::TypeMismatch(format!(
            "'contains' needs a string or array field, '{field}' is {}",
            value_kind(value)
        ))),
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
