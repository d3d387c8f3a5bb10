//! Sandboxed expression and template evaluator
//!
//! Used for:
//! - observer `set` templates (`"{{ (variables.count or 0) + 1 }}"`)
//! - workflow transition and trigger `when` guards
//! - pipeline step `condition` strings and `{{ inputs.x }}` body templates
//!
//! Expressions only ever see the JSON values placed in an [`EvalContext`];
//! there is no access to the host environment.
//!
//! # Supported Expressions
//!
//! - **Path Access**: `variables.count`, `inputs.target`, `steps.build.output`
//! - **Comparisons**: `==`, `!=`, `>`, `<`, `>=`, `<=`, `in`
//! - **Boolean Operators**: `and`/`&&`, `or`/`||`, `not`/`!`
//! - **Arithmetic**: `+`, `-`, `*`, `/`, `%` (`+` also concatenates strings)
//! - **Literals**: strings (single or double quoted), integers, floats,
//!   `true`/`false`/`null` and their `True`/`False`/`None` spellings
//!
//! `and`/`or` short-circuit and return the deciding operand, so
//! `(variables.count or 0) + 1` yields `1` when `count` is unset.
//!
//! # Example
//!
//! ```rust
//! use gantry_core::expression_eval::{render_template, EvalContext};
//! use serde_json::json;
//!
//! let context = EvalContext::new().with_nested("variables", json!({"count": 2}));
//! let rendered = render_template("{{ (variables.count or 0) + 1 }}", &context).unwrap();
//! assert_eq!(rendered, "3");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Failure while parsing or evaluating an expression
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EvalError {
    #[error("syntax error at offset {offset}: {message}")]
    ParseError { offset: usize, message: String },

    #[error("undefined name '{0}'")]
    UnknownVariable(String),

    #[error("type mismatch: {0}")]
    TypeError(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("expression is empty")]
    EmptyExpression,

    #[error("template block opened at byte {0} is never closed")]
    UnterminatedTemplate(usize),
}

pub type EvalResult<T> = Result<T, EvalError>;

fn syntax(offset: usize, message: impl Into<String>) -> EvalError {
    EvalError::ParseError {
        offset,
        message: message.into(),
    }
}

/// Values an expression can reference.
///
/// `variables` holds bare names and `nested` holds roots reached through a
/// dotted path (`inputs.x`, `steps.build.output`). A bare name falls back to
/// `nested`; a dotted path falls back to `variables`.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub variables: HashMap<String, Value>,
    pub nested: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_nested(mut self, name: &str, value: Value) -> Self {
        self.set_nested(name, value);
        self
    }

    /// Workflow variables, reachable both bare (`count`) and under
    /// `variables.` (`variables.count`)
    pub fn from_variables(variables: &Map<String, Value>) -> Self {
        let bare = variables
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let mut nested = HashMap::new();
        nested.insert("variables".to_string(), Value::Object(variables.clone()));
        Self {
            variables: bare,
            nested,
        }
    }

    /// Resolve `name` or `root.key.0.field`. Numeric segments index arrays.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (root, tail) = match path.split_once('.') {
            Some((root, tail)) => (root, Some(tail)),
            None => (path, None),
        };

        let start = if tail.is_some() {
            self.nested.get(root).or_else(|| self.variables.get(root))
        } else {
            self.variables.get(root).or_else(|| self.nested.get(root))
        }?;

        tail.into_iter()
            .flat_map(|rest| rest.split('.'))
            .try_fold(start, |node, segment| match node {
                Value::Object(fields) => fields.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn set_nested(&mut self, name: &str, value: Value) {
        self.nested.insert(name.to_string(), value);
    }
}

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),

    /// Dotted lookup such as `count` or `steps.build.output`
    Variable(String),

    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    In,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    /// Digits with at most one fractional part, kept raw so a path segment
    /// like `items.0.1` survives lexing
    Num(String),
    Str(String),
    /// Identifier or keyword
    Word(String),
    Op(&'static str),
    Open,
    Close,
    Dot,
}

#[derive(Debug)]
struct Lexeme {
    tok: Tok,
    at: usize,
}

/// Longest spellings first so `<=` wins over `<`
const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%",
];

fn lex(src: &str) -> EvalResult<Vec<Lexeme>> {
    let mut lexemes = Vec::new();
    let mut pos = 0;

    while let Some(ch) = src[pos..].chars().next() {
        if ch.is_whitespace() {
            pos += ch.len_utf8();
            continue;
        }

        let rest = &src[pos..];
        let (tok, width) = match ch {
            '(' => (Tok::Open, 1),
            ')' => (Tok::Close, 1),
            '.' => (Tok::Dot, 1),
            '"' | '\'' => lex_string(src, pos, ch)?,
            c if c.is_ascii_digit() => lex_number(rest),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let width = rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                (Tok::Word(rest[..width].to_string()), width)
            }
            _ => match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
                Some(op) => (Tok::Op(*op), op.len()),
                None if matches!(ch, '=' | '&' | '|') => {
                    return Err(syntax(pos, format!("'{}' must be doubled", ch)))
                }
                None => return Err(syntax(pos, format!("unexpected character '{}'", ch))),
            },
        };

        lexemes.push(Lexeme { tok, at: pos });
        pos += width;
    }

    Ok(lexemes)
}

fn lex_number(rest: &str) -> (Tok, usize) {
    let digits = |s: &str| s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());

    let mut width = digits(rest);
    if let Some(fraction) = rest[width..].strip_prefix('.') {
        // `1.` followed by anything but a digit leaves the dot for the parser
        let more = digits(fraction);
        if more > 0 {
            width += 1 + more;
        }
    }
    (Tok::Num(rest[..width].to_string()), width)
}

/// Returns the literal and its width including both quotes
fn lex_string(src: &str, at: usize, quote: char) -> EvalResult<(Tok, usize)> {
    let mut text = String::new();
    let mut chars = src[at + 1..].char_indices();

    while let Some((i, c)) = chars.next() {
        if c == quote {
            return Ok((Tok::Str(text), i + 2));
        }
        if c != '\\' {
            text.push(c);
            continue;
        }
        let unescaped = match chars.next() {
            Some((_, 'n')) => '\n',
            Some((_, 't')) => '\t',
            Some((_, 'r')) => '\r',
            Some((_, lit @ ('\\' | '"' | '\''))) => lit,
            Some((j, other)) => {
                return Err(syntax(at + 1 + j, format!("unsupported escape '\\{}'", other)))
            }
            None => break,
        };
        text.push(unescaped);
    }

    Err(syntax(at, "string literal is not closed"))
}

/// Operator and left binding power of an infix token
fn infix(tok: &Tok) -> Option<(BinaryOp, u8)> {
    let op = match tok {
        Tok::Word(word) => match word.as_str() {
            "or" => BinaryOp::Or,
            "and" => BinaryOp::And,
            "in" => BinaryOp::In,
            _ => return None,
        },
        Tok::Op(sym) => match *sym {
            "||" => BinaryOp::Or,
            "&&" => BinaryOp::And,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            _ => return None,
        },
        _ => return None,
    };

    let power = match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::In => NOT_OPERAND_POWER,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
        BinaryOp::Add | BinaryOp::Sub => 5,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 6,
    };
    Some((op, power))
}

/// `not` swallows equality and tighter, so `not a == b` is `not (a == b)`
/// while `not a and b` is `(not a) and b`
const NOT_OPERAND_POWER: u8 = 3;

/// Pratt parser over a lexed expression
struct Parser {
    lexemes: Vec<Lexeme>,
    cursor: usize,
    source_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.lexemes.get(self.cursor).map(|lexeme| &lexeme.tok)
    }

    fn offset(&self) -> usize {
        self.lexemes
            .get(self.cursor)
            .map_or(self.source_len, |lexeme| lexeme.at)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.lexemes.get(self.cursor)?.tok.clone();
        self.cursor += 1;
        Some(tok)
    }

    fn expression(&mut self, min_power: u8) -> EvalResult<Expr> {
        let mut lhs = self.prefix()?;

        while let Some((op, power)) = self.peek().and_then(infix) {
            if power < min_power {
                break;
            }
            self.bump();
            let rhs = self.expression(power + 1)?;
            lhs = Expr::Binary {
                left: Box::new(lhs),
                op,
                right: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> EvalResult<Expr> {
        let at = self.offset();
        let Some(tok) = self.bump() else {
            return Err(syntax(at, "expression ended early"));
        };

        match tok {
            Tok::Op("!") => self.negation(),
            Tok::Op("-") => Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.prefix()?),
            }),
            Tok::Open => {
                let inner = self.expression(0)?;
                match self.bump() {
                    Some(Tok::Close) => Ok(inner),
                    _ => Err(syntax(at, "'(' is never closed")),
                }
            }
            Tok::Num(raw) => number(&raw, at).map(Expr::Literal),
            Tok::Str(text) => Ok(Expr::Literal(Value::String(text))),
            Tok::Word(word) => match word.as_str() {
                "not" => self.negation(),
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" | "none" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "in" => Err(syntax(at, format!("'{}' needs a left operand", word))),
                _ => self.path(word),
            },
            other => Err(syntax(at, format!("unexpected {:?}", other))),
        }
    }

    fn negation(&mut self) -> EvalResult<Expr> {
        let operand = self.expression(NOT_OPERAND_POWER)?;
        Ok(Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(operand),
        })
    }

    fn path(&mut self, mut path: String) -> EvalResult<Expr> {
        while self.peek() == Some(&Tok::Dot) {
            self.bump();
            let at = self.offset();
            match self.bump() {
                Some(Tok::Word(segment)) | Some(Tok::Num(segment)) => {
                    path.push('.');
                    path.push_str(&segment);
                }
                _ => return Err(syntax(at, "expected a name after '.'")),
            }
        }
        Ok(Expr::Variable(path))
    }
}

fn number(raw: &str, at: usize) -> EvalResult<Value> {
    let parsed = if raw.contains('.') {
        raw.parse::<f64>().ok().map(float_to_value)
    } else {
        raw.parse::<i64>().ok().map(Value::from)
    };
    parsed.ok_or_else(|| syntax(at, format!("invalid number '{}'", raw)))
}

fn parse_expression(src: &str) -> EvalResult<Expr> {
    let lexemes = lex(src)?;
    if lexemes.is_empty() {
        return Err(EvalError::EmptyExpression);
    }

    let mut parser = Parser {
        lexemes,
        cursor: 0,
        source_len: src.len(),
    };
    let expr = parser.expression(0)?;

    match parser.peek() {
        None => Ok(expr),
        Some(extra) => Err(syntax(
            parser.offset(),
            format!("unexpected {:?} after expression", extra),
        )),
    }
}

/// Evaluates parsed expressions against an [`EvalContext`].
///
/// Strict lookups fail on an unknown path; lenient lookups yield `null`,
/// which is what templates and guards want.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator {
    lenient: bool,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lenient() -> Self {
        Self { lenient: true }
    }

    pub fn parse(&self, expression: &str) -> EvalResult<Expr> {
        parse_expression(expression)
    }

    pub fn evaluate(&self, expression: &str, context: &EvalContext) -> EvalResult<Value> {
        parse_expression(expression).and_then(|expr| self.reduce(&expr, context))
    }

    pub fn evaluate_bool(&self, expression: &str, context: &EvalContext) -> EvalResult<bool> {
        self.evaluate(expression, context).map(|value| truthy(&value))
    }

    fn reduce(&self, expr: &Expr, ctx: &EvalContext) -> EvalResult<Value> {
        let (left, op, right) = match expr {
            Expr::Literal(value) => return Ok(value.clone()),
            Expr::Variable(path) => return self.lookup(path, ctx),
            Expr::Unary { op, expr } => return unary(*op, self.reduce(expr, ctx)?),
            Expr::Binary { left, op, right } => (left, *op, right),
        };

        let lhs = self.reduce(left, ctx)?;
        // `and`/`or` yield whichever operand decided the result
        match op {
            BinaryOp::And if !truthy(&lhs) => Ok(lhs),
            BinaryOp::Or if truthy(&lhs) => Ok(lhs),
            BinaryOp::And | BinaryOp::Or => self.reduce(right, ctx),
            _ => binary(op, &lhs, &self.reduce(right, ctx)?),
        }
    }

    fn lookup(&self, path: &str, ctx: &EvalContext) -> EvalResult<Value> {
        match ctx.get(path) {
            Some(value) => Ok(value.clone()),
            None if self.lenient => Ok(Value::Null),
            None => Err(EvalError::UnknownVariable(path.to_string())),
        }
    }
}

fn unary(op: UnaryOp, operand: Value) -> EvalResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(&operand))),
        UnaryOp::Neg => match operand.as_i64().and_then(i64::checked_neg) {
            Some(negated) => Ok(Value::from(negated)),
            None => Ok(float_to_value(-to_number(&operand)?)),
        },
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    let ordered =
        |accept: fn(Ordering) -> bool| ordering(lhs, rhs).map(|found| Value::Bool(accept(found)));

    match op {
        BinaryOp::Eq => Ok(Value::Bool(loosely_equal(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!loosely_equal(lhs, rhs))),
        BinaryOp::Lt => ordered(Ordering::is_lt),
        BinaryOp::Le => ordered(Ordering::is_le),
        BinaryOp::Gt => ordered(Ordering::is_gt),
        BinaryOp::Ge => ordered(Ordering::is_ge),
        BinaryOp::In => membership(lhs, rhs).map(Value::Bool),
        BinaryOp::And => Ok(Value::Bool(truthy(lhs) && truthy(rhs))),
        BinaryOp::Or => Ok(Value::Bool(truthy(lhs) || truthy(rhs))),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array([a.as_slice(), b.as_slice()].concat()))
            }
            _ => arithmetic(lhs, rhs, i64::checked_add, |a, b| a + b),
        },
        BinaryOp::Sub => arithmetic(lhs, rhs, i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => arithmetic(lhs, rhs, i64::checked_mul, |a, b| a * b),
        BinaryOp::Div => {
            let divisor = nonzero(rhs)?;
            Ok(float_to_value(to_number(lhs)? / divisor))
        }
        BinaryOp::Mod => {
            nonzero(rhs)?;
            arithmetic(lhs, rhs, i64::checked_rem_euclid, f64::rem_euclid)
        }
    }
}

fn nonzero(divisor: &Value) -> EvalResult<f64> {
    match to_number(divisor)? {
        d if d == 0.0 => Err(EvalError::DivisionByZero),
        d => Ok(d),
    }
}

/// Numbers order numerically and strings lexically; nothing else orders
fn ordering(lhs: &Value, rhs: &Value) -> EvalResult<Ordering> {
    let found = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    found.ok_or_else(|| EvalError::TypeError(format!("{} and {} are not comparable", lhs, rhs)))
}

/// `needle in haystack`: list element, substring, or object key
fn membership(needle: &Value, haystack: &Value) -> EvalResult<bool> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loosely_equal(item, needle))),
        Value::String(text) => Ok(text.contains(render_value(needle).as_str())),
        Value::Object(fields) => Ok(needle
            .as_str()
            .map_or(false, |key| fields.contains_key(key))),
        Value::Null => Ok(false),
        other => Err(EvalError::TypeError(format!(
            "cannot test membership in {}",
            other
        ))),
    }
}

/// Integer operands stay integers unless the result overflows
fn arithmetic(
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> EvalResult<Value> {
    let exact = integral(lhs)
        .zip(integral(rhs))
        .and_then(|(a, b)| int_op(a, b));
    match exact {
        Some(n) => Ok(Value::from(n)),
        None => Ok(float_to_value(float_op(to_number(lhs)?, to_number(rhs)?))),
    }
}

fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Bool(flag) => Some(i64::from(*flag)),
        Value::Null => Some(0),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn to_number(value: &Value) -> EvalResult<f64> {
    let coerced = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(flag) => Some(f64::from(u8::from(*flag))),
        Value::Null => Some(0.0),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    coerced.ok_or_else(|| EvalError::TypeError(format!("{} is not a number", value)))
}

/// `1 == 1.0`
fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

/// Non-finite results become `null`
fn float_to_value(n: f64) -> Value {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

/// Truthiness used by guards and `and`/`or`
pub fn truthy(val: &Value) -> bool {
    match val {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Textual form of a value as it appears in rendered templates.
///
/// Strings are inserted raw, `null` renders empty, and containers render
/// as compact JSON.
pub fn render_value(val: &Value) -> String {
    match val {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Evaluate an expression against a context (strict lookup)
pub fn evaluate(expression: &str, context: &EvalContext) -> EvalResult<Value> {
    ExpressionEvaluator::new().evaluate(expression, context)
}

/// Evaluate an expression as a boolean (strict lookup)
pub fn evaluate_bool(expression: &str, context: &EvalContext) -> EvalResult<bool> {
    ExpressionEvaluator::new().evaluate_bool(expression, context)
}

/// Evaluate a guard such as a `when` or `condition` string.
///
/// Unknown paths are `null`, and a guard written as a single `{{ ... }}`
/// block is accepted as well.
pub fn evaluate_condition(expression: &str, context: &EvalContext) -> EvalResult<bool> {
    let trimmed = expression.trim();
    let inner = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .unwrap_or(trimmed);
    ExpressionEvaluator::lenient().evaluate_bool(inner, context)
}

/// Render a template, evaluating each `{{ expr }}` block leniently.
///
/// Text outside the blocks is copied verbatim.
pub fn render_template(template: &str, context: &EvalContext) -> EvalResult<String> {
    let evaluator = ExpressionEvaluator::lenient();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(EvalError::UnterminatedTemplate(offset + start))?;
        let value = evaluator.evaluate(after_open[..end].trim(), context)?;
        out.push_str(&render_value(&value));

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Create a context from a JSON object: objects become nested roots,
/// everything else a bare variable.
pub fn context_from_json(value: Value) -> EvalContext {
    let Value::Object(fields) = value else {
        return EvalContext::new();
    };
    let (nested, variables) = fields.into_iter().partition(|(_, v)| v.is_object());
    EvalContext { variables, nested }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> EvalContext {
        match value {
            Value::Object(map) => EvalContext::from_variables(&map),
            _ => EvalContext::new(),
        }
    }

    #[test]
    fn test_literal_evaluation() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new();

        assert_eq!(eval.evaluate("42", &ctx).unwrap(), json!(42));
        assert_eq!(eval.evaluate("3.5", &ctx).unwrap(), json!(3.5));
        assert_eq!(eval.evaluate("\"hello\"", &ctx).unwrap(), json!("hello"));
        assert_eq!(eval.evaluate("'single'", &ctx).unwrap(), json!("single"));
        assert_eq!(eval.evaluate("True", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("None", &ctx).unwrap(), json!(null));
    }

    #[test]
    fn test_path_access() {
        let ctx = vars(json!({"count": 5, "plan": {"steps": ["a", "b"]}}));
        let eval = ExpressionEvaluator::new();

        assert_eq!(eval.evaluate("count", &ctx).unwrap(), json!(5));
        assert_eq!(eval.evaluate("variables.count", &ctx).unwrap(), json!(5));
        assert_eq!(eval.evaluate("plan.steps.1", &ctx).unwrap(), json!("b"));
        assert_eq!(
            eval.evaluate("variables.plan.steps.0", &ctx).unwrap(),
            json!("a")
        );
    }

    #[test]
    fn test_or_returns_operand() {
        let ctx = vars(json!({}));
        let eval = ExpressionEvaluator::lenient();

        assert_eq!(
            eval.evaluate("(variables.count or 0) + 1", &ctx).unwrap(),
            json!(1)
        );
        assert_eq!(eval.evaluate("\"\" or \"x\"", &ctx).unwrap(), json!("x"));
        assert_eq!(eval.evaluate("0 and 5", &ctx).unwrap(), json!(0));
    }

    #[test]
    fn test_integer_arithmetic_is_preserved() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new()
            .with_variable("a", json!(10))
            .with_variable("b", json!(3));

        assert_eq!(eval.evaluate("a + b", &ctx).unwrap(), json!(13));
        assert_eq!(eval.evaluate("a - b", &ctx).unwrap(), json!(7));
        assert_eq!(eval.evaluate("a * b", &ctx).unwrap(), json!(30));
        assert_eq!(eval.evaluate("a % b", &ctx).unwrap(), json!(1));
        assert_eq!(eval.evaluate("a + 0.5", &ctx).unwrap(), json!(10.5));

        let result = eval.evaluate("a / b", &ctx).unwrap();
        assert!((result.as_f64().unwrap() - 3.333333).abs() < 0.001);
    }

    #[test]
    fn test_operator_precedence() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new();

        assert_eq!(eval.evaluate("2 + 3 * 4", &ctx).unwrap(), json!(14));
        assert_eq!(eval.evaluate("(2 + 3) * 4", &ctx).unwrap(), json!(20));
        assert_eq!(eval.evaluate("5 > 3 and 2 < 4", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("not 1 == 2", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("-5 + 2", &ctx).unwrap(), json!(-3));
    }

    #[test]
    fn test_in_operator() {
        let ctx = vars(json!({"tags": ["rust", "cli"], "name": "gantry"}));
        let eval = ExpressionEvaluator::new();

        assert!(eval.evaluate_bool("\"rust\" in tags", &ctx).unwrap());
        assert!(!eval.evaluate_bool("\"go\" in tags", &ctx).unwrap());
        assert!(eval.evaluate_bool("\"ant\" in name", &ctx).unwrap());
        assert!(eval.evaluate_bool("\"name\" in variables", &ctx).unwrap());
    }

    #[test]
    fn test_string_concatenation_and_comparison() {
        let ctx = vars(json!({"status": "running"}));
        let eval = ExpressionEvaluator::new();

        assert_eq!(
            eval.evaluate("status + \"!\"", &ctx).unwrap(),
            json!("running!")
        );
        assert!(eval.evaluate_bool("status == 'running'", &ctx).unwrap());
        assert!(eval.evaluate_bool("status != \"stopped\"", &ctx).unwrap());
        assert!(eval.evaluate_bool("\"a\" < \"b\"", &ctx).unwrap());
    }

    #[test]
    fn test_error_handling() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new();

        assert!(matches!(
            eval.evaluate("unknown", &ctx),
            Err(EvalError::UnknownVariable(_))
        ));
        assert!(matches!(
            eval.evaluate("10 / 0", &ctx),
            Err(EvalError::DivisionByZero)
        ));
        assert!(matches!(
            eval.evaluate("", &ctx),
            Err(EvalError::EmptyExpression)
        ));
        assert!(matches!(
            eval.evaluate("1 2", &ctx),
            Err(EvalError::ParseError { .. })
        ));
        assert!(matches!(
            eval.evaluate("null > 1", &ctx),
            Err(EvalError::TypeError(_))
        ));
    }

    #[test]
    fn test_lexer_edges() {
        let ctx = vars(json!({"grid": [[1, 2], [3, 4]]}));
        let eval = ExpressionEvaluator::new();

        assert_eq!(eval.evaluate("grid.1.0", &ctx).unwrap(), json!(3));
        assert_eq!(eval.evaluate("'it\\'s'", &ctx).unwrap(), json!("it's"));
        assert!(eval.evaluate_bool("1 <= 1 && !(2 < 1)", &ctx).unwrap());

        for broken in ["a = 1", "a & b", "'open", "(1 + 2", "1 +", "and 1", "a.", "#"] {
            assert!(
                matches!(eval.evaluate(broken, &ctx), Err(EvalError::ParseError { .. })),
                "{} should not parse",
                broken
            );
        }
    }

    #[test]
    fn test_lenient_unknown_is_null() {
        let eval = ExpressionEvaluator::lenient();
        let ctx = EvalContext::new();
        assert_eq!(eval.evaluate("missing.path", &ctx).unwrap(), json!(null));
        assert!(!eval.evaluate_bool("missing", &ctx).unwrap());
    }

    #[test]
    fn test_render_template() {
        let ctx = vars(json!({"count": 2, "name": "build", "flag": false, "list": [1, 2]}));

        assert_eq!(
            render_template("{{ (variables.count or 0) + 1 }}", &ctx).unwrap(),
            "3"
        );
        assert_eq!(
            render_template("run {{ name }} now", &ctx).unwrap(),
            "run build now"
        );
        assert_eq!(render_template("{{ flag }}", &ctx).unwrap(), "false");
        assert_eq!(render_template("{{ missing }}", &ctx).unwrap(), "");
        assert_eq!(render_template("{{ list }}", &ctx).unwrap(), "[1,2]");
        assert_eq!(render_template("plain text", &ctx).unwrap(), "plain text");
        assert!(matches!(
            render_template("broken {{ name", &ctx),
            Err(EvalError::UnterminatedTemplate(7))
        ));
    }

    #[test]
    fn test_evaluate_condition() {
        let ctx = vars(json!({"ready": true, "count": 3}));

        assert!(evaluate_condition("ready", &ctx).unwrap());
        assert!(evaluate_condition("{{ count >= 3 }}", &ctx).unwrap());
        assert!(!evaluate_condition("variables.missing", &ctx).unwrap());
    }

    #[test]
    fn test_context_from_json() {
        let ctx = context_from_json(json!({
            "count": 10,
            "inputs": {"target": "release"}
        }));

        assert_eq!(evaluate("count", &ctx).unwrap(), json!(10));
        assert_eq!(evaluate("inputs.target", &ctx).unwrap(), json!("release"));
    }
}
