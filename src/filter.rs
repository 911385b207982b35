//! Event filtering: condition trees and the textual filter language
//!
//! Filters are immutable condition trees evaluated against one [`Event`] at a
//! time. Trees are built either programmatically ([`field`], [`exists`],
//! [`event_is`] and the combinators on [`Cond`]) or from the textual language
//! via [`parse_filter`].
//!
//! Evaluation never fails: a condition whose field is missing or unconvertible
//! simply does not match. A field marked [`strict`](FieldExpr::strict) widens
//! that to the whole filter — if its data is unavailable, the entire filter
//! evaluates to `false` regardless of other branches.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;
use tracing::warn;

use crate::event::Event;

/// Operand or resolved field value inside a check.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String value.
    Str(String),
    /// Integer value (after an [`Int`](FieldExpr::to_int) pipe).
    Int(i64),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

/// Signal interrupting an evaluation below a condition.
///
/// `Skip` fails only the condition that raised it; `Abort` propagates to the
/// filter root and fails the whole evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Skip,
    Abort,
}

type EvalResult = Result<bool, Interrupt>;

/// Value coercion applied to a field before its check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeOp {
    Int,
    Lower,
}

/// Field reference inside a condition: a name, a strictness flag and an
/// optional chain of coercions.
///
/// Non-strict (the default): a missing field or failed coercion fails the
/// enclosing condition only. Strict: it fails the entire filter.
#[derive(Debug, Clone)]
pub struct FieldExpr {
    name: String,
    strict: bool,
    pipes: Vec<PipeOp>,
}

/// Start a condition on the named event field (case-insensitive).
pub fn field(name: impl AsRef<str>) -> FieldExpr {
    FieldExpr {
        name: name.as_ref().to_lowercase(),
        strict: false,
        pipes: Vec::new(),
    }
}

impl FieldExpr {
    /// Make missing data abort the whole filter instead of failing only the
    /// enclosing condition.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Coerce the field value to an integer before checking.
    pub fn to_int(mut self) -> Self {
        self.pipes.push(PipeOp::Int);
        self
    }

    /// Lower-case the field value before checking.
    pub fn lowercase(mut self) -> Self {
        self.pipes.push(PipeOp::Lower);
        self
    }

    /// Equality check.
    pub fn eq(self, value: impl Into<Value>) -> Cond {
        self.cmp(CmpOp::Eq, value)
    }

    /// Inequality check.
    pub fn ne(self, value: impl Into<Value>) -> Cond {
        self.cmp(CmpOp::Ne, value)
    }

    /// Less-than check.
    pub fn lt(self, value: impl Into<Value>) -> Cond {
        self.cmp(CmpOp::Lt, value)
    }

    /// Less-than-or-equal check.
    pub fn le(self, value: impl Into<Value>) -> Cond {
        self.cmp(CmpOp::Le, value)
    }

    /// Greater-than check.
    pub fn gt(self, value: impl Into<Value>) -> Cond {
        self.cmp(CmpOp::Gt, value)
    }

    /// Greater-than-or-equal check.
    pub fn ge(self, value: impl Into<Value>) -> Cond {
        self.cmp(CmpOp::Ge, value)
    }

    /// Regex check, anchored at the start of the field value.
    pub fn matches(self, pattern: &str) -> Result<Cond, regex::Error> {
        let re = Regex::new(&format!(r"\A(?:{pattern})"))?;
        Ok(Cond::Test(Condition {
            field: self,
            check: Check::Regex(re),
        }))
    }

    fn cmp(self, op: CmpOp, value: impl Into<Value>) -> Cond {
        Cond::Test(Condition {
            field: self,
            check: Check::Cmp(op, value.into()),
        })
    }

    fn interrupt(&self) -> Interrupt {
        if self.strict {
            Interrupt::Abort
        } else {
            Interrupt::Skip
        }
    }

    fn resolve(&self, event: &Event) -> Result<Value, Interrupt> {
        let raw = match event.get(&self.name) {
            Some(v) => v.to_string(),
            None => return Err(self.interrupt()),
        };
        let mut value = Value::Str(raw);
        for pipe in &self.pipes {
            value = match (pipe, value) {
                (PipeOp::Int, Value::Str(s)) => match s.trim().parse::<i64>() {
                    Ok(n) => Value::Int(n),
                    Err(_) => return Err(self.interrupt()),
                },
                (PipeOp::Int, v @ Value::Int(_)) => v,
                (PipeOp::Lower, Value::Str(s)) => Value::Str(s.to_lowercase()),
                (PipeOp::Lower, Value::Int(_)) => {
                    warn!(
                        field = %self.name,
                        "lowercase pipe applied to an integer value"
                    );
                    return Err(Interrupt::Abort);
                }
            };
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone)]
enum Check {
    Cmp(CmpOp, Value),
    Regex(Regex),
}

impl Check {
    fn check(&self, value: &Value, field: &str) -> EvalResult {
        match self {
            Check::Cmp(op, operand) => match (value, operand) {
                (Value::Int(a), Value::Int(b)) => Ok(op.apply(a.cmp(b))),
                (Value::Str(a), Value::Str(b)) => Ok(op.apply(a.as_str().cmp(b.as_str()))),
                _ => {
                    warn!(field, "type mismatch between field value and check operand");
                    Err(Interrupt::Abort)
                }
            },
            Check::Regex(re) => match value {
                Value::Str(s) => Ok(re.is_match(s)),
                Value::Int(_) => {
                    warn!(field, "regex check applied to an integer value");
                    Err(Interrupt::Abort)
                }
            },
        }
    }
}

/// Single field check.
#[derive(Debug, Clone)]
pub struct Condition {
    field: FieldExpr,
    check: Check,
}

impl Condition {
    fn eval(&self, event: &Event) -> EvalResult {
        let value = match self.field.resolve(event) {
            Ok(v) => v,
            Err(Interrupt::Skip) => return Ok(false),
            Err(Interrupt::Abort) => return Err(Interrupt::Abort),
        };
        self.check.check(&value, &self.field.name)
    }
}

/// Boolean combinator joining two conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoolOp {
    And,
    Or,
}

/// Two conditions joined by a short-circuiting boolean operator.
#[derive(Debug, Clone)]
pub struct CondGroup {
    left: Cond,
    op: BoolOp,
    right: Cond,
}

impl CondGroup {
    fn eval(&self, event: &Event) -> EvalResult {
        let left = self.left.eval(event)?;
        // Short-circuit: the right side is not evaluated when the left side
        // already decides the group.
        match (self.op, left) {
            (BoolOp::And, false) => Ok(false),
            (BoolOp::Or, true) => Ok(true),
            _ => self.right.eval(event),
        }
    }
}

/// Field presence check. Never interrupts.
#[derive(Debug, Clone)]
pub struct ExistsCheck {
    name: String,
}

/// Event-name (class) check.
#[derive(Debug, Clone)]
pub struct ClassCheck {
    name: String,
    invert: bool,
}

impl ClassCheck {
    fn eval(&self, event: &Event) -> bool {
        let matched = event.name().eq_ignore_ascii_case(&self.name)
            || event
                .schema_name()
                .is_some_and(|schema| schema.eq_ignore_ascii_case(&self.name));
        matched != self.invert
    }
}

/// Node of a filter condition tree.
#[derive(Debug, Clone)]
pub enum Cond {
    /// Field check.
    Test(Condition),
    /// `and`/`or` group of two conditions.
    Group(Box<CondGroup>),
    /// Field presence check.
    Exists(ExistsCheck),
    /// Event-name check.
    Class(ClassCheck),
}

/// Condition that is true when the named field is present on the event.
pub fn exists(name: impl AsRef<str>) -> Cond {
    Cond::Exists(ExistsCheck {
        name: name.as_ref().to_lowercase(),
    })
}

/// Condition that is true when the event's name (or matched schema) equals
/// `name`, case-insensitively.
pub fn event_is(name: impl AsRef<str>) -> Cond {
    Cond::Class(ClassCheck {
        name: name.as_ref().to_string(),
        invert: false,
    })
}

/// Negated [`event_is`].
pub fn event_is_not(name: impl AsRef<str>) -> Cond {
    Cond::Class(ClassCheck {
        name: name.as_ref().to_string(),
        invert: true,
    })
}

impl Cond {
    /// Combine with another condition; both must hold. Short-circuits.
    pub fn and(self, other: Cond) -> Cond {
        Cond::Group(Box::new(CondGroup {
            left: self,
            op: BoolOp::And,
            right: other,
        }))
    }

    /// Combine with another condition; either may hold. Short-circuits.
    pub fn or(self, other: Cond) -> Cond {
        Cond::Group(Box::new(CondGroup {
            left: self,
            op: BoolOp::Or,
            right: other,
        }))
    }

    fn eval(&self, event: &Event) -> EvalResult {
        match self {
            Cond::Test(condition) => condition.eval(event),
            Cond::Group(group) => group.eval(event),
            Cond::Exists(check) => Ok(event.contains(&check.name)),
            Cond::Class(check) => Ok(check.eval(event)),
        }
    }
}

/// Immutable event filter: a condition tree with an evaluation entry point
/// that never fails.
#[derive(Debug, Clone)]
pub struct Filter {
    root: Cond,
}

impl Filter {
    /// Wrap a condition tree.
    pub fn new(root: Cond) -> Self {
        Self { root }
    }

    /// Evaluate against an event. Any abort anywhere in the tree degrades to
    /// `false` — a filter can never break event dispatch.
    pub fn matches(&self, event: &Event) -> bool {
        self.root.eval(event).unwrap_or(false)
    }
}

/// Error produced when filter text cannot be parsed.
///
/// `pos` is the byte offset of the offending token, suitable for rendering a
/// caret under the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFilterError {
    /// What went wrong.
    pub message: String,
    /// Byte offset of the failure in the input.
    pub pos: usize,
}

impl ParseFilterError {
    fn new(message: impl Into<String>, pos: usize) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

impl fmt::Display for ParseFilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.pos)
    }
}

impl std::error::Error for ParseFilterError {}

/// Parse the textual filter language into a [`Filter`].
///
/// Grammar: whitespace-separated tokens; `"…"`/`'…'` quote values containing
/// spaces; `(…)` groups sub-expressions; `and`/`or` combine conditions
/// strictly left-to-right; `exists event.X` tests presence;
/// `event == Name` (or `=`) tests the event name; otherwise
/// `event.X <op> value` with `<op>` one of `==` `=` `!=` `>` `>=` `<` `<=`.
/// Ordering operators require an integer value, rejected at parse time
/// otherwise. Fields are non-strict: a missing field fails its own condition
/// only.
pub fn parse_filter(input: &str) -> Result<Filter, ParseFilterError> {
    parse_expression(input, 0).map(Filter::new)
}

struct Tok {
    text: String,
    quoted: bool,
    start: usize,
}

fn left_strip(s: &str, pos: usize) -> (&str, usize) {
    let trimmed = s.trim_start();
    (trimmed, pos + (s.len() - trimmed.len()))
}

/// Take one whitespace-delimited (or quoted) token, returning it with the
/// stripped remainder and the advanced byte position.
fn next_token(s: &str, pos: usize) -> Result<(Tok, &str, usize), ParseFilterError> {
    let (tok, rest, new_pos);
    let first = s.chars().next().unwrap_or(' ');
    if first == '"' || first == '\'' {
        let Some(close) = s[1..].find(first) else {
            return Err(ParseFilterError::new("unclosed quotation", pos));
        };
        tok = Tok {
            text: s[1..1 + close].to_string(),
            quoted: true,
            start: pos,
        };
        rest = &s[close + 2..];
        new_pos = pos + close + 2;
    } else {
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        tok = Tok {
            text: s[..end].to_string(),
            quoted: false,
            start: pos,
        };
        rest = &s[end..];
        new_pos = pos + end;
    }
    let (rest, new_pos) = left_strip(rest, new_pos);
    Ok((tok, rest, new_pos))
}

/// Take a parenthesized group, scanning to the balancing close paren.
/// Parens inside quoted tokens do not count.
fn take_group(s: &str, pos: usize) -> Result<(&str, usize, &str, usize), ParseFilterError> {
    let mut depth = 0usize;
    let mut in_quote: Option<char> = None;
    for (idx, ch) in s.char_indices() {
        match in_quote {
            Some(quote) => {
                if ch == quote {
                    in_quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => in_quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = &s[1..idx];
                        let rest = &s[idx + 1..];
                        return Ok((inner, pos + 1, rest, pos + idx + 1));
                    }
                }
                _ => {}
            },
        }
    }
    Err(ParseFilterError::new("unclosed group", pos))
}

fn field_name(tok: &Tok) -> Result<String, ParseFilterError> {
    // get(..6) instead of [..6]: a multibyte char straddling byte 6 must
    // produce a parse error, not a slice panic.
    if !tok.quoted
        && tok.text.len() > 6
        && tok.text.get(..6).is_some_and(|prefix| prefix.eq_ignore_ascii_case("event."))
    {
        return Ok(tok.text[6..].to_lowercase());
    }
    Err(ParseFilterError::new(
        "expected a field reference of the form event.<field>",
        tok.start,
    ))
}

fn parse_expression(s: &str, base: usize) -> Result<Cond, ParseFilterError> {
    let (mut rest, mut pos) = left_strip(s, base);
    if rest.is_empty() {
        return Err(ParseFilterError::new("empty filter expression", pos));
    }

    let mut acc: Option<Cond> = None;
    while !rest.is_empty() {
        let op = match acc {
            None => None,
            Some(_) => {
                let (tok, r, p) = next_token(rest, pos)?;
                let op = match tok.text.to_lowercase().as_str() {
                    "and" if !tok.quoted => BoolOp::And,
                    "or" if !tok.quoted => BoolOp::Or,
                    _ => {
                        return Err(ParseFilterError::new(
                            "expected 'and' or 'or'",
                            tok.start,
                        ))
                    }
                };
                rest = r;
                pos = p;
                if rest.is_empty() {
                    return Err(ParseFilterError::new("unexpected end of expression", pos));
                }
                Some(op)
            }
        };

        let cond = if rest.starts_with('(') {
            let (inner, inner_pos, r, p) = take_group(rest, pos)?;
            rest = r;
            pos = p;
            parse_expression(inner, inner_pos)?
        } else {
            let (c, r, p) = parse_term(rest, pos)?;
            rest = r;
            pos = p;
            c
        };

        acc = Some(match (acc, op) {
            (None, _) => cond,
            (Some(left), Some(BoolOp::And)) => left.and(cond),
            (Some(left), _) => left.or(cond),
        });

        let (r, p) = left_strip(rest, pos);
        rest = r;
        pos = p;
    }

    match acc {
        Some(cond) => Ok(cond),
        None => Err(ParseFilterError::new("empty filter expression", base)),
    }
}

fn parse_term(s: &str, pos: usize) -> Result<(Cond, &str, usize), ParseFilterError> {
    let (tok, rest, pos) = next_token(s, pos)?;

    if !tok.quoted && tok.text.eq_ignore_ascii_case("exists") {
        if rest.is_empty() {
            return Err(ParseFilterError::new("expected field after 'exists'", pos));
        }
        let (field_tok, rest, pos) = next_token(rest, pos)?;
        let name = field_name(&field_tok)?;
        return Ok((exists(name), rest, pos));
    }

    if !tok.quoted && tok.text.eq_ignore_ascii_case("event") {
        if rest.is_empty() {
            return Err(ParseFilterError::new(
                "expected comparison operator after 'event'",
                pos,
            ));
        }
        let (op_tok, rest, pos) = next_token(rest, pos)?;
        if op_tok.quoted || (op_tok.text != "==" && op_tok.text != "=") {
            return Err(ParseFilterError::new(
                "event name check supports only '==' or '='",
                op_tok.start,
            ));
        }
        if rest.is_empty() {
            return Err(ParseFilterError::new("expected event name", pos));
        }
        let (name_tok, rest, pos) = next_token(rest, pos)?;
        return Ok((event_is(name_tok.text), rest, pos));
    }

    let name = field_name(&tok)?;
    if rest.is_empty() {
        return Err(ParseFilterError::new("expected comparison operator", pos));
    }
    let (op_tok, rest, pos) = next_token(rest, pos)?;
    if rest.is_empty() {
        return Err(ParseFilterError::new("expected comparison value", pos));
    }
    let (value_tok, rest, pos) = next_token(rest, pos)?;

    let cond = match op_tok.text.as_str() {
        "==" | "=" if !op_tok.quoted => field(&name).eq(value_tok.text),
        "!=" if !op_tok.quoted => field(&name).ne(value_tok.text),
        ">" | ">=" | "<" | "<=" if !op_tok.quoted => {
            let Ok(operand) = value_tok.text.parse::<i64>() else {
                return Err(ParseFilterError::new(
                    "ordering comparison requires an integer value",
                    value_tok.start,
                ));
            };
            let lhs = field(&name).to_int();
            match op_tok.text.as_str() {
                ">" => lhs.gt(operand),
                ">=" => lhs.ge(operand),
                "<" => lhs.lt(operand),
                _ => lhs.le(operand),
            }
        }
        _ => {
            return Err(ParseFilterError::new(
                "unknown comparison operator",
                op_tok.start,
            ))
        }
    };
    Ok((cond, rest, pos))
}
