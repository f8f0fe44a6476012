//! Literal rendering for the agent's scripting syntax.
//!
//! The agent evaluates statements with a Python interpreter, so every
//! parameter embedded in a statement must be a valid Python literal that
//! evaluates back to the value passed in.

use opennet_core::error::{NetError, Result};

/// A literal value embedded in a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Float(f64),
    Int(i64),
    Uint(u64),
    Bool(bool),
}

impl Literal {
    pub fn render(&self) -> Result<String> {
        match self {
            Literal::Str(s) => Ok(quote_string(s)),
            Literal::Float(v) => format_float(*v),
            Literal::Int(v) => Ok(v.to_string()),
            Literal::Uint(v) => Ok(v.to_string()),
            Literal::Bool(true) => Ok("True".to_string()),
            Literal::Bool(false) => Ok("False".to_string()),
        }
    }
}

/// Render a float so the interpreter reads it back as the same value.
///
/// Rust's `Display` for `f64` already prints the shortest representation
/// that round-trips and never uses an exponent; the only adjustment needed
/// is a trailing `.0` on integral values so the literal stays a float.
pub fn format_float(value: f64) -> Result<String> {
    if !value.is_finite() {
        return Err(NetError::InvalidParameter(format!(
            "{} has no float literal form",
            value
        )));
    }
    let mut s = value.to_string();
    if !s.contains('.') {
        s.push_str(".0");
    }
    Ok(s)
}

/// Double-quoted string literal with backslash escapes.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\x7f' => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Parse a float literal using the interpreter's numeric grammar.
///
/// Accepts an optional leading minus, `pointfloat` and `exponentfloat`
/// forms, and digit-group underscores. Rejects everything the grammar
/// rejects, including `inf`/`nan` spellings that `f64::from_str` would
/// otherwise accept.
pub fn parse_float_literal(s: &str) -> Option<f64> {
    let body = s.strip_prefix('-').unwrap_or(s);
    let bytes = body.as_bytes();
    let mut i = 0;

    let int_digits = digit_part(bytes, &mut i)?;
    let mut frac_digits = 0;
    let mut has_point = false;
    if bytes.get(i) == Some(&b'.') {
        has_point = true;
        i += 1;
        frac_digits = digit_part(bytes, &mut i)?;
    }
    if int_digits == 0 && frac_digits == 0 {
        return None;
    }

    let mut has_exponent = false;
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        has_exponent = true;
        i += 1;
        if matches!(bytes.get(i), Some(b'+') | Some(b'-')) {
            i += 1;
        }
        if digit_part(bytes, &mut i)? == 0 {
            return None;
        }
    }

    if i != bytes.len() || !(has_point || has_exponent) {
        return None;
    }

    s.replace('_', "").parse().ok()
}

/// Consume `digit (["_"] digit)*`, returning the digit count. A stray
/// underscore (leading, trailing or doubled) is a syntax error.
fn digit_part(bytes: &[u8], i: &mut usize) -> Option<usize> {
    let mut count = 0;
    while let Some(&b) = bytes.get(*i) {
        if b.is_ascii_digit() {
            count += 1;
            *i += 1;
        } else if b == b'_' {
            let next_is_digit = bytes.get(*i + 1).is_some_and(|n| n.is_ascii_digit());
            if count == 0 || !next_is_digit {
                return None;
            }
            *i += 1;
        } else {
            break;
        }
    }
    Some(count)
}
