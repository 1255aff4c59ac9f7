//! Numeric values.
//!
//! Scripts are untyped: every argument and variable is a string.  Numbers
//! only exist transiently, while an expression is evaluated or a compound
//! assignment (`+=`, `<<=`, …) is applied, and are formatted back to text
//! with [`format_number`].

use std::fmt;

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Scalar(0.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(x) => f.write_str(&format_number(*x)),
            Value::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|x| format_number(*x)).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

impl Value {
    /// Truthiness: a scalar is true when non-zero, a vector when non-empty.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Scalar(x) => *x != 0.0,
            Value::Vector(v) => !v.is_empty(),
        }
    }

    /// First component (0 for an empty vector).
    pub fn as_scalar(&self) -> f64 {
        match self {
            Value::Scalar(x) => *x,
            Value::Vector(v) => v.first().copied().unwrap_or(0.0),
        }
    }

    /// Apply `f` componentwise, broadcasting scalars against vectors.
    pub fn zip_with(&self, rhs: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, String> {
        match (self, rhs) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(*a, *b))),
            (Value::Vector(a), Value::Scalar(b)) => {
                Ok(Value::Vector(a.iter().map(|x| f(*x, *b)).collect()))
            }
            (Value::Scalar(a), Value::Vector(b)) => {
                Ok(Value::Vector(b.iter().map(|x| f(*a, *x)).collect()))
            }
            (Value::Vector(a), Value::Vector(b)) => {
                if a.len() != b.len() {
                    return Err(format!(
                        "vector size mismatch ({} vs {})",
                        a.len(),
                        b.len()
                    ));
                }
                Ok(Value::Vector(a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect()))
            }
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Scalar(x) => Value::Scalar(f(*x)),
            Value::Vector(v) => Value::Vector(v.iter().map(|x| f(*x)).collect()),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(if b { 1.0 } else { 0.0 })
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

// ── Number text conversions ───────────────────────────────────────────────────

/// Format a number the way substitutions and variables show it: integral
/// values without a fractional part, everything else in shortest
/// round-trip form.
pub fn format_number(x: f64) -> String {
    if x.is_nan() {
        "nan".to_owned()
    } else if x.is_infinite() {
        if x > 0.0 { "inf".to_owned() } else { "-inf".to_owned() }
    } else if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

/// Parse a number, accepting surrounding whitespace, `inf` and `nan`.
pub fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    match t {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ if t.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '+' | '-' | '.')) => {
            t.parse().ok()
        }
        _ => None,
    }
}

// ── Compound arithmetic ───────────────────────────────────────────────────────

/// Operator of a compound assignment (`name<op>=value`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    BitAnd,
    BitOr,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn from_symbol(s: &str) -> Option<Self> {
        Some(match s {
            "+" => ArithOp::Add,
            "-" => ArithOp::Sub,
            "*" => ArithOp::Mul,
            "/" => ArithOp::Div,
            "%" => ArithOp::Rem,
            "^" => ArithOp::Pow,
            "&" => ArithOp::BitAnd,
            "|" => ArithOp::BitOr,
            "<<" => ArithOp::Shl,
            ">>" => ArithOp::Shr,
            _ => return None,
        })
    }

    /// `%` is the floored remainder; bitwise operators and shifts work on
    /// the operands truncated to `i64`.
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Rem => floored_rem(a, b),
            ArithOp::Pow => a.powf(b),
            ArithOp::BitAnd => ((a as i64) & (b as i64)) as f64,
            ArithOp::BitOr => ((a as i64) | (b as i64)) as f64,
            ArithOp::Shl => shift(a, b, i64::checked_shl),
            ArithOp::Shr => shift(a, b, i64::checked_shr),
        }
    }
}

pub fn floored_rem(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return f64::NAN;
    }
    a - b * (a / b).floor()
}

fn shift(a: f64, b: f64, op: fn(i64, u32) -> Option<i64>) -> f64 {
    if b < 0.0 {
        return 0.0;
    }
    op(a as i64, b as u32).unwrap_or(0) as f64
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_integral() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-7.0), "-7");
        assert_eq!(format_number(-0.0), "0");
    }

    #[test]
    fn format_fractional() {
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(3.14), "3.14");
    }

    #[test]
    fn format_special() {
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_number(f64::NAN), "nan");
    }

    #[test]
    fn parse() {
        assert_eq!(parse_number(" 42 "), Some(42.0));
        assert_eq!(parse_number("-1.5e1"), Some(-15.0));
        assert_eq!(parse_number("inf"), Some(f64::INFINITY));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn floored_remainder() {
        assert_eq!(ArithOp::Rem.apply(7.0, 3.0), 1.0);
        assert_eq!(ArithOp::Rem.apply(-7.0, 3.0), 2.0);
        assert_eq!(ArithOp::Rem.apply(7.0, -3.0), -2.0);
        assert!(ArithOp::Rem.apply(1.0, 0.0).is_nan());
    }

    #[test]
    fn bitwise_and_shifts() {
        assert_eq!(ArithOp::BitAnd.apply(6.0, 3.0), 2.0);
        assert_eq!(ArithOp::BitOr.apply(4.0, 1.0), 5.0);
        assert_eq!(ArithOp::Shl.apply(1.0, 4.0), 16.0);
        assert_eq!(ArithOp::Shr.apply(16.0, 2.0), 4.0);
        assert_eq!(ArithOp::Shl.apply(1.0, -1.0), 0.0);
    }

    #[test]
    fn power() {
        assert_eq!(ArithOp::Pow.apply(2.0, 10.0), 1024.0);
    }

    #[test]
    fn vector_display_and_broadcast() {
        let v = Value::Vector(vec![1.0, 2.5]);
        assert_eq!(v.to_string(), "1,2.5");
        let sum = v.zip_with(&Value::Scalar(1.0), |a, b| a + b).unwrap();
        assert_eq!(sum, Value::Vector(vec![2.0, 3.5]));
        assert!(v.zip_with(&Value::Vector(vec![1.0]), |a, b| a + b).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(Value::Scalar(2.0).as_bool());
        assert!(!Value::Scalar(0.0).as_bool());
        assert!(!Value::Vector(vec![]).as_bool());
    }
}
