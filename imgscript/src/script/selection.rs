//! Image selections.
//!
//! A selection is written in brackets after a command name (`add[0,2-4]`)
//! or as trailing dots (`add.` is `add[-1]`).  Syntax inside the brackets:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `^` | every image |
//! | `3`, `-1` | one index; negative counts from the end |
//! | `a-b`, `a-b:s` | inclusive range, optional step |
//! | `50%`, `0%-50%` | position relative to the list length |
//! | `name` | every image with that name |
//! | `a,b,…` | union, sorted, duplicates kept |
//! | `^a,b` | complement of `a,b` |

use crate::error::InterpreterError;

/// One comma-separated term of a selection.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionTerm {
    Index(i64),
    Percent(f64),
    Range {
        from: Box<SelectionTerm>,
        to: Box<SelectionTerm>,
        step: usize,
    },
    Label(String),
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(spec: &str) -> InterpreterError {
    InterpreterError::syntax(format!("Invalid selection '[{spec}]'."))
}

fn parse_bound(s: &str, spec: &str) -> Result<SelectionTerm, InterpreterError> {
    let s = s.trim();
    if let Some(p) = s.strip_suffix('%') {
        return p.parse().map(SelectionTerm::Percent).map_err(|_| invalid(spec));
    }
    s.parse().map(SelectionTerm::Index).map_err(|_| invalid(spec))
}

/// Parse one term.
pub fn parse_term(term: &str, spec: &str) -> Result<SelectionTerm, InterpreterError> {
    let term = term.trim();
    if term.is_empty() {
        return Err(invalid(spec));
    }
    if is_identifier(term) {
        return Ok(SelectionTerm::Label(term.to_owned()));
    }
    let (body, step) = match term.split_once(':') {
        Some((b, s)) => {
            let step: usize = s.trim().parse().map_err(|_| invalid(spec))?;
            if step == 0 {
                return Err(InterpreterError::syntax(format!(
                    "Invalid selection '[{spec}]' (step must be positive)."
                )));
            }
            (b, Some(step))
        }
        None => (term, None),
    };
    // The range dash is the first '-' that follows a digit or '%'.
    let bytes = body.as_bytes();
    let dash = (1..bytes.len())
        .find(|&i| bytes[i] == b'-' && (bytes[i - 1].is_ascii_digit() || bytes[i - 1] == b'%'));
    match dash {
        Some(i) => Ok(SelectionTerm::Range {
            from: Box::new(parse_bound(&body[..i], spec)?),
            to: Box::new(parse_bound(&body[i + 1..], spec)?),
            step: step.unwrap_or(1),
        }),
        None if step.is_some() => Err(invalid(spec)),
        None => parse_bound(body, spec),
    }
}

fn out_of_range(value: &str, n: usize) -> InterpreterError {
    if n == 0 {
        InterpreterError::syntax(format!(
            "Invalid selection: index '{value}' is out of range (image list is empty)."
        ))
    } else {
        InterpreterError::syntax(format!(
            "Invalid selection: index '{value}' is out of range [-{n}..{}].",
            n - 1
        ))
    }
}

fn bound_index(term: &SelectionTerm, n: usize) -> Result<usize, InterpreterError> {
    match term {
        SelectionTerm::Index(v) => {
            let idx = if *v < 0 { *v + n as i64 } else { *v };
            if idx < 0 || idx >= n as i64 {
                return Err(out_of_range(&v.to_string(), n));
            }
            Ok(idx as usize)
        }
        SelectionTerm::Percent(p) => {
            let shown = format!("{p}%");
            if n == 0 || !(-100.0..=100.0).contains(p) {
                return Err(out_of_range(&shown, n));
            }
            let p = if *p < 0.0 { 100.0 + p } else { *p };
            Ok((p * (n - 1) as f64 / 100.0).round() as usize)
        }
        _ => Err(InterpreterError::syntax("Invalid selection bound.")),
    }
}

fn resolve_term(
    term: &SelectionTerm,
    n: usize,
    names: &[String],
    allow_undefined: bool,
    out: &mut Vec<usize>,
) -> Result<(), InterpreterError> {
    match term {
        SelectionTerm::Label(label) => {
            let before = out.len();
            out.extend(names.iter().enumerate().filter(|(_, nm)| *nm == label).map(|(i, _)| i));
            if out.len() == before && !allow_undefined {
                return Err(InterpreterError::undefined(format!(
                    "Invalid selection: undefined label '{label}'."
                )));
            }
        }
        SelectionTerm::Range { from, to, step } => {
            let a = bound_index(from, n)?;
            let b = bound_index(to, n)?;
            let (a, b) = if a <= b { (a, b) } else { (b, a) };
            out.extend((a..=b).step_by(*step));
        }
        single => out.push(bound_index(single, n)?),
    }
    Ok(())
}

/// Resolve selection text against a list of `n` images with `names`.
pub fn resolve(
    spec: &str,
    n: usize,
    names: &[String],
    allow_undefined: bool,
) -> Result<Vec<usize>, InterpreterError> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed == "^" {
        return Ok((0..n).collect());
    }
    let (invert, body) = match trimmed.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let mut out = Vec::new();
    for part in body.split(',') {
        let term = parse_term(part, spec)?;
        resolve_term(&term, n, names, allow_undefined, &mut out)?;
    }
    out.sort_unstable();
    if invert {
        out.dedup();
        return Ok((0..n).filter(|i| out.binary_search(i).is_err()).collect());
    }
    Ok(out)
}

// ── Command items ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    None,
    /// `-name`
    Minus,
    /// `+name`: run on copies, append the results.
    Plus,
}

/// An item that has the shape of a command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandItem {
    pub prefix: Prefix,
    pub name: String,
    /// Raw selection text, `None` when no selection was written.
    pub selection: Option<String>,
}

/// Split `[-+]name[selection]` or `[-+]name...`.  Returns `None` for items
/// that are not command-shaped.
pub fn parse_command_item(text: &str) -> Option<CommandItem> {
    let (prefix, rest) = match text.as_bytes().first()? {
        b'-' => (Prefix::Minus, &text[1..]),
        b'+' => (Prefix::Plus, &text[1..]),
        _ => (Prefix::None, text),
    };
    let name_len = rest
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(rest.len(), |(i, _)| i);
    let (name, tail) = rest.split_at(name_len);
    if !is_identifier(name) {
        return None;
    }
    let selection = match tail {
        "" => None,
        "." => Some("-1".to_owned()),
        ".." => Some("-2".to_owned()),
        "..." => Some("-3".to_owned()),
        t if t.starts_with('[') && t.ends_with(']') => Some(t[1..t.len() - 1].to_owned()),
        _ => return None,
    };
    Some(CommandItem { prefix, name: name.to_owned(), selection })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
