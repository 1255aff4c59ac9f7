//! Substitution engine.
//!
//! Two passes happen to custom-command bodies:
//!
//! 1. [`bind_arguments`] once per invocation, replacing argument references:
//!
//! | Sequence | Meaning |
//! |----------|---------|
//! | `$#` | number of arguments (after defaults) |
//! | `$*` | all arguments, comma-separated |
//! | `$"*"` | all arguments, each double-quoted |
//! | `$0` | command name |
//! | `$N`, `${N}` | N-th argument |
//! | `${N=default}` | N-th argument, or `default` when missing |
//! | `${a-b}` | arguments `a` to `b`, comma-separated |
//! | `$=name` | define `name0` … `nameN` |
//!
//! 2. [`expand`] on every item right before it runs:
//!
//! | Sequence | Meaning |
//! |----------|---------|
//! | `$?` | rendered call stack |
//! | `$!` | number of images |
//! | `$^` | verbosity level |
//! | `$\|` | elapsed seconds |
//! | `$/` | custom-command path |
//! | `$>`, `$<` | loop index, iterations left |
//! | `$name`, `${name}` | variable, else index of image `name`, else environment |
//! | `${"script"}` | run `script`, substitute its status |
//! | `$$` | literal `$` |
//! | `{…}` | image feature, string codes, comparison or math expression |

use crate::error::InterpreterError;
use crate::image::Image;

use super::builtins::split_args;
use super::lexer::ESC_DOLLAR;
use super::value::{format_number, Value};

// ── ExpandContext ─────────────────────────────────────────────────────────────

/// What substitution needs from the interpreter.
pub trait ExpandContext {
    fn variable(&self, name: &str) -> Option<String>;

    fn image_count(&self) -> usize;

    fn image_names(&self) -> &[String];

    fn image(&self, index: usize) -> Result<&Image, InterpreterError>;

    fn verbosity(&self) -> i32;

    /// Seconds since the interpreter started.
    fn elapsed(&self) -> f64;

    /// `$?`
    fn call_stack(&self) -> String;

    /// `$/`
    fn call_path(&self) -> String;

    /// `($>, $<)` of the innermost loop.
    fn loop_indices(&self) -> Option<(u64, i64)>;

    /// Evaluate a math expression, optionally bound to an image.
    fn evaluate(&mut self, expr: &str, image: Option<usize>) -> Result<Value, InterpreterError>;

    /// Run `script` on the current images and return the resulting status.
    fn run_subscript(&mut self, script: &str) -> Result<String, InterpreterError>;
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn unbalanced(src: &str) -> InterpreterError {
    InterpreterError::syntax(format!("Unbalanced braces in '{src}'."))
}

/// Index of the `}` closing the `{` at `open`.
fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn read_ident(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len() && is_ident_continue(chars[end]) {
        end += 1;
    }
    end
}

/// Shortest text for a pixel value.
pub fn format_pixel(v: f32) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e7 {
        format!("{}", v as i64)
    } else if v.is_nan() {
        "nan".into()
    } else if v.is_infinite() {
        if v > 0.0 { "inf".into() } else { "-inf".into() }
    } else {
        format!("{v}")
    }
}

// ── Runtime expansion ─────────────────────────────────────────────────────────

/// Expand every substitution in `src`.  The result is never re-scanned.
pub fn expand(src: &str, ctx: &mut dyn ExpandContext) -> Result<String, InterpreterError> {
    if !src.contains(['$', '{', '}']) {
        return Ok(src.to_owned());
    }
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '$' => i = expand_dollar(&chars, i, ctx, &mut out, src)?,
            '{' => {
                let close = matching_brace(&chars, i).ok_or_else(|| unbalanced(src))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = expand(&inner, ctx)?;
                out.push_str(&evaluate_brace(&inner, ctx)?);
                i = close + 1;
            }
            '}' => return Err(unbalanced(src)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Handle the `$` at `i`; returns the position after the sequence.
fn expand_dollar(
    chars: &[char],
    i: usize,
    ctx: &mut dyn ExpandContext,
    out: &mut String,
    src: &str,
) -> Result<usize, InterpreterError> {
    let Some(&next) = chars.get(i + 1) else {
        out.push('$');
        return Ok(i + 1);
    };
    let simple = match next {
        '?' => Some(ctx.call_stack()),
        '!' => Some(ctx.image_count().to_string()),
        '^' => Some(ctx.verbosity().to_string()),
        '|' => Some(format_number((ctx.elapsed() * 1000.0).round() / 1000.0)),
        '/' => Some(ctx.call_path()),
        '$' => Some(ESC_DOLLAR.to_string()),
        '>' | '<' => {
            let (index, left) = ctx.loop_indices().ok_or_else(|| {
                InterpreterError::undefined(format!("Loop index '${next}' used outside of a loop."))
            })?;
            Some(if next == '>' { index.to_string() } else { left.to_string() })
        }
        _ => None,
    };
    if let Some(text) = simple {
        out.push_str(&text);
        return Ok(i + 2);
    }

    if next == '{' {
        let close = matching_brace(chars, i + 1).ok_or_else(|| unbalanced(src))?;
        let raw: String = chars[i + 2..close].iter().collect();
        let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            ctx.run_subscript(&raw[1..raw.len() - 1])?
        } else {
            let name = expand(&raw, ctx)?;
            lookup_name(name.trim(), ctx)
        };
        out.push_str(&value);
        return Ok(close + 1);
    }

    if is_ident_start(next) {
        let end = read_ident(chars, i + 1);
        let name: String = chars[i + 1..end].iter().collect();
        out.push_str(&lookup_name(&name, ctx));
        return Ok(end);
    }

    out.push('$');
    Ok(i + 1)
}

/// Variable, then index of the last image with that name, then environment.
fn lookup_name(name: &str, ctx: &dyn ExpandContext) -> String {
    if let Some(v) = ctx.variable(name) {
        return v;
    }
    if let Some(i) = ctx.image_names().iter().rposition(|n| n == name) {
        return i.to_string();
    }
    std::env::var(name).unwrap_or_default()
}

// ── `{…}` ────────────────────────────────────────────────────────────────────

fn char_codes(text: &str) -> String {
    text.chars().map(|c| (c as u32).to_string()).collect::<Vec<_>>().join(",")
}

fn codes_to_text(codes: &str) -> Result<String, InterpreterError> {
    codes
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| InterpreterError::argument(format!("Invalid character code '{s}'.")))
        })
        .collect()
}

fn string_comparison(s: &str) -> Option<bool> {
    let body = s.strip_prefix('\'')?.strip_suffix('\'')?;
    for (op, eq) in [("'=='", true), ("'!='", false)] {
        if let Some((a, b)) = body.split_once(op) {
            return Some((a == b) == eq);
        }
    }
    None
}

/// Values `a..=b` of `img` (`[a-b]` or `[a]`).
fn value_subset(img: &Image, spec: &str) -> Result<String, InterpreterError> {
    let bad = || InterpreterError::argument(format!("Invalid value subset '[{spec}]'."));
    let len = img.len() as i64;
    let index = |t: &str| -> Result<usize, InterpreterError> {
        let v: i64 = t.trim().parse().map_err(|_| bad())?;
        let v = if v < 0 { v + len } else { v };
        if v < 0 || v >= len {
            return Err(bad());
        }
        Ok(v as usize)
    };
    let (a, b) = match spec.get(1..).and_then(|rest| rest.find('-').map(|k| k + 1)) {
        Some(k) => (index(&spec[..k])?, index(&spec[k + 1..])?),
        None => {
            let a = index(spec)?;
            (a, a)
        }
    };
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    Ok(img.data()[a..=b].iter().map(|v| format_pixel(*v)).collect::<Vec<_>>().join(","))
}

/// Feature `f` of image `index`, or `None` if `f` is not a feature name.
fn image_feature(
    ctx: &dyn ExpandContext,
    index: usize,
    feature: &str,
) -> Result<Option<String>, InterpreterError> {
    let f = feature.trim();
    if f == "n" {
        return Ok(Some(ctx.image_names().get(index).cloned().unwrap_or_default()));
    }
    let is_feature = matches!(f, "w" | "h" | "d" | "s" | "wh" | "whd" | "whds" | "t" | "^")
        || (f.starts_with('[') && f.ends_with(']'));
    if !is_feature {
        return Ok(None);
    }
    let img = ctx.image(index)?;
    let (w, h, d, s) = (img.width(), img.height(), img.depth(), img.spectrum());
    Ok(Some(match f {
        "w" => w.to_string(),
        "h" => h.to_string(),
        "d" => d.to_string(),
        "s" => s.to_string(),
        "wh" => (w * h).to_string(),
        "whd" => (w * h * d).to_string(),
        "whds" => (w * h * d * s).to_string(),
        "t" => img
            .data()
            .iter()
            .filter_map(|v| char::from_u32(*v as u32))
            .collect(),
        "^" => img.data().iter().map(|v| format_pixel(*v)).collect::<Vec<_>>().join(","),
        subset => value_subset(img, &subset[1..subset.len() - 1])?,
    }))
}

/// Image designated by the head of `{head,feature}`: an index or a name.
fn image_ref(ctx: &dyn ExpandContext, head: &str) -> Result<Option<usize>, InterpreterError> {
    let head = head.trim();
    let n = ctx.image_count() as i64;
    if let Ok(v) = head.parse::<i64>() {
        let idx = if v < 0 { v + n } else { v };
        if idx < 0 || idx >= n {
            return Err(InterpreterError::syntax(format!(
                "Invalid image index '{v}' in substitution (list has {n} images)."
            )));
        }
        return Ok(Some(idx as usize));
    }
    if head.chars().next().is_some_and(is_ident_start) && head.chars().all(is_ident_continue) {
        return Ok(ctx.image_names().iter().rposition(|nm| nm == head));
    }
    Ok(None)
}

/// Resolve the (already expanded) content of `{…}`.
fn evaluate_brace(s: &str, ctx: &mut dyn ExpandContext) -> Result<String, InterpreterError> {
    let t = s.trim();

    if t.len() >= 2 && t.starts_with('\'') && t.ends_with('\'') && !t[1..t.len() - 1].contains('\'') {
        return Ok(char_codes(&t[1..t.len() - 1]));
    }
    if t.len() >= 2 && t.starts_with('`') && t.ends_with('`') {
        return codes_to_text(&t[1..t.len() - 1]);
    }
    if let Some(eq) = string_comparison(t) {
        return Ok(if eq { "1" } else { "0" }.to_owned());
    }

    let parts = split_args(t);
    if parts.len() == 2 {
        if let Some(index) = image_ref(ctx, &parts[0])? {
            if let Some(v) = image_feature(ctx, index, &parts[1])? {
                return Ok(v);
            }
            return Ok(ctx.evaluate(&parts[1], Some(index))?.to_string());
        }
    }
    if t == "^" || (t.starts_with('[') && t.ends_with(']') && !t.contains(',')) {
        let last = ctx.image_count().checked_sub(1).ok_or_else(|| {
            InterpreterError::undefined(format!("No image to read '{{{t}}}' from."))
        })?;
        if let Some(v) = image_feature(ctx, last, t)? {
            return Ok(v);
        }
    }

    let last = ctx.image_count().checked_sub(1);
    Ok(ctx.evaluate(t, last)?.to_string())
}

// ── Argument binding ──────────────────────────────────────────────────────────

/// Escape spaces outside quotes so an inserted argument stays one item.
fn protect(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut in_quotes = false;
    for c in arg.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                out.push(c);
            }
            ' ' if !in_quotes => out.push_str("\\ "),
            c => out.push(c),
        }
    }
    out
}

/// Apply every `${N=default}` found in `body` to `args`.
fn apply_defaults(body: &[char], args: &mut Vec<String>) {
    let mut i = 0;
    while i + 1 < body.len() {
        if body[i] == '$' && body[i + 1] == '{' {
            if let Some(close) = matching_brace(body, i + 1) {
                let inner: String = body[i + 2..close].iter().collect();
                if let Some((n, default)) = inner.split_once('=') {
                    if let Ok(n) = n.trim().parse::<usize>() {
                        if n >= 1 {
                            if args.len() < n {
                                args.resize(n, String::new());
                            }
                            if args[n - 1].is_empty() {
                                args[n - 1] = default.to_owned();
                            }
                        }
                    }
                }
                i = close + 1;
                continue;
            }
        }
        i += 1;
    }
}

/// Resolve a signed 1-based argument index.
fn arg_index(t: &str, count: usize) -> Option<usize> {
    let v: i64 = t.trim().parse().ok()?;
    let v = if v < 0 { v + count as i64 + 1 } else { v };
    (v >= 1 && v <= count as i64).then_some(v as usize)
}

/// Result of binding a body to its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub body: String,
    /// Variables requested with `$=name`.
    pub variables: Vec<(String, String)>,
}

/// Substitute argument references in a custom-command body.
pub fn bind_arguments(body: &str, args: &[String], name: &str) -> Result<Bound, InterpreterError> {
    let chars: Vec<char> = body.chars().collect();
    let mut args = args.to_vec();
    apply_defaults(&chars, &mut args);
    let count = args.len();
    let arg = |k: usize| protect(args.get(k.wrapping_sub(1)).map_or("", String::as_str));

    let mut out = String::with_capacity(body.len());
    let mut variables = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' || i + 1 >= chars.len() {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let next = chars[i + 1];
        match next {
            '#' => {
                out.push_str(&count.to_string());
                i += 2;
            }
            '*' => {
                out.push_str(&(1..=count).map(arg).collect::<Vec<_>>().join(","));
                i += 2;
            }
            '"' if chars.get(i + 2) == Some(&'*') && chars.get(i + 3) == Some(&'"') => {
                let quoted: Vec<String> = args.iter().map(|a| format!("\"{a}\"")).collect();
                out.push_str(&quoted.join(","));
                i += 4;
            }
            '0' => {
                out.push_str(name);
                i += 2;
            }
            '1'..='9' => {
                let mut end = i + 1;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                let n: usize = chars[i + 1..end].iter().collect::<String>().parse().unwrap_or(0);
                out.push_str(&arg(n));
                i = end;
            }
            '=' if chars.get(i + 2).is_some_and(|c| is_ident_start(*c)) => {
                let end = read_ident(&chars, i + 2);
                let var: String = chars[i + 2..end].iter().collect();
                variables.push((format!("{var}0"), name.to_owned()));
                for (k, a) in args.iter().enumerate() {
                    variables.push((format!("{var}{}", k + 1), a.clone()));
                }
                i = end;
            }
            '{' => {
                let close = matching_brace(&chars, i + 1).ok_or_else(|| unbalanced(body))?;
                let inner: String = chars[i + 2..close].iter().collect();
                match bind_brace(&inner, &args, count) {
                    Some(text) => out.push_str(&text),
                    None => out.extend(&chars[i..=close]),
                }
                i = close + 1;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }
    Ok(Bound { body: out, variables })
}

/// `${N}`, `${N=default}` or `${a-b}`; `None` leaves the sequence for
/// runtime expansion.
fn bind_brace(inner: &str, args: &[String], count: usize) -> Option<String> {
    let t = inner.trim();
    let head = t.split_once('=').map_or(t, |(n, _)| n);
    if let Ok(n) = head.trim().parse::<usize>() {
        return Some(protect(args.get(n.wrapping_sub(1)).map_or("", String::as_str)));
    }
    let dash = t.get(1..).and_then(|rest| rest.find('-')).map(|k| k + 1)?;
    let a = arg_index(&t[..dash], count)?;
    let b = arg_index(&t[dash + 1..], count)?;
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    Some(args[a - 1..b].iter().map(|s| protect(s)).collect::<Vec<_>>().join(","))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
