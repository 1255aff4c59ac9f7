//! Built-in command table.
//!
//! Every built-in name maps to a [`Builtin`]: a control-flow [`Keyword`], a
//! [`CoreCmd`] the interpreter executes itself, or an operation delegated to
//! the [`ImageLibrary`](crate::image::ImageLibrary) together with the shape
//! of the argument it accepts.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::InterpreterError;
use crate::image::OpArg;

use super::lexer::literal;
use super::value::parse_number;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    If,
    Elif,
    Else,
    Endif,
    Repeat,
    Done,
    Do,
    While,
    Local,
    Onfail,
    Endlocal,
    Break,
    Continue,
    Return,
    Quit,
}

impl Keyword {
    /// Keywords followed by an argument item.
    pub fn takes_argument(self) -> bool {
        matches!(self, Keyword::If | Keyword::Elif | Keyword::Repeat | Keyword::While)
    }

    pub fn name(self) -> &'static str {
        match self {
            Keyword::If => "if",
            Keyword::Elif => "elif",
            Keyword::Else => "else",
            Keyword::Endif => "endif",
            Keyword::Repeat => "repeat",
            Keyword::Done => "done",
            Keyword::Do => "do",
            Keyword::While => "while",
            Keyword::Local => "local",
            Keyword::Onfail => "onfail",
            Keyword::Endlocal => "endlocal",
            Keyword::Break => "break",
            Keyword::Continue => "continue",
            Keyword::Return => "return",
            Keyword::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreCmd {
    Echo,
    Warn,
    Error,
    Status,
    Verbose,
    Command,
    Uncommand,
    Input,
    Remove,
    Keep,
    Move,
    Name,
    Reverse,
    Check,
    Skip,
    Parallel,
    Wait,
}

impl CoreCmd {
    pub fn takes_argument(self) -> bool {
        !matches!(self, CoreCmd::Remove | CoreCmd::Keep | CoreCmd::Reverse | CoreCmd::Wait)
    }

    /// Selection used when none is written.
    pub fn selects_all_by_default(self) -> bool {
        !matches!(self, CoreCmd::Input | CoreCmd::Move)
    }
}

/// Shape of an operation argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Number,
    /// A number or an image reference `[i]`.
    NumberOrImage,
    /// Exactly `n` comma-separated numbers.
    Numbers(usize),
    /// A number, or else an expression passed as text.
    Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgForm {
    None,
    /// Consumed only when the next item parses as the kind and is not a
    /// command name.
    Optional(ArgKind),
    Required(ArgKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Keyword(Keyword),
    Core(CoreCmd),
    Operation(ArgForm),
}

fn table() -> &'static HashMap<&'static str, Builtin> {
    static TABLE: OnceLock<HashMap<&'static str, Builtin>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use ArgForm::*;
        use Builtin::{Core, Keyword as Kw, Operation as Op};
        use CoreCmd as C;
        use Keyword as K;

        let mut t = HashMap::new();
        for (name, kw) in [
            ("if", K::If),
            ("elif", K::Elif),
            ("else", K::Else),
            ("endif", K::Endif),
            ("fi", K::Endif),
            ("repeat", K::Repeat),
            ("done", K::Done),
            ("do", K::Do),
            ("while", K::While),
            ("local", K::Local),
            ("l", K::Local),
            ("onfail", K::Onfail),
            ("endlocal", K::Endlocal),
            ("endl", K::Endlocal),
            ("break", K::Break),
            ("continue", K::Continue),
            ("return", K::Return),
            ("quit", K::Quit),
            ("q", K::Quit),
        ] {
            t.insert(name, Kw(kw));
        }
        for (name, cmd) in [
            ("echo", C::Echo),
            ("e", C::Echo),
            ("warn", C::Warn),
            ("error", C::Error),
            ("status", C::Status),
            ("u", C::Status),
            ("verbose", C::Verbose),
            ("v", C::Verbose),
            ("command", C::Command),
            ("m", C::Command),
            ("uncommand", C::Uncommand),
            ("input", C::Input),
            ("i", C::Input),
            ("remove", C::Remove),
            ("rm", C::Remove),
            ("keep", C::Keep),
            ("k", C::Keep),
            ("move", C::Move),
            ("mv", C::Move),
            ("name", C::Name),
            ("nm", C::Name),
            ("reverse", C::Reverse),
            ("check", C::Check),
            ("skip", C::Skip),
            ("parallel", C::Parallel),
            ("wait", C::Wait),
        ] {
            t.insert(name, Core(cmd));
        }
        for name in ["add", "sub", "mul", "div", "pow", "min", "max"] {
            t.insert(name, Op(Optional(ArgKind::NumberOrImage)));
        }
        for name in ["abs", "sqrt", "exp", "log", "sin", "cos", "round"] {
            t.insert(name, Op(None));
        }
        t.insert("fill", Op(Required(ArgKind::Expression)));
        t.insert("cut", Op(Required(ArgKind::Numbers(2))));
        t.insert("normalize", Op(Required(ArgKind::Numbers(2))));
        t.insert("mod", Op(Required(ArgKind::Number)));
        t
    })
}

/// Look up a built-in by (possibly abbreviated) name.
pub fn lookup(name: &str) -> Option<Builtin> {
    table().get(name).copied()
}

/// Every built-in name, for suggestions.
pub fn names() -> impl Iterator<Item = &'static str> {
    table().keys().copied()
}

pub fn keyword(name: &str) -> Option<Keyword> {
    match lookup(name)? {
        Builtin::Keyword(k) => Some(k),
        _ => None,
    }
}

// ── Argument helpers ──────────────────────────────────────────────────────────

/// Split an argument on top-level commas.  Commas inside double quotes,
/// parentheses or brackets do not split; escaped commas never do.
pub fn split_args(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' | '[' | '{' if !in_quotes => depth += 1,
            ')' | ']' | '}' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth <= 0 => {
                out.push(std::mem::take(&mut cur));
                continue;
            }
            _ => {}
        }
        cur.push(c);
    }
    out.push(cur);
    out
}

fn bad_argument(text: &str) -> InterpreterError {
    InterpreterError::argument(format!("Invalid argument '{}'.", literal(text)))
}

/// Parse `text` as an argument of `kind`.  `image_ref` resolves the
/// selection inside an `[…]` argument to a single index.
pub fn parse_op_args(
    kind: ArgKind,
    text: &str,
    image_ref: &mut dyn FnMut(&str) -> Result<usize, InterpreterError>,
) -> Result<Vec<OpArg>, InterpreterError> {
    let number = |t: &str| parse_number(&literal(t)).ok_or_else(|| bad_argument(text));
    match kind {
        ArgKind::Number => Ok(vec![OpArg::Number(number(text)?)]),
        ArgKind::NumberOrImage => {
            let t = text.trim();
            if let Some(inner) = t.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
                return Ok(vec![OpArg::Image(image_ref(inner)?)]);
            }
            Ok(vec![OpArg::Number(number(t)?)])
        }
        ArgKind::Numbers(n) => {
            let parts = split_args(text);
            if parts.len() != n {
                return Err(bad_argument(text));
            }
            parts.iter().map(|p| number(p).map(OpArg::Number)).collect()
        }
        ArgKind::Expression => match parse_number(&literal(text)) {
            Some(x) => Ok(vec![OpArg::Number(x)]),
            None => Ok(vec![OpArg::Text(literal(text))]),
        },
    }
}

/// Whether `text` would be accepted as an argument of `kind`.
pub fn accepts(kind: ArgKind, text: &str) -> bool {
    let t = text.trim();
    match kind {
        ArgKind::Number => parse_number(&literal(t)).is_some(),
        ArgKind::NumberOrImage => {
            (t.starts_with('[') && t.ends_with(']')) || parse_number(&literal(t)).is_some()
        }
        ArgKind::Numbers(n) => {
            let parts = split_args(t);
            parts.len() == n && parts.iter().all(|p| parse_number(&literal(p)).is_some())
        }
        ArgKind::Expression => !t.is_empty(),
    }
}

// ── Suggestions ───────────────────────────────────────────────────────────────

/// Edit distance between two strings (insert, delete, substitute).
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Closest candidate within edit distance 4.
pub fn suggest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    candidates
        .into_iter()
        .map(|c| (levenshtein(name, c), c))
        .filter(|(d, _)| *d <= 4)
        .min_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.cmp(b)))
        .map(|(_, c)| c.to_owned())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
