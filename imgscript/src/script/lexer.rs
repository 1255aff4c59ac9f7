//! Script lexer.
//!
//! A script is split into whitespace-separated *items*.  Double quotes group
//! whitespace into one item and stay in the item text; a backslash outside
//! quotes escapes the next character:
//!
//! | Input | Item text |
//! |-------|-----------|
//! | `\ ` | literal space (does not split) |
//! | `\$ \{ \} \, \"` | private control characters, see [`ESC_DOLLAR`] … |
//! | `\\` | `\` |
//!
//! The control characters survive substitution and argument splitting as
//! literals and are turned back into plain characters by [`unescape`] when an
//! argument is finally consumed.
//!
//! Debug markers `\u{1}line,file\u{2}` (inserted by the command loader) set
//! the source position attached to the following items.

use crate::error::InterpreterError;

pub const ESC_DOLLAR: char = '\u{17}';
pub const ESC_LBRACE: char = '\u{18}';
pub const ESC_RBRACE: char = '\u{19}';
pub const ESC_COMMA: char = '\u{1a}';
pub const ESC_DQUOTE: char = '\u{1c}';

pub const MARKER_START: char = '\u{1}';
pub const MARKER_END: char = '\u{2}';

/// Source position of an item: index into the command registry's source
/// table, and 1-based line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugPos {
    pub file: usize,
    pub line: usize,
}

impl DebugPos {
    /// The in-band marker for this position.
    pub fn marker(&self) -> String {
        format!("{MARKER_START}{},{}{MARKER_END}", self.line, self.file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub text: String,
    pub debug: Option<DebugPos>,
}

impl Item {
    pub fn new(text: impl Into<String>) -> Self {
        Item { text: text.into(), debug: None }
    }
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer {
    items: Vec<Item>,
    current: String,
    started: bool,
    item_pos: Option<DebugPos>,
    pos: Option<DebugPos>,
    /// Newlines seen, for error messages when no marker is known.
    line: usize,
}

impl Lexer {
    fn flush(&mut self) {
        if self.started {
            self.items.push(Item {
                text: std::mem::take(&mut self.current),
                debug: self.item_pos,
            });
            self.started = false;
        }
    }

    fn push(&mut self, c: char) {
        if !self.started {
            self.started = true;
            self.item_pos = self.pos;
        }
        self.current.push(c);
    }

    fn best_line(&self) -> usize {
        self.pos.map_or(self.line, |p| p.line)
    }
}

/// Read a debug marker body (`line,file`) up to [`MARKER_END`].
fn read_marker(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<DebugPos> {
    let mut body = String::new();
    for c in chars.by_ref() {
        if c == MARKER_END {
            let (line, file) = body.split_once(',')?;
            return Some(DebugPos {
                line: line.trim().parse().ok()?,
                file: file.trim().parse().ok()?,
            });
        }
        body.push(c);
    }
    None
}

/// Split `src` into items.
pub fn tokenize(src: &str) -> Result<Vec<Item>, InterpreterError> {
    let mut lx = Lexer {
        items: Vec::new(),
        current: String::new(),
        started: false,
        item_pos: None,
        pos: None,
        line: 1,
    };
    let mut in_quotes = false;
    let mut quote_line = 0;
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            MARKER_START => {
                if let Some(p) = read_marker(&mut chars) {
                    lx.pos = Some(p);
                }
                if !in_quotes {
                    lx.flush();
                }
            }
            '\n' => {
                lx.line += 1;
                if in_quotes {
                    lx.push(c);
                } else {
                    lx.flush();
                }
            }
            '"' => {
                if !in_quotes {
                    quote_line = lx.best_line();
                }
                in_quotes = !in_quotes;
                lx.push(c);
            }
            '\\' if in_quotes => match chars.peek() {
                Some('"') => {
                    chars.next();
                    lx.push(ESC_DQUOTE);
                }
                Some('\\') => {
                    chars.next();
                    lx.push('\\');
                }
                _ => lx.push('\\'),
            },
            '\\' => {
                let escaped = match chars.peek() {
                    Some(' ') => Some(' '),
                    Some('$') => Some(ESC_DOLLAR),
                    Some('{') => Some(ESC_LBRACE),
                    Some('}') => Some(ESC_RBRACE),
                    Some(',') => Some(ESC_COMMA),
                    Some('"') => Some(ESC_DQUOTE),
                    Some('\\') => Some('\\'),
                    _ => None,
                };
                match escaped {
                    Some(e) => {
                        chars.next();
                        lx.push(e);
                    }
                    None => lx.push('\\'),
                }
            }
            c if c.is_whitespace() && !in_quotes => lx.flush(),
            c => lx.push(c),
        }
    }

    if in_quotes {
        return Err(InterpreterError::syntax(format!(
            "Unterminated double quote (line #{quote_line})."
        )));
    }
    lx.flush();
    Ok(lx.items)
}

// ── Argument helpers ──────────────────────────────────────────────────────────

/// Turn escape control characters back into the characters they stand for.
pub fn unescape(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ESC_DOLLAR => '$',
            ESC_LBRACE => '{',
            ESC_RBRACE => '}',
            ESC_COMMA => ',',
            ESC_DQUOTE => '"',
            c => c,
        })
        .collect()
}

/// Drop grouping double quotes (escaped quotes are kept).
pub fn strip_quotes(s: &str) -> String {
    s.chars().filter(|&c| c != '"').collect()
}

/// Text of an argument as the command finally sees it.
pub fn literal(s: &str) -> String {
    unescape(&strip_quotes(s))
}

/// Remove debug markers from a string.
pub fn strip_markers(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_marker = false;
    for c in s.chars() {
        match c {
            MARKER_START => in_marker = true,
            MARKER_END => in_marker = false,
            c if !in_marker => out.push(c),
            _ => {}
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
