//! Call stack and block matching.
//!
//! The interpreter walks a flat item list.  Blocks are not pre-parsed:
//! when an opener (`if`, `repeat`, `do`, `local`) runs, [`scan`] looks ahead
//! for its terminator, counting nested openers, and the resulting positions
//! are kept in the pushed [`Frame`].
//!
//! Rendering (`$?` and error messages) uses `*` for block frames:
//! `./blend/*repeat/*if/`.

use crate::error::{ErrorKind, InterpreterError};

use super::builtins::{self, ArgForm, Builtin, Keyword};
use super::lexer::{DebugPos, Item};
use super::selection::{parse_command_item, Prefix};

// ── Frames ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Command(String),
    If,
    Repeat,
    Do,
    Local,
    Thread,
    Substitution,
}

impl FrameKind {
    fn label(&self) -> String {
        match self {
            FrameKind::Command(name) => name.clone(),
            FrameKind::If => "*if".into(),
            FrameKind::Repeat => "*repeat".into(),
            FrameKind::Do => "*do".into(),
            FrameKind::Local => "*local".into(),
            FrameKind::Thread => "*thread".into(),
            FrameKind::Substitution => "*substitute".into(),
        }
    }
}

/// Control state kept by a frame.  Positions index the item list of the
/// run that pushed the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameState {
    None,
    If {
        /// Position of the matching `endif`.
        end: usize,
    },
    Repeat {
        /// First item of the body.
        resume: usize,
        /// Position of the matching `done`.
        end: usize,
        /// Iterations left after the current one; `None` loops forever.
        remaining: Option<u64>,
        iteration: u64,
        var: Option<String>,
    },
    Do {
        resume: usize,
        /// Position of the matching `while`.
        end: usize,
        iteration: u64,
    },
    Local {
        /// Position of the matching `endlocal`.
        end: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub origin: Option<DebugPos>,
    pub state: FrameState,
}

impl Frame {
    pub fn new(kind: FrameKind, origin: Option<DebugPos>) -> Self {
        Frame { kind, origin, state: FrameState::None }
    }

    pub fn with_state(mut self, state: FrameState) -> Self {
        self.state = state;
        self
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, FrameKind::Repeat | FrameKind::Do)
    }
}

// ── CallStack ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<Frame>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        CallStack { frames: Vec::new(), max_depth }
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), InterpreterError> {
        if self.frames.len() >= self.max_depth {
            return Err(InterpreterError::new(
                ErrorKind::StackOverflow,
                format!("Call stack overflow (maximum depth {} reached).", self.max_depth),
            ));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// `./cmd/*repeat/`
    pub fn render(&self) -> String {
        let mut out = String::from("./");
        for f in &self.frames {
            out.push_str(&f.kind.label());
            out.push('/');
        }
        out
    }

    /// Custom commands only: `./outer/inner/`.
    pub fn path(&self) -> String {
        let mut out = String::from("./");
        for f in &self.frames {
            if let FrameKind::Command(name) = &f.kind {
                out.push_str(name);
                out.push('/');
            }
        }
        out
    }

    /// Name of the innermost custom command, empty at top level.
    pub fn innermost_command(&self) -> &str {
        self.frames
            .iter()
            .rev()
            .find_map(|f| match &f.kind {
                FrameKind::Command(name) => Some(name.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    /// Innermost loop of the current command scope.
    pub fn innermost_loop(&self) -> Option<&Frame> {
        for f in self.frames.iter().rev() {
            if f.is_loop() {
                return Some(f);
            }
            if matches!(f.kind, FrameKind::Command(_) | FrameKind::Thread) {
                return None;
            }
        }
        None
    }

    /// `($>, $<)` for the innermost loop: the 0-based iteration and the
    /// number of iterations left (`-1` when unknown).
    pub fn loop_indices(&self) -> Option<(u64, i64)> {
        match &self.innermost_loop()?.state {
            FrameState::Repeat { iteration, remaining, .. } => {
                Some((*iteration, remaining.map_or(-1, |r| r as i64)))
            }
            FrameState::Do { iteration, .. } => Some((*iteration, -1)),
            _ => None,
        }
    }
}

// ── Block matching ────────────────────────────────────────────────────────────

/// Control keyword an item stands for, if any.
pub fn item_keyword(text: &str) -> Option<Keyword> {
    let item = parse_command_item(text)?;
    if item.prefix == Prefix::Plus {
        return None;
    }
    builtins::keyword(&item.name)
}

/// Whether the item at `pos` consumes the following item as its argument.
fn consumes_next(items: &[Item], pos: usize) -> bool {
    let Some(item) = parse_command_item(&items[pos].text) else {
        return false;
    };
    match builtins::lookup(&item.name) {
        Some(Builtin::Keyword(k)) => k.takes_argument(),
        Some(Builtin::Core(c)) => c.takes_argument(),
        Some(Builtin::Operation(ArgForm::Required(_))) => true,
        Some(Builtin::Operation(ArgForm::Optional(kind))) => items.get(pos + 1).is_some_and(|next| {
            builtins::accepts(kind, &next.text) && builtins::lookup(&next.text).is_none()
        }),
        _ => false,
    }
}

fn opener_of(closer: Keyword) -> Option<Keyword> {
    match closer {
        Keyword::Endif => Some(Keyword::If),
        Keyword::Done => Some(Keyword::Repeat),
        Keyword::While => Some(Keyword::Do),
        Keyword::Endlocal => Some(Keyword::Local),
        _ => None,
    }
}

/// Find the first item at nesting depth zero, starting at `from`, whose
/// keyword is in `targets`.  Returns `None` when the current block ends
/// (or the list runs out) first.
pub fn scan(items: &[Item], from: usize, targets: &[Keyword]) -> Option<(usize, Keyword)> {
    let mut stack: Vec<Keyword> = Vec::new();
    let mut pos = from;
    while pos < items.len() {
        if let Some(kw) = item_keyword(&items[pos].text) {
            if stack.is_empty() && targets.contains(&kw) {
                return Some((pos, kw));
            }
            match kw {
                Keyword::If | Keyword::Repeat | Keyword::Do | Keyword::Local => stack.push(kw),
                closer => {
                    if let Some(opener) = opener_of(closer) {
                        match stack.last() {
                            Some(top) if *top == opener => {
                                stack.pop();
                            }
                            _ => return None,
                        }
                    }
                }
            }
        }
        pos += if consumes_next(items, pos) { 2 } else { 1 };
    }
    None
}

/// Terminator name used in "missing" errors.
pub fn terminator_of(opener: Keyword) -> &'static str {
    match opener {
        Keyword::If | Keyword::Elif | Keyword::Else => "-endif",
        Keyword::Repeat => "-done",
        Keyword::Do => "-while",
        Keyword::Local | Keyword::Onfail => "-endlocal",
        _ => "",
    }
}

/// Error for an opener without its terminator.
pub fn missing_terminator(opener: Keyword, origin: Option<DebugPos>) -> InterpreterError {
    let at = match origin {
        Some(p) => format!(" (opened at line #{})", p.line),
        None => String::new(),
    };
    InterpreterError::syntax(format!(
        "Missing associated '{}' command{at}.",
        terminator_of(opener)
    ))
    .with_command(opener.name())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::tokenize;

    #[test]
    fn render_and_path() {
        let mut cs = CallStack::new(16);
        cs.push(Frame::new(FrameKind::Command("foo".into()), None)).unwrap();
        cs.push(Frame::new(FrameKind::Repeat, None)).unwrap();
        assert_eq!(cs.render(), "./foo/*repeat/");
        assert_eq!(cs.path(), "./foo/");
        assert_eq!(cs.innermost_command(), "foo");
    }

    #[test]
    fn depth_limit() {
        let mut cs = CallStack::new(2);
        cs.push(Frame::new(FrameKind::If, None)).unwrap();
        cs.push(Frame::new(FrameKind::If, None)).unwrap();
        let err = cs.push(Frame::new(FrameKind::If, None)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn scan_skips_nested_blocks() {
        let items = tokenize("if 1 repeat 2 if 0 endif done else add 1 endif").unwrap();
        let (pos, kw) = scan(&items, 2, &[Keyword::Elif, Keyword::Else, Keyword::Endif]).unwrap();
        assert_eq!(kw, Keyword::Else);
        assert_eq!(items[pos].text, "else");
    }

    #[test]
    fn scan_skips_keyword_arguments() {
        let items = tokenize("echo done done").unwrap();
        let (pos, _) = scan(&items, 0, &[Keyword::Done]).unwrap();
        assert_eq!(pos, 2);
    }

    #[test]
    fn scan_reports_unmatched() {
        let items = tokenize("repeat 3 add 1").unwrap();
        assert!(scan(&items, 2, &[Keyword::Done]).is_none());
        let items = tokenize("add 1 done").unwrap();
        assert!(scan(&items, 0, &[Keyword::Endif]).is_none());
    }

    #[test]
    fn missing_terminator_names_it() {
        let err = missing_terminator(Keyword::Repeat, Some(DebugPos { file: 0, line: 4 }));
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert!(err.message.contains("'-done'"));
        assert!(err.message.contains("line #4"));
    }

    #[test]
    fn loop_indices_stop_at_command_boundary() {
        let mut cs = CallStack::new(16);
        cs.push(
            Frame::new(FrameKind::Repeat, None).with_state(FrameState::Repeat {
                resume: 0,
                end: 0,
                remaining: Some(2),
                iteration: 1,
                var: None,
            }),
        )
        .unwrap();
        assert_eq!(cs.loop_indices(), Some((1, 2)));
        cs.push(Frame::new(FrameKind::Command("inner".into()), None)).unwrap();
        assert_eq!(cs.loop_indices(), None);
    }
}
