//! Custom-command registry.
//!
//! Custom commands are named script bodies loaded from command files:
//!
//! ```text
//! #@cli double : Double the selected images.
//! double :
//!   mul 2     # trailing comments are stripped
//! greet : echo "Hello $1"
//! ```
//!
//! A header `name : body` starts at column zero; indented or otherwise
//! non-header lines continue the latest definition.  A line ending in `\`
//! is joined directly with the next one.  Every body line is prefixed with a
//! debug marker so errors can point at the definition line.
//!
//! Several definitions of the same name may coexist: the latest one is
//! used, and [`CommandRegistry::undefine`] removes it to expose the previous
//! one again.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use aho_corasick::AhoCorasick;
use regex::Regex;

use crate::script::lexer::DebugPos;

// ── CustomCommand ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCommand {
    /// Sequential id assigned by [`CommandRegistry::define`].
    pub num: u32,
    pub name: String,
    pub body: String,
    /// Whether the body references its arguments (`$1`, `$*`, …).
    pub has_arguments: bool,
    /// Index into the registry's source table.
    pub source: usize,
    /// Line of the header in its source, 0 when defined programmatically.
    pub line: usize,
}

// ── Argument detection ────────────────────────────────────────────────────────

fn argument_refs() -> &'static AhoCorasick {
    static AC: OnceLock<AhoCorasick> = OnceLock::new();
    AC.get_or_init(|| {
        let mut patterns: Vec<String> = vec!["$#".into(), "$*".into(), "$\"*\"".into(), "$=".into()];
        for d in 1..=9 {
            patterns.push(format!("${d}"));
            patterns.push(format!("${{{d}"));
            patterns.push(format!("${{-{d}"));
        }
        AhoCorasick::new(patterns)
    })
}

/// True if `body` references `$#`, `$*`, `$"*"`, `$=`, `$N`, `${N…}` or
/// `${-N…}`.
/// Escaped dollars (`\$1`) do not count.
pub fn has_arguments(body: &str) -> bool {
    let bytes = body.as_bytes();
    argument_refs()
        .find_iter(body)
        .any(|m| m.start() == 0 || bytes[m.start() - 1] != b'\\')
}

// ── Loader helpers ────────────────────────────────────────────────────────────

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(.*)$").expect("header regex is valid")
    })
}

fn help_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#@cli\s+([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(.*)$").expect("help regex is valid")
    })
}

/// Cut a ` #` comment that is not inside double quotes.
fn strip_trailing_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let mut prev = ' ';
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        } else if c == '#' && !in_quotes && prev.is_whitespace() && i > 0 {
            return &line[..i];
        }
        prev = c;
    }
    line
}

/// Trim a body piece, keeping trailing blanks before a `\` continuation.
fn trim_piece(s: &str, continues: bool) -> &str {
    if continues { s.trim_start() } else { s.trim() }
}

// ── CommandRegistry ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CommandRegistry {
    next_num: u32,
    commands: HashMap<String, Vec<Arc<CustomCommand>>>,
    sources: Vec<String>,
    help: HashMap<String, String>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry {
            next_num: 1,
            commands: HashMap::new(),
            sources: vec!["(script)".to_owned()],
            help: HashMap::new(),
        }
    }

    /// Register a source name and return its index (reused if known).
    pub fn add_source(&mut self, name: &str) -> usize {
        if let Some(i) = self.sources.iter().position(|s| s == name) {
            return i;
        }
        self.sources.push(name.to_owned());
        self.sources.len() - 1
    }

    pub fn source_name(&self, index: usize) -> Option<&str> {
        self.sources.get(index).map(String::as_str)
    }

    /// Add a definition; it shadows earlier ones with the same name.
    pub fn define(&mut self, name: &str, body: &str, source: &str) -> u32 {
        let source = self.add_source(source);
        self.push(name, body, source, 0)
    }

    fn push(&mut self, name: &str, body: &str, source: usize, line: usize) -> u32 {
        let num = self.next_num;
        self.next_num += 1;
        let cmd = CustomCommand {
            num,
            name: name.to_owned(),
            body: body.to_owned(),
            has_arguments: has_arguments(body),
            source,
            line,
        };
        self.commands.entry(name.to_owned()).or_default().push(Arc::new(cmd));
        num
    }

    /// Add `line` to the latest definition of `name`, separated by a space
    /// unless `join` is set.  Returns `false` if `name` is not defined.
    pub fn append_line(&mut self, name: &str, line: &str, join: bool) -> bool {
        let Some(latest) = self.commands.get_mut(name).and_then(|v| v.last_mut()) else {
            return false;
        };
        let cmd = Arc::make_mut(latest);
        if !join && !cmd.body.is_empty() {
            cmd.body.push(' ');
        }
        cmd.body.push_str(line);
        cmd.has_arguments = has_arguments(&cmd.body);
        true
    }

    /// Parse command-file text and register every definition in it.
    /// Returns the number of commands defined.
    pub fn load(&mut self, text: &str, source: &str) -> usize {
        let file = self.add_source(source);
        let mut current: Option<String> = None;
        let mut joining = false;
        let mut count = 0;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let raw = raw.trim_end_matches('\r');

            if let Some(caps) = help_re().captures(raw.trim_start()) {
                self.help.insert(caps[1].to_owned(), caps[2].trim().to_owned());
                continue;
            }
            if !joining && raw.trim_start().starts_with('#') {
                continue;
            }

            let line = strip_trailing_comment(raw);
            let (line, continues) = match line.strip_suffix('\\') {
                Some(l) if !l.ends_with('\\') => (l, true),
                _ => (line, false),
            };
            let marker = DebugPos { file, line: lineno }.marker();

            let header = if joining || line.starts_with(char::is_whitespace) {
                None
            } else {
                header_re().captures(line)
            };

            match header {
                Some(caps) => {
                    let name = caps[1].to_owned();
                    let body = trim_piece(caps.get(2).map_or("", |m| m.as_str()), continues);
                    let body = if body.is_empty() { String::new() } else { format!("{marker}{body}") };
                    self.push(&name, &body, file, lineno);
                    current = Some(name);
                    count += 1;
                }
                None => {
                    let Some(name) = current.as_deref() else {
                        if !line.trim().is_empty() {
                            tracing::debug!(source, lineno, "ignoring text outside of a command");
                        }
                        joining = continues;
                        continue;
                    };
                    let piece = if joining {
                        if continues { line.to_owned() } else { line.trim_end().to_owned() }
                    } else if line.trim().is_empty() {
                        joining = continues;
                        continue;
                    } else {
                        format!("{marker}{}", trim_piece(line, continues))
                    };
                    self.append_line(name, &piece, joining);
                }
            }
            joining = continues;
        }
        count
    }

    /// Latest definition of `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<CustomCommand>> {
        self.commands.get(name)?.last().cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.get(name).is_some_and(|v| !v.is_empty())
    }

    /// Remove the latest definition of `name`.  Returns `true` if it existed.
    pub fn undefine(&mut self, name: &str) -> bool {
        let Some(defs) = self.commands.get_mut(name) else {
            return false;
        };
        let removed = defs.pop().is_some();
        if defs.is_empty() {
            self.commands.remove(name);
        }
        removed
    }

    /// Remove every definition.  Returns how many were removed.
    pub fn undefine_all(&mut self) -> usize {
        let n = self.commands.values().map(Vec::len).sum();
        self.commands.clear();
        n
    }

    /// Names of all defined commands, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn help(&self, name: &str) -> Option<&str> {
        self.help.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
