//! Error types.
//!
//! Every failure inside the interpreter surfaces as an [`InterpreterError`].
//! Errors are created bare by the low-level parsers (lexer, selection,
//! substitution) and receive their call-stack context the first time they
//! cross the dispatcher, so the rendered message always points at the
//! innermost scope that was active when the error happened.
//!
//! The image-library collaborator reports failures with [`OpError`] and
//! [`EvalError`]; both convert into an [`InterpreterError`].

use thiserror::Error;

// ── ErrorKind ─────────────────────────────────────────────────────────────────

/// Category of an [`InterpreterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unterminated quote, malformed selection, unmatched block.
    Syntax,
    /// Unknown image name or label, loop index outside of a loop.
    UndefinedReference,
    /// A command argument matched none of the accepted forms.
    Argument,
    /// No built-in or custom command with that name.
    UnknownCommand,
    /// Call-stack depth limit reached.
    StackOverflow,
    /// Image/name list mismatch or a corrupted call stack.
    InternalInvariant,
    /// Failure reported by the image library.
    Operation,
    /// Raised on purpose by the `error` command.
    User,
}

impl ErrorKind {
    /// Fatal errors bypass `onfail` handlers.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::InternalInvariant | ErrorKind::StackOverflow)
    }
}

// ── SourceLocation ────────────────────────────────────────────────────────────

/// File and line of the command definition being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
}

// ── InterpreterError ──────────────────────────────────────────────────────────

/// An exception raised while running a script.
#[derive(Debug, Clone, Error)]
#[error("{rendered}")]
pub struct InterpreterError {
    pub kind: ErrorKind,
    /// Innermost command name, empty outside of a command context.
    pub command: String,
    /// Message without any context decoration.
    pub message: String,
    /// Call stack rendering captured when the error left its scope.
    pub call_stack: Option<String>,
    pub location: Option<SourceLocation>,
    /// Closest known command name, for [`ErrorKind::UnknownCommand`].
    pub suggestion: Option<String>,
    rendered: String,
}

impl InterpreterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut err = InterpreterError {
            kind,
            command: String::new(),
            message: message.into(),
            call_stack: None,
            location: None,
            suggestion: None,
            rendered: String::new(),
        };
        err.render();
        err
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn undefined(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UndefinedReference, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalInvariant, message)
    }

    /// Unknown command, with an optional correction.
    pub fn unknown_command(name: &str, suggestion: Option<String>) -> Self {
        let message = match &suggestion {
            Some(s) => format!("Unknown command or filename '{name}' (did you mean '{s}'?)."),
            None => format!("Unknown command or filename '{name}'."),
        };
        let mut err = Self::new(ErrorKind::UnknownCommand, message);
        err.suggestion = suggestion;
        err
    }

    /// Attach the innermost command name, unless one is already set.
    pub fn with_command(mut self, command: &str) -> Self {
        if self.command.is_empty() && !command.is_empty() {
            self.command = command.to_owned();
            self.render();
        }
        self
    }

    /// Attach call-stack context.  The first context wins: an error keeps
    /// pointing at the scope it was raised in while it unwinds.
    pub fn in_context(mut self, call_stack: String, location: Option<SourceLocation>) -> Self {
        if self.call_stack.is_none() {
            self.call_stack = Some(call_stack);
            self.location = location;
            self.render();
        }
        self
    }

    pub fn has_context(&self) -> bool {
        self.call_stack.is_some()
    }

    /// The fully decorated message, as printed at top level.
    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    fn render(&mut self) {
        let body = if self.command.is_empty() {
            self.message.clone()
        } else {
            format!("Command '{}': {}", self.command, self.message)
        };
        self.rendered = match &self.call_stack {
            None => body,
            Some(stack) => {
                let at = match &self.location {
                    Some(loc) => format!(" (file '{}', line #{})", loc.file, loc.line),
                    None => String::new(),
                };
                format!("*** Error in {stack}{at} *** {body}")
            }
        };
    }
}

// ── Collaborator errors ───────────────────────────────────────────────────────

/// Failure reported by [`ImageLibrary::apply_operation`](crate::image::ImageLibrary).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("Invalid argument '{0}'.")]
    InvalidArgument(String),
    #[error("Image [{0}] is currently owned by a parallel thread.")]
    MovedOut(usize),
    #[error("Operation '{0}' is not supported by the image library.")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
}

/// Failure reported by the expression evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct EvalError(pub String);

impl From<OpError> for InterpreterError {
    fn from(e: OpError) -> Self {
        let kind = match e {
            OpError::InvalidArgument(_) => ErrorKind::Argument,
            _ => ErrorKind::Operation,
        };
        InterpreterError::new(kind, e.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_error_renders_message_only() {
        let e = InterpreterError::syntax("Unbalanced braces.");
        assert_eq!(e.to_string(), "Unbalanced braces.");
    }

    #[test]
    fn command_prefix() {
        let e = InterpreterError::argument("Invalid argument 'x'.").with_command("add");
        assert_eq!(e.to_string(), "Command 'add': Invalid argument 'x'.");
    }

    #[test]
    fn first_context_wins() {
        let e = InterpreterError::syntax("boom")
            .in_context("./foo/".into(), None)
            .in_context("./".into(), None);
        assert_eq!(e.call_stack.as_deref(), Some("./foo/"));
        assert_eq!(e.to_string(), "*** Error in ./foo/ *** boom");
    }

    #[test]
    fn location_is_rendered() {
        let loc = SourceLocation { file: "user.ims".into(), line: 12 };
        let e = InterpreterError::syntax("boom").in_context("./foo/".into(), Some(loc));
        assert_eq!(e.to_string(), "*** Error in ./foo/ (file 'user.ims', line #12) *** boom");
    }

    #[test]
    fn unknown_command_with_suggestion() {
        let e = InterpreterError::unknown_command("blurr", Some("blur".into()));
        assert_eq!(e.kind, ErrorKind::UnknownCommand);
        assert!(e.to_string().contains("did you mean 'blur'"));
    }

    #[test]
    fn op_error_conversion() {
        let e: InterpreterError = OpError::InvalidArgument("foo".into()).into();
        assert_eq!(e.kind, ErrorKind::Argument);
        let e: InterpreterError = OpError::MovedOut(3).into();
        assert_eq!(e.kind, ErrorKind::Operation);
    }

    #[test]
    fn fatal_kinds() {
        assert!(ErrorKind::InternalInvariant.is_fatal());
        assert!(ErrorKind::StackOverflow.is_fatal());
        assert!(!ErrorKind::User.is_fatal());
        assert!(!ErrorKind::Argument.is_fatal());
    }
}
