//! The interpreter loop.
//!
//! An [`Interpreter`] walks a flat list of [`Item`]s against an
//! [`ImageList`].  Each item is substituted right before it runs, then
//! dispatched as a variable assignment, a control-flow keyword, a core
//! command, an image operation, a custom command or an implicit `input`.
//!
//! Blocks are not parsed ahead of time: openers look for their terminator
//! with [`scan`] and record positions in a call-stack [`Frame`].  A custom
//! command body, a `local` block and a parallel fragment each run as a
//! nested item list with their own frame base.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::commands::{CommandRegistry, CustomCommand};
use crate::config::{self, Config};
use crate::error::{ErrorKind, InterpreterError, SourceLocation};
use crate::image::basic::BasicLibrary;
use crate::image::{ExprContext, Image, ImageLibrary, ImageList, OpArg};
use crate::var::{parse_assignment, VarOp, VariableStore};

use super::builtins::{self, ArgForm, ArgKind, Builtin, CoreCmd, Keyword};
use super::callstack::{missing_terminator, scan, CallStack, Frame, FrameKind, FrameState};
use super::expand::{bind_arguments, expand, ExpandContext};
use super::lexer::{literal, tokenize, DebugPos, Item};
use super::parallel::{self, Pending};
use super::selection::{parse_command_item, resolve, CommandItem, Prefix};
use super::value::{parse_number, Value};

/// Output lines produced by `echo` and `warn`, shared with parallel threads.
pub type Console = Arc<Mutex<Vec<String>>>;

/// How a top-level run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// `quit` was executed.
    Quit,
    /// An abort flag was raised while running.
    Aborted,
}

/// How a nested item list ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Normal,
    Return,
    Quit,
    Abort,
    /// `break` with no loop in the list; ends the enclosing `local` or thread.
    Break,
    Continue,
}

enum Step {
    Next(usize),
    Exit(Flow),
}

// ── Interpreter ───────────────────────────────────────────────────────────────

pub struct Interpreter {
    library: Arc<dyn ImageLibrary>,
    commands: Arc<RwLock<CommandRegistry>>,
    vars: VariableStore,
    call_stack: CallStack,
    console: Console,
    verbosity: i32,
    status: String,
    start: Instant,
    /// This instance's own flag first, then every ancestor's.
    abort: Vec<Arc<AtomicBool>>,
    detached: Vec<Pending>,
    /// Detached groups below this index belong to enclosing scopes.
    detached_base: usize,
    quit_requested: bool,
    position: Option<DebugPos>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Interpreter backed by the reference image library.
    pub fn new() -> Self {
        Self::with_library(Arc::new(BasicLibrary::new()), &Config::default())
    }

    pub fn with_library(library: Arc<dyn ImageLibrary>, config: &Config) -> Self {
        Interpreter {
            library,
            commands: Arc::new(RwLock::new(CommandRegistry::new())),
            vars: VariableStore::new(),
            call_stack: CallStack::new(config.max_call_depth),
            console: Arc::new(Mutex::new(Vec::new())),
            verbosity: config.verbosity,
            status: String::new(),
            start: Instant::now(),
            abort: vec![Arc::new(AtomicBool::new(false))],
            detached: Vec::new(),
            detached_base: 0,
            quit_requested: false,
            position: None,
        }
    }

    /// Copy of this interpreter for a parallel thread.
    pub(super) fn fork(&self) -> Interpreter {
        let mut abort = vec![Arc::new(AtomicBool::new(false))];
        abort.extend(self.abort.iter().cloned());
        Interpreter {
            library: Arc::clone(&self.library),
            commands: Arc::clone(&self.commands),
            vars: self.vars.fork(),
            call_stack: self.call_stack.clone(),
            console: Arc::clone(&self.console),
            verbosity: self.verbosity,
            status: self.status.clone(),
            start: self.start,
            abort,
            detached: Vec::new(),
            detached_base: 0,
            quit_requested: false,
            position: self.position,
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn commands(&self) -> Arc<RwLock<CommandRegistry>> {
        Arc::clone(&self.commands)
    }

    /// Load custom commands from `text`; returns how many were defined.
    pub fn load_commands(&mut self, text: &str, source: &str) -> usize {
        self.registry_mut().load(text, source)
    }

    pub fn variables(&self) -> &VariableStore {
        &self.vars
    }

    pub fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.vars
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn verbosity(&self) -> i32 {
        self.verbosity
    }

    pub fn set_verbosity(&mut self, level: i32) {
        self.verbosity = level;
    }

    pub fn console(&self) -> Console {
        Arc::clone(&self.console)
    }

    /// Drain the console.
    pub fn take_output(&self) -> Vec<String> {
        std::mem::take(&mut *self.console.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Flag that stops this interpreter (and its threads) when raised.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort[0])
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    fn registry(&self) -> RwLockReadGuard<'_, CommandRegistry> {
        self.commands.read().unwrap_or_else(|p| p.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, CommandRegistry> {
        self.commands.write().unwrap_or_else(|p| p.into_inner())
    }

    fn aborted(&self) -> bool {
        self.abort.iter().any(|f| f.load(Ordering::Relaxed))
    }

    fn console_line(&self, line: String) {
        self.console.lock().unwrap_or_else(|p| p.into_inner()).push(line);
    }

    // ── Entry points ───────────────────────────────────────────────────────

    /// Run a script on `images`.
    pub fn run(&mut self, script: &str, images: &mut ImageList) -> Result<RunStatus, InterpreterError> {
        let items = tokenize(script).map_err(|e| e.in_context(self.call_stack.render(), None))?;
        self.quit_requested = false;
        let flow = self.run_items(&items, images)?;
        images.check_consistency()?;
        Ok(match flow {
            Flow::Quit => RunStatus::Quit,
            Flow::Abort => RunStatus::Aborted,
            _ => RunStatus::Completed,
        })
    }

    /// Run one parallel fragment inside a `thread` frame.
    pub(super) fn run_fragment(&mut self, script: &str, images: &mut ImageList) -> Result<(), InterpreterError> {
        let items = tokenize(script)?;
        let depth = self.call_stack.len();
        self.call_stack.push(Frame::new(FrameKind::Thread, self.position))?;
        let result = self.run_items(&items, images);
        self.call_stack.truncate(depth);
        result.map(|_| ())
    }

    /// `${"script"}`: run on the current images, yield the status.
    fn run_substitution(&mut self, script: &str, images: &mut ImageList) -> Result<String, InterpreterError> {
        let items = tokenize(script)?;
        let depth = self.call_stack.len();
        self.call_stack.push(Frame::new(FrameKind::Substitution, self.position))?;
        let result = self.run_items(&items, images);
        self.call_stack.truncate(depth);
        if result? == Flow::Quit {
            self.quit_requested = true;
        }
        Ok(self.status.clone())
    }

    /// Run a nested item list.  Frames pushed by the list and detached
    /// parallel groups started in it are released on every exit path.
    pub(super) fn run_items(&mut self, items: &[Item], images: &mut ImageList) -> Result<Flow, InterpreterError> {
        let base = self.call_stack.len();
        let saved_detached = std::mem::replace(&mut self.detached_base, self.detached.len());
        let result = self.run_loop(items, images, base);
        let joined = self.finish_detached(images, result.is_err());
        self.detached_base = saved_detached;
        self.call_stack.truncate(base);
        let flow = result?;
        joined?;
        images.check_consistency()?;
        Ok(flow)
    }

    fn run_loop(&mut self, items: &[Item], images: &mut ImageList, base: usize) -> Result<Flow, InterpreterError> {
        let mut pos = 0;
        while pos < items.len() {
            if self.aborted() {
                tracing::debug!("run aborted");
                return Ok(Flow::Abort);
            }
            let item = &items[pos];
            if item.debug.is_some() {
                self.position = item.debug;
            }
            let step = images
                .check_consistency()
                .and_then(|()| self.step(items, pos, images, base))
                .map_err(|e| self.decorate(e, item))?;
            if self.quit_requested {
                return Ok(Flow::Quit);
            }
            match step {
                Step::Next(next) => pos = next,
                Step::Exit(flow) => return Ok(flow),
            }
        }
        if self.call_stack.len() > base {
            if let Some(frame) = self.call_stack.top() {
                let opener = match frame.kind {
                    FrameKind::Repeat => Keyword::Repeat,
                    FrameKind::Do => Keyword::Do,
                    FrameKind::Local => Keyword::Local,
                    _ => Keyword::If,
                };
                return Err(self.decorate(missing_terminator(opener, frame.origin), &Item::new("")));
            }
        }
        Ok(Flow::Normal)
    }

    /// Attach the command name and call-stack context to an error.
    fn decorate(&self, err: InterpreterError, item: &Item) -> InterpreterError {
        let name = parse_command_item(&item.text)
            .map(|c| c.name)
            .unwrap_or_else(|| self.call_stack.innermost_command().to_owned());
        let err = err.with_command(&name);
        if err.has_context() {
            return err;
        }
        let location = item.debug.or(self.position).map(|p| SourceLocation {
            file: self.registry().source_name(p.file).unwrap_or("(script)").to_owned(),
            line: p.line,
        });
        err.in_context(self.call_stack.render(), location)
    }

    // ── Dispatch ───────────────────────────────────────────────────────────

    fn step(&mut self, items: &[Item], pos: usize, images: &mut ImageList, base: usize) -> Result<Step, InterpreterError> {
        let text = self.expand_text(&items[pos].text, images)?;
        tracing::trace!(item = %text, pos, "dispatch");

        if let Some(mut assignment) = parse_assignment(&text) {
            assignment.value = literal(&assignment.value);
            self.vars.assign(&assignment)?;
            return Ok(Step::Next(pos + 1));
        }

        let Some(ci) = parse_command_item(&text) else {
            return self.implicit_input(&text, images).map(|()| Step::Next(pos + 1));
        };

        match builtins::lookup(&ci.name) {
            Some(Builtin::Keyword(kw)) => return self.keyword(kw, &ci, items, pos, images, base),
            Some(Builtin::Core(cmd)) => return self.core(cmd, &ci, items, pos, images),
            Some(Builtin::Operation(form)) => return self.operation(form, &ci, items, pos, images),
            None => {}
        }

        let custom = self.registry().lookup(&ci.name);
        if let Some(cmd) = custom {
            return self.invoke(cmd, &ci, items, pos, images);
        }

        if std::path::Path::new(&literal(&text)).exists() {
            return self.implicit_input(&text, images).map(|()| Step::Next(pos + 1));
        }
        let known = self.registry().names();
        let candidates = builtins::names().map(|s| s as &str).chain(known.iter().map(String::as_str));
        let suggestion = builtins::suggest(&ci.name, candidates);
        Err(InterpreterError::unknown_command(&ci.name, suggestion))
    }

    fn expand_text(&mut self, text: &str, images: &mut ImageList) -> Result<String, InterpreterError> {
        expand(text, &mut Scope { interp: self, images })
    }

    /// The expanded item following `pos`.
    fn argument(&mut self, items: &[Item], pos: usize, images: &mut ImageList) -> Result<String, InterpreterError> {
        let item = items
            .get(pos + 1)
            .ok_or_else(|| InterpreterError::argument("Missing argument."))?;
        self.expand_text(&item.text, images)
    }

    fn is_command_name(&self, text: &str) -> bool {
        parse_command_item(text)
            .is_some_and(|c| builtins::lookup(&c.name).is_some() || self.registry().contains(&c.name))
    }

    fn selection(&self, ci: &CommandItem, images: &ImageList, all_by_default: bool) -> Result<Vec<usize>, InterpreterError> {
        match &ci.selection {
            Some(spec) => resolve(spec, images.len(), &images.names, false),
            None if all_by_default => Ok((0..images.len()).collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Evaluate `if`/`elif`/`while`/`check` conditions.
    fn condition(&mut self, text: &str, images: &mut ImageList) -> Result<bool, InterpreterError> {
        let t = literal(text);
        if let Some(x) = parse_number(&t) {
            return Ok(x != 0.0);
        }
        if t.trim().is_empty() {
            return Err(InterpreterError::argument("Invalid condition ''."));
        }
        let last = images.len().checked_sub(1);
        Ok(Scope { interp: self, images }.evaluate(&t, last)?.as_bool())
    }

    fn implicit_input(&mut self, text: &str, images: &mut ImageList) -> Result<(), InterpreterError> {
        tracing::debug!(item = %text, "implicit input");
        let args = [OpArg::Text(literal(text))];
        self.library
            .apply_operation("input", &[], &args, &mut images.slots, &mut images.names)?;
        Ok(())
    }

    // ── Control flow ───────────────────────────────────────────────────────

    fn top_state(&mut self, base: usize) -> Option<&mut FrameState> {
        if self.call_stack.len() > base {
            self.call_stack.top_mut().map(|f| &mut f.state)
        } else {
            None
        }
    }

    fn keyword(
        &mut self,
        kw: Keyword,
        ci: &CommandItem,
        items: &[Item],
        pos: usize,
        images: &mut ImageList,
        base: usize,
    ) -> Result<Step, InterpreterError> {
        let origin = items[pos].debug.or(self.position);
        match kw {
            Keyword::If => {
                let cond = self.argument(items, pos, images)?;
                if self.condition(&cond, images)? {
                    self.enter_if(items, pos + 2, origin)
                } else {
                    self.next_branch(items, pos + 2, origin, images)
                }
            }
            Keyword::Elif | Keyword::Else => match self.top_state(base) {
                Some(&mut FrameState::If { end }) => {
                    self.call_stack.pop();
                    Ok(Step::Next(end + 1))
                }
                _ => Err(unmatched(kw, Keyword::If)),
            },
            Keyword::Endif => match self.top_state(base) {
                Some(FrameState::If { .. }) => {
                    self.call_stack.pop();
                    Ok(Step::Next(pos + 1))
                }
                _ => Err(unmatched(kw, Keyword::If)),
            },
            Keyword::Repeat => self.enter_repeat(items, pos, origin, images),
            Keyword::Done => {
                let again = match self.top_state(base) {
                    Some(FrameState::Repeat { resume, remaining, iteration, var, .. }) => {
                        if *remaining == Some(0) {
                            None
                        } else {
                            if let Some(r) = remaining.as_mut() {
                                *r -= 1;
                            }
                            *iteration += 1;
                            Some((*resume, *iteration, var.clone()))
                        }
                    }
                    _ => return Err(unmatched(kw, Keyword::Repeat)),
                };
                match again {
                    None => {
                        self.call_stack.pop();
                        Ok(Step::Next(pos + 1))
                    }
                    Some((resume, iteration, var)) => {
                        if let Some(var) = var {
                            self.vars.set(&var, &iteration.to_string(), VarOp::Assign)?;
                        }
                        Ok(Step::Next(resume))
                    }
                }
            }
            Keyword::Do => {
                let (end, _) = scan(items, pos + 1, &[Keyword::While])
                    .ok_or_else(|| missing_terminator(Keyword::Do, origin))?;
                self.call_stack.push(Frame::new(FrameKind::Do, origin).with_state(FrameState::Do {
                    resume: pos + 1,
                    end,
                    iteration: 0,
                }))?;
                Ok(Step::Next(pos + 1))
            }
            Keyword::While => {
                if !matches!(self.top_state(base), Some(FrameState::Do { .. })) {
                    return Err(unmatched(kw, Keyword::Do));
                }
                let cond = self.argument(items, pos, images)?;
                if !self.condition(&cond, images)? {
                    self.call_stack.pop();
                    return Ok(Step::Next(pos + 2));
                }
                match self.top_state(base) {
                    Some(FrameState::Do { resume, iteration, .. }) => {
                        *iteration += 1;
                        Ok(Step::Next(*resume))
                    }
                    _ => Err(InterpreterError::internal("Loop frame vanished during 'while'.")),
                }
            }
            Keyword::Local => self.local(ci, items, pos, origin, images),
            Keyword::Onfail | Keyword::Endlocal => Err(unmatched(kw, Keyword::Local)),
            Keyword::Break | Keyword::Continue => self.leave_iteration(kw, base),
            Keyword::Return => Ok(Step::Exit(Flow::Return)),
            Keyword::Quit => Ok(Step::Exit(Flow::Quit)),
        }
    }

    fn enter_if(&mut self, items: &[Item], body: usize, origin: Option<DebugPos>) -> Result<Step, InterpreterError> {
        let (end, _) = scan(items, body, &[Keyword::Endif]).ok_or_else(|| missing_terminator(Keyword::If, origin))?;
        self.call_stack
            .push(Frame::new(FrameKind::If, origin).with_state(FrameState::If { end }))?;
        Ok(Step::Next(body))
    }

    /// Condition was false: find the branch to run.
    fn next_branch(
        &mut self,
        items: &[Item],
        mut from: usize,
        origin: Option<DebugPos>,
        images: &mut ImageList,
    ) -> Result<Step, InterpreterError> {
        loop {
            let (p, kw) = scan(items, from, &[Keyword::Elif, Keyword::Else, Keyword::Endif])
                .ok_or_else(|| missing_terminator(Keyword::If, origin))?;
            match kw {
                Keyword::Else => return self.enter_if(items, p + 1, origin),
                Keyword::Elif => {
                    let cond = self.argument(items, p, images)?;
                    if self.condition(&cond, images)? {
                        return self.enter_if(items, p + 2, origin);
                    }
                    from = p + 2;
                }
                _ => return Ok(Step::Next(p + 1)),
            }
        }
    }

    fn enter_repeat(
        &mut self,
        items: &[Item],
        pos: usize,
        origin: Option<DebugPos>,
        images: &mut ImageList,
    ) -> Result<Step, InterpreterError> {
        let arg = self.argument(items, pos, images)?;
        let parts = builtins::split_args(&arg);
        let count_text = literal(&parts[0]);
        let count = match count_text.trim() {
            "inf" | "+inf" => None,
            t => {
                let x = match parse_number(t) {
                    Some(x) => x,
                    None => {
                        let last = images.len().checked_sub(1);
                        Scope { interp: self, images }.evaluate(t, last)?.as_scalar()
                    }
                };
                if x.is_infinite() && x > 0.0 {
                    None
                } else if x.is_nan() || x < 1.0 {
                    Some(0)
                } else {
                    Some(x.floor() as u64)
                }
            }
        };
        let (end, _) =
            scan(items, pos + 2, &[Keyword::Done]).ok_or_else(|| missing_terminator(Keyword::Repeat, origin))?;
        if count == Some(0) {
            return Ok(Step::Next(end + 1));
        }
        let var = parts.get(1).map(|v| literal(v).trim().to_owned()).filter(|v| !v.is_empty());
        if let Some(var) = &var {
            self.vars.set(var, "0", VarOp::Assign)?;
        }
        self.call_stack.push(Frame::new(FrameKind::Repeat, origin).with_state(FrameState::Repeat {
            resume: pos + 2,
            end,
            remaining: count.map(|c| c - 1),
            iteration: 0,
            var,
        }))?;
        Ok(Step::Next(pos + 2))
    }

    /// `break` / `continue`: unwind `if` frames up to the innermost loop.
    fn leave_iteration(&mut self, kw: Keyword, base: usize) -> Result<Step, InterpreterError> {
        loop {
            if self.call_stack.len() <= base {
                let enclosing = base.checked_sub(1).and_then(|i| self.call_stack.frames().get(i));
                return match enclosing.map(|f| &f.kind) {
                    Some(FrameKind::Local | FrameKind::Thread) => Ok(Step::Exit(if kw == Keyword::Break {
                        Flow::Break
                    } else {
                        Flow::Continue
                    })),
                    _ => Err(InterpreterError::syntax("No loop to leave.").with_command(kw.name())),
                };
            }
            let state = self.call_stack.top().map(|f| f.state.clone());
            match state {
                Some(FrameState::Repeat { end, .. }) | Some(FrameState::Do { end, .. }) if kw == Keyword::Continue => {
                    return Ok(Step::Next(end));
                }
                Some(FrameState::Repeat { end, .. }) => {
                    self.call_stack.pop();
                    return Ok(Step::Next(end + 1));
                }
                Some(FrameState::Do { end, .. }) => {
                    self.call_stack.pop();
                    return Ok(Step::Next(end + 2));
                }
                Some(FrameState::If { .. }) => {
                    self.call_stack.pop();
                }
                _ => return Err(InterpreterError::internal("Unexpected frame while leaving a loop.")),
            }
        }
    }

    /// `local[sel] … [onfail …] endlocal`
    fn local(
        &mut self,
        ci: &CommandItem,
        items: &[Item],
        pos: usize,
        origin: Option<DebugPos>,
        images: &mut ImageList,
    ) -> Result<Step, InterpreterError> {
        let (end, _) =
            scan(items, pos + 1, &[Keyword::Endlocal]).ok_or_else(|| missing_terminator(Keyword::Local, origin))?;
        let onfail = scan(items, pos + 1, &[Keyword::Onfail, Keyword::Endlocal])
            .filter(|(_, kw)| *kw == Keyword::Onfail)
            .map(|(p, _)| p);
        let body_end = onfail.unwrap_or(end);

        let selection = self.selection(ci, images, true)?;
        let (positions, mut sub) = images.extract(&selection);
        let depth = self.call_stack.len();
        let pushed = self
            .call_stack
            .push(Frame::new(FrameKind::Local, origin).with_state(FrameState::Local { end }));
        let result = pushed.and_then(|()| self.run_items(&items[pos + 1..body_end], &mut sub));
        self.call_stack.truncate(depth);
        images.merge_back(&positions, sub);

        match result {
            Ok(Flow::Normal | Flow::Break | Flow::Continue) => Ok(Step::Next(end + 1)),
            Ok(flow) => Ok(Step::Exit(flow)),
            Err(e) if e.kind.is_fatal() => Err(e),
            Err(e) => {
                let Some(p) = onfail else {
                    return Err(e);
                };
                tracing::debug!(error = %e.message, "local block failed, running onfail");
                self.status = e.message.clone();
                self.call_stack
                    .push(Frame::new(FrameKind::Local, origin).with_state(FrameState::Local { end }))?;
                let recovered = self.run_items(&items[p + 1..end], images);
                self.call_stack.truncate(depth);
                match recovered? {
                    Flow::Normal | Flow::Break | Flow::Continue => Ok(Step::Next(end + 1)),
                    flow => Ok(Step::Exit(flow)),
                }
            }
        }
    }

    // ── Custom commands ────────────────────────────────────────────────────

    fn invoke(
        &mut self,
        cmd: Arc<CustomCommand>,
        ci: &CommandItem,
        items: &[Item],
        pos: usize,
        images: &mut ImageList,
    ) -> Result<Step, InterpreterError> {
        let mut next = pos + 1;
        let mut args = Vec::new();
        if cmd.has_arguments && pos + 1 < items.len() {
            args = builtins::split_args(&self.argument(items, pos, images)?);
            next += 1;
        }
        let selection = self.selection(ci, images, true)?;
        tracing::debug!(command = %cmd.name, ?selection, nargs = args.len(), "invoke custom command");

        let bound = bind_arguments(&cmd.body, &args, &cmd.name)?;
        let body = tokenize(&bound.body)?;

        let (positions, mut sub) = if ci.prefix == Prefix::Plus {
            (Vec::new(), images.share_copies(&selection)?)
        } else {
            images.extract(&selection)
        };

        let depth = self.call_stack.len();
        let origin = items[pos].debug.or(self.position);
        let result = self
            .call_stack
            .push(Frame::new(FrameKind::Command(cmd.name.clone()), origin))
            .and_then(|()| {
                self.vars.push_scope();
                let run = bound
                    .variables
                    .iter()
                    .try_for_each(|(name, value)| self.vars.set(name, value, VarOp::Assign).map(|_| ()))
                    .and_then(|()| self.run_items(&body, &mut sub));
                self.vars.pop_scope();
                run
            });
        self.call_stack.truncate(depth);

        if ci.prefix == Prefix::Plus {
            images.append(sub);
        } else {
            images.merge_back(&positions, sub);
        }
        match result? {
            Flow::Quit => Ok(Step::Exit(Flow::Quit)),
            Flow::Abort => Ok(Step::Exit(Flow::Abort)),
            _ => Ok(Step::Next(next)),
        }
    }

    // ── Image operations ───────────────────────────────────────────────────

    fn operation(
        &mut self,
        form: ArgForm,
        ci: &CommandItem,
        items: &[Item],
        pos: usize,
        images: &mut ImageList,
    ) -> Result<Step, InterpreterError> {
        let mut next = pos + 1;
        let arg: Option<(ArgKind, String)> = match form {
            ArgForm::None => None,
            ArgForm::Required(kind) => {
                next += 1;
                Some((kind, self.argument(items, pos, images)?))
            }
            ArgForm::Optional(kind) => match items.get(pos + 1) {
                Some(item) => {
                    let text = self.expand_text(&item.text, images)?;
                    if builtins::accepts(kind, &text) && !self.is_command_name(&text) {
                        next += 1;
                        Some((kind, text))
                    } else {
                        None
                    }
                }
                None => None,
            },
        };

        let args = match &arg {
            Some((kind, text)) => {
                let n = images.len();
                let names = &images.names;
                builtins::parse_op_args(*kind, text, &mut |spec| single_image(spec, n, names))?
            }
            None => Vec::new(),
        };

        let mut selection = self.selection(ci, images, true)?;
        if ci.prefix == Prefix::Plus {
            let copies = images.share_copies(&selection)?;
            let start = images.len();
            images.append(copies);
            selection = (start..images.len()).collect();
        }
        tracing::debug!(op = %ci.name, ?selection, "apply operation");
        self.library
            .apply_operation(&ci.name, &selection, &args, &mut images.slots, &mut images.names)?;
        Ok(Step::Next(next))
    }

    // ── Core commands ──────────────────────────────────────────────────────

    fn core(
        &mut self,
        cmd: CoreCmd,
        ci: &CommandItem,
        items: &[Item],
        pos: usize,
        images: &mut ImageList,
    ) -> Result<Step, InterpreterError> {
        let (arg, next) = if cmd.takes_argument() {
            (self.argument(items, pos, images)?, pos + 2)
        } else {
            (String::new(), pos + 1)
        };
        let selection = self.selection(ci, images, cmd.selects_all_by_default())?;

        match cmd {
            CoreCmd::Echo => {
                if self.verbosity >= 0 {
                    self.console_line(literal(&arg));
                }
            }
            CoreCmd::Warn => {
                let msg = literal(&arg);
                tracing::warn!(message = %msg, "script warning");
                if self.verbosity >= 0 {
                    self.console_line(format!("*** Warning in {} *** {msg}", self.call_stack.render()));
                }
            }
            CoreCmd::Error => return Err(InterpreterError::new(ErrorKind::User, literal(&arg))),
            CoreCmd::Status => self.status = literal(&arg),
            CoreCmd::Verbose => {
                let t = literal(&arg);
                self.verbosity = match t.trim() {
                    "+" => self.verbosity + 1,
                    "-" => self.verbosity - 1,
                    v => parse_number(v)
                        .map(|x| x as i32)
                        .ok_or_else(|| InterpreterError::argument(format!("Invalid argument '{v}'.")))?,
                };
            }
            CoreCmd::Command => {
                let t = literal(&arg);
                let path = std::path::Path::new(t.trim());
                let (text, source) = if path.is_file() {
                    let text = config::read_command_file(path)
                        .map_err(|e| InterpreterError::argument(format!("Cannot read '{}': {e}.", path.display())))?;
                    (text, path.display().to_string())
                } else {
                    (t, "(script)".to_owned())
                };
                let defined = self.registry_mut().load(&text, &source);
                tracing::debug!(defined, %source, "loaded custom commands");
            }
            CoreCmd::Uncommand => {
                let mut registry = self.registry_mut();
                for name in builtins::split_args(&literal(&arg)) {
                    match name.trim() {
                        "*" => {
                            registry.undefine_all();
                        }
                        n => {
                            registry.undefine(n);
                        }
                    }
                }
            }
            CoreCmd::Input => {
                let args = [OpArg::Text(literal(&arg))];
                self.library
                    .apply_operation("input", &selection, &args, &mut images.slots, &mut images.names)?;
            }
            CoreCmd::Remove => images.remove(&selection)?,
            CoreCmd::Keep => images.keep(&selection)?,
            CoreCmd::Move => {
                let t = literal(&arg);
                let p = parse_number(&t)
                    .ok_or_else(|| InterpreterError::argument(format!("Invalid argument '{t}'.")))?
                    as i64;
                let n = images.len() as i64;
                let target = (if p < 0 { p + n + 1 } else { p }).clamp(0, n) as usize;
                let (positions, sub) = images.extract(&selection);
                let before = positions.iter().filter(|&&q| q < target).count();
                images.insert_at(target - before, sub);
            }
            CoreCmd::Name => {
                let names: Vec<String> = builtins::split_args(&arg).iter().map(|s| literal(s)).collect();
                if names.len() != 1 && names.len() != selection.len() {
                    return Err(InterpreterError::argument(format!(
                        "Cannot give {} names to {} images.",
                        names.len(),
                        selection.len()
                    )));
                }
                for (k, &i) in selection.iter().enumerate() {
                    images.names[i] = names[if names.len() == 1 { 0 } else { k }].clone();
                }
            }
            CoreCmd::Reverse => images.reverse(&selection),
            CoreCmd::Check => {
                if !self.condition(&arg, images)? {
                    return Err(InterpreterError::argument(format!("Expression '{}' is false.", literal(&arg))));
                }
            }
            CoreCmd::Skip => {}
            CoreCmd::Parallel => self.parallel(&arg, images)?,
            CoreCmd::Wait => {
                let groups = self.detached.split_off(self.detached_base.min(self.detached.len()));
                settle(groups, images, false)?;
            }
        }
        Ok(Step::Next(next))
    }

    // ── Parallel ───────────────────────────────────────────────────────────

    fn parallel(&mut self, arg: &str, images: &mut ImageList) -> Result<(), InterpreterError> {
        let mut parts = builtins::split_args(arg);
        let wait = match parts.first().map(|p| p.trim()) {
            Some("0") if parts.len() > 1 => {
                parts.remove(0);
                false
            }
            Some("1") if parts.len() > 1 => {
                parts.remove(0);
                true
            }
            _ => true,
        };
        let fragments: Vec<String> = parts.iter().map(|p| parallel::unquote(p)).collect();
        let group = parallel::spawn(self, fragments, images)?;
        if wait {
            group.join(images)
        } else {
            self.detached.push(group);
            Ok(())
        }
    }

    /// Join (or cancel, after an error) the groups detached in this scope.
    fn finish_detached(&mut self, images: &mut ImageList, failed: bool) -> Result<(), InterpreterError> {
        let groups = self.detached.split_off(self.detached_base.min(self.detached.len()));
        settle(groups, images, failed)
    }
}

/// Join detached groups in order; once one fails, the rest are cancelled.
fn settle(groups: Vec<Pending>, images: &mut ImageList, mut cancel: bool) -> Result<(), InterpreterError> {
    let mut first = Ok(());
    for group in groups {
        if cancel {
            group.cancel(images);
        } else if let Err(e) = group.join(images) {
            first = Err(e);
            cancel = true;
        }
    }
    first
}

fn unmatched(kw: Keyword, opener: Keyword) -> InterpreterError {
    InterpreterError::syntax(format!("No associated '-{}' command.", opener.name())).with_command(kw.name())
}

/// Resolve an `[…]` argument to exactly one image.
fn single_image(spec: &str, n: usize, names: &[String]) -> Result<usize, InterpreterError> {
    match resolve(spec, n, names, false)?.as_slice() {
        [i] => Ok(*i),
        _ => Err(InterpreterError::argument(format!("Selection '[{spec}]' must designate one image."))),
    }
}

// ── Scope ─────────────────────────────────────────────────────────────────────

/// The interpreter together with the images it currently works on.
struct Scope<'a> {
    interp: &'a mut Interpreter,
    images: &'a mut ImageList,
}

impl ExpandContext for Scope<'_> {
    fn variable(&self, name: &str) -> Option<String> {
        self.interp.vars.get(name)
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn image_names(&self) -> &[String] {
        &self.images.names
    }

    fn image(&self, index: usize) -> Result<&Image, InterpreterError> {
        Ok(self.images.image(index)?)
    }

    fn verbosity(&self) -> i32 {
        self.interp.verbosity
    }

    fn elapsed(&self) -> f64 {
        self.interp.start.elapsed().as_secs_f64()
    }

    fn call_stack(&self) -> String {
        self.interp.call_stack.render()
    }

    fn call_path(&self) -> String {
        self.interp.call_stack.path()
    }

    fn loop_indices(&self) -> Option<(u64, i64)> {
        self.interp.call_stack.loop_indices()
    }

    fn evaluate(&mut self, expr: &str, image: Option<usize>) -> Result<Value, InterpreterError> {
        let ctx = ExprContext {
            image: image.and_then(|i| self.images.image(i).ok()),
            image_count: self.images.len(),
        };
        self.interp
            .library
            .evaluate_expression(expr, &ctx)
            .map_err(|e| InterpreterError::argument(format!("Invalid expression '{expr}': {e}.")))
    }

    fn run_subscript(&mut self, script: &str) -> Result<String, InterpreterError> {
        self.interp.run_substitution(script, self.images)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn run(script: &str) -> (Interpreter, ImageList) {
        let mut interp = Interpreter::new();
        let mut images = ImageList::new();
        interp.run(script, &mut images).unwrap();
        (interp, images)
    }

    fn value(images: &ImageList, i: usize) -> f32 {
        images.image(i).unwrap().data()[0]
    }

    fn run_err(script: &str) -> InterpreterError {
        Interpreter::new().run(script, &mut ImageList::new()).unwrap_err()
    }

    #[test]
    fn repeat_adds() {
        let (_, images) = run("(0) repeat 3 add 1 done");
        assert_eq!(value(&images, 0), 3.0);
    }

    #[test]
    fn if_else_branches() {
        let (_, images) = run("(0) if 0 add 1 else add 2 endif");
        assert_eq!(value(&images, 0), 2.0);
        let (_, images) = run("(0) if 0 add 1 elif 1 add 5 else add 2 endif");
        assert_eq!(value(&images, 0), 5.0);
        let (_, images) = run("(0) if 1 add 1 elif 1 add 5 else add 2 endif add 10");
        assert_eq!(value(&images, 0), 11.0);
    }

    #[test]
    fn repeat_variable_and_loop_index() {
        let (interp, _) = run("s=0 repeat 4,k s+=$k done t=0 repeat 2 t+=$> done");
        assert_eq!(interp.variables().get("s").as_deref(), Some("6"));
        assert_eq!(interp.variables().get("t").as_deref(), Some("1"));
    }

    #[test]
    fn repeat_zero_skips_body() {
        let (_, images) = run("(0) repeat 0 add 1 done");
        assert_eq!(value(&images, 0), 0.0);
    }

    #[test]
    fn do_while_loops() {
        let (interp, _) = run("i=0 do i+=1 while {$i<5}");
        assert_eq!(interp.variables().get("i").as_deref(), Some("5"));
    }

    #[test]
    fn break_and_continue() {
        let (interp, _) = run("n=0 repeat inf n+=1 if {$n==4} break endif done");
        assert_eq!(interp.variables().get("n").as_deref(), Some("4"));
        let (interp, _) = run("n=0 repeat 5 if {$>%2} continue endif n+=1 done");
        assert_eq!(interp.variables().get("n").as_deref(), Some("3"));
    }

    #[test]
    fn break_outside_loop_is_error() {
        assert_eq!(run_err("break").kind, ErrorKind::Syntax);
    }

    #[test]
    fn unmatched_blocks_name_terminator() {
        let err = run_err("repeat 3 echo x");
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert!(err.message.contains("-done"));
        let err = run_err("if 1 echo x");
        assert!(err.message.contains("-endif"));
        let err = run_err("done");
        assert_eq!(err.kind, ErrorKind::Syntax);
        let err = run_err("endif");
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[test]
    fn custom_command_with_defaults() {
        let mut interp = Interpreter::new();
        interp.load_commands("greet : status ${1=foo},$#", "test");
        interp.run("greet", &mut ImageList::new()).unwrap();
        assert_eq!(interp.status(), "foo,1");
        interp.run("greet bar", &mut ImageList::new()).unwrap();
        assert_eq!(interp.status(), "bar,1");
    }

    #[test]
    fn custom_command_runs_on_selection() {
        let mut interp = Interpreter::new();
        interp.load_commands("inc : add 1", "test");
        let mut images = ImageList::new();
        interp.run("(0) (10) (20) inc[0,2]", &mut images).unwrap();
        assert_eq!((value(&images, 0), value(&images, 1), value(&images, 2)), (1.0, 10.0, 21.0));
    }

    #[test]
    fn locals_are_scoped() {
        let mut interp = Interpreter::new();
        interp.load_commands("setx : x=inner _g=global", "test");
        let mut images = ImageList::new();
        interp.run("x=outer setx", &mut images).unwrap();
        assert_eq!(interp.variables().get("x").as_deref(), Some("outer"));
        assert_eq!(interp.variables().get("_g").as_deref(), Some("global"));
    }

    #[test]
    fn return_ends_command_only() {
        let mut interp = Interpreter::new();
        interp.load_commands("early : status a return status b", "test");
        interp.run("early status {'x'}", &mut ImageList::new()).unwrap();
        assert_eq!(interp.status(), "120");
    }

    #[test]
    fn plus_prefix_appends_copies() {
        let (_, images) = run("(1) +add 1");
        assert_eq!(images.len(), 2);
        assert_eq!((value(&images, 0), value(&images, 1)), (1.0, 2.0));
    }

    #[test]
    fn local_onfail_recovers() {
        let (interp, images) = run("(0) local error oops onfail add 5 endlocal");
        assert_eq!(interp.status(), "oops");
        assert_eq!(value(&images, 0), 5.0);
    }

    #[test]
    fn local_without_onfail_reraises() {
        let err = run_err("local error oops endlocal");
        assert_eq!(err.kind, ErrorKind::User);
        assert!(err.rendered().contains("*local"));
    }

    #[test]
    fn unknown_command_suggests() {
        let err = run_err("(0) ad 1");
        assert_eq!(err.kind, ErrorKind::UnknownCommand);
        assert_eq!(err.suggestion.as_deref(), Some("add"));
    }

    #[test]
    fn errors_carry_stack_and_command() {
        let mut interp = Interpreter::new();
        interp.load_commands("outer : inner\ninner : error boom", "lib.ims");
        let err = interp.run("outer", &mut ImageList::new()).unwrap_err();
        assert_eq!(err.command, "error");
        assert_eq!(err.call_stack.as_deref(), Some("./outer/inner/"));
        assert_eq!(err.location.as_ref().map(|l| l.file.as_str()), Some("lib.ims"));
        assert!(err.rendered().starts_with("*** Error in ./outer/inner/"));
    }

    #[test]
    fn recursion_hits_depth_limit() {
        let config = Config { max_call_depth: 8, ..Config::default() };
        let mut interp = Interpreter::with_library(Arc::new(BasicLibrary::new()), &config);
        interp.load_commands("loop : loop", "test");
        let err = interp.run("loop", &mut ImageList::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn onfail_does_not_catch_overflow() {
        let config = Config { max_call_depth: 8, ..Config::default() };
        let mut interp = Interpreter::with_library(Arc::new(BasicLibrary::new()), &config);
        interp.load_commands("forever : forever", "test");
        let err = interp
            .run("local forever onfail status caught endlocal", &mut ImageList::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
        assert_eq!(interp.status(), "");
    }

    #[test]
    fn negative_subset_argument_is_consumed() {
        let mut interp = Interpreter::new();
        interp.load_commands("last : status ${-1}", "test");
        interp.run("last a,b", &mut ImageList::new()).unwrap();
        assert_eq!(interp.status(), "b");
    }

    #[test]
    fn image_management_commands() {
        let (_, images) = run("(0) (1) (2) (3) remove[1] reverse move[0] -1 name[-1] last");
        let got: Vec<f32> = (0..images.len()).map(|i| value(&images, i)).collect();
        assert_eq!(got, vec![2.0, 0.0, 3.0]);
        assert_eq!(images.name(2), Some("last"));
        let (_, images) = run("(0) (1) (2) keep[1]");
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn echo_and_substitution() {
        let (interp, _) = run("(5) echo \"n=$! v={0,^}\"");
        assert_eq!(interp.take_output(), vec!["n=1 v=5"]);
    }

    #[test]
    fn subscript_substitutes_status() {
        let (interp, _) = run("x=${\"status hello\"}");
        assert_eq!(interp.variables().get("x").as_deref(), Some("hello"));
    }

    #[test]
    fn quit_stops_run() {
        let mut interp = Interpreter::new();
        let mut images = ImageList::new();
        let status = interp.run("(0) quit add 1", &mut images).unwrap();
        assert_eq!(status, RunStatus::Quit);
        assert_eq!(value(&images, 0), 0.0);
    }

    #[test]
    fn abort_flag_stops_run() {
        let mut interp = Interpreter::new();
        interp.abort_handle().store(true, Ordering::Relaxed);
        let status = interp.run("repeat inf done", &mut ImageList::new()).unwrap();
        assert_eq!(status, RunStatus::Aborted);
    }

    #[test]
    fn check_fails_on_false() {
        assert_eq!(run_err("check 0").kind, ErrorKind::Argument);
    }
}
