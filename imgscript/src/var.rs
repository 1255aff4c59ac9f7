//! Tiered variable store.
//!
//! | Name | Tier | Lifetime |
//! |------|------|----------|
//! | `foo` | local | current custom-command invocation |
//! | `_foo` | global | whole interpreter; copied into parallel threads |
//! | `__foo` | shared | shared by every parallel thread, behind a mutex |
//!
//! Values are always strings.  Numeric results of compound assignments are
//! formatted with [`format_number`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

use crate::error::InterpreterError;
use crate::script::value::{format_number, parse_number, ArithOp};

/// The `__` table shared between threads.
pub type SharedVars = Arc<Mutex<HashMap<String, String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Global,
    Shared,
}

impl Tier {
    pub fn of(name: &str) -> Tier {
        if name.starts_with("__") {
            Tier::Shared
        } else if name.starts_with('_') {
            Tier::Global
        } else {
            Tier::Local
        }
    }
}

/// How a value is combined with the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarOp {
    /// `=`: define or replace.
    Assign,
    /// `+=`, `<<=`, …
    Compound(ArithOp),
    /// `.=`
    Append,
    /// `..=`
    Prepend,
}

// ── Assignment items ──────────────────────────────────────────────────────────

/// A parsed `name<op>=value` item.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub names: Vec<String>,
    pub op: VarOp,
    pub value: String,
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)^([A-Za-z_][A-Za-z0-9_]*(?:,[A-Za-z_][A-Za-z0-9_]*)*)(<<|>>|\.\.|[-+*/%&|^.])?=(.*)$",
        )
        .expect("assignment regex is valid")
    })
}

/// Recognize an assignment item.  `x==3` is a comparison, not an
/// assignment.
pub fn parse_assignment(item: &str) -> Option<Assignment> {
    let caps = assignment_re().captures(item)?;
    let value = caps.get(3).map_or("", |m| m.as_str());
    if value.starts_with('=') {
        return None;
    }
    let op = match caps.get(2).map(|m| m.as_str()) {
        None => VarOp::Assign,
        Some(".") => VarOp::Append,
        Some("..") => VarOp::Prepend,
        Some(sym) => VarOp::Compound(ArithOp::from_symbol(sym)?),
    };
    Some(Assignment {
        names: caps[1].split(',').map(str::to_owned).collect(),
        op,
        value: value.to_owned(),
    })
}

// ── VariableStore ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VariableStore {
    scopes: Vec<HashMap<String, String>>,
    globals: HashMap<String, String>,
    shared: SharedVars,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        VariableStore {
            scopes: vec![HashMap::new()],
            globals: HashMap::new(),
            shared: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Store for a parallel thread: globals and the current locals by value,
    /// the `__` table by reference.
    pub fn fork(&self) -> Self {
        VariableStore {
            scopes: vec![self.scopes.last().cloned().unwrap_or_default()],
            globals: self.globals.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Enter a custom-command invocation.
    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Leave a custom-command invocation, dropping its locals.  The root
    /// scope is never popped.
    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        match Tier::of(name) {
            Tier::Local => self.scopes.last()?.get(name).cloned(),
            Tier::Global => self.globals.get(name).cloned(),
            Tier::Shared => lock(&self.shared).get(name).cloned(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Combine `value` into variable `name`; returns the stored value.
    pub fn set(&mut self, name: &str, value: &str, op: VarOp) -> Result<String, InterpreterError> {
        match Tier::of(name) {
            Tier::Shared => {
                let mut table = lock(&self.shared);
                let new = combine(name, table.get(name).map(String::as_str), value, op)?;
                table.insert(name.to_owned(), new.clone());
                Ok(new)
            }
            Tier::Global => {
                let new = combine(name, self.globals.get(name).map(String::as_str), value, op)?;
                self.globals.insert(name.to_owned(), new.clone());
                Ok(new)
            }
            Tier::Local => {
                if self.scopes.is_empty() {
                    self.scopes.push(HashMap::new());
                }
                let scope = self.scopes.len() - 1;
                let table = &mut self.scopes[scope];
                let new = combine(name, table.get(name).map(String::as_str), value, op)?;
                table.insert(name.to_owned(), new.clone());
                Ok(new)
            }
        }
    }

    /// Apply a parsed assignment.  With several names, the value is split
    /// on commas; a single value is given to every name.
    pub fn assign(&mut self, a: &Assignment) -> Result<(), InterpreterError> {
        if a.names.len() == 1 {
            self.set(&a.names[0], &a.value, a.op)?;
            return Ok(());
        }
        let values: Vec<&str> = a.value.split(',').collect();
        if values.len() != 1 && values.len() != a.names.len() {
            return Err(InterpreterError::argument(format!(
                "Cannot assign {} values to {} variables.",
                values.len(),
                a.names.len()
            )));
        }
        for (k, name) in a.names.iter().enumerate() {
            let v = if values.len() == 1 { values[0] } else { values[k] };
            self.set(name, v, a.op)?;
        }
        Ok(())
    }
}

fn lock(shared: &SharedVars) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn combine(name: &str, current: Option<&str>, value: &str, op: VarOp) -> Result<String, InterpreterError> {
    match op {
        VarOp::Assign => Ok(value.to_owned()),
        VarOp::Append => Ok(format!("{}{value}", current.unwrap_or(""))),
        VarOp::Prepend => Ok(format!("{value}{}", current.unwrap_or(""))),
        VarOp::Compound(arith) => {
            let cur = current.unwrap_or("");
            let a = parse_number(cur).ok_or_else(|| {
                InterpreterError::argument(format!(
                    "Variable '{name}' has non-numeric value '{cur}'."
                ))
            })?;
            let b = parse_number(value).ok_or_else(|| {
                InterpreterError::argument(format!("Non-numeric operand '{value}' for '{name}'."))
            })?;
            Ok(format_number(arith.apply(a, b)))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
