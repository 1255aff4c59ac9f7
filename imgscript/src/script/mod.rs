//! The script language.
//!
//! - [`lexer`]: raw text to items, escapes and debug markers
//! - [`selection`]: `[0,2-4]`, `50%`, labels, inversion
//! - [`expand`]: `$…` and `{…}` substitution, argument binding
//! - [`builtins`]: keyword / core command / operation table
//! - [`callstack`]: frames and block matching
//! - [`interp`]: the dispatcher
//! - [`parallel`]: `parallel` threads
//!
//! # Quick start
//!
//! ```rust
//! use imgscript::image::ImageList;
//! use imgscript::script::Interpreter;
//!
//! let mut interp = Interpreter::new();
//! let mut images = ImageList::new();
//! interp.run("(0) repeat 3 add 1 done echo {0,^}", &mut images).unwrap();
//! assert_eq!(interp.take_output(), vec!["3"]);
//! ```

pub mod builtins;
pub mod callstack;
pub mod expand;
pub mod interp;
pub mod lexer;
pub mod parallel;
pub mod selection;
pub mod value;

pub use expand::ExpandContext;
pub use interp::{Interpreter, RunStatus};
pub use value::Value;
