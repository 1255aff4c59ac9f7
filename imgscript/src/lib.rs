//! `imgscript`: an interpreter for a small image-processing script language.
//!
//! Scripts are lists of items naming an operation, an optional image
//! selection and arguments.  The [`script::Interpreter`] runs them against an
//! [`image::ImageList`]; pixel work is delegated to an
//! [`image::ImageLibrary`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod image;
pub mod script;
pub mod var;

pub use error::{ErrorKind, InterpreterError};
