//! nanocc: a compiler for a large subset of C11, producing GNU-assembler
//! text for x86-64 (System V ABI).
//!
//! Compilation is a strictly staged pipeline; each stage consumes the
//! previous stage's output:
//!
//! 1. [`tokenize`]: source bytes to a token list, with per-token source
//!    coordinates and the `at_bol`/`has_space` flags the preprocessor needs.
//! 2. [`preprocess`]: token list to token list. Macro expansion uses
//!    Prosser's hideset algorithm, so it terminates on any input.
//! 3. [`parse`]: token list to a [`Program`](types::ast::Program) of global
//!    variables and functions, each with a fully typed AST body.
//! 4. [`codegen`]: the program to assembly text, evaluated against a fixed
//!    bank of integer and floating registers used as an expression stack.
//!
//! The driver binary wires the stages together, handles `-E`/`-M` style
//! output modes, and runs the external assembler.

pub mod symbol;
pub mod tokenize;
pub mod preprocess;
pub mod types;
pub mod parse;
pub mod codegen;

use std::fmt;

pub use symbol::{Symbol, intern};
pub use tokenize::{SourceFile, Token, TokenKind};
pub use types::ast::Program;

/// A compilation error: a fully rendered diagnostic, ready to print.
///
/// Diagnostics that point at source carry the `file:line:` prefix, the
/// offending line, and a caret marker; file-level errors are a bare message.
/// Compilation stops at the first error.
#[derive(Clone)]
pub struct Error(String);

impl Error {
  /// Construct an error from a plain message with no source location.
  #[must_use] pub fn msg(msg: impl Into<String>) -> Self { Self(msg.into()) }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl fmt::Debug for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
  fn from(e: std::io::Error) -> Self { Error::msg(format!("write failed: {e}")) }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration shared by the pipeline stages.
#[derive(Clone, Debug)]
pub struct Options {
  /// `#include <...>` search directories, in order.
  pub include_paths: Vec<std::path::PathBuf>,
  /// Position-independent addressing for globals and calls (`-fpic`,
  /// the default) versus absolute addressing (`-fno-pic`).
  pub pic: bool,
}

impl Default for Options {
  fn default() -> Self {
    Options { include_paths: vec![], pic: true }
  }
}
