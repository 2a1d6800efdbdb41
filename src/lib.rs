//! A variability-aware C preprocessor.
//!
//! `brackish` performs the lexing, macro expansion, and
//! conditional-compilation resolution a C compiler's preprocessing phase
//! does, with one difference: the branch an `#if` does not take is never
//! deleted. Every token in the output carries a *presence condition* — a
//! boolean formula over "macro M is defined" and "expression E is nonzero"
//! propositions — describing exactly which configurations include it.
//! Downstream tools can then analyze every variant of a codebase from a
//! single pass instead of re-preprocessing per configuration.
//!
//! ```
//! use brackish::PreProcessorBuilder;
//!
//! let src = "#ifdef FAST\nint shift(int x) { return x << 1; }\n#endif\n";
//! let mut cpp = PreProcessorBuilder::new(src).filename("example.c").build();
//! for token in &mut cpp {
//!     // tokens from the #ifdef arrive here, tagged with `defined(FAST)`
//!     assert!(token.is_ok());
//! }
//! ```

#![allow(clippy::cognitive_complexity)]
#![warn(absolute_paths_not_starting_with_crate)]
#![warn(explicit_outlives_requirements)]
#![warn(unreachable_pub)]
#![warn(deprecated_in_future)]
#![deny(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use arcstr::ArcStr;
pub use codespan;

/// The `Source` type for `codespan::Files`.
///
/// Used to store extra metadata about the file, like the absolute filename.
///
/// NOTE: If `path` is empty (e.g. by using `my_string.into()`),
/// then the path will be relative to the _current directory_, not to the
/// including file. This is recommended only for test code and proofs of
/// concept, since it does not adhere to the C standard.
#[derive(Debug, Clone)]
pub struct Source {
    pub code: ArcStr,
    pub path: PathBuf,
}

impl AsRef<str> for Source {
    fn as_ref(&self) -> &str {
        self.code.as_ref()
    }
}

pub type Files = codespan::Files<Source>;

pub use cond::{Cond, CondArena, CondId};
pub use data::*;
// https://github.com/rust-lang/rust/issues/64762
#[allow(unreachable_pub)]
pub use lex::{Definition, Definitions, Lexer, PreProcessor, PreProcessorBuilder};

#[macro_use]
mod macros;
pub mod cond;
pub mod data;
pub mod intern;
mod lex;

/// Options for a preprocessing run.
#[derive(Debug, Default)]
pub struct Opt {
    /// Trace each token as it is lexed, before replacement.
    pub debug_lex: bool,
    /// The directories to search for `#include`d files, in order.
    pub search_path: Vec<PathBuf>,
    /// Macros defined before the first line, e.g. from `-D` flags.
    pub definitions: Definitions,
    /// The maximum number of errors to report before giving up.
    pub max_errors: Option<NonZeroUsize>,
}

/// Everything a preprocessing run produced.
///
/// Recoverable errors do not stop the run, so `tokens`, `errors`, and
/// `warnings` can all be non-empty at once; a partially-broken file still
/// gets its surviving tokens described.
pub struct Program {
    /// The annotated output stream.
    pub tokens: Vec<PpToken>,
    /// The formulas `tokens` refer to.
    pub conditions: CondArena,
    /// Every error encountered, in source order.
    pub errors: VecDeque<CompileError>,
    /// Every warning encountered.
    pub warnings: VecDeque<CompileWarning>,
    /// All files read, including `#include`s.
    pub files: Files,
}

/// Run the preprocessor over a single source buffer.
///
/// This is the one-stop API: drive [`PreProcessorBuilder`] directly if you
/// need streaming output or want to interleave condition queries.
pub fn preprocess(buf: &str, opt: Opt, filename: impl Into<std::ffi::OsString>) -> Program {
    let max_errors = opt.max_errors;
    let mut builder = PreProcessorBuilder::new(arcstr::ArcStr::from(buf.to_owned()))
        .filename(filename.into())
        .debug(opt.debug_lex);
    for dir in opt.search_path {
        builder = builder.search_path(dir);
    }
    for (name, def) in opt.definitions {
        builder = builder.definition(name, def);
    }
    let mut cpp = builder.build();

    let mut tokens = Vec::new();
    let mut errors = VecDeque::new();
    for result in &mut cpp {
        match result {
            Ok(token) => tokens.push(token),
            Err(err) => errors.push_back(err),
        }
        if let Some(max) = max_errors {
            if errors.len() >= max.get() {
                break;
            }
        }
    }
    let warnings = cpp.warnings();
    cpp.into_program(tokens, errors, warnings)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{}", .0.iter().map(|err| err.data.to_string()).collect::<Vec<_>>().join("\n"))]
    Source(VecDeque<CompileError>),

    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Error {
        Error::Source(vec_deque![err])
    }
}

impl From<VecDeque<CompileError>> for Error {
    fn from(errs: VecDeque<CompileError>) -> Self {
        Error::Source(errs)
    }
}
