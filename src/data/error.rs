use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use super::lex::{Locatable, Location, Token};
use crate::intern::InternedStr;

pub type CompileResult<T> = Result<T, CompileError>;
pub type CompileError = Locatable<Error>;
pub type CompileWarning = Locatable<Warning>;

/// A structured diagnostic sink.
///
/// Recoverable errors and warnings are collected here with their positions
/// instead of aborting, so a single pass over a file reports every issue
/// found. The preprocessor drains `errors` into its output stream and
/// exposes `warnings` through `PreProcessor::warnings()`.
#[derive(Debug)]
pub struct ErrorHandler<T = Error> {
    errors: VecDeque<Locatable<T>>,
    pub warnings: VecDeque<CompileWarning>,
}

impl<T> Default for ErrorHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ErrorHandler<T> {
    pub fn new() -> Self {
        ErrorHandler {
            errors: VecDeque::new(),
            warnings: VecDeque::new(),
        }
    }

    pub fn push_back<E: Into<Locatable<T>>>(&mut self, error: E) {
        self.errors.push_back(error.into());
    }

    pub fn pop_front(&mut self) -> Option<Locatable<T>> {
        self.errors.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn warn<W: Into<Warning>>(&mut self, warning: W, location: Location) {
        self.warnings.push_back(location.with(warning.into()));
    }

    /// Move another handler's diagnostics to the back of this queue.
    pub fn append<S: Into<T>>(&mut self, other: &mut ErrorHandler<S>) {
        self.errors
            .extend(other.errors.drain(..).map(|e| e.map(Into::into)));
        self.warnings.append(&mut other.warnings);
    }
}

impl ErrorHandler<Error> {
    pub fn error<E: Into<Error>>(&mut self, error: E, location: Location) {
        self.errors.push_back(location.with(error.into()));
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid token: {0}")]
    Lex(#[from] LexError),

    #[error("invalid preprocessing directive: {0}")]
    PreProcessor(#[from] CppError),
}

/// Errors from the tokenizer.
///
/// These are all recoverable: the lexer reports them and resynchronizes at
/// the next line.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated /* comment")]
    UnterminatedComment,

    #[error("missing terminating {} character", if *(.string) { '"' } else { '\'' })]
    MissingEndQuote { string: bool },

    #[error("illegal newline while parsing string literal")]
    NewlineInString,

    #[error("illegal newline while parsing char literal")]
    NewlineInChar,

    #[error("empty character constant")]
    EmptyChar,

    #[error("missing digits after {0} prefix")]
    MissingDigits(Radix),

    #[error("exponent for floating literal has no digits")]
    ExponentMissingDigits,

    #[error("unknown token {0:?}")]
    UnknownToken(char),

    #[error("no newline at end of file")]
    NoNewlineAtEOF,
}

/// Errors from the preprocessor proper: directives, macro expansion, and
/// `#if` evaluation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CppError {
    /// A `#foo` where `foo` is not a known directive
    #[error("invalid preprocessing directive")]
    InvalidDirective,

    /// A token such as `#1`, or a directive operand of the wrong shape
    #[error("expected {0}, got {1}")]
    UnexpectedToken(&'static str, Token),

    /// The file ended before a directive was complete
    #[error("expected {0}, got <end-of-file>")]
    EndOfFile(&'static str),

    #[error("expected {0} for {1}")]
    Expected(&'static str, &'static str),

    /// An `#if` chain left open at the end of the file. Structural, fatal
    /// to the current file.
    #[error("#if is never terminated")]
    UnterminatedIf,

    /// `#elif` before `#if` or after `#else`. Structural.
    #[error("{}", if *(.early) { "#elif without preceding #if" } else { "#elif after #else" })]
    UnexpectedElif { early: bool },

    /// `#else` before `#if` or after another `#else`. Structural.
    #[error("#else without matching #if")]
    UnexpectedElse,

    /// `#endif` with no open conditional. Structural.
    #[error("#endif without matching #if")]
    UnexpectedEndIf,

    #[error("macro name missing")]
    EmptyDefine,

    #[error("expected macro name")]
    ExpectedMacroId,

    /// `#if` with no tokens before the newline
    #[error("#if with no expression")]
    EmptyExpression,

    /// Tokens left over after parsing a `#if` expression
    #[error("trailing tokens in #if expression")]
    TooManyTokens,

    /// Division or modulo by zero while evaluating a conditional.
    /// The branch is treated as false.
    #[error("division by zero in #if expression")]
    DivisionByZero,

    /// Arity mismatch for a function-like macro.
    /// The invocation passes through unexpanded.
    #[error("macro invoked with {0} arguments, but it takes {1}")]
    TooFewArguments(usize, usize),

    /// `##` produced something that is not a single token.
    /// The invocation passes through unexpanded.
    #[error("pasting formed {0:?}, an invalid preprocessing token")]
    InvalidPaste(String),

    /// `#` in a macro body not followed by a parameter name
    #[error("'#' is not followed by a macro parameter")]
    InvalidStringify,

    #[error("empty filename in #include")]
    EmptyInclude,

    /// Non-fatal: the directive is skipped and processing continues.
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("io error: {0}")]
    IO(String),

    /// A `#error` directive
    #[error("#error {}", join_tokens(.0))]
    User(Vec<Token>),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Warning {
    #[error("{0}")]
    Generic(String),

    #[error("ignoring #pragma")]
    IgnoredPragma,

    #[error("#warning {}", join_tokens(.0))]
    User(Vec<Token>),

    /// `#define` over an existing, different definition.
    /// The new definition wins.
    #[error("\"{0}\" redefined with a different body")]
    IncompatibleRedefinition(InternedStr),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Radix {
    Binary,
    Octal,
    Decimal,
    Hexadecimal,
}

impl Radix {
    pub fn as_u8(self) -> u8 {
        match self {
            Radix::Binary => 2,
            Radix::Octal => 8,
            Radix::Decimal => 10,
            Radix::Hexadecimal => 16,
        }
    }
}

impl fmt::Display for Radix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            Radix::Binary => "binary",
            Radix::Octal => "octal",
            Radix::Decimal => "decimal",
            Radix::Hexadecimal => "hexadecimal",
        };
        write!(f, "{}", word)
    }
}

fn join_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl CompileError {
    pub fn location(&self) -> Location {
        self.location
    }
    pub fn is_lex_err(&self) -> bool {
        matches!(self.data, Error::Lex(_))
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.data)
    }
}

impl From<Locatable<LexError>> for CompileError {
    fn from(err: Locatable<LexError>) -> Self {
        err.map(Error::Lex)
    }
}

impl From<Locatable<CppError>> for CompileError {
    fn from(err: Locatable<CppError>) -> Self {
        err.map(Error::PreProcessor)
    }
}
