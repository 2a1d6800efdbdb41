pub mod error;
pub mod lex;

pub use crate::intern::InternedStr;
pub use error::{
    CompileError, CompileResult, CompileWarning, CppError, Error, ErrorHandler, LexError, Radix,
    Warning,
};
pub use lex::{LiteralToken, Locatable, Location, PpToken, Token};
