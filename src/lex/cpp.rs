//! The preprocessor is made of 2 nested iterators:
//!
//! 1. The innermost iterator (`FileProcessor`) deals with multiple files/lexers.
//!    If one included file runs out of tokens, it seamlessly goes on to the next one.
//! 2. The outermost iterator (`PreProcessor`) deals with preprocessing directives
//!    and tags every token it emits with its presence condition.
//!
//! There is also a step in the middle to perform macro replacement.
//! The `PreProcessor` sometimes does not want to replace its tokens (e.g. for
//! `#if defined(a)`). In this case, it reaches directly into the
//! `FileProcessor` to drag out those tokens.
//!
//! Unlike an ordinary preprocessor, conditional branches that are not taken
//! are never thrown away: their tokens are still lexed and emitted, carrying
//! a presence condition that the current macro environment does not satisfy.
//! Only state mutation — `#define`, `#undef`, `#include`, `#error` and
//! friends — is suppressed outside the live branch.

use arcstr::{ArcStr, Substr};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};

use super::eval::{eval_condition, extract_cond};
use super::files::FileProcessor;
use super::replace::{replace, Definition, Definitions};
use super::Lexer;
use crate::cond::{CondArena, CondId};
use crate::data::error::CppError;
use crate::data::lex::LiteralToken;
use crate::data::*;
use crate::get_str;
use crate::Files;

/// An easier interface for constructing a preprocessor.
///
/// Here is the example for `PreProcessor::new()` using the builder:
/// ```
/// use brackish::PreProcessorBuilder;
///
/// let cpp = PreProcessorBuilder::new("int main(void) { char *hello = \"hi\"; }\n").filename("example.c").build();
/// for token in cpp {
///     assert!(token.is_ok());
/// }
/// ```
pub struct PreProcessorBuilder<'a> {
    /// The buffer for the starting file
    buf: ArcStr,
    /// The name of the file
    filename: PathBuf,
    /// Whether to print each token before replacement
    debug: bool,
    /// The paths to search for `#include`d files
    search_path: Vec<Cow<'a, Path>>,
    /// The user-defined macros that should be defined at startup
    definitions: Definitions,
}

impl<'a> PreProcessorBuilder<'a> {
    pub fn new<S: Into<ArcStr>>(buf: S) -> PreProcessorBuilder<'a> {
        PreProcessorBuilder {
            debug: false,
            filename: PathBuf::default(),
            buf: buf.into(),
            search_path: Vec::new(),
            definitions: Definitions::new(),
        }
    }
    pub fn filename<P: Into<PathBuf>>(mut self, name: P) -> Self {
        self.filename = name.into();
        self
    }
    pub fn debug(mut self, yes: bool) -> Self {
        self.debug = yes;
        self
    }
    pub fn search_path<C: Into<Cow<'a, Path>>>(mut self, path: C) -> Self {
        self.search_path.push(path.into());
        self
    }
    pub fn definition<D: Into<Definition>>(mut self, name: InternedStr, def: D) -> Self {
        self.definitions.insert(name, def.into());
        self
    }
    pub fn build(self) -> PreProcessor<'a> {
        PreProcessor::new(
            self.buf,
            self.filename,
            self.debug,
            self.search_path,
            self.definitions,
        )
    }
}

/// A variability-aware preprocessor for C source.
///
/// Textual substitution works the way `cpp` does it: the rules for
/// tokenizing identifiers, operators, and literals are C's, and
/// whitespace matters in the places it matters to `cpp`
/// (`#define a() b` is not the same as `#define a () b`).
///
/// The difference is what happens to conditional compilation. Where `cpp`
/// deletes the branches an `#if` chain does not take, this preprocessor
/// keeps every branch and tags each emitted token with the condition under
/// which the branch survives, so one pass describes every configuration of
/// the input instead of one.
///
/// Examples:
///
/// ```
/// use brackish::PreProcessor;
///
/// let cpp = PreProcessor::new("int main(void) { char *hello = \"hi\"; }\n", "example.c", false, vec![], Default::default());
/// for token in cpp {
///     assert!(token.is_ok());
/// }
/// ```
pub struct PreProcessor<'a> {
    error_handler: ErrorHandler,
    /// Keeps track of current `#if` directives
    nested_ifs: Vec<CondFrame>,
    /// The tokens that have been `#define`d and are currently being substituted
    pending: VecDeque<Locatable<PendingToken>>,
    /// The paths to search for `#include`d files
    search_path: Vec<Cow<'a, Path>>,
    /// The current macro definitions
    definitions: Definitions,
    /// Handles reading from files
    file_processor: FileProcessor,
    /// The formulas attached to emitted tokens
    conds: CondArena,
    /// Set when a structural error has killed the whole run
    finished: bool,
}

enum PendingToken {
    Replaced(Token),
    NeedsReplacement(Token),
}

impl From<Token> for CppToken {
    fn from(t: Token) -> CppToken {
        CppToken::Token(t)
    }
}

impl From<Vec<Token>> for Definition {
    fn from(tokens: Vec<Token>) -> Definition {
        Definition::Object(tokens)
    }
}

impl TryFrom<&str> for Definition {
    type Error = error::LexError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let value = arcstr::format!("{}\n", value);
        let mut files = codespan::Files::new();
        let _dummy_id = files.add("<impl TryFrom<&str> for Definition>", ArcStr::clone(&value));
        let lexer = Lexer::new(_dummy_id, value, false);
        lexer
            .map(|res| match res {
                Ok(loc) => Ok(loc.data),
                Err(err) => Err(err.data),
            })
            .collect::<Result<_, _>>()
            .map(Definition::Object)
    }
}

/// One level of `#if` nesting.
///
/// The state machine per frame (pipe to `xdot -` for visualization):
///
/// ```dot
/// strict digraph branch_state {
///    start -> Taken   [label="#if 1"]
///    start -> Seeking [label="#if 0"]
///    Seeking -> Taken   [label="#elif 1 / #else"]
///    Seeking -> Seeking [label="#elif 0"]
///    Taken -> Dead [label="#elif ... / #else"]
///    Dead -> Dead  [label="#elif ... / #else"]
///    Taken -> end [label="#endif"]
///    Seeking -> end [label="#endif"]
///    Dead -> end [label="#endif"]
///  }
/// ```
///
/// `Taken` is the branch the current macro environment selects; a `Dead`
/// chain had an earlier branch fire. Every branch's tokens are emitted
/// regardless — the state only controls which directives execute and which
/// tokens get macro-expanded.
#[derive(Copy, Clone, Debug, PartialEq)]
enum BranchState {
    Seeking,
    Taken,
    Dead,
}

#[derive(Debug)]
struct CondFrame {
    /// conjunction of the enclosing frames' conditions when this was pushed
    parent: CondId,
    /// the current branch's condition, as written
    branch: CondId,
    /// negations of every earlier branch in this chain
    seen: CondId,
    /// `parent && seen && branch`: what emitted tokens carry
    cond: CondId,
    state: BranchState,
    saw_else: bool,
}

pub(super) type CppResult<T> = Result<Locatable<T>, CompileError>;

impl Iterator for PreProcessor<'_> {
    /// The preprocessor hides all internal complexity and returns
    /// condition-annotated tokens.
    type Item = Result<PpToken, CompileError>;
    fn next(&mut self) -> Option<Self::Item> {
        // We have two things we need to handle.
        // First, we could have gotten to the end of the file;
        // Second, the current token could be an identifier that was
        // `#define`d to an empty token list.
        // This loop is for the second case, not the first.
        loop {
            if let Some(err) = self.error_handler.pop_front() {
                return Some(Err(err));
            }
            if self.finished {
                return None;
            }
            let replacement = if let Some(token) = self.pending.pop_front() {
                self.handle_token(token.data, token.location)
            } else {
                match self.next_cpp_token() {
                    None => {
                        if !self.nested_ifs.is_empty() {
                            self.nested_ifs.clear();
                            self.error_handler
                                .error(CppError::UnterminatedIf, self.eof());
                        }
                        self.finished = true;
                        continue;
                    }
                    Some(Err(err)) => return Some(Err(err)),
                    Some(Ok(loc)) => match loc.data {
                        CppToken::Directive(directive) => {
                            let start = loc.location.span.start().to_usize() as u32;
                            match self.directive(directive, start) {
                                Err(err) => {
                                    // structural errors halt the file that
                                    // contains them, not the whole run
                                    if is_structural(&err) && self.file_processor.abort_file() {
                                        self.finished = true;
                                    }
                                    return Some(Err(err));
                                }
                                Ok(()) => continue,
                            }
                        }
                        CppToken::Token(token) => {
                            if self.is_live() {
                                self.handle_token(
                                    PendingToken::NeedsReplacement(token),
                                    loc.location,
                                )
                            } else {
                                // a branch the current environment does not
                                // take: emit unexpanded, tagged
                                let cond = self.current_cond();
                                return Some(Ok(PpToken::new(token, loc.location, cond)));
                            }
                        }
                    },
                }
            };
            if let Some(token) = replacement {
                return Some(token);
            }
            // This token was an empty define, so continue looking for tokens
        }
    }
}

fn is_structural(err: &CompileError) -> bool {
    matches!(
        &err.data,
        Error::PreProcessor(
            CppError::UnexpectedElif { .. }
                | CppError::UnexpectedElse
                | CppError::UnexpectedEndIf
                | CppError::UnterminatedIf
        )
    )
}

fn now_local() -> time::OffsetDateTime {
    match time::OffsetDateTime::try_now_local() {
        Ok(ok) => ok,
        Err(_) => time::OffsetDateTime::now_utc(),
    }
}

// idiom: to check if there has been a newline since the last token,
// use the following pattern:
// ```rust
// let line = self.line();
// ... do stuff that consumes tokens ...
// let seen_newline = line == self.line();
// ```
impl<'a> PreProcessor<'a> {
    /// Create a new preprocessor for a source buffer.
    ///
    /// Note that the preprocessor may add arbitrarily many `#include`d files
    /// to its file database, but will never delete a file.
    ///
    /// The `debug` parameter specifies whether to trace each token before replacement.
    pub fn new<'search: 'a, I: IntoIterator<Item = Cow<'search, Path>>, S: Into<ArcStr>>(
        chars: S,
        filename: impl Into<std::ffi::OsString>,
        debug: bool,
        user_search_path: I,
        user_definitions: Definitions,
    ) -> Self {
        let now = now_local();

        #[allow(clippy::inconsistent_digit_grouping)]
        let mut definitions = map! {
            "__STDC__".into() => int_def(1),
            "__STDC_HOSTED__".into() => int_def(1),
            "__STDC_VERSION__".into() => int_def(2011_12),
            "__STDC_NO_ATOMICS__".into() => int_def(1),
            "__STDC_NO_COMPLEX__".into() => int_def(1),
            "__STDC_NO_THREADS__".into() => int_def(1),
            "__STDC_NO_VLA__".into() => int_def(1),
            "__DATE__".into() => str_def(&now.format("%b %_d %Y")),
            "__TIME__".into() => str_def(&now.format("%H:%M:%S")),
        };
        definitions.extend(user_definitions);
        let search_path = user_search_path.into_iter().collect();

        let file_processor = FileProcessor::new(chars, filename, debug);

        let mut new_cpp = Self {
            error_handler: Default::default(),
            nested_ifs: Default::default(),
            pending: Default::default(),
            search_path,
            definitions,
            file_processor,
            conds: CondArena::new(),
            finished: false,
        };
        new_cpp.update_builtin_definitions(); // So they are defined from the start
        new_cpp
    }

    /// Return all warnings found so far.
    ///
    /// These warnings are consumed and will not be returned if you call
    /// `warnings()` again.
    pub fn warnings(&mut self) -> VecDeque<CompileWarning> {
        let mut warnings = std::mem::take(&mut self.error_handler.warnings);
        warnings.extend(std::mem::take(
            &mut self.file_processor.error_handler.warnings,
        ));
        warnings
    }

    pub fn eof(&self) -> Location {
        self.file_processor.eof()
    }

    pub fn into_files(self) -> Files {
        self.file_processor.into_files()
    }

    /// Package a finished run, keeping the condition arena the emitted
    /// tokens point into.
    pub fn into_program(
        self,
        tokens: Vec<PpToken>,
        errors: VecDeque<CompileError>,
        warnings: VecDeque<CompileWarning>,
    ) -> crate::Program {
        crate::Program {
            tokens,
            conditions: self.conds,
            errors,
            warnings,
            files: self.file_processor.into_files(),
        }
    }

    /// The arena holding every presence condition this preprocessor emits.
    pub fn conditions(&self) -> &CondArena {
        &self.conds
    }

    /// Whether a macro is currently defined.
    pub fn is_defined(&self, name: InternedStr) -> bool {
        self.definitions.contains_key(&name)
    }

    /// Whether `cond` holds under the macro environment as it stands right
    /// now. Opaque expression atoms are re-evaluated against the current
    /// definitions; one that fails to evaluate counts as false.
    pub fn satisfied(&self, cond: CondId) -> bool {
        let definitions = &self.definitions;
        let eof = self.eof();
        self.conds.eval(
            cond,
            &|name| definitions.contains_key(&name),
            &|text| {
                let source = arcstr::format!("{}\n", text);
                let mut files = codespan::Files::new();
                let id = files.add("<condition>", ArcStr::clone(&source));
                let tokens: Vec<_> = Lexer::new(id, source, false)
                    .filter_map(|res| res.ok())
                    .filter(|t| !t.data.is_whitespace())
                    .map(|t| Locatable::new(t.data, eof))
                    .collect();
                eval_condition(tokens, definitions, eof).unwrap_or(false)
            },
        )
    }

    /* internal functions */
    fn span(&self, start: u32) -> Location {
        self.file_processor.span(start)
    }

    fn lexer_mut(&mut self) -> &mut Lexer {
        self.file_processor.lexer_mut()
    }

    fn line(&self) -> usize {
        self.file_processor.line()
    }

    fn tokens_until_newline(&mut self, whitespace: bool) -> Vec<CompileResult<Locatable<Token>>> {
        self.file_processor.tokens_until_newline(whitespace)
    }

    /// True when every enclosing conditional branch is the one the current
    /// macro environment takes.
    fn is_live(&self) -> bool {
        self.nested_ifs
            .iter()
            .all(|frame| frame.state == BranchState::Taken)
    }

    /// The condition attached to tokens emitted right now.
    fn current_cond(&mut self) -> CondId {
        let cond = self.nested_ifs.last().map(|frame| frame.cond);
        match cond {
            Some(cond) => cond,
            None => self.conds.tt(),
        }
    }

    /// Possibly recursively replace tokens.
    ///
    /// If `token` was defined to an empty token list, this will return `None`.
    fn handle_token(
        &mut self,
        token: PendingToken,
        location: Location,
    ) -> Option<Result<PpToken, CompileError>> {
        let cond = self.current_cond();
        match token {
            // if we've already replaced the token once, don't do it again
            // avoids infinite loops on cyclic defines
            PendingToken::Replaced(token) => Some(Ok(PpToken::new(token, location, cond))),
            PendingToken::NeedsReplacement(token) => {
                self.update_builtin_definitions();
                let mut replacement_list =
                    replace(&self.definitions, token, &mut self.file_processor, location)
                        .into_iter();
                let first = replacement_list.next();
                for remaining in replacement_list {
                    match remaining {
                        Err(err) => self.error_handler.push_back(err),
                        Ok(token) => self.pending.push_back(token.map(PendingToken::Replaced)),
                    }
                }
                first.map(|res| res.map(|token| PpToken::new(token.data, token.location, cond)))
            }
        }
    }

    /// If at the start of the line and we see `#directive`, return that directive.
    /// Otherwise, if we see a token (or error), return that error.
    /// Otherwise, return `None`.
    fn next_cpp_token(&mut self) -> Option<CppResult<CppToken>> {
        let next_token = self.file_processor.next()?;
        let is_hash = matches!(
            next_token,
            Ok(Locatable {
                data: Token::Hash,
                ..
            })
        );
        Some(if is_hash && !self.file_processor.seen_line_token() {
            let line = self.file_processor.line();
            match self.file_processor.next_non_whitespace()? {
                Ok(Locatable {
                    data: Token::Id(id),
                    location,
                }) if self.file_processor.line() == line => {
                    if let Ok(directive) = DirectiveKind::try_from(get_str!(id)) {
                        Ok(Locatable::new(CppToken::Directive(directive), location))
                    } else if !self.is_live() {
                        // an unknown directive in a skipped group is not
                        // an error, just a line to ignore
                        drop(self.tokens_until_newline(false));
                        return self.next_cpp_token();
                    } else {
                        Err(Locatable::new(CppError::InvalidDirective.into(), location))
                    }
                }
                Ok(other) => {
                    if self.file_processor.line() == line {
                        Err(other.map(|tok| CppError::UnexpectedToken("directive", tok).into()))
                    } else {
                        Ok(other.into())
                    }
                }
                other => other.map(Locatable::from),
            }
        } else {
            next_token.map(Locatable::from)
        })
    }

    // this function does _not_ perform macro substitution
    fn expect_id(&mut self) -> CppResult<InternedStr> {
        let location = self.file_processor.span(self.file_processor.offset());
        match self.file_processor.next() {
            Some(Ok(Locatable {
                data: Token::Id(name),
                location,
            })) => Ok(Locatable::new(name, location)),
            Some(Err(err)) => Err(err),
            Some(Ok(other)) => {
                Err(other.map(|tok| CppError::UnexpectedToken("identifier", tok).into()))
            }
            None => Err(CompileError {
                data: CppError::EndOfFile("identifier").into(),
                location,
            }),
        }
    }

    // Handle a directive. This assumes we have consumed the directive (e.g. `#if`),
    // but not the rest of the tokens on the current line.
    fn directive(&mut self, kind: DirectiveKind, start: u32) -> Result<(), CompileError> {
        use crate::data::error::Warning as WarningDiagnostic;
        use DirectiveKind::*;
        match kind {
            If => {
                let tokens = self.condition_tokens();
                let formula = extract_cond(&tokens, &mut self.conds);
                let location = self.span(start);
                let value = self.evaluate_if_live(tokens, location);
                self.push_frame(formula, value);
                Ok(())
            }
            IfDef => {
                self.consume_whitespace_oneline(start, CppError::ExpectedMacroId)?;
                let name = self.expect_id()?;
                let formula = self.conds.defined(name.data);
                let value = self.definitions.contains_key(&name.data);
                self.push_frame(formula, value);
                Ok(())
            }
            IfNDef => {
                self.consume_whitespace_oneline(start, CppError::ExpectedMacroId)?;
                let name = self.expect_id()?;
                let defined = self.conds.defined(name.data);
                let formula = self.conds.not(defined);
                let value = !self.definitions.contains_key(&name.data);
                self.push_frame(formula, value);
                Ok(())
            }
            Elif => self.elif_directive(start),
            Else => self.else_directive(start),
            EndIf => {
                if self.nested_ifs.pop().is_none() {
                    Err(CompileError::new(
                        CppError::UnexpectedEndIf.into(),
                        self.span(start),
                    ))
                } else {
                    Ok(())
                }
            }
            Define => {
                if !self.is_live() {
                    drop(self.tokens_until_newline(false));
                    return Ok(());
                }
                self.define(start)
            }
            Undef => {
                if !self.is_live() {
                    drop(self.tokens_until_newline(false));
                    return Ok(());
                }
                self.consume_whitespace_oneline(start, CppError::ExpectedMacroId)?;
                let name = self.expect_id()?;
                // undefining a name that was never defined is fine
                self.definitions.remove(&name.data);
                Ok(())
            }
            Pragma => {
                if !self.is_live() {
                    drop(self.tokens_until_newline(false));
                    return Ok(());
                }
                let tokens = self.condition_tokens();
                match tokens.first().map(|t| &t.data) {
                    Some(Token::Id(id)) if *id == "once".into() => {
                        self.file_processor.mark_once();
                    }
                    _ => {
                        self.error_handler
                            .warn(WarningDiagnostic::IgnoredPragma, self.span(start));
                    }
                }
                Ok(())
            }
            // NOTE: #warning is a non-standard extension, but is implemented
            // by most major compilers including clang and gcc.
            Warning => {
                let tokens: Vec<_> = self
                    .tokens_until_newline(false)
                    .into_iter()
                    .map(|res| res.map(|l| l.data))
                    .collect::<Result<_, _>>()?;
                if self.is_live() {
                    self.error_handler
                        .warn(WarningDiagnostic::User(tokens), self.span(start));
                }
                Ok(())
            }
            Error => {
                let tokens: Vec<_> = self
                    .tokens_until_newline(false)
                    .into_iter()
                    .map(|res| res.map(|l| l.data))
                    .collect::<Result<_, _>>()?;
                if self.is_live() {
                    self.error_handler
                        .error(CppError::User(tokens), self.span(start));
                }
                Ok(())
            }
            Line => {
                if self.is_live() {
                    self.error_handler.warn(
                        WarningDiagnostic::Generic("#line is ignored".into()),
                        self.span(start),
                    );
                }
                drop(self.tokens_until_newline(false));
                Ok(())
            }
            Include => {
                if !self.is_live() {
                    drop(self.tokens_until_newline(false));
                    return Ok(());
                }
                self.include(start)
            }
        }
    }

    /// The tokens of a directive's condition, with lex errors diverted to
    /// the diagnostic queue so the conditional structure stays intact.
    fn condition_tokens(&mut self) -> Vec<Locatable<Token>> {
        let mut tokens = Vec::new();
        for result in self.tokens_until_newline(false) {
            match result {
                Ok(token) => tokens.push(token),
                Err(err) => self.error_handler.push_back(err),
            }
        }
        tokens
    }

    /// Evaluate an `#if`/`#elif` condition if this context can be evaluated
    /// at all. An evaluation error makes the branch false and is reported
    /// as a diagnostic, never a hard failure.
    fn evaluate_if_live(&mut self, tokens: Vec<Locatable<Token>>, location: Location) -> bool {
        if !self.is_live() {
            return false;
        }
        self.update_builtin_definitions();
        match eval_condition(tokens, &self.definitions, location) {
            Ok(value) => value,
            Err(err) => {
                self.error_handler.push_back(err);
                false
            }
        }
    }

    fn push_frame(&mut self, branch: CondId, value: bool) {
        let parent = self.current_cond();
        let live = self.is_live();
        let seen = self.conds.tt();
        let cond = self.conds.and(parent, branch);
        let state = if live && value {
            BranchState::Taken
        } else {
            BranchState::Seeking
        };
        log::trace!(
            "#if: {} -> {:?}",
            self.conds.display(cond),
            state,
        );
        self.nested_ifs.push(CondFrame {
            parent,
            branch,
            seen,
            cond,
            state,
            saw_else: false,
        });
    }

    fn elif_directive(&mut self, start: u32) -> Result<(), CompileError> {
        let tokens = self.condition_tokens();
        let location = self.span(start);
        match self.nested_ifs.last() {
            None => {
                return Err(CompileError::new(
                    CppError::UnexpectedElif { early: true }.into(),
                    location,
                ));
            }
            Some(frame) if frame.saw_else => {
                return Err(CompileError::new(
                    CppError::UnexpectedElif { early: false }.into(),
                    location,
                ));
            }
            Some(_) => {}
        }
        let formula = extract_cond(&tokens, &mut self.conds);
        // a prior branch that fired short-circuits evaluation: matches
        // `cpp`, and avoids evaluating expressions guarded by macros that
        // are only defined in other configurations
        let frame_state = self.nested_ifs.last().unwrap().state;
        let value = match frame_state {
            BranchState::Seeking => {
                let parent_live = self
                    .nested_ifs
                    .iter()
                    .rev()
                    .skip(1)
                    .all(|f| f.state == BranchState::Taken);
                if parent_live {
                    self.update_builtin_definitions();
                    match eval_condition(tokens, &self.definitions, location) {
                        Ok(value) => value,
                        Err(err) => {
                            self.error_handler.push_back(err);
                            false
                        }
                    }
                } else {
                    false
                }
            }
            BranchState::Taken | BranchState::Dead => false,
        };
        let frame = self.nested_ifs.last().unwrap();
        let (parent, old_seen, old_branch) = (frame.parent, frame.seen, frame.branch);
        let not_prior = self.conds.not(old_branch);
        let seen = self.conds.and(old_seen, not_prior);
        let chain = self.conds.and(seen, formula);
        let cond = self.conds.and(parent, chain);
        let frame = self.nested_ifs.last_mut().unwrap();
        frame.seen = seen;
        frame.branch = formula;
        frame.cond = cond;
        frame.state = match frame_state {
            BranchState::Seeking if value => BranchState::Taken,
            BranchState::Seeking => BranchState::Seeking,
            BranchState::Taken | BranchState::Dead => BranchState::Dead,
        };
        Ok(())
    }

    fn else_directive(&mut self, start: u32) -> Result<(), CompileError> {
        let location = self.span(start);
        match self.nested_ifs.last() {
            None => {
                return Err(CompileError::new(CppError::UnexpectedElse.into(), location));
            }
            Some(frame) if frame.saw_else => {
                return Err(CompileError::new(CppError::UnexpectedElse.into(), location));
            }
            Some(_) => {}
        }
        let frame = self.nested_ifs.last().unwrap();
        let (parent, old_seen, old_branch, old_state) =
            (frame.parent, frame.seen, frame.branch, frame.state);
        let not_prior = self.conds.not(old_branch);
        let seen = self.conds.and(old_seen, not_prior);
        let tt = self.conds.tt();
        let cond = self.conds.and(parent, seen);
        let frame = self.nested_ifs.last_mut().unwrap();
        frame.seen = seen;
        frame.branch = tt;
        frame.cond = cond;
        frame.saw_else = true;
        frame.state = match old_state {
            BranchState::Seeking => BranchState::Taken,
            BranchState::Taken | BranchState::Dead => BranchState::Dead,
        };
        Ok(())
    }

    // Consumes tokens like this:
    // before:
    // #define f(a, b, c) a + b + c
    //           ^
    // after:
    // #define f(a, b, c) a + b + c
    //                   ^
    fn fn_args(&mut self, start: u32) -> Result<(Vec<InternedStr>, bool), CompileError> {
        let mut arguments = Vec::new();
        let mut variadic = false;
        loop {
            match self.file_processor.next_non_whitespace() {
                None => {
                    return Err(CompileError::new(
                        CppError::EndOfFile("identifier or ')'").into(),
                        self.span(start),
                    ));
                }
                Some(Err(err)) => {
                    self.error_handler.push_back(err);
                    continue;
                }
                Some(Ok(Locatable {
                    data: Token::Ellipsis,
                    ..
                })) => {
                    // `...` must close the list
                    variadic = true;
                    self.consume_whitespace_oneline(
                        self.file_processor.offset(),
                        CppError::Expected("')'", "macro parameter list"),
                    )?;
                    return if self.lexer_mut().match_next(')') {
                        Ok((arguments, variadic))
                    } else {
                        Err(CompileError::new(
                            CppError::Expected("')'", "variadic macro parameter list").into(),
                            self.span(start),
                        ))
                    };
                }
                Some(Ok(Locatable {
                    data: Token::Id(id),
                    ..
                })) => arguments.push(id),
                Some(Ok(Locatable {
                    data: other,
                    location,
                })) => self.error_handler.error(
                    CppError::UnexpectedToken("identifier or ')'", other),
                    location,
                ),
            }
            self.consume_whitespace_oneline(
                self.file_processor.offset(),
                CppError::Expected("',' or ')'", "macro parameter list"),
            )?;
            // either `,` or `)`
            if self.lexer_mut().match_next(')') {
                return Ok((arguments, variadic));
            }
            if self.lexer_mut().match_next(',') {
                self.consume_whitespace_oneline(
                    self.file_processor.offset(),
                    CppError::Expected("parameter", "macro parameter list"),
                )?;
                continue;
            }
            // some other token
            match self.file_processor.next() {
                None => {
                    return Err(CompileError::new(
                        CppError::EndOfFile("identifier or ')'").into(),
                        self.span(start),
                    ))
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(other)) => self.error_handler.error(
                    CppError::UnexpectedToken("',' or ')'", other.data),
                    other.location,
                ),
            }
        }
    }

    // http://port70.net/~nsz/c/c11/n1570.html#6.10.3
    // `#define a b` - object macro
    // `#define f(a) a` - function macro
    // `#define f (a) - object macro
    fn define(&mut self, start: u32) -> Result<(), CompileError> {
        let body = |this: &mut PreProcessor| {
            this.tokens_until_newline(true)
                .into_iter()
                .skip_while(|res| matches!(res, Ok(token) if token.data.is_whitespace()))
                .map(|res| res.map(|loc| loc.data))
                .collect::<Result<Vec<_>, CompileError>>()
        };

        self.consume_whitespace_oneline(start, CppError::EmptyDefine)?;
        let id = self.expect_id()?;
        // NOTE: does _not_ discard whitespace
        if self.lexer_mut().match_next('(') {
            // function macro
            // first, parse the arguments:
            // # define identifier lparen identifier-listopt ) replacement-list new-line
            // # define identifier lparen ... ) replacement-list new-line
            // # define identifier lparen identifier-list , ... ) replacement-list new-line
            self.consume_whitespace_oneline(
                self.file_processor.offset(),
                CppError::Expected(")", "macro parameter list"),
            )?;
            let (params, variadic) = if !self.lexer_mut().match_next(')') {
                self.fn_args(start)?
            } else {
                (Vec::new(), false)
            };
            let body = body(self)?;
            self.define_macro(
                id.data,
                Definition::Function {
                    params,
                    variadic,
                    body,
                },
                id.location,
            );
            Ok(())
        } else {
            // object macro
            let tokens = body(self)?;
            self.define_macro(id.data, Definition::Object(tokens), id.location);
            Ok(())
        }
    }

    fn define_macro(&mut self, name: InternedStr, definition: Definition, location: Location) {
        use std::collections::hash_map::Entry;
        log::debug!("#define {}", name);
        match self.definitions.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(definition);
            }
            Entry::Occupied(mut entry) => {
                // 6.10.3p1: redefinition to the same token sequence is a
                // no-op; anything else gets a diagnostic, and the new
                // definition wins so later expansions see it
                if !entry.get().compatible_with(&definition) {
                    self.error_handler
                        .warn(error::Warning::IncompatibleRedefinition(name), location);
                }
                entry.insert(definition);
            }
        }
    }

    // http://port70.net/~nsz/c/c11/n1570.html#6.10.2
    // `#include <file>` - system include
    // `#include "file"` - local include, but falls back to system include if `file` is not found.
    fn include(&mut self, start: u32) -> Result<(), CompileError> {
        self.consume_whitespace_oneline(start, CppError::EmptyInclude)?;
        let lexer = self.lexer_mut();
        let local = if lexer.match_next('"') {
            true
        } else if lexer.match_next('<') {
            false
        } else {
            // a computed include: `#include MACRO` where the macro expands
            // to a quoted filename
            let (id, location) = match self.file_processor.next_non_whitespace() {
                Some(Ok(Locatable {
                    data: Token::Id(id),
                    location,
                })) => (id, location),
                Some(Err(err)) => return Err(err),
                Some(Ok(other)) => {
                    return Err(CompileError::new(
                        CppError::UnexpectedToken("include file", other.data).into(),
                        other.location,
                    ))
                }
                None => {
                    return Err(CompileError::new(
                        CppError::EndOfFile("include file").into(),
                        self.span(start),
                    ))
                }
            };
            self.update_builtin_definitions();
            let mut replaced = replace(
                &self.definitions,
                Token::Id(id),
                &mut self.file_processor,
                location,
            )
            .into_iter()
            .filter(|res| !matches!(res, Ok(token) if token.data.is_whitespace()));
            match replaced.next() {
                Some(Ok(Locatable {
                    data: Token::Literal(LiteralToken::Str(segments)),
                    ..
                })) => {
                    let name: String = segments
                        .iter()
                        .map(|seg| seg.trim_matches('"'))
                        .collect();
                    return self.include_path(PathBuf::from(name), true, start);
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(other)) => {
                    return Err(CompileError::new(
                        CppError::UnexpectedToken("include file", other.data).into(),
                        other.location,
                    ))
                }
                None => {
                    return Err(CompileError::new(
                        CppError::EndOfFile("include file").into(),
                        self.span(start),
                    ))
                }
            }
        };

        let end = if local { '"' } else { '>' };
        let filename = PathBuf::from(self.chars_until(end).to_owned());
        self.include_path(filename, local, start)
    }

    // we've done the parsing for an `#include`,
    // now we want to figure what file on disk it corresponds to
    fn find_include_path(
        &mut self,
        filename: &Path,
        local: bool,
        start: u32,
    ) -> Result<PathBuf, CompileError> {
        if filename.as_os_str().is_empty() {
            return Err(CompileError::new(
                CppError::EmptyInclude.into(),
                self.span(start),
            ));
        }

        let not_found = |this: &Self, filename: &Path| {
            Err(this.span(start).error(CppError::FileNotFound(
                filename.to_string_lossy().to_string(),
            )))
        };

        // absolute path, e.g `#include </usr/local/include/stdio.h>`
        if filename.is_absolute() {
            return if filename.exists() {
                Ok(filename.to_owned())
            } else {
                not_found(self, filename)
            };
        }
        // local include: #include "dict.h" searches the including file's
        // directory first
        if local {
            let current_path = self.file_processor.path();
            let relative_path = &current_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(""));
            let resolved = relative_path.join(filename);
            if resolved.exists() {
                return Ok(resolved);
            }
        }
        // if we don't find it locally, we fall back to the system paths
        // this is part of the spec! http://port70.net/~nsz/c/c11/n1570.html#6.10.2p3
        for path in &self.search_path {
            let mut buf = path.clone().into_owned();
            buf.push(filename);
            if buf.exists() {
                return Ok(buf);
            }
        }

        not_found(self, filename)
    }

    // we've done the parsing for an `#include`,
    // now we want to do the dirty work of reading it into memory
    fn include_path(
        &mut self,
        filename: PathBuf,
        local: bool,
        start: u32,
    ) -> Result<(), CompileError> {
        let resolved = self.find_include_path(&filename, local, start)?;
        let src: ArcStr = std::fs::read_to_string(&resolved)
            .map_err(|err| CompileError {
                data: CppError::IO(err.to_string()).into(),
                location: self.span(start),
            })?
            .into();
        // a file that already told us it only wants to be seen once
        if self.file_processor.is_once(&resolved) {
            log::debug!("skipping {} (#pragma once)", resolved.display());
            return Ok(());
        }
        if let Some(guard) = self.file_processor.include_guard(&resolved, &src) {
            if self.definitions.contains_key(&guard) {
                log::debug!(
                    "skipping {} (guarded by {})",
                    resolved.display(),
                    guard
                );
                return Ok(());
            }
        }
        let source = crate::Source {
            path: resolved.clone(),
            code: ArcStr::clone(&src),
        };
        self.file_processor.add_file(resolved, source);
        Ok(())
    }

    /// Returns every char between the current position and the next `end`.
    /// Consumes and does not return the final `end`.
    fn chars_until(&mut self, end: char) -> &str {
        // directives must not span multiple files
        let lexer = self.file_processor.lexer_mut();
        let offset = lexer.location.offset as usize;
        match lexer.chars[offset..].find(end) {
            None => {
                lexer.location.offset += (lexer.chars.len() - offset) as u32;
                &lexer.chars[offset..]
            }
            Some(idx) => {
                lexer.location.offset += idx as u32;
                let s = &lexer.chars[offset..lexer.location.offset as usize];
                lexer.location.offset += 1; // to account for `end`
                s
            }
        }
    }

    /// Returns next token in stream which is not whitespace
    pub fn next_non_whitespace(&mut self) -> Option<Result<PpToken, CompileError>> {
        loop {
            match self.next() {
                Some(Ok(token)) if token.is_whitespace() => continue,
                other => break other,
            }
        }
    }

    /// Consumes whitespace but returns error if it includes a newline
    #[inline]
    fn consume_whitespace_oneline(
        &mut self,
        start: u32,
        error: CppError,
    ) -> Result<String, CompileError> {
        let line = self.line();
        let ret = self.file_processor.consume_whitespace();
        if self.line() != line {
            return Err(self.span(start).error(error));
        }
        Ok(ret)
    }

    fn update_builtin_definitions(&mut self) {
        self.definitions.extend(map! {
            "__LINE__".into() => int_def((self.line() + 1) as i64),
            "__FILE__".into() => str_def(self.file_processor.path().to_string_lossy()),
        })
    }
}

fn int_def(i: i64) -> Definition {
    Definition::Object(vec![LiteralToken::Int(Substr::from(i.to_string())).into()])
}
fn str_def<S: Into<String>>(s: S) -> Definition {
    let substr = Substr::from(format!("\"{}\"", s.into().replace('"', "\\\"")));
    Definition::Object(vec![LiteralToken::Str(vec![substr]).into()])
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DirectiveKind {
    If,
    IfDef,
    IfNDef,
    Elif,
    Else,
    EndIf,
    Include,
    Define,
    Undef,
    Line,
    Warning,
    Error,
    Pragma,
}

#[derive(Clone, Debug, PartialEq)]
enum CppToken {
    Token(Token),
    Directive(DirectiveKind),
}

impl From<Locatable<Token>> for Locatable<CppToken> {
    fn from(token: Locatable<Token>) -> Locatable<CppToken> {
        token.map(CppToken::Token)
    }
}

impl TryFrom<&str> for DirectiveKind {
    type Error = ();
    fn try_from(s: &str) -> Result<Self, ()> {
        use DirectiveKind::*;
        Ok(match s {
            "if" => If,
            "elif" => Elif,
            "endif" => EndIf,
            "else" => Else,
            "ifdef" => IfDef,
            "ifndef" => IfNDef,
            "include" => Include,
            "define" => Define,
            "undef" => Undef,
            "line" => Line,
            "warning" => Warning,
            "error" => Error,
            "pragma" => Pragma,
            _ => return Err(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::lex::test::{cpp, cpp_no_newline};

    macro_rules! assert_err {
        ($src: expr, $err: pat, $description: expr $(,)?) => {
            let mut found = false;
            for item in cpp($src) {
                if let Err(err) = item {
                    match err.data {
                        Error::PreProcessor($err) => {
                            found = true;
                            break;
                        }
                        Error::PreProcessor(other) => {
                            panic!("expected {}, got {}", $description, other)
                        }
                        other => panic!("expected cpp err, got {}", other),
                    }
                }
            }
            assert!(found, "expected {}, got no error", $description);
        };
    }

    /// The tokens a conventional preprocessor would produce: whitespace
    /// dropped, and only tokens whose presence condition the macro
    /// environment satisfies at the moment they are emitted.
    fn live_tokens(mut cpp: PreProcessor) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            match cpp.next() {
                None => break,
                Some(Err(_)) => {}
                Some(Ok(token)) => {
                    if !token.is_whitespace() && cpp.satisfied(token.cond) {
                        tokens.push(token.token);
                    }
                }
            }
        }
        tokens
    }

    /// Every token, satisfied or not, with its condition rendered.
    fn all_tokens(mut cpp: PreProcessor) -> Vec<(Token, String, bool)> {
        let mut tokens = Vec::new();
        loop {
            match cpp.next() {
                None => break,
                Some(Err(_)) => {}
                Some(Ok(token)) if token.is_whitespace() => {}
                Some(Ok(token)) => {
                    let display = cpp.conditions().display(token.cond).to_string();
                    let satisfied = cpp.satisfied(token.cond);
                    tokens.push((token.token, display, satisfied));
                }
            }
        }
        tokens
    }

    fn assert_same(src: &str, cpp_src: &str) {
        assert_eq!(
            live_tokens(cpp(src)),
            live_tokens(cpp(cpp_src)),
            "{} is not the same as {}",
            src,
            cpp_src,
        );
    }

    fn assert_same_exact(src: &str, cpp_src: &str) {
        // NOTE make sure `cpp_src` has no trailing newline; one is added here
        let pprint = cpp(src)
            .filter_map(|res| res.ok().map(|token| token.token.to_string()))
            .collect::<Vec<_>>()
            .join("");
        assert_eq!(pprint, format!("{}\n", cpp_src));
    }

    fn assert_no_errors(src: &str) {
        for item in cpp(src) {
            assert!(item.is_ok(), "unexpected error in {}: {:?}", src, item);
        }
    }

    #[test]
    fn if_directive() {
        assert_same(
            "
#if a
    b
#else
    c
#endif",
            "c",
        );
        assert_same(
            "
#if 0 + 2
    b
#endif",
            "b",
        );
        assert_same(
            "
#if 1^1
    b
#endif",
            "",
        );
    }

    #[test]
    fn if_fn_directive() {
        assert_same(
            "
#define f(a) 1
#if f(a)
success
#endif",
            "success",
        );
        assert_same(
            "
#define f(a) a*a
#define g(a) 2*a
#define h(b, c) 3*b + 4*c
#if f(5) == g(0) + h(1, 2)
failure
#elif f(5) == g(6) + h(3, 1)
success
#endif",
            "success",
        );
    }

    #[test]
    fn ifdef() {
        let code = "#ifdef a
        whatever, it does not matter
        #endif";
        assert_eq!(live_tokens(cpp(code)), vec![]);

        let code = "#ifdef a\n#endif";
        assert_eq!(live_tokens(cpp(code)), vec![]);

        assert!(cpp("#ifdef").any(|t| t.is_err()));

        let nested = "#ifdef a
        #ifdef b
        int main() {}
        #endif
        #endif
        char;";
        assert_eq!(
            live_tokens(cpp(nested)),
            vec![Token::Id("char".into()), Token::Semicolon]
        );

        assert!(cpp("#endif").any(|t| t.is_err()));

        let same_line = "#ifdef a #endif\nint main() {}";
        assert!(cpp(same_line).any(|t| t.is_err()));
    }

    #[test]
    fn ifndef() {
        let src = "
#ifndef A
#define A
#endif
A";
        assert_eq!(live_tokens(cpp(src)), vec![]);
    }

    #[test]
    fn dead_branches_are_retained() {
        let src = "#ifdef UNDEF
alpha
#else
beta
#endif";
        let tokens = all_tokens(cpp(src));
        assert_eq!(
            tokens,
            vec![
                (
                    Token::Id("alpha".into()),
                    "defined(UNDEF)".to_string(),
                    false
                ),
                (
                    Token::Id("beta".into()),
                    "!defined(UNDEF)".to_string(),
                    true
                ),
            ]
        );
    }

    #[test]
    fn nested_conditions_conjoin() {
        let src = "#ifdef A
#ifdef B
x
#endif
y
#endif";
        let tokens = all_tokens(cpp(src));
        assert_eq!(
            tokens,
            vec![
                (
                    Token::Id("x".into()),
                    "defined(A) && defined(B)".to_string(),
                    false
                ),
                (Token::Id("y".into()), "defined(A)".to_string(), false),
            ]
        );
    }

    #[test]
    fn elif_chain_negates_prior_branches() {
        let src = "#if defined(A)
a
#elif defined(B)
b
#else
c
#endif";
        let tokens = all_tokens(cpp(src));
        assert_eq!(
            tokens,
            vec![
                (Token::Id("a".into()), "defined(A)".to_string(), false),
                (
                    Token::Id("b".into()),
                    "!defined(A) && defined(B)".to_string(),
                    false
                ),
                (
                    Token::Id("c".into()),
                    "!defined(A) && !defined(B)".to_string(),
                    true
                ),
            ]
        );
    }

    #[test]
    fn dead_branch_tokens_are_not_expanded() {
        let src = "#define x 1
#ifdef UNDEF
x
#endif
x";
        let tokens = all_tokens(cpp(src));
        // the dead occurrence stays an identifier, the live one expands
        assert_eq!(tokens[0].0, Token::Id("x".into()));
        assert!(!tokens[0].2);
        assert!(matches!(
            &tokens[1].0,
            Token::Literal(LiteralToken::Int(text)) if text.as_str() == "1"
        ));
    }

    #[test]
    fn dead_branches_do_not_define() {
        let src = "#ifdef UNDEF
#define a b
#endif
a";
        assert_eq!(live_tokens(cpp(src)), vec![Token::Id("a".into())]);
    }

    #[test]
    fn object_macros() {
        let src = "
#define a b
int a() { return 1; }";
        let cpp_src = "int b() { return 1; }";
        assert_same(src, cpp_src);

        let multidef = "
#define a b + c
int d() { return a; }";
        assert_same(multidef, "int d() { return b + c; }");

        let opdef = "
#define BEGIN {
#define END }
int f() BEGIN return 5; END";
        assert_same(opdef, "int f() { return 5; }");
    }

    #[test]
    fn recursive_macros() {
        assert_same("#define a a\na", "a");
        assert_same("#define a a + b\na", "a + b");
        let mutual_recursion = "
#define a b
#define b a
a";
        assert_same(mutual_recursion, "a");
        let mutual_recursion_2 = "
#define a b
#define b c
#define c a
a";
        assert_same(mutual_recursion_2, "a");
        let mutual_recursion_3 = "
#define a b
#define b c
#define c b
a";
        assert_same(mutual_recursion_3, "b");
        assert_same("#define a \n a", "");
    }

    #[test]
    fn empty_def() {
        assert_err!("#define", CppError::EmptyDefine, "empty define");
        assert_err!(
            "#define
            int",
            CppError::EmptyDefine,
            "empty define",
        );
    }

    #[test]
    fn redefinition() {
        // an incompatible redefinition warns, and the new definition wins
        let src = "
#define a b
#define a c
a
";
        let mut preprocessor = cpp(src);
        let tokens: Vec<_> = (&mut preprocessor)
            .filter_map(|res| res.ok())
            .filter(|t| !t.is_whitespace())
            .map(|t| t.token)
            .collect();
        assert_eq!(tokens, vec![Token::Id("c".into())]);
        assert!(preprocessor
            .warnings()
            .iter()
            .any(|w| matches!(w.data, error::Warning::IncompatibleRedefinition(_))));

        // token-identical redefinition is a silent no-op
        let src = "
#define a b
#define a b
a
";
        let mut preprocessor = cpp(src);
        for _ in &mut preprocessor {}
        assert!(preprocessor.warnings().is_empty());

        // whitespace differences don't count
        let src = "
#define f(x) x  +  1
#define f(x) x + 1
f(2)
";
        let mut preprocessor = cpp(src);
        for _ in &mut preprocessor {}
        assert!(preprocessor.warnings().is_empty());

        // different parameter spellings do
        let src = "
#define a(b) b+1
#define a(c) c+1
a(2)
";
        let mut preprocessor = cpp(src);
        for _ in &mut preprocessor {}
        assert!(preprocessor
            .warnings()
            .iter()
            .any(|w| matches!(w.data, error::Warning::IncompatibleRedefinition(_))));
    }

    #[test]
    fn undef() {
        let src = "
#define a b
a
#undef a
a";
        assert_same(src, "b a");
        let src = "
#define a
#undef a
a
";
        assert_same(src, "a");
        // undef of something never defined is fine
        assert_no_errors("#undef not_defined");
    }

    #[test]
    fn else_directive() {
        let src = "
#if 1
#if 0
b
#else
// this should be an error
#else
d
#endif
";
        assert_err!(src, CppError::UnexpectedElse, "duplicate else");
    }

    #[test]
    fn elif() {
        let src = "
            #define __WORDSIZE 64
            #if 0
                wrong1
            #elif __WORDSIZE == 64
                right
            #else
                wrong2
            #endif
        ";
        assert_same(src, "right");

        let src = "
#if 0
a
#elif 0
b
#elif 1
c
#elif 0
d
#endif
";
        assert_same(src, "c");
    }

    #[test]
    fn elif_after_else_is_an_error() {
        let src = "
#if 0
a
#else
b
#elif 1
c
#endif
";
        assert_err!(src, CppError::UnexpectedElif { early: false }, "elif after else");
    }

    #[test]
    fn elif_is_not_evaluated_after_a_taken_branch() {
        // the divide-by-zero in the second condition must never run
        let src = "
#if 1
a
#elif 1/0
b
#endif
";
        assert_no_errors(src);
        assert_same(src, "a");
    }

    #[test]
    fn unterminated_if() {
        assert_err!("#if 1\nx", CppError::UnterminatedIf, "unterminated #if");
    }

    #[test]
    fn function_body_replacement() {
        let src = "#define a b
        #define f(c) a
        f(1)";
        assert_same(src, "b")
    }

    #[test]
    fn object_body_replacement() {
        let src = "#define NULL ((void*)0)
        int *p = NULL;";
        assert_same(src, "int *p = ((void*)0);")
    }

    #[test]
    fn pragma() {
        let src = "#pragma gcc __attribute__((inline))";
        let mut preprocessor = cpp(src);
        assert!(preprocessor.next_non_whitespace().is_none());
        assert!(preprocessor.warnings().pop_front().is_some());
    }

    #[test]
    fn line() {
        let src = "#line 1";
        let mut preprocessor = cpp(src);
        assert!(preprocessor.next_non_whitespace().is_none());
        assert!(preprocessor.warnings().pop_front().is_some());
    }

    #[test]
    fn warning() {
        let src = "#warning your pants are on fire";
        let mut preprocessor = cpp(src);
        assert!(preprocessor.next_non_whitespace().is_none());
        assert!(preprocessor.warnings().pop_front().is_some());
    }

    #[test]
    fn error() {
        assert_err!("#error cannot drink and drive", CppError::User(_), "#error");
        // a #error in a dead branch does not fire
        assert_no_errors("#ifdef UNDEF\n#error unreachable\n#endif");
    }

    #[test]
    fn invalid_directive() {
        assert_err!("#wrong", CppError::InvalidDirective, "invalid directive");
        assert_err!("#1", CppError::UnexpectedToken(_, _), "unexpected token");
        assert_err!("#include", CppError::EmptyInclude, "empty include");
        assert_err!("#if defined", CppError::EndOfFile(_), "end of file");
        for s in &["#if defined(+)", "#if defined)", "#if defined(()"] {
            assert_err!(s, CppError::UnexpectedToken(_, _), "unexpected token");
        }
        assert_err!("#if", CppError::EmptyExpression, "empty expression");
        // unknown directives in a dead branch are ignored
        assert_no_errors("#ifdef UNDEF\n#wrong\n#endif");
    }

    #[test]
    // make sure that `"b"` doesn't accidentally consume the newline token
    // without resetting `self.seen_line_token`
    fn str_at_eol() {
        let src = r#"
#define a "b"
#define c a
c
"#;
        assert_same(src, "\"b\"");
    }

    #[test]
    fn test_comment_newline() {
        assert_same(
            "
#if 1 //
int main() {}
#endif
",
            "int main() {}",
        );
        assert_same(
            "
#if 1 /**//**/
int main(){}
#endif
",
            "int main() {}",
        );
    }

    #[test]
    fn cycle_detection() {
        let src = "
        #define sa_handler   __sa_handler.sa_handler
        s.sa_handler";
        assert_same(src, "s.__sa_handler.sa_handler");
    }

    #[test]
    fn parens() {
        let original = "#define f(a, b) a\nf((1, 2, 3), 2)";
        let expected = "(1, 2, 3)";
        assert_same(original, expected);

        let original = "#define foo(x, y) { x, y }\nfoo(5 (6), 7)";
        let expected = "{ 5 (6), 7 }";
        assert_same(original, expected);

        let original = "#define f(a, b, c) a + b + c\nf((((1))), ((2)), (3))";
        let expected = "(((1))) + ((2)) + (3)";
        assert_same(original, expected);

        let original = "#define f(a, b) a\nf([1, 2], 3)";
        let expected = "[1, 2]";
        assert_same(original, expected);
    }

    #[test]
    fn recursive_function() {
        let original = "#define f(a) f(a + 1)\nf(1)";
        let expected = "f(1 + 1)";
        assert_same(original, expected);
    }

    #[test]
    fn mutually_recursive_function() {
        let original = "
            #define a(c) b(c)
            #define b(c) a(c)
            a(1)
        ";
        assert_same(original, "a(1)");
    }

    #[test]
    fn space_separated_function_macro() {
        assert_same_exact("#define f(a) <a>\nf     (a)", "\n<a>");
        assert_same_exact("#define f(a) <a>\nf(a)", "\n<a>");
        assert_same_exact("#define f(a) <a>\nf", "\nf");
        assert_same_exact("#define f(a) <a>\nf   ;", "\nf   ;");
        assert_same_exact("#define f(a) <a>\nf;", "\nf;");
        assert_same_exact(
            "#define f(a) 1
#define h f (2)
h",
            "\n\n1",
        );
    }

    #[test]
    fn eof_after_macro_call() {
        let pprint = cpp_no_newline("#define f(a)\nf")
            .filter_map(|res| res.ok().map(|token| token.token.to_string()))
            .collect::<Vec<_>>()
            .join("");
        assert_eq!(pprint, "\nf");
    }

    fn assert_same_stringified(src: &str, cpp_src: &str) {
        assert_same_exact(
            &format!("#define xstr(a) #a\nxstr({})", src),
            &format!("\n{}", cpp_src),
        );
    }

    #[test]
    fn stringify() {
        assert_same_stringified("a + b", r#""a + b""#);
        assert_same_stringified("  a +   b", r#""a + b""#);
        assert_same_stringified("", r#""""#);
        assert_same_stringified(r#""hey""#, r#""\"hey\"""#);
        assert_same_exact("#define xstr(a, b) #a = b\nxstr(1+2,3)", "\n\"1+2\" = 3");
        assert_same_exact("#define xstr(a, b) a b\nxstr(1+2,3)", "\n1+2 3");
        assert_same_exact("#define xstr(a) # a\nxstr(1+2)", "\n\"1+2\"");
        assert_same_exact("#define hash #a\nhash", "\n#a");
        assert_same_exact(
            r#"#define f(  x  ,y  )   4 # x ; #y
f (   42 ,  "hey" ) + f(1,0)"#,
            "\n4 \"42\" ; \"\\\"hey\\\"\" + 4 \"1\" ; \"0\"",
        );
        assert!(cpp("#define f(x) #y\nf(0)").any(|x| x.is_err()));
        assert!(cpp("#define f(x) #+\nf(0)").any(|x| x.is_err()));
    }

    #[test]
    fn paste() {
        assert_eq!(
            live_tokens(cpp("#define CAT(a,b) a##b\nCAT(fo,o)")),
            vec![Token::Id("foo".into())]
        );
        assert_eq!(
            live_tokens(cpp("#define CAT(a,b) a##b\nCAT(+,+)")),
            vec![Token::PlusPlus]
        );
        assert_err!(
            "#define CAT(a,b) a##b\nCAT(+,-)",
            CppError::InvalidPaste(_),
            "invalid paste",
        );
        assert_same("#define suffix(a) a##1\nsuffix(x)", "x1");
        assert_same("#define glue 1 ## 2\nglue", "12");
        // an empty argument pastes to just the other operand
        assert_same("#define CAT(a,b) a##b\nCAT(x,)", "x");
        // the pasted result is itself a candidate for expansion
        let src = "
#define foobar 1
#define CAT(a,b) a##b
CAT(foo,bar)";
        assert_same(src, "1");
    }

    #[test]
    fn variadic() {
        let src = "#define V(a, ...) a\nV(1)";
        assert_same(src, "1");
        let src = "#define V(a, ...) a\nV(1, 2)";
        assert_same(src, "1");
        let src = "#define V(a, ...) a\nV(1, 2, 3)";
        assert_same(src, "1");
        assert_err!(
            "#define V(a, ...) a\nV()",
            CppError::TooFewArguments(_, _),
            "missing required argument",
        );
        let src = "#define CALL(f, ...) f(__VA_ARGS__)\nCALL(g, 1, 2)";
        assert_same(src, "g(1, 2)");
        let src = "#define ALL(...) [__VA_ARGS__]\nALL(1, 2, 3)";
        assert_same(src, "[1, 2, 3]");
        let src = "#define ALL(...) [__VA_ARGS__]\nALL()";
        assert_same(src, "[]");
    }

    #[test]
    fn comma_elision() {
        let src = "#define LOG(fmt, ...) printf(fmt, ## __VA_ARGS__)\nLOG(x)";
        assert_same(src, "printf(x)");
        let src = "#define LOG(fmt, ...) printf(fmt, ## __VA_ARGS__)\nLOG(x, 1, 2)";
        assert_same(src, "printf(x, 1, 2)");
    }

    #[test]
    fn arity_mismatch_passes_invocation_through() {
        let src = "#define f(a, b) a\nf(1)";
        assert_err!(src, CppError::TooFewArguments(_, _), "too few arguments");
        assert_eq!(
            live_tokens(cpp(src)),
            vec![
                Token::Id("f".into()),
                Token::LeftParen,
                Token::Literal(LiteralToken::Int("1".into())),
                Token::RightParen,
            ]
        );
        let src = "#define f(a) a\nf(1, 2, 3)";
        assert_err!(src, CppError::TooFewArguments(_, _), "too many arguments");
    }

    #[test]
    fn division_by_zero_in_if() {
        assert_err!("#if 1/0\nx\n#endif", CppError::DivisionByZero, "div by zero");
        // and the branch is simply false
        assert_same("#if 1/0\nx\n#endif", "");
        // short-circuit protects the untaken operand
        assert_no_errors("#if 0 && 1/0\nx\n#endif");
        assert_no_errors("#if 1 || 1/0\nx\n#endif");
        assert_same("#if 0 && 1/0\nx\n#endif", "");
        assert_same("#if 1 || 1/0\nx\n#endif", "x");
    }

    #[test]
    fn if_on_undefined_macro_is_zero() {
        assert_same("#if UNDEFINED\nx\n#endif", "");
        assert_same("#if !UNDEFINED\nx\n#endif", "x");
        assert_no_errors("#if UNDEFINED\nx\n#endif");
    }

    #[test]
    fn conditional_definitions() {
        // the original's "alternative macros" pattern: which definition is
        // active depends on the configuration the engine is run with
        let with = PreProcessorBuilder::new("#ifdef TRACE\n#define log(x) trace(x)\n#else\n#define log(x)\n#endif\nlog(1)\n")
            .definition("TRACE".into(), Definition::Object(vec![]))
            .build();
        assert_eq!(
            live_tokens(with),
            vec![
                Token::Id("trace".into()),
                Token::LeftParen,
                Token::Literal(LiteralToken::Int("1".into())),
                Token::RightParen,
            ]
        );
        let without = cpp("#ifdef TRACE\n#define log(x) trace(x)\n#else\n#define log(x)\n#endif\nlog(1)");
        assert_eq!(live_tokens(without), vec![]);
    }

    #[test]
    fn builtins_line() {
        assert_same("__LINE__", "1");
        assert_same("\n\n\n\n\n\n\n\n\n__LINE__", "10");
        assert_same(
            "#ifdef __LINE__
            1
            #endif",
            "1",
        );
        // the branch fires only if __LINE__ evaluated to 2 at the directive
        let src = "#define YES ok
#if __LINE__ == 2
YES
#endif";
        assert!(all_tokens(cpp(src))
            .iter()
            .any(|(token, _, _)| *token == Token::Id("ok".into())));
        assert_same(
            "#define LINE __LINE__
            
            
            LINE",
            "4",
        );
        assert_same(
            "__LINE__
            __LINE__
            __LINE__

            __LINE__",
            "1 2 3 5",
        );
    }

    #[test]
    fn builtins_file() {
        let filename = "helloworld.c";
        let mut preprocessor = PreProcessorBuilder::new("__FILE__\n")
            .filename(filename)
            .build();
        let token = preprocessor.next_non_whitespace().unwrap().unwrap().token;
        if let Token::Literal(LiteralToken::Str(segments)) = token {
            assert_eq!(
                segments.first().unwrap().as_str(),
                format!("\"{}\"", filename)
            );
        } else {
            panic!("__FILE__ was not a string: {:?}", token);
        }
    }

    #[test]
    fn builtins_date_time() {
        fn assert_is_str(src: &str) {
            assert!(matches!(
                cpp(src).next_non_whitespace().unwrap().unwrap().token,
                Token::Literal(LiteralToken::Str(_))
            ));
        }
        assert_is_str("__DATE__");
        assert_is_str("__TIME__");
        assert_same("#ifdef __DATE__\nyes\n#endif", "yes");
    }

    #[test]
    fn preprocess_only() {
        let assert_unchanged = |s| assert_same_exact(s, s);
        assert_unchanged("\"abc\\?\" 1 2.0 3.000f 0x88 false");
        assert_unchanged("int \t\n\r     main() {}");
        assert_same_exact("int/* */main() {}", "int main() {}");
        assert_same_exact("int/*\n\n\n*/main() {}", "int\n\n\nmain() {}");
        assert_same_exact("#define x\n#undef x\n  x", "\n\n  x");
        assert_same_exact("#warning dont panic\n  x", "\n  x");
        assert_same_exact("#line 1\n  x", "\n  x");
    }
}
