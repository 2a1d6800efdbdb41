//! Reading tokens across `#include`d files.
//!
//! The `FileProcessor` owns a stack of lexers, one per file currently being
//! processed. When one runs out of tokens it seamlessly folds back to the
//! file that included it. It also remembers which files are protected by an
//! include guard or `#pragma once`, so the driver can skip a reinclusion
//! entirely.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use arcstr::ArcStr;

use super::Lexer;
use crate::data::{CompileResult, ErrorHandler, Locatable, Location, Token};
use crate::intern::InternedStr;
use crate::{Files, Source};

pub(super) struct FileProcessor {
    /// The preprocessor collaborates extremely closely with the lexer,
    /// since it sometimes needs to know if a token is followed by whitespace.
    first_lexer: Lexer,
    /// Each lexer represents a separate source file that is currently being processed.
    includes: Vec<Lexer>,
    /// All known files, including files which have already been read.
    files: Files,
    pub(super) error_handler: ErrorHandler,
    /// The include-guard macro of each file that has one, memoized by path.
    /// `None` means the file was scanned and has no guard.
    guards: HashMap<PathBuf, Option<InternedStr>>,
    /// Files that said `#pragma once`.
    once: HashSet<PathBuf>,
}

impl Iterator for FileProcessor {
    type Item = CompileResult<Locatable<Token>>;
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = match self.includes.last_mut() {
                Some(lexer) => lexer.next(),
                None => self.first_lexer.next(),
            };
            match next {
                Some(res) => return Some(res.map_err(Into::into)),
                // finished this file, go on to the one that included it
                None => match self.includes.pop() {
                    Some(mut lexer) => {
                        self.error_handler.append(&mut lexer.error_handler);
                        log::debug!(
                            "finished include {:?}",
                            self.files.name(lexer.location.file)
                        );
                    }
                    // this is the original source file
                    None => return None,
                },
            }
        }
    }
}

impl FileProcessor {
    pub(super) fn new(
        chars: impl Into<ArcStr>,
        filename: impl Into<std::ffi::OsString>,
        debug: bool,
    ) -> Self {
        let mut files = Files::new();
        let chars = chars.into();
        let filename = filename.into();
        let source = Source {
            code: ArcStr::clone(&chars),
            path: filename.clone().into(),
        };
        let file = files.add(filename, source);
        Self {
            error_handler: ErrorHandler::default(),
            first_lexer: Lexer::new(file, chars, debug),
            files,
            includes: Default::default(),
            guards: Default::default(),
            once: Default::default(),
        }
    }

    /// Since there could potentially be multiple lexers (for multiple files),
    /// this is a convenience function that returns the lexer for the current file.
    pub(super) fn lexer(&self) -> &Lexer {
        self.includes.last().unwrap_or(&self.first_lexer)
    }
    /// Same as `lexer()` but `&mut self -> &mut Lexer`.
    pub(super) fn lexer_mut(&mut self) -> &mut Lexer {
        self.includes.last_mut().unwrap_or(&mut self.first_lexer)
    }

    /// Start reading tokens from an included file.
    /// All tokens from it (and anything *it* includes) come before the
    /// remaining tokens of the current file.
    pub(super) fn add_file(&mut self, filename: PathBuf, source: Source) {
        let code = ArcStr::clone(&source.code);
        let id = self.files.add(filename, source);
        log::debug!("entering include {:?}", self.files.name(id));
        self.includes.push(Lexer::new(id, code, self.first_lexer.debug));
    }

    /// The guard macro protecting `path`, if its contents follow the
    /// `#ifndef G` / `#define G` / ... / `#endif` idiom. Memoized: the scan
    /// runs once per path.
    pub(super) fn include_guard(&mut self, path: &Path, code: &ArcStr) -> Option<InternedStr> {
        if let Some(cached) = self.guards.get(path) {
            return *cached;
        }
        let guard = detect_include_guard(code);
        self.guards.insert(path.to_owned(), guard);
        guard
    }

    /// Stop reading the current file, folding back to the one that included
    /// it. Returns true if the aborted file was the main file.
    pub(super) fn abort_file(&mut self) -> bool {
        match self.includes.pop() {
            Some(mut lexer) => {
                self.error_handler.append(&mut lexer.error_handler);
                false
            }
            None => true,
        }
    }

    /// Mark the file currently being processed as include-once.
    pub(super) fn mark_once(&mut self) {
        let path = self.path().to_owned();
        self.once.insert(path);
    }

    pub(super) fn is_once(&self, path: &Path) -> bool {
        self.once.contains(path)
    }

    /// Return a `Location` representing the end of the first file.
    pub(super) fn eof(&self) -> Location {
        let lex = &self.first_lexer;
        Location {
            span: codespan::Span::new(lex.chars.len() as u32, lex.chars.len() as u32),
            file: lex.location.file,
        }
    }

    /// Return all files loaded by the preprocessor, consuming it in the process.
    ///
    /// Files can be loaded by C source using `#include` directives.
    pub(super) fn into_files(self) -> Files {
        self.files
    }

    /* Convenience functions */
    #[inline]
    pub(super) fn line(&self) -> usize {
        self.lexer().line
    }
    #[inline]
    pub(super) fn span(&self, start: u32) -> Location {
        self.lexer().span(start)
    }
    #[inline]
    pub(super) fn consume_whitespace(&mut self) -> String {
        self.lexer_mut().consume_whitespace()
    }
    #[inline]
    pub(super) fn consume_whitespace_preprocessor(&mut self) -> String {
        self.lexer_mut().consume_whitespace_preprocessor()
    }
    #[inline]
    pub(super) fn seen_line_token(&self) -> bool {
        self.lexer().seen_line_token
    }
    #[inline]
    pub(super) fn offset(&self) -> u32 {
        self.lexer().location.offset
    }

    /* These functions are really for the benefit of `PreProcessor`, not anyone else. */
    pub(super) fn path(&self) -> &Path {
        &self.files.source(self.lexer().location.file).path
    }

    /// Return all tokens from the current position until the end of the current line.
    ///
    /// * `whitespace` - whether or not to include whitespace tokens
    ///
    /// Note that these are _tokens_ and not bytes, so if there are invalid tokens
    /// on the current line, this will return a lex error.
    pub(super) fn tokens_until_newline(
        &mut self,
        whitespace: bool,
    ) -> Vec<CompileResult<Locatable<Token>>> {
        let mut tokens = Vec::new();
        loop {
            let ws_start = self.offset();
            let ws = self.consume_whitespace_preprocessor();
            let ws_span = self.span(ws_start);
            if whitespace && !ws.is_empty() {
                tokens.push(Ok(Locatable {
                    data: Token::Whitespace(ws),
                    location: ws_span,
                }));
            }
            if self.lexer_mut().peek().unwrap_or('\n') == '\n' {
                break;
            }
            match self.next() {
                Some(token) => tokens.push(token),
                None => break,
            }
        }
        tokens
    }

    /// Returns next token in stream which is not whitespace
    pub(super) fn next_non_whitespace(&mut self) -> Option<CompileResult<Locatable<Token>>> {
        loop {
            match self.next() {
                Some(Ok(Locatable {
                    data: Token::Whitespace(_),
                    ..
                })) => continue,
                other => break other,
            }
        }
    }
}

/// Scan a file for the conventional include-guard idiom:
/// `#ifndef G` as the first directive, `#define G` as the second, and the
/// matching `#endif` as the last thing in the file.
///
/// The scan is purely lexical. A file that fails it in any way (tokens
/// before the `#ifndef`, the guard closing early, a lex error) is simply
/// treated as unguarded and reprocessed on every inclusion.
fn detect_include_guard(code: &ArcStr) -> Option<InternedStr> {
    let mut scratch = codespan::Files::new();
    let id = scratch.add("<guard scan>", ArcStr::clone(code));
    let mut tokens = Lexer::new(id, ArcStr::clone(code), false).map(|res| res.ok().map(|t| t.data));

    // a directive is a `#` first on its line; the lexer's newline tracking
    // is replicated here over the token stream. In strict mode any other
    // token disqualifies the file; otherwise ordinary tokens (the guarded
    // body) are skipped over.
    let mut at_line_start = true;
    fn next_directive(
        tokens: &mut dyn Iterator<Item = Option<Token>>,
        at_line_start: &mut bool,
        strict: bool,
    ) -> Option<Vec<Token>> {
        let mut line = Vec::new();
        loop {
            match tokens.next()?? {
                Token::Whitespace(ws) => {
                    if ws.contains('\n') {
                        *at_line_start = true;
                    }
                }
                Token::Hash if *at_line_start => break,
                _ if strict => return None,
                _ => *at_line_start = false,
            }
        }
        *at_line_start = false;
        // collect the rest of the logical line
        loop {
            match tokens.next() {
                None => break,
                Some(None) => return None,
                Some(Some(Token::Whitespace(ws))) => {
                    if ws.contains('\n') {
                        *at_line_start = true;
                        break;
                    }
                }
                Some(Some(token)) => line.push(token),
            }
        }
        Some(line)
    }

    let ifndef = next_directive(&mut tokens, &mut at_line_start, true)?;
    let guard = match ifndef.as_slice() {
        [Token::Id(directive), Token::Id(guard)] if *directive == "ifndef".into() => *guard,
        _ => return None,
    };
    let define = next_directive(&mut tokens, &mut at_line_start, false)?;
    match define.as_slice() {
        [Token::Id(directive), Token::Id(name)]
            if *directive == "define".into() && *name == guard => {}
        _ => return None,
    }

    // now track nesting until the guard's own #endif, which must be last
    let mut depth = 1usize;
    loop {
        let line = next_directive(&mut tokens, &mut at_line_start, false)?;
        match line.first() {
            Some(Token::Id(name))
                if *name == "if".into() || *name == "ifdef".into() || *name == "ifndef".into() =>
            {
                depth += 1;
            }
            Some(Token::Id(name)) if *name == "endif".into() => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    // nothing but whitespace may follow the closing #endif
    for token in tokens {
        match token? {
            Token::Whitespace(_) => {}
            _ => return None,
        }
    }
    Some(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(src: &str) -> Option<InternedStr> {
        detect_include_guard(&ArcStr::from(src.to_string()))
    }

    #[test]
    fn detects_the_idiom() {
        let src = "#ifndef FOO_H\n#define FOO_H\nint foo(void);\n#endif\n";
        assert_eq!(guard(src), Some("FOO_H".into()));
    }

    #[test]
    fn nested_conditionals_stay_guarded() {
        let src = "#ifndef FOO_H\n#define FOO_H\n#ifdef BAR\nint bar;\n#endif\n#endif\n";
        assert_eq!(guard(src), Some("FOO_H".into()));
    }

    #[test]
    fn comments_and_blank_lines_are_fine() {
        let src = "/* license */\n\n#ifndef X\n#define X\n\n#endif\n// trailing comment\n";
        assert_eq!(guard(src), Some("X".into()));
    }

    #[test]
    fn rejects_token_before_the_guard() {
        let src = "int leak;\n#ifndef FOO_H\n#define FOO_H\n#endif\n";
        assert_eq!(guard(src), None);
    }

    #[test]
    fn rejects_token_after_the_guard() {
        let src = "#ifndef FOO_H\n#define FOO_H\n#endif\nint leak;\n";
        assert_eq!(guard(src), None);
    }

    #[test]
    fn rejects_mismatched_define() {
        let src = "#ifndef FOO_H\n#define OTHER\n#endif\n";
        assert_eq!(guard(src), None);
    }

    #[test]
    fn rejects_early_close() {
        let src = "#ifndef FOO_H\n#define FOO_H\n#endif\n#ifdef X\n#endif\n";
        assert_eq!(guard(src), None);
    }

    #[test]
    fn unguarded_file() {
        assert_eq!(guard("int x;\n"), None);
        assert_eq!(guard("#define A 1\n"), None);
    }
}
