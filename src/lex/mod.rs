use arcstr::ArcStr;
use codespan::FileId;

use super::data::{error::LexError, lex::*, *};
use crate::intern::InternedStr;

mod cpp;
mod eval;
mod files;
pub mod replace;
#[cfg(test)]
mod tests;
// https://github.com/rust-lang/rust/issues/64762
#[allow(unreachable_pub)]
pub use cpp::{PreProcessor, PreProcessorBuilder};
#[allow(unreachable_pub)]
pub use replace::{Definition, Definitions};

type LexResult<T = Token> = Result<T, Locatable<LexError>>;

/// A Lexer takes the source code and turns it into tokens with location information.
///
/// Tokens are either literals, identifiers, or punctuators; classification
/// is as deep as it goes. Literals keep their raw lexeme — nothing is
/// evaluated here, that's the `#if` evaluator's job.
/// Location information is irritating to deal with but allows for better error messages.
///
/// Lexer implements iterator, so you can loop over the tokens.
#[derive(Debug)]
pub struct Lexer {
    location: SingleLocation,
    chars: ArcStr,
    /// used for 2-character tokens
    current: Option<char>,
    /// used for 3-character tokens
    lookahead: Option<char>,
    /// whether we've seen a token on this line before or not
    /// used for preprocessing (e.g. `#line 5` is a directive
    /// but `int main() { # line 5` is not)
    seen_line_token: bool,
    /// counts _logical_ lines, not physical lines
    /// used for the preprocessor (mostly for `tokens_until_newline()`)
    line: usize,
    error_handler: ErrorHandler<LexError>,
    /// whitespace consumed while looking for an adjacent string literal,
    /// handed back on the next call
    stashed_whitespace: Option<Locatable<Token>>,
    /// Whether or not to display each token as it is processed
    debug: bool,
}

#[derive(Debug)]
struct SingleLocation {
    offset: u32,
    file: FileId,
}

impl Lexer {
    /// Creates a Lexer from a filename and the contents of a file
    pub fn new<S: Into<ArcStr>>(file: FileId, chars: S, debug: bool) -> Lexer {
        Lexer {
            debug,
            location: SingleLocation { offset: 0, file },
            chars: chars.into(),
            seen_line_token: false,
            line: 0,
            current: None,
            lookahead: None,
            error_handler: ErrorHandler::new(),
            stashed_whitespace: None,
        }
    }

    /// This lexer is somewhat unique - it reads a single character at a time,
    /// unlike most lexers which read a token at a time (e.g. string literals).
    ///
    /// This, along with `peek` and `unput` is sort of an iterator within an iterator:
    /// that loops over `char` instead of `Token`.
    ///
    /// Returns the next token in the stream, updating internal location information.
    /// If a lookahead already exists, use that instead.
    ///
    /// All functions should use this instead of `chars` directly.
    /// Using `chars` will not update location information and may discard lookaheads.
    fn next_char(&mut self) -> Option<char> {
        let mut c = self._next_char();
        // Section 5.1.1.2 phase 2: splice physical lines joined by a
        // backslash before classifying anything. The spliced pair stays on
        // the same _logical_ line, so `line` does not advance.
        while c == Some('\\') && self.peek() == Some('\n') {
            self._next_char(); // discard \n
            c = self._next_char();
        }
        if c == Some('\n') {
            self.seen_line_token = false;
            self.line += 1;
        }
        c
    }
    // Internal use only, use `next_char()` instead.
    fn _next_char(&mut self) -> Option<char> {
        if let c @ Some(_) = self.current {
            self.current = self.lookahead.take();
            c
        } else {
            debug_assert!(self.lookahead.is_none());
            self.chars().next()
        }
        .map(|c| {
            self.location.offset += c.len_utf8() as u32;
            c
        })
    }

    fn chars(&self) -> std::str::Chars<'_> {
        self.chars[self.location.offset as usize..].chars()
    }

    /// Return the character that would be returned by `next_char`.
    /// Can be called any number of the times and will still return the same result.
    fn peek(&mut self) -> Option<char> {
        self.current = self
            .current
            .or_else(|| self.lookahead.take())
            .or_else(|| self.chars().next());
        self.current
    }
    /// Return the character that would be returned if you called `next_char()` twice in a row.
    fn peek_next(&mut self) -> Option<char> {
        self.lookahead = self.lookahead.or_else(|| self.chars().nth(1));
        self.lookahead
    }
    /// Return a single character to the stream.
    /// Can be called at most once before running out of space to store the character.
    ///
    /// # Panics
    /// This function will panic if called when `self.lookahead.is_some()`.
    fn unput(&mut self, byte: char) {
        assert!(
            self.lookahead.is_none(),
            "unputting {:?} would cause the lexer to forget it saw {:?} (current is {:?})",
            byte,
            self.lookahead.unwrap(),
            self.current.unwrap()
        );
        self.lookahead = self.current.take();
        self.current = Some(byte);
        self.location.offset -= 1;
    }
    /// If the next character is `item`, consume it and return true.
    /// Otherwise, return false.
    fn match_next(&mut self, item: char) -> bool {
        if self.peek().map_or(false, |c| c == item) {
            self.next_char();
            true
        } else {
            false
        }
    }
    /// Given the start of a span as an offset,
    /// return a span lasting until the current location in the file.
    fn span(&self, start: u32) -> Location {
        Location {
            span: codespan::Span::new(start, self.location.offset),
            file: self.location.file,
        }
    }
    /// The raw source text from `start` to the current offset.
    fn slice(&self, start: u32) -> arcstr::Substr {
        self.chars
            .substr(start as usize..self.location.offset as usize)
    }

    #[inline]
    fn consume_whitespace(&mut self) -> String {
        self.consume_whitespace_full(false, true)
    }
    #[inline]
    fn consume_whitespace_preprocessor(&mut self) -> String {
        self.consume_whitespace_full(true, false)
    }
    /// Remove all consecutive whitespace pending in the stream.
    /// This includes comments: a comment is folded into whitespace,
    /// preserving the line count for diagnostics.
    ///
    /// If `stop_at_newline` this stops at the end of the line (unless there's a comment)
    /// If `comments_newlines` then multiline comments are replaced with their newlines else space
    ///
    /// Before: b"    // some comment\n /*multi comment*/hello   "
    /// After:  b"hello   "
    fn consume_whitespace_full(
        &mut self,
        stop_at_newline: bool,
        comments_newlines: bool,
    ) -> String {
        // there may be comments following whitespace
        let mut whitespace = String::new();
        loop {
            // whitespace
            while self.peek().map_or(false, |c| {
                c.is_ascii_whitespace() && !(stop_at_newline && c == '\n')
            }) {
                if let Some(c) = self.next_char() {
                    whitespace.push(c);
                }
            }
            // comments
            if self.peek() == Some('/') {
                match self.peek_next() {
                    Some('/') => self.consume_line_comment(),
                    Some('*') => {
                        self.next_char();
                        self.next_char();
                        match self.consume_multi_comment() {
                            Ok(ws) => {
                                let ws = if comments_newlines { &ws } else { " " };
                                whitespace.push_str(ws)
                            }
                            Err(err) => self.error_handler.push_back(err),
                        }
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }
        whitespace
    }
    /// Remove all characters between now and the next '\n' character.
    ///
    /// Before: u8s{"blah `invalid tokens``\nhello // blah"}
    /// After:  chars{"hello // blah"}
    fn consume_line_comment(&mut self) {
        loop {
            match self.peek() {
                None | Some('\n') => return,
                _ => {
                    self.next_char();
                }
            }
        }
    }
    /// Remove a multi-line C-style comment, i.e. until the next '*/'.
    ///
    /// Before: u8s{"hello this is a lot of text */ int main(){}"}
    /// After:  chars{" int main(){}"}
    ///
    /// Return newlines occupied by the comment or a space if no newlines
    fn consume_multi_comment(&mut self) -> LexResult<String> {
        let mut whitespace = String::new();
        let start = self.location.offset - 2;
        while let Some(c) = self.next_char() {
            if c == '*' && self.peek() == Some('/') {
                self.next_char();
                if whitespace.is_empty() {
                    whitespace.push(' '); // For the case `a/* */b`
                }
                return Ok(whitespace);
            }
            if c == '\n' {
                whitespace.push(c);
            }
        }
        Err(Locatable {
            location: self.span(start),
            data: LexError::UnterminatedComment,
        })
    }
    /// Scan a numeric literal, given that the starting digit has been consumed.
    ///
    /// This accepts the whole C numeric-literal grammar (radix prefixes,
    /// suffixes, fractions, exponents) but stores only the raw lexeme;
    /// nothing is converted to a value here.
    fn parse_num(&mut self, start: char) -> Result<Token, LexError> {
        debug_assert!(start.is_ascii_digit());
        let span_start = self.location.offset - 1; // -1 for `start`
        let mut hex = false;
        if start == '0' {
            if self.match_next('x') || self.match_next('X') {
                hex = true;
                // `0x.ep0` is legal: the digits may all be in the fraction
                if !self
                    .peek()
                    .map_or(false, |c| c.is_ascii_hexdigit() || c == '.')
                {
                    return Err(LexError::MissingDigits(Radix::Hexadecimal));
                }
            } else if self.match_next('b') || self.match_next('B') {
                if !self.peek().map_or(false, |c| c == '0' || c == '1') {
                    return Err(LexError::MissingDigits(Radix::Binary));
                }
            }
        }
        let digits = |c: char| {
            if hex {
                c.is_ascii_hexdigit()
            } else {
                c.is_ascii_digit()
            }
        };
        while self.peek().map_or(false, digits) {
            self.next_char();
        }
        let mut float = false;
        if self.peek() == Some('.') {
            float = true;
            self.next_char();
            while self.peek().map_or(false, digits) {
                self.next_char();
            }
        }
        let exponent = if hex { ['p', 'P'] } else { ['e', 'E'] };
        if self.peek().map_or(false, |c| exponent.contains(&c)) {
            float = true;
            self.next_char();
            if self.peek() == Some('+') || self.peek() == Some('-') {
                self.next_char();
            }
            if !self.peek().map_or(false, |c| c.is_ascii_digit()) {
                return Err(LexError::ExponentMissingDigits);
            }
            while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                self.next_char();
            }
        }
        // suffixes: uU/lL for integers, fFlL for floats. Combinations are
        // not validated, only carried along with the lexeme.
        while self
            .peek()
            .map_or(false, |c| matches!(c, 'u' | 'U' | 'l' | 'L' | 'f' | 'F'))
        {
            if matches!(self.peek(), Some('f') | Some('F')) {
                float = true;
            }
            self.next_char();
        }
        let text = self.slice(span_start);
        Ok(if float {
            LiteralToken::Float(text).into()
        } else {
            LiteralToken::Int(text).into()
        })
    }
    /// Scan the rest of a float literal that began with a bare `.`.
    fn parse_dot_float(&mut self, span_start: u32) -> Result<Token, LexError> {
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.next_char();
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            self.next_char();
            if self.peek() == Some('+') || self.peek() == Some('-') {
                self.next_char();
            }
            if !self.peek().map_or(false, |c| c.is_ascii_digit()) {
                return Err(LexError::ExponentMissingDigits);
            }
            while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                self.next_char();
            }
        }
        while self
            .peek()
            .map_or(false, |c| matches!(c, 'f' | 'F' | 'l' | 'L'))
        {
            self.next_char();
        }
        Ok(LiteralToken::Float(self.slice(span_start)).into())
    }
    /// Scan a character literal, starting after the opening quote.
    ///
    /// Escape sequences are absorbed, not reinterpreted: `'\x41'` keeps its
    /// six characters.
    fn parse_char(&mut self, span_start: u32) -> Result<Token, LexError> {
        let mut chars = 0usize;
        loop {
            match self.next_char() {
                None => return Err(LexError::MissingEndQuote { string: false }),
                Some('\n') => return Err(LexError::NewlineInChar),
                Some('\'') => break,
                Some('\\') => {
                    // consume whatever follows, it can't terminate the literal
                    match self.next_char() {
                        None => return Err(LexError::MissingEndQuote { string: false }),
                        Some('\n') => return Err(LexError::NewlineInChar),
                        Some(_) => chars += 1,
                    }
                }
                Some(_) => chars += 1,
            }
        }
        if chars == 0 {
            return Err(LexError::EmptyChar);
        }
        Ok(LiteralToken::Char(self.slice(span_start)).into())
    }
    /// Scan a string literal, starting before the opening quote.
    ///
    /// Adjacent literals on the same line are collected into one token,
    /// each segment keeping its own quotes and escapes. Concatenation
    /// across lines is left alone: that is a compilation phase that comes
    /// after preprocessing anyway, and consuming the newline here would
    /// confuse directive detection.
    ///
    /// Before: u8s{"hello" "you" "it's me" mary}
    /// After:  chars{mary}
    fn parse_string(&mut self) -> Result<Token, LexError> {
        let mut segments = Vec::new();
        // allow multiple adjacent strings
        while self.peek() == Some('"') {
            let seg_start = self.location.offset;
            self.next_char(); // start quote
            loop {
                match self.next_char() {
                    None => return Err(LexError::MissingEndQuote { string: true }),
                    Some('\n') => return Err(LexError::NewlineInString),
                    Some('"') => break,
                    Some('\\') => match self.next_char() {
                        None => return Err(LexError::MissingEndQuote { string: true }),
                        Some('\n') => return Err(LexError::NewlineInString),
                        Some(_) => {}
                    },
                    Some(_) => {}
                }
            }
            segments.push(self.slice(seg_start));
            let ws_start = self.location.offset;
            let ws = self.consume_whitespace_preprocessor();
            if !ws.is_empty() && self.peek() != Some('"') {
                // not a continuation: hand the whitespace back on the next call
                self.stashed_whitespace =
                    Some(self.span(ws_start).with(Token::Whitespace(ws)));
            }
        }
        Ok(LiteralToken::Str(segments).into())
    }
    /// Parse an identifier, given the starting letter.
    ///
    /// Identifiers match the following regex: `[a-zA-Z_][a-zA-Z0-9_]*`
    fn parse_id(&mut self, start: char) -> Result<Token, LexError> {
        let mut id = String::new();
        id.push(start);
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | 'a'..='z' | 'A'..='Z' | '_' => {
                    self.next_char();
                    id.push(c);
                }
                _ => break,
            }
        }
        Ok(Token::Id(InternedStr::get_or_intern(id)))
    }
}

impl Iterator for Lexer {
    // option: whether the stream is exhausted
    // result: whether the next lexeme is an error
    type Item = LexResult<Locatable<Token>>;

    /// Return the next token in the stream.
    ///
    /// This iterator never resumes after it is depleted,
    /// i.e. once it returns None once, it will always return None.
    ///
    /// Any item may be an error, but items will always have an associated location.
    /// The file may be empty to start, in which case the iterator will return None.
    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error_handler.pop_front() {
            return Some(Err(err));
        }
        if let Some(ws) = self.stashed_whitespace.take() {
            return Some(Ok(ws));
        }

        // sanity check
        if self.chars.len() == self.location.offset as usize
            && self.current.is_none()
            && self.lookahead.is_none()
        {
            return None;
        }

        let check_no_newline = |this: &mut Self| {
            if this.location.offset as usize == this.chars.len() && !this.chars.ends_with('\n') {
                let location = this.span(this.chars.len() as u32);
                this.error_handler
                    .push_back(location.with(LexError::NoNewlineAtEOF));
            }
        };

        {
            let span_start = self.location.offset;
            let data = self.consume_whitespace();
            check_no_newline(self);
            if !data.is_empty() {
                return Some(Ok(Locatable {
                    data: Token::Whitespace(data),
                    location: self.span(span_start),
                }));
            }
        };

        let c = self.next_char().and_then(|c| {
            let span_start = self.location.offset - c.len_utf8() as u32;
            // this giant switch is most of the logic
            let data = match c {
                '#' => {
                    if self.match_next('#') {
                        Token::HashHash
                    } else {
                        Token::Hash
                    }
                }
                '+' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        AssignmentToken::AddEqual.into()
                    }
                    Some('+') => {
                        self.next_char();
                        Token::PlusPlus
                    }
                    _ => Token::Plus,
                },
                '-' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        AssignmentToken::SubEqual.into()
                    }
                    Some('-') => {
                        self.next_char();
                        Token::MinusMinus
                    }
                    Some('>') => {
                        self.next_char();
                        Token::StructDeref
                    }
                    _ => Token::Minus,
                },
                '*' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        AssignmentToken::MulEqual.into()
                    }
                    _ => Token::Star,
                },
                '/' => {
                    if self.match_next('=') {
                        AssignmentToken::DivEqual.into()
                    } else {
                        Token::Divide
                    }
                }
                '%' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        AssignmentToken::ModEqual.into()
                    }
                    _ => Token::Mod,
                },
                '^' => {
                    if self.match_next('=') {
                        AssignmentToken::XorEqual.into()
                    } else {
                        Token::Xor
                    }
                }
                '=' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        ComparisonToken::EqualEqual.into()
                    }
                    _ => Token::EQUAL,
                },
                '!' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        ComparisonToken::NotEqual.into()
                    }
                    _ => Token::LogicalNot,
                },
                '>' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        ComparisonToken::GreaterEqual.into()
                    }
                    Some('>') => {
                        self.next_char();
                        if self.match_next('=') {
                            AssignmentToken::ShrEqual.into()
                        } else {
                            Token::ShiftRight
                        }
                    }
                    _ => ComparisonToken::Greater.into(),
                },
                '<' => match self.peek() {
                    Some('=') => {
                        self.next_char();
                        ComparisonToken::LessEqual.into()
                    }
                    Some('<') => {
                        self.next_char();
                        if self.match_next('=') {
                            AssignmentToken::ShlEqual.into()
                        } else {
                            Token::ShiftLeft
                        }
                    }
                    _ => ComparisonToken::Less.into(),
                },
                '&' => match self.peek() {
                    Some('&') => {
                        self.next_char();
                        Token::LogicalAnd
                    }
                    Some('=') => {
                        self.next_char();
                        AssignmentToken::AndEqual.into()
                    }
                    _ => Token::Ampersand,
                },
                '|' => match self.peek() {
                    Some('|') => {
                        self.next_char();
                        Token::LogicalOr
                    }
                    Some('=') => {
                        self.next_char();
                        AssignmentToken::OrEqual.into()
                    }
                    _ => Token::BitwiseOr,
                },
                '{' => Token::LeftBrace,
                '}' => Token::RightBrace,
                '(' => Token::LeftParen,
                ')' => Token::RightParen,
                '[' => Token::LeftBracket,
                ']' => Token::RightBracket,
                '~' => Token::BinaryNot,
                ':' => Token::Colon,
                ';' => Token::Semicolon,
                ',' => Token::Comma,
                '.' => match self.peek() {
                    Some(c) if c.is_ascii_digit() => match self.parse_dot_float(span_start) {
                        Ok(f) => f,
                        Err(err) => {
                            return Some(Err(Locatable {
                                data: err,
                                location: self.span(span_start),
                            }))
                        }
                    },
                    Some('.') => {
                        if self.peek_next() == Some('.') {
                            self.next_char();
                            self.next_char();
                            Token::Ellipsis
                        } else {
                            Token::Dot
                        }
                    }
                    _ => Token::Dot,
                },
                '?' => Token::Question,
                '0'..='9' => match self.parse_num(c) {
                    Ok(num) => num,
                    Err(err) => {
                        let span = self.span(span_start);
                        return Some(Err(span.with(err)));
                    }
                },
                'a'..='z' | 'A'..='Z' | '_' => match self.parse_id(c) {
                    Ok(id) => id,
                    Err(err) => {
                        let span = self.span(span_start);
                        return Some(Err(span.with(err)));
                    }
                },
                '\'' => match self.parse_char(span_start) {
                    Ok(id) => id,
                    Err(err) => {
                        let span = self.span(span_start);
                        return Some(Err(span.with(err)));
                    }
                },
                '"' => {
                    self.unput('"');
                    match self.parse_string() {
                        Ok(id) => id,
                        Err(err) => {
                            let span = self.span(span_start);
                            return Some(Err(span.with(err)));
                        }
                    }
                }
                x => {
                    return Some(Err(self.span(span_start).with(LexError::UnknownToken(x))));
                }
            };
            // We've seen a token if this isn't # or whitespace
            self.seen_line_token |= !(data == Token::Hash || data.is_whitespace());
            Some(Ok(Locatable {
                data,
                location: self.span(span_start),
            }))
        });

        if self.debug {
            if let Some(Ok(token)) = &c {
                log::trace!("token: {}", token.data);
            }
        }
        c.or_else(|| self.error_handler.pop_front().map(Err))
    }
}
