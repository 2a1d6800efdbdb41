#![allow(unreachable_pub)]
//! Macro replacement
//!
//! This module does no parsing and accepts only tokens.
//!
//! Recursion is prevented by painting: every token produced while macro `X`
//! is being replaced carries `X` in its paint set and is never eligible to
//! trigger `X` again. The paint travels with each token instead of living in
//! a shared flag, so `#define a a` expands to `a` exactly once and mutually
//! recursive definitions unwind instead of looping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use arcstr::Substr;

use super::cpp::CppResult;
use super::Lexer;
use crate::data::error::CppError;
use crate::data::lex::{LiteralToken, Locatable, Location, Token};
use crate::intern::InternedStr;

pub type Definitions = HashMap<InternedStr, Definition>;

#[derive(Clone, Debug)]
pub enum Definition {
    Object(Vec<Token>),
    Function {
        params: Vec<InternedStr>,
        variadic: bool,
        body: Vec<Token>,
    },
}

impl Definition {
    /// Whether redefining `self` as `other` is benign.
    ///
    /// Definitions are compatible when they have the same shape, the same
    /// parameter spellings, and the same body after whitespace
    /// normalization (any run of whitespace counts the same as any other).
    pub fn compatible_with(&self, other: &Definition) -> bool {
        use Definition::*;
        match (self, other) {
            (Object(left), Object(right)) => normalized(left) == normalized(right),
            (
                Function {
                    params: lp,
                    variadic: lv,
                    body: lb,
                },
                Function {
                    params: rp,
                    variadic: rv,
                    body: rb,
                },
            ) => lp == rp && lv == rv && normalized(lb) == normalized(rb),
            _ => false,
        }
    }
}

// collapse every whitespace run to a single space and drop the ends,
// so `a  +  b` and `a + b` compare equal
fn normalized(body: &[Token]) -> Vec<Token> {
    let mut out = Vec::with_capacity(body.len());
    for token in body {
        if token.is_whitespace() {
            if matches!(out.last(), Some(Token::Whitespace(_)) | None) {
                continue;
            }
            out.push(Token::Whitespace(" ".into()));
        } else {
            out.push(token.clone());
        }
    }
    if matches!(out.last(), Some(Token::Whitespace(_))) {
        out.pop();
    }
    out
}

/// The set of macro names a token is painted with.
type Paint = HashSet<InternedStr>;

struct Pending {
    item: CppResult<Token>,
    paint: Rc<Paint>,
}

impl Pending {
    fn fresh(item: CppResult<Token>) -> Pending {
        Pending {
            item,
            paint: Rc::new(Paint::new()),
        }
    }
}

/// Replace every token in `iter`, consuming further tokens from the same
/// iterator when a function-like invocation spans them.
pub fn replace_iter<I>(iter: I, definitions: &Definitions) -> Vec<CppResult<Token>>
where
    I: IntoIterator<Item = CppResult<Token>>,
{
    let mut output = Vec::new();
    let mut stream = iter.into_iter();
    while let Some(item) = stream.next() {
        match item {
            Err(err) => output.push(Err(err)),
            Ok(token) => output.extend(replace(
                definitions,
                token.data,
                &mut stream,
                token.location,
            )),
        }
    }
    output
}

/// Possibly recursively replace one token.
///
/// This performs object-macro replacement, function-macro replacement, and
/// rescanning, all in one: the replacement list is pushed onto a work queue
/// and every token coming off the queue is itself a candidate, unless its
/// paint forbids it.
///
/// A function-like macro name followed by `(` consumes its argument list
/// from the queue first and then from `inner` — the tokens after the
/// invocation in the source.
///
/// An expansion error (wrong arity, invalid paste) aborts only that
/// invocation: the diagnostic is emitted as an `Err` item and the
/// invocation's own tokens pass through unexpanded.
pub fn replace<S>(
    definitions: &Definitions,
    token: Token,
    inner: &mut S,
    location: Location,
) -> Vec<CppResult<Token>>
where
    S: Iterator<Item = CppResult<Token>>,
{
    let mut output = Vec::new();
    let mut pending = VecDeque::new();
    pending.push_back(Pending::fresh(Ok(location.with(token))));

    while let Some(Pending { item, paint }) = pending.pop_front() {
        let token = match item {
            Err(err) => {
                output.push(Err(err));
                continue;
            }
            Ok(token) => token,
        };
        let name = match token.data.id() {
            Some(id) if !paint.contains(&id) => id,
            _ => {
                output.push(Ok(token));
                continue;
            }
        };
        match definitions.get(&name) {
            None => output.push(Ok(token)),
            Some(Definition::Object(body)) => {
                let mut painted = Paint::clone(&paint);
                painted.insert(name);
                let painted = Rc::new(painted);
                match substitute_object(body, token.location) {
                    Ok(tokens) => prepend(&mut pending, tokens, &painted),
                    Err(err) => {
                        // pasting failed: report it and emit the name untouched
                        output.push(Err(err));
                        output.push(Ok(token));
                    }
                }
            }
            Some(Definition::Function {
                params,
                variadic,
                body,
            }) => {
                // `f` alone is not an invocation; look ahead for `(`
                let mut skipped = Vec::new();
                if !find_left_paren(&mut pending, inner, &mut skipped) {
                    output.push(Ok(token));
                    for ws in skipped {
                        pending.push_front(ws);
                    }
                    continue;
                }
                let mut consumed = vec![token.location.with(Token::LeftParen)];
                let args = match collect_args(
                    &mut pending,
                    inner,
                    &mut consumed,
                    params.len(),
                    *variadic,
                    token.location,
                ) {
                    Ok(args) => args,
                    Err(err) => {
                        output.push(Err(err));
                        output.push(Ok(token.clone()));
                        output.extend(consumed.into_iter().map(Ok));
                        continue;
                    }
                };
                match check_arity(&args, params.len(), *variadic) {
                    Ok(()) => {}
                    Err(cpp_err) => {
                        output.push(Err(token.location.with(cpp_err).into()));
                        output.push(Ok(token.clone()));
                        output.extend(consumed.into_iter().map(Ok));
                        continue;
                    }
                }
                let mut painted = Paint::clone(&paint);
                painted.insert(name);
                let painted = Rc::new(painted);
                match substitute_function(
                    params,
                    *variadic,
                    body,
                    &args,
                    definitions,
                    token.location,
                ) {
                    Ok(tokens) => prepend(&mut pending, tokens, &painted),
                    Err(err) => {
                        output.push(Err(err));
                        output.push(Ok(token.clone()));
                        output.extend(consumed.into_iter().map(Ok));
                    }
                }
            }
        }
    }
    output
}

fn prepend(pending: &mut VecDeque<Pending>, tokens: Vec<Locatable<Token>>, paint: &Rc<Paint>) {
    // they need to go before, not after. For instance:
    // ```c
    // #define a b c d
    // #define b 1 + 2
    // a
    // ```
    // should replace to `1 + 2 c d`, not `c d 1 + 2`
    for token in tokens.into_iter().rev() {
        pending.push_front(Pending {
            item: Ok(token),
            paint: Rc::clone(paint),
        });
    }
}

// Look for a `(` after the macro name, first in the already-queued tokens,
// then in the outer stream. Whitespace between the name and the paren is
// allowed; anything else means this is not an invocation, and whatever was
// skipped is handed back through `skipped`.
fn find_left_paren<S>(
    pending: &mut VecDeque<Pending>,
    inner: &mut S,
    skipped: &mut Vec<Pending>,
) -> bool
where
    S: Iterator<Item = CppResult<Token>>,
{
    loop {
        let next = match pending.pop_front() {
            Some(pending) => pending,
            None => match inner.next() {
                Some(item) => Pending::fresh(item),
                None => {
                    skipped.reverse();
                    return false;
                }
            },
        };
        match &next.item {
            Ok(Locatable {
                data: Token::LeftParen,
                ..
            }) => return true,
            // the `(` must come on the same logical line: a name at the end
            // of a line must not drag the next line's directive into an
            // argument list
            Ok(Locatable {
                data: Token::Whitespace(ws),
                ..
            }) => {
                let ends_line = ws.contains('\n');
                skipped.push(next);
                if ends_line {
                    skipped.reverse();
                    return false;
                }
            }
            _ => {
                skipped.push(next);
                skipped.reverse();
                return false;
            }
        }
    }
}

// Collect a balanced, comma-separated argument list. Assumes the `(` has
// been consumed. Every raw token consumed is appended to `consumed` so the
// caller can pass the invocation through untouched if something fails.
fn collect_args<S>(
    pending: &mut VecDeque<Pending>,
    inner: &mut S,
    consumed: &mut Vec<Locatable<Token>>,
    named: usize,
    variadic: bool,
    location: Location,
) -> Result<Vec<Vec<Locatable<Token>>>, crate::data::CompileError>
where
    S: Iterator<Item = CppResult<Token>>,
{
    let mut args = Vec::new();
    let mut current: Vec<Locatable<Token>> = Vec::new();
    let mut parens = 1usize;
    let mut brackets = 0usize;
    loop {
        let next = match pending.pop_front() {
            Some(Pending { item, .. }) => item,
            None => match inner.next() {
                Some(item) => item,
                None => {
                    return Err(location.with(CppError::EndOfFile("')'")).into());
                }
            },
        };
        let next = next?;
        match next.data {
            // NOTE: `f(,)` is _legal_ and means two empty arguments.
            // Once the named parameters of a variadic macro are filled,
            // commas stop separating: the rest is one trailing argument.
            Token::Comma
                if parens == 1 && brackets == 0 && (!variadic || args.len() < named) =>
            {
                consumed.push(next);
                args.push(trim(std::mem::take(&mut current)));
                continue;
            }
            Token::RightParen => {
                parens -= 1;
                if parens == 0 {
                    consumed.push(next);
                    args.push(trim(std::mem::take(&mut current)));
                    break;
                }
            }
            Token::LeftParen => parens += 1,
            Token::LeftBracket => brackets += 1,
            Token::RightBracket => brackets = brackets.saturating_sub(1),
            _ => {}
        }
        consumed.push(next.clone());
        current.push(next);
    }
    Ok(args)
}

fn trim(mut arg: Vec<Locatable<Token>>) -> Vec<Locatable<Token>> {
    while matches!(arg.last(), Some(t) if t.data.is_whitespace()) {
        arg.pop();
    }
    while matches!(arg.first(), Some(t) if t.data.is_whitespace()) {
        arg.remove(0);
    }
    arg
}

fn check_arity(
    args: &[Vec<Locatable<Token>>],
    named: usize,
    variadic: bool,
) -> Result<(), CppError> {
    // `f()` parses as a single empty argument; for a macro of no parameters
    // that _is_ the empty argument list
    let effective = if args.len() == 1 && args[0].is_empty() && named == 0 && !variadic {
        0
    } else {
        args.len()
    };
    if variadic {
        // the named parameters must all be present; `V()` omits them
        if named > 0 && (effective < named || (args.len() == 1 && args[0].is_empty())) {
            return Err(CppError::TooFewArguments(0, named));
        }
        Ok(())
    } else if effective != named {
        Err(CppError::TooFewArguments(effective, named))
    } else {
        Ok(())
    }
}

// What a body token turns into before pasting is resolved.
enum Chunk {
    Tok(Token),
    /// a parameter occurrence; `expand` is false for `#`/`##` operands
    Arg { index: usize, expand: bool },
    Stringify(usize),
    Paste,
}

/// Substitute an object-like body: only `##` needs handling.
fn substitute_object(
    body: &[Token],
    location: Location,
) -> Result<Vec<Locatable<Token>>, crate::data::CompileError> {
    let mut chunks = Vec::with_capacity(body.len());
    let mut iter = body.iter().peekable();
    while let Some(token) = iter.next() {
        if *token == Token::HashHash {
            pop_trailing_whitespace(&mut chunks);
            if chunks.is_empty() {
                return Err(location.with(CppError::InvalidPaste("##".into())).into());
            }
            chunks.push(Chunk::Paste);
            skip_whitespace(&mut iter);
        } else {
            chunks.push(Chunk::Tok(token.clone()));
        }
    }
    if matches!(chunks.last(), Some(Chunk::Paste)) {
        return Err(location.with(CppError::InvalidPaste("##".into())).into());
    }
    resolve(chunks, &[], &Definitions::new(), location)
}

/// Substitute a function-like body: stringification, pasting, and argument
/// substitution with prescan.
fn substitute_function(
    params: &[InternedStr],
    variadic: bool,
    body: &[Token],
    args: &[Vec<Locatable<Token>>],
    definitions: &Definitions,
    location: Location,
) -> Result<Vec<Locatable<Token>>, crate::data::CompileError> {
    let va_args: InternedStr = "__VA_ARGS__".into();
    let param_index = |id: InternedStr| -> Option<usize> {
        if let Some(i) = params.iter().position(|&p| p == id) {
            Some(i)
        } else if variadic && id == va_args {
            Some(params.len())
        } else {
            None
        }
    };

    // first pass: classify every body token
    let mut chunks = Vec::with_capacity(body.len());
    let mut iter = body.iter().peekable();
    while let Some(token) = iter.next() {
        match token {
            Token::Hash => {
                skip_whitespace(&mut iter);
                match iter.next().and_then(|t| t.id()).and_then(param_index) {
                    Some(index) => chunks.push(Chunk::Stringify(index)),
                    None => {
                        return Err(location.with(CppError::InvalidStringify).into());
                    }
                }
            }
            Token::HashHash => {
                pop_trailing_whitespace(&mut chunks);
                if chunks.is_empty() {
                    return Err(location.with(CppError::InvalidPaste("##".into())).into());
                }
                chunks.push(Chunk::Paste);
                skip_whitespace(&mut iter);
            }
            Token::Id(id) => match param_index(*id) {
                Some(index) => chunks.push(Chunk::Arg {
                    index,
                    expand: true,
                }),
                None => chunks.push(Chunk::Tok(token.clone())),
            },
            _ => chunks.push(Chunk::Tok(token.clone())),
        }
    }
    if matches!(chunks.last(), Some(Chunk::Paste)) {
        return Err(location.with(CppError::InvalidPaste("##".into())).into());
    }

    // second pass: a parameter next to `##` substitutes its raw argument
    for i in 0..chunks.len() {
        let next_to_paste = (i > 0 && matches!(chunks[i - 1], Chunk::Paste))
            || matches!(chunks.get(i + 1), Some(Chunk::Paste));
        if let Chunk::Arg { expand, .. } = &mut chunks[i] {
            if next_to_paste {
                *expand = false;
            }
        }
    }

    // GNU extension exercised all over real kernel headers:
    // `, ## __VA_ARGS__` swallows the comma when the varargs are empty,
    // and degrades to a plain substitution when they are not
    if variadic {
        let va_empty = args
            .get(params.len())
            .map_or(true, |trailing| trailing.is_empty());
        let mut i = 0;
        while i + 2 < chunks.len() {
            let is_comma = matches!(chunks[i], Chunk::Tok(Token::Comma));
            let is_paste = matches!(chunks[i + 1], Chunk::Paste);
            let is_va = matches!(chunks[i + 2], Chunk::Arg { index, .. } if index == params.len());
            if is_comma && is_paste && is_va {
                if va_empty {
                    chunks.drain(i..i + 3);
                } else {
                    chunks.remove(i + 1);
                }
            }
            i += 1;
        }
    }

    resolve(chunks, args, definitions, location)
}

fn skip_whitespace<'a, I: Iterator<Item = &'a Token>>(iter: &mut std::iter::Peekable<I>) {
    while matches!(iter.peek(), Some(t) if t.is_whitespace()) {
        iter.next();
    }
}

fn pop_trailing_whitespace(chunks: &mut Vec<Chunk>) {
    while matches!(chunks.last(), Some(Chunk::Tok(t)) if t.is_whitespace()) {
        chunks.pop();
    }
}

// Materialize chunks into tokens, resolving `##` as we go.
fn resolve(
    chunks: Vec<Chunk>,
    args: &[Vec<Locatable<Token>>],
    definitions: &Definitions,
    location: Location,
) -> Result<Vec<Locatable<Token>>, crate::data::CompileError> {
    let empty: Vec<Locatable<Token>> = Vec::new();
    let arg_at = |index: usize| -> &Vec<Locatable<Token>> { args.get(index).unwrap_or(&empty) };

    let mut output: Vec<Locatable<Token>> = Vec::new();
    let mut iter = chunks.into_iter().peekable();
    while let Some(chunk) = iter.next() {
        match chunk {
            Chunk::Tok(token) => output.push(location.with(token)),
            Chunk::Stringify(index) => {
                output.push(location.with(stringify(arg_at(index))));
            }
            Chunk::Arg { index, expand } => {
                let raw = arg_at(index);
                if expand {
                    // the argument prescan: expand the argument in isolation
                    for item in replace_iter(raw.iter().cloned().map(Ok), definitions) {
                        match item {
                            Ok(token) => output.push(token),
                            // errors inside an argument abort the invocation
                            Err(err) => return Err(err),
                        }
                    }
                } else {
                    output.extend(raw.iter().cloned());
                }
            }
            Chunk::Paste => {
                // left operand: the last real token produced so far
                while matches!(output.last(), Some(t) if t.data.is_whitespace()) {
                    output.pop();
                }
                let left = output.pop();
                // right operand: the first real token of the next chunk
                let mut right_rest = match iter.next() {
                    Some(Chunk::Tok(token)) => vec![location.with(token)],
                    Some(Chunk::Stringify(index)) => vec![location.with(stringify(arg_at(index)))],
                    Some(Chunk::Arg { index, .. }) => arg_at(index).clone(),
                    // `## ##` or trailing `##`: rejected during classification
                    Some(Chunk::Paste) | None => {
                        return Err(location.with(CppError::InvalidPaste("##".into())).into());
                    }
                };
                let right = if right_rest.is_empty() {
                    None
                } else {
                    Some(right_rest.remove(0))
                };
                match (left, right) {
                    // an empty argument on either side: nothing to paste with
                    (None, None) => {}
                    (Some(single), None) | (None, Some(single)) => output.push(single),
                    (Some(left), Some(right)) => {
                        let text = format!("{}{}", left.data, right.data);
                        match lex_fragment(&text) {
                            Some(token) => output.push(location.with(token)),
                            None => {
                                return Err(location.with(CppError::InvalidPaste(text)).into());
                            }
                        }
                    }
                }
                output.extend(right_rest);
            }
        }
    }
    Ok(output)
}

/// Turn an argument's raw tokens into a string literal: interior whitespace
/// collapses to one space, the ends are trimmed, and `"`/`\` are escaped.
fn stringify(arg: &[Locatable<Token>]) -> Token {
    let mut text = String::new();
    for token in arg {
        if token.data.is_whitespace() {
            if !(text.is_empty() || text.ends_with(' ')) {
                text.push(' ');
            }
        } else {
            text.push_str(&token.data.to_string());
        }
    }
    let text = text.trim_end();
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('"');
    Token::Literal(LiteralToken::Str(vec![Substr::from(escaped)]))
}

/// Re-lex a paste result. `Some(token)` only if the text forms exactly one
/// preprocessing token.
fn lex_fragment(text: &str) -> Option<Token> {
    let source = arcstr::format!("{}\n", text);
    let mut files = codespan::Files::new();
    let id = files.add("<token paste>", arcstr::ArcStr::clone(&source));
    let mut tokens = Lexer::new(id, source, false)
        .filter(|item| !matches!(item, Ok(t) if t.data.is_whitespace()))
        .map(|item| item.map(|t| t.data));
    match (tokens.next(), tokens.next()) {
        (Some(Ok(token)), None) => Some(token),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> Locatable<Token> {
        Location::default().with(Token::Whitespace(" ".into()))
    }
    fn id(name: &str) -> Locatable<Token> {
        Location::default().with(Token::Id(name.into()))
    }

    #[test]
    fn stringify_collapses_whitespace() {
        let arg = vec![
            id("a"),
            ws(),
            ws(),
            Location::default().with(Token::Plus),
            ws(),
            id("b"),
        ];
        assert_eq!(
            stringify(&arg).to_string(),
            "\"a + b\"".to_string(),
        );
        assert_eq!(stringify(&[]).to_string(), "\"\"");
    }

    #[test]
    fn stringify_escapes_quotes_and_backslashes() {
        let lit = Location::default().with(Token::Literal(LiteralToken::Str(vec![
            Substr::from(r#""hey there""#),
        ])));
        assert_eq!(stringify(&[lit]).to_string(), r#""\"hey there\"""#);
    }

    #[test]
    fn paste_fragments() {
        assert_eq!(lex_fragment("foo"), Some(Token::Id("foo".into())));
        assert_eq!(lex_fragment("++"), Some(Token::PlusPlus));
        assert_eq!(lex_fragment("+-"), None);
        assert!(matches!(
            lex_fragment("1234"),
            Some(Token::Literal(LiteralToken::Int(_)))
        ));
    }

    #[test]
    fn whitespace_insensitive_compatibility() {
        let parse = |s: &str| -> Vec<Token> {
            let source = arcstr::format!("{}\n", s);
            let mut files = codespan::Files::new();
            let file = files.add("<test>", arcstr::ArcStr::clone(&source));
            Lexer::new(file, source, false)
                .map(|res| res.unwrap().data)
                .collect()
        };
        let a = Definition::Object(parse("x  +  y"));
        let b = Definition::Object(parse("x + y"));
        let c = Definition::Object(parse("x+y"));
        assert!(a.compatible_with(&b));
        // whitespace runs are interchangeable, but presence still matters
        assert!(!a.compatible_with(&c));
        let f = Definition::Function {
            params: vec!["a".into()],
            variadic: false,
            body: parse("a"),
        };
        assert!(!a.compatible_with(&f));
        let g = Definition::Function {
            params: vec!["b".into()],
            variadic: false,
            body: parse("b"),
        };
        assert!(!f.compatible_with(&g));
    }
}
