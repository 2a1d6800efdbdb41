//! `#if` expression evaluation.
//!
//! The condition of an `#if`/`#elif` is an integer constant expression over
//! the widest signed type, evaluated after macro expansion — except for the
//! operand of `defined`, which is resolved against the raw identifier
//! before any replacement happens.
//!
//! Evaluation is structural: the expression is parsed into a small tree
//! first, and `&&`/`||`/`?:` only evaluate the operands they select. That
//! is what makes `0 && 1/0` legal while `1/0` is a division-by-zero
//! diagnostic.

use std::convert::TryFrom;

use crate::cond::{CondArena, CondId};
use crate::data::error::CppError;
use crate::data::lex::{ComparisonToken, LiteralToken, Locatable, Location, Token};
use crate::data::{CompileError, CompileResult};
use crate::intern::InternedStr;

use super::replace::{replace_iter, Definitions};

/// Evaluate the tokens of an `#if`/`#elif` condition.
///
/// `tokens` must not contain whitespace tokens and must not span lines.
pub(super) fn eval_condition(
    tokens: Vec<Locatable<Token>>,
    definitions: &Definitions,
    location: Location,
) -> CompileResult<bool> {
    if tokens.is_empty() {
        return Err(location.with(CppError::EmptyExpression).into());
    }
    // `defined` first: its operand must never be macro-expanded
    let tokens = resolve_defined(tokens, definitions)?;
    // then ordinary replacement over what's left
    let mut expanded = Vec::with_capacity(tokens.len());
    for item in replace_iter(tokens.into_iter().map(Ok), definitions) {
        match item {
            Ok(token) if token.data.is_whitespace() => {}
            Ok(token) => expanded.push(token),
            Err(err) => return Err(err),
        }
    }
    // an identifier that survives expansion evaluates to 0
    // http://port70.net/~nsz/c/c11/n1570.html#6.10.1p4
    for token in &mut expanded {
        if matches!(token.data, Token::Id(_)) {
            token.data = int(0);
        }
    }
    if expanded.is_empty() {
        return Err(location.with(CppError::EmptyExpression).into());
    }

    let mut parser = Parser {
        tokens: expanded.into_iter().peekable(),
        location,
    };
    let expr = parser.expr()?;
    if parser.tokens.next().is_some() {
        return Err(location.with(CppError::TooManyTokens).into());
    }
    Ok(eval(&expr, location)? != 0)
}

fn int(value: i64) -> Token {
    Token::Literal(LiteralToken::Int(arcstr::Substr::from(value.to_string())))
}

/// Replace `defined X` and `defined(X)` with `1` or `0`.
// http://port70.net/~nsz/c/c11/n1570.html#6.10.1p1
fn resolve_defined(
    tokens: Vec<Locatable<Token>>,
    definitions: &Definitions,
) -> CompileResult<Vec<Locatable<Token>>> {
    let defined: InternedStr = "defined".into();
    let mut output = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        match token.data {
            Token::Id(name) if name == defined => {
                let operand = defined_operand(&mut iter, token.location)?;
                let value = definitions.contains_key(&operand) as i64;
                output.push(token.location.with(int(value)));
            }
            _ => output.push(token),
        }
    }
    Ok(output)
}

// the tiny state machine for `defined(a)` / `defined a`
fn defined_operand(
    lex_tokens: &mut impl Iterator<Item = Locatable<Token>>,
    location: Location,
) -> CompileResult<InternedStr> {
    enum State {
        Start,
        SawParen,
        SawId(InternedStr),
    }
    use State::*;
    let mut state = Start;
    loop {
        return match lex_tokens.next() {
            None => match state {
                SawId(def) => Ok(def),
                _ => Err(CompileError::new(
                    CppError::EndOfFile("defined(identifier)").into(),
                    location,
                )),
            },
            Some(Locatable {
                data: Token::Id(def),
                location,
            }) => match state {
                Start => Ok(def),
                SawParen => {
                    state = SawId(def);
                    continue;
                }
                SawId(_) => Err(CompileError::new(
                    CppError::UnexpectedToken("right paren", Token::Id(def)).into(),
                    location,
                )),
            },
            Some(Locatable {
                data: Token::LeftParen,
                location,
            }) => match state {
                Start => {
                    state = SawParen;
                    continue;
                }
                _ => Err(CompileError::new(
                    CppError::UnexpectedToken("identifier or right paren", Token::LeftParen).into(),
                    location,
                )),
            },
            Some(Locatable {
                data: Token::RightParen,
                location,
            }) => match state {
                Start => Err(CompileError::new(
                    CppError::UnexpectedToken("identifier or left paren", Token::RightParen).into(),
                    location,
                )),
                SawParen => Err(CompileError::new(
                    CppError::UnexpectedToken("identifier", Token::RightParen).into(),
                    location,
                )),
                SawId(def) => Ok(def),
            },
            Some(other) => Err(CompileError::new(
                CppError::UnexpectedToken("identifier", other.data).into(),
                other.location,
            )),
        };
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(i64),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum UnaryOp {
    Not,
    BitNot,
    Minus,
    Plus,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[rustfmt::skip]
enum BinaryOp {
    Mul, Div, Mod,
    Add, Sub,
    Shl, Shr,
    Less, Greater, LessEq, GreaterEq,
    Eq, Ne,
    BitAnd,
    BitXor,
    BitOr,
    LogAnd,
    LogOr,
}

// see `BinaryOp` for all possible binary expressions
#[derive(Copy, Clone, Debug)]
enum Precedence {
    Binary(BinaryOp),
    Ternary,
}

impl Precedence {
    fn prec(&self) -> usize {
        use BinaryOp::*;
        match self {
            Precedence::Binary(op) => match op {
                Mul | Div | Mod => 11,
                Add | Sub => 10,
                Shl | Shr => 9,
                Less | Greater | LessEq | GreaterEq => 8,
                Eq | Ne => 7,
                BitAnd => 6,
                BitXor => 5,
                BitOr => 4,
                LogAnd => 3,
                LogOr => 2,
            },
            Precedence::Ternary => 1,
        }
    }
    fn left_associative(&self) -> bool {
        match self {
            Precedence::Ternary => false,
            Precedence::Binary(_) => true,
        }
    }
}

impl TryFrom<&Token> for Precedence {
    type Error = ();
    fn try_from(t: &Token) -> Result<Precedence, ()> {
        use BinaryOp::*;
        use ComparisonToken as Compare;
        let op = match t {
            Token::Star => Mul,
            Token::Divide => Div,
            Token::Mod => Mod,
            Token::Plus => Add,
            Token::Minus => Sub,
            Token::ShiftLeft => Shl,
            Token::ShiftRight => Shr,
            Token::Comparison(Compare::Less) => Less,
            Token::Comparison(Compare::Greater) => Greater,
            Token::Comparison(Compare::LessEqual) => LessEq,
            Token::Comparison(Compare::GreaterEqual) => GreaterEq,
            Token::Comparison(Compare::EqualEqual) => Eq,
            Token::Comparison(Compare::NotEqual) => Ne,
            Token::Ampersand => BitAnd,
            Token::Xor => BitXor,
            Token::BitwiseOr => BitOr,
            Token::LogicalAnd => LogAnd,
            Token::LogicalOr => LogOr,
            Token::Question => return Ok(Precedence::Ternary),
            _ => return Err(()),
        };
        Ok(Precedence::Binary(op))
    }
}

struct Parser {
    tokens: std::iter::Peekable<std::vec::IntoIter<Locatable<Token>>>,
    location: Location,
}

impl Parser {
    fn expr(&mut self) -> CompileResult<Expr> {
        let start = self.unary_expr()?;
        self.binary_expr(start, 0)
    }

    fn binary_expr(&mut self, mut left: Expr, max_precedence: usize) -> CompileResult<Expr> {
        while let Some(binop) = self
            .tokens
            .peek()
            .and_then(|tok| Precedence::try_from(&tok.data).ok())
        {
            let prec = binop.prec();
            if prec < max_precedence {
                break;
            }
            self.tokens.next();
            if let Precedence::Ternary = binop {
                // conditional_expression
                // : logical_or_expression
                // | logical_or_expression '?' expression ':' conditional_expression
                // ;
                let inner = self.expr()?;
                self.expect_colon()?;
                let right_start = self.unary_expr()?;
                let right = self.binary_expr(right_start, Precedence::Ternary.prec())?;
                left = Expr::Ternary(Box::new(left), Box::new(inner), Box::new(right));
                continue;
            }
            let op = match binop {
                Precedence::Binary(op) => op,
                Precedence::Ternary => unreachable!(),
            };
            let right = if binop.left_associative() {
                let inner_left = self.unary_expr()?;
                self.binary_expr(inner_left, prec + 1)?
            } else {
                let inner_left = self.unary_expr()?;
                self.binary_expr(inner_left, prec)?
            };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn expect_colon(&mut self) -> CompileResult<()> {
        match self.tokens.next() {
            Some(Locatable {
                data: Token::Colon, ..
            }) => Ok(()),
            Some(other) => Err(other
                .location
                .with(CppError::UnexpectedToken("':'", other.data))
                .into()),
            None => Err(self.location.with(CppError::EndOfFile("':'")).into()),
        }
    }

    // | '(' expr ')'
    // | unary_operator unary_expr
    // | LITERAL
    fn unary_expr(&mut self) -> CompileResult<Expr> {
        let next = match self.tokens.next() {
            Some(token) => token,
            None => {
                return Err(self
                    .location
                    .with(CppError::EndOfFile("expression"))
                    .into());
            }
        };
        let op = match next.data {
            Token::LeftParen => {
                let inner = self.expr()?;
                return match self.tokens.next() {
                    Some(Locatable {
                        data: Token::RightParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(other
                        .location
                        .with(CppError::UnexpectedToken("')'", other.data))
                        .into()),
                    None => Err(self.location.with(CppError::EndOfFile("')'")).into()),
                };
            }
            Token::LogicalNot => UnaryOp::Not,
            Token::BinaryNot => UnaryOp::BitNot,
            Token::Minus => UnaryOp::Minus,
            Token::Plus => UnaryOp::Plus,
            Token::Literal(literal) => {
                return literal_value(&literal, next.location).map(Expr::Literal);
            }
            other => {
                return Err(next
                    .location
                    .with(CppError::UnexpectedToken("integer expression", other))
                    .into());
            }
        };
        let inner = self.unary_expr()?;
        Ok(Expr::Unary(op, Box::new(inner)))
    }
}

/// Parse a raw literal lexeme to its value.
///
/// Overflow wraps: every value lives in the widest signed type.
fn literal_value(literal: &LiteralToken, location: Location) -> CompileResult<i64> {
    match literal {
        LiteralToken::Int(text) => Ok(parse_int(text)),
        LiteralToken::Char(text) => Ok(parse_char(text)),
        other => Err(location
            .with(CppError::UnexpectedToken(
                "integer expression",
                Token::Literal(other.clone()),
            ))
            .into()),
    }
}

fn parse_int(text: &str) -> i64 {
    // strip any suffix; the lexer already validated the shape
    let digits = text.trim_end_matches(|c| matches!(c, 'u' | 'U' | 'l' | 'L'));
    let (digits, radix) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (hex, 16)
    } else if let Some(bin) = digits
        .strip_prefix("0b")
        .or_else(|| digits.strip_prefix("0B"))
    {
        (bin, 2)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (&digits[1..], 8)
    } else {
        (digits, 10)
    };
    let mut acc = 0i64;
    for c in digits.chars() {
        if let Some(digit) = c.to_digit(radix) {
            acc = acc
                .wrapping_mul(radix as i64)
                .wrapping_add(digit as i64);
        }
    }
    acc
}

fn parse_char(text: &str) -> i64 {
    // strip the quotes
    let inner = &text[1..text.len().saturating_sub(1)];
    let mut chars = inner.chars();
    match chars.next() {
        Some('\\') => match chars.next() {
            Some('n') => b'\n' as i64,
            Some('r') => b'\r' as i64,
            Some('t') => b'\t' as i64,
            Some('a') => 0x07,
            Some('b') => 0x08,
            Some('f') => 0x0c,
            Some('v') => 0x0b,
            Some('0'..='7') => {
                let octal: String = inner[1..].chars().take_while(|c| ('0'..'8').contains(c)).collect();
                i64::from_str_radix(&octal, 8).unwrap_or(0)
            }
            Some('x') => {
                let hex: String = inner[2..]
                    .chars()
                    .take_while(char::is_ascii_hexdigit)
                    .collect();
                i64::from_str_radix(&hex, 16).unwrap_or(0)
            }
            Some(c) => c as i64,
            None => 0,
        },
        Some(c) => c as i64,
        None => 0,
    }
}

/// Fold an expression tree, selecting operands structurally.
fn eval(expr: &Expr, location: Location) -> CompileResult<i64> {
    use BinaryOp::*;
    Ok(match expr {
        Expr::Literal(value) => *value,
        Expr::Unary(op, inner) => {
            let value = eval(inner, location)?;
            match op {
                UnaryOp::Not => (value == 0) as i64,
                UnaryOp::BitNot => !value,
                UnaryOp::Minus => value.wrapping_neg(),
                UnaryOp::Plus => value,
            }
        }
        Expr::Ternary(cond, then, otherwise) => {
            if eval(cond, location)? != 0 {
                eval(then, location)?
            } else {
                eval(otherwise, location)?
            }
        }
        Expr::Binary(op, left, right) => {
            // the short-circuit operators must not evaluate an untaken
            // operand, e.g. `0 && 1/0` is false, not an error
            match op {
                LogAnd => {
                    return Ok((eval(left, location)? != 0 && eval(right, location)? != 0) as i64);
                }
                LogOr => {
                    return Ok((eval(left, location)? != 0 || eval(right, location)? != 0) as i64);
                }
                _ => {}
            }
            let l = eval(left, location)?;
            let r = eval(right, location)?;
            match op {
                Mul => l.wrapping_mul(r),
                Div => {
                    if r == 0 {
                        return Err(location.with(CppError::DivisionByZero).into());
                    }
                    l.wrapping_div(r)
                }
                Mod => {
                    if r == 0 {
                        return Err(location.with(CppError::DivisionByZero).into());
                    }
                    l.wrapping_rem(r)
                }
                Add => l.wrapping_add(r),
                Sub => l.wrapping_sub(r),
                Shl => l.wrapping_shl((r & 63) as u32),
                Shr => l.wrapping_shr((r & 63) as u32),
                Less => (l < r) as i64,
                Greater => (l > r) as i64,
                LessEq => (l <= r) as i64,
                GreaterEq => (l >= r) as i64,
                Eq => (l == r) as i64,
                Ne => (l != r) as i64,
                BitAnd => l & r,
                BitXor => l ^ r,
                BitOr => l | r,
                LogAnd | LogOr => unreachable!("handled above"),
            }
        }
    })
}

/// Build the presence-condition formula for an `#if` condition.
///
/// Pure combinations of `defined`, `!`, `&&`, `||`, and parentheses map to
/// structured formula nodes; anything else becomes a single opaque
/// expression atom over the normalized source text.
pub(super) fn extract_cond(tokens: &[Locatable<Token>], arena: &mut CondArena) -> CondId {
    struct DefinedParser<'a> {
        tokens: &'a [&'a Token],
        at: usize,
    }
    impl DefinedParser<'_> {
        fn peek(&self) -> Option<&Token> {
            self.tokens.get(self.at).copied()
        }
        fn next(&mut self) -> Option<&Token> {
            let token = self.tokens.get(self.at).copied();
            self.at += 1;
            token
        }
        fn or(&mut self, arena: &mut CondArena) -> Option<CondId> {
            let mut left = self.and(arena)?;
            while self.peek() == Some(&Token::LogicalOr) {
                self.next();
                let right = self.and(arena)?;
                left = arena.or(left, right);
            }
            Some(left)
        }
        fn and(&mut self, arena: &mut CondArena) -> Option<CondId> {
            let mut left = self.atom(arena)?;
            while self.peek() == Some(&Token::LogicalAnd) {
                self.next();
                let right = self.atom(arena)?;
                left = arena.and(left, right);
            }
            Some(left)
        }
        fn atom(&mut self, arena: &mut CondArena) -> Option<CondId> {
            match self.next() {
                Some(Token::LogicalNot) => {
                    let inner = self.atom(arena)?;
                    Some(arena.not(inner))
                }
                Some(Token::LeftParen) => {
                    let inner = self.or(arena)?;
                    match self.next() {
                        Some(Token::RightParen) => Some(inner),
                        _ => None,
                    }
                }
                Some(Token::Id(name)) if *name == "defined".into() => {
                    let operand = match self.next() {
                        Some(Token::LeftParen) => {
                            let id = self.next().and_then(|t| t.id())?;
                            match self.next() {
                                Some(Token::RightParen) => id,
                                _ => return None,
                            }
                        }
                        Some(Token::Id(id)) => *id,
                        _ => return None,
                    };
                    Some(arena.defined(operand))
                }
                _ => None,
            }
        }
    }

    let without_ws: Vec<&Token> = tokens
        .iter()
        .map(|t| &t.data)
        .filter(|t| !t.is_whitespace())
        .collect();
    // structured formula if the whole line is defined-algebra,
    // otherwise a single opaque atom over the normalized text
    let mut parser = DefinedParser {
        tokens: &without_ws,
        at: 0,
    };
    if let Some(id) = parser.or(arena) {
        if parser.at == without_ws.len() {
            return id;
        }
    }
    let text = without_ws
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    arena.expr(text.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::replace::Definition;
    use crate::lex::Lexer;

    fn lex(src: &str) -> (Vec<Locatable<Token>>, Location) {
        let source = arcstr::format!("{}\n", src);
        let mut files = codespan::Files::new();
        let file = files.add("<test>", arcstr::ArcStr::clone(&source));
        let tokens: Vec<_> = Lexer::new(file, source, false)
            .map(|res| res.expect("test input should lex"))
            .filter(|t| !t.data.is_whitespace())
            .collect();
        let location = tokens
            .first()
            .map(|t| t.location)
            .unwrap_or_else(|| Location {
                span: codespan::Span::new(0, 0),
                file,
            });
        (tokens, location)
    }

    fn eval_with(src: &str, definitions: &Definitions) -> CompileResult<bool> {
        let (tokens, location) = lex(src);
        eval_condition(tokens, definitions, location)
    }

    fn eval(src: &str) -> bool {
        eval_with(src, &Definitions::new()).expect("expected a value")
    }

    fn assert_eval_err(src: &str, expected: CppError) {
        match eval_with(src, &Definitions::new()) {
            Err(Locatable {
                data: crate::data::Error::PreProcessor(err),
                ..
            }) => assert_eq!(err, expected, "wrong error for {}", src),
            other => panic!("expected error for {}, got {:?}", src, other),
        }
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert!(eval("1 + 2 * 3 == 7"));
        assert!(eval("(1 + 2) * 3 == 9"));
        assert!(eval("10 % 3 == 1"));
        assert!(eval("2 << 3 == 16"));
        assert!(eval("255 >> 4 == 15"));
        assert!(eval("(1 | 2) == 3 && (1 & 3) == 1 && (1 ^ 3) == 2"));
        assert!(eval("-1 < 0 && +1 > 0"));
        assert!(eval("!0 && ~0 == -1"));
        assert!(!eval("1 > 2"));
    }

    #[test]
    fn radixes_and_chars() {
        assert!(eval("0x10 == 16"));
        assert!(eval("0755 == 493"));
        assert!(eval("0b101 == 5"));
        assert!(eval("16u == 0x10L"));
        assert!(eval("'a' == 97"));
        assert!(eval("'\\n' == 10"));
        assert!(eval("'\\x41' == 65"));
    }

    #[test]
    fn ternary() {
        assert!(eval("1 ? 2 : 3 == 2 ? 1 : 0"));
        assert!(eval("(0 ? 1 : 2) == 2"));
        assert!(eval("1 || 2 ? 3 : 4"));
    }

    #[test]
    fn short_circuit_prevents_division() {
        assert!(!eval("0 && 1/0"));
        assert!(eval("1 || 1/0"));
        assert!(eval("(0 ? 1/0 : 2) == 2"));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eval_err("1/0", CppError::DivisionByZero);
        assert_eval_err("1 % 0", CppError::DivisionByZero);
        assert_eval_err("1 && 1/0", CppError::DivisionByZero);
    }

    #[test]
    fn overflow_wraps() {
        assert!(eval("9223372036854775807 + 1 < 0"));
        assert!(eval("-9223372036854775807 - 2 > 0"));
    }

    #[test]
    fn undefined_identifiers_are_zero() {
        assert!(!eval("NOT_DEFINED"));
        assert!(eval("NOT_DEFINED == 0"));
        assert!(eval("NOT_DEFINED || 1"));
    }

    #[test]
    fn defined_operator() {
        let mut definitions = Definitions::new();
        definitions.insert("FOO".into(), Definition::Object(vec![]));
        assert!(eval_with("defined(FOO)", &definitions).unwrap());
        assert!(eval_with("defined FOO", &definitions).unwrap());
        assert!(!eval_with("defined(BAR)", &definitions).unwrap());
        assert!(eval_with("!defined(BAR)", &definitions).unwrap());
        // the operand is not macro-expanded
        definitions.insert(
            "ALIAS".into(),
            Definition::Object(vec![Token::Id("FOO".into())]),
        );
        assert!(eval_with("defined ALIAS", &definitions).unwrap());
    }

    #[test]
    fn macros_expand_before_evaluation() {
        let mut definitions = Definitions::new();
        definitions.insert(
            "WORDSIZE".into(),
            Definition::Object(vec![int(64)]),
        );
        assert!(eval_with("WORDSIZE == 64", &definitions).unwrap());
        definitions.insert(
            "DOUBLE".into(),
            Definition::Function {
                params: vec!["x".into()],
                variadic: false,
                body: vec![
                    Token::Id("x".into()),
                    Token::Plus,
                    Token::Id("x".into()),
                ],
            },
        );
        assert!(eval_with("DOUBLE(4) == 8", &definitions).unwrap());
    }

    #[test]
    fn malformed_expressions() {
        assert_eval_err("1 +", CppError::EndOfFile("expression"));
        assert_eval_err("1 2", CppError::TooManyTokens);
        assert_eval_err("1 ? 2", CppError::EndOfFile("':'"));
    }

    #[test]
    fn formula_extraction() {
        use crate::cond::CondArena;
        let mut arena = CondArena::new();
        let (tokens, _) = lex("defined(A) && !defined(B)");
        let id = extract_cond(&tokens, &mut arena);
        assert_eq!(
            arena.display(id).to_string(),
            "defined(A) && !defined(B)"
        );
        let (tokens, _) = lex("A > 2");
        let id = extract_cond(&tokens, &mut arena);
        assert_eq!(arena.display(id).to_string(), "(A > 2)");
        // defined-algebra must cover the whole line to stay structured
        let (tokens, _) = lex("defined(A) && A > 2");
        let id = extract_cond(&tokens, &mut arena);
        assert_eq!(
            arena.display(id).to_string(),
            "(defined ( A ) && A > 2)"
        );
    }
}
