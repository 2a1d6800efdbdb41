use crate::data::lex::test::{cpp, cpp_no_newline};
use crate::data::lex::{LiteralToken, PpToken};
use crate::data::{CompileError, Token};
use crate::intern::InternedStr;

type LexType = Result<PpToken, CompileError>;

fn lex(input: &str) -> Option<LexType> {
    let mut lexed = lex_all(input);
    assert!(
        lexed.len() <= 1,
        "too many lexemes for {}: {:?}",
        input,
        lexed
    );
    lexed.pop()
}
fn lex_all(input: &str) -> Vec<LexType> {
    cpp(input)
        .filter(|res| !matches!(res, Ok(token) if token.is_whitespace()))
        .collect()
}

fn match_data<T>(lexed: Option<LexType>, closure: T) -> bool
where
    T: FnOnce(Result<&Token, &str>) -> bool,
{
    match lexed {
        Some(Ok(result)) => closure(Ok(&result.token)),
        Some(Err(err)) if err.is_lex_err() => closure(Err(&err.data.to_string())),
        _ => false,
    }
}

fn match_all(lexed: &[LexType], expected: &[Token]) -> bool {
    lexed.len() == expected.len()
        && lexed
            .iter()
            .zip(expected)
            .all(|(actual, expected)| match actual {
                Ok(token) => token.token == *expected,
                _ => false,
            })
}

fn int(text: &str) -> Token {
    Token::Literal(LiteralToken::Int(text.into()))
}
fn float(text: &str) -> Token {
    Token::Literal(LiteralToken::Float(text.into()))
}
fn chr(text: &str) -> Token {
    Token::Literal(LiteralToken::Char(text.into()))
}
fn string(segments: &[&str]) -> Token {
    Token::Literal(LiteralToken::Str(
        segments.iter().map(|s| (*s).into()).collect(),
    ))
}

fn assert_int(s: &str) {
    assert!(
        match_data(lex(s), |lexed| lexed == Ok(&int(s))),
        "{} didn't keep its raw lexeme",
        s
    );
}
fn assert_float(s: &str) {
    assert!(
        match_data(lex(s), |lexed| lexed == Ok(&float(s))),
        "{} didn't lex as a float",
        s
    );
}
fn assert_err(s: &str) {
    let lexed = lex_all(s);
    assert!(
        lexed.iter().any(|e| e.is_err()),
        "{:?} is not an error (from {})",
        &lexed,
        s
    );
}

#[test]
fn test_plus() {
    assert!(match_data(lex("+"), |lexed| lexed == Ok(&Token::Plus)));
}

#[test]
fn test_ellipses() {
    assert!(match_all(
        &lex_all("...;...;.."),
        &[
            Token::Ellipsis,
            Token::Semicolon,
            Token::Ellipsis,
            Token::Semicolon,
            Token::Dot,
            Token::Dot,
        ]
    ));
}

#[test]
fn test_hash() {
    // a `#` that is not first on its line is an ordinary token
    assert!(match_all(
        &lex_all("a # b"),
        &[Token::Id("a".into()), Token::Hash, Token::Id("b".into())]
    ));
    assert!(match_all(
        &lex_all("a ## b"),
        &[Token::Id("a".into()), Token::HashHash, Token::Id("b".into())]
    ));
    // a `#` alone at the start of a line is the null directive
    assert_eq!(lex("#"), None);
}

#[test]
fn test_int_literals() {
    // lexemes are raw: nothing is evaluated here
    assert_int("10");
    assert_int("0x10");
    assert_int("0b10");
    assert_int("010");
    assert_int("02l");
    assert_int("0L");
    assert_int("0xff");
    assert_int("0xFF");
    assert_int("9223372036854775807u");
    // larger than any integer type: still a single raw token
    assert_int("10000000000000000000000");
    assert_err("0b");
    assert_err("0x");
    assert_eq!(lex_all("1a").len(), 2);
}

#[test]
fn test_float_literals() {
    assert_float("0.1");
    assert_float(".1");
    assert_float("1e10");
    assert_float("1E-10");
    assert_float("2.5f");
    assert_float("3.000f");
    assert_float("0x.ep0");
    assert_float("0xep-4f");
    assert_float("1.797693134862315708e+308L");
    assert!(match_all(&lex_all("-1"), &[Token::Minus, int("1")]));
    assert!(match_all(
        &lex_all("-1e10"),
        &[Token::Minus, float("1e10")]
    ));
}

#[test]
fn test_num_errors() {
    assert_err("1e");
    assert_err("1e+");
    assert_eq!(lex_all("1e1.0").len(), 2);
}

fn lots_of(c: char) -> String {
    let mut buf = Vec::new();
    buf.resize(8096, c);
    buf.into_iter().collect()
}

#[test]
// used to have a stack overflow on large consecutive whitespace inputs
fn test_lots_of_whitespace() {
    assert_eq!(lex(&lots_of(' ')), None);
    assert_eq!(lex(&lots_of('\t')), None);
    assert_eq!(lex(&lots_of('\n')), None);
}

#[test]
fn backslashes() {
    let a = InternedStr::get_or_intern("a");
    assert!(match_data(
        lex(r"\
    a"),
        |lexed| lexed == Ok(&Token::Id(a))
    ));
    assert!(match_data(
        lex(r"\
    \
    \
    a"),
        |lexed| lexed == Ok(&Token::Id(a))
    ));
    assert!(match_data(lex("\\\na"), |lexed| lexed == Ok(&Token::Id(a))));
    assert_err(r"\a");
}

#[test]
fn test_comments() {
    assert!(lex("/* this is a comment /* /* /* */").is_none());
    assert!(lex("// this is a comment // /// // ").is_none());
    assert!(lex("/*/ this is part of the comment */").is_none());
    assert_eq!(
        lex_all(
            "/* make sure it finds things _after_ comments */
    int i;"
        )
        .len(),
        3
    );
    let bad_comment = lex("/* unterminated comments are an error ");
    assert!(
        bad_comment.is_some() && bad_comment.as_ref().unwrap().is_err(),
        "expected unterminated comment err, got {:?}",
        bad_comment
    );
    // check for stack overflow
    assert_eq!(lex(&"//".repeat(10_000)), None);
    assert_eq!(lex(&"/* */".repeat(10_000)), None);
}

#[test]
fn test_characters() {
    // escape sequences are carried through uninterpreted
    assert!(match_data(lex("'a'"), |lexed| lexed == Ok(&chr("'a'"))));
    assert!(match_data(lex("'0'"), |lexed| lexed == Ok(&chr("'0'"))));
    assert!(match_data(lex(r"'\0'"), |lexed| lexed == Ok(&chr(r"'\0'"))));
    assert!(match_data(lex(r"'\\'"), |lexed| lexed == Ok(&chr(r"'\\'"))));
    assert!(match_data(lex(r"'\n'"), |lexed| lexed == Ok(&chr(r"'\n'"))));
    assert!(match_data(lex(r"'\''"), |lexed| lexed == Ok(&chr(r"'\''"))));
    assert!(match_data(lex(r"'\x41'"), |lexed| lexed
        == Ok(&chr(r"'\x41'"))));
    assert_err("''");
    assert_err("'a");
    assert_err("'a\nb'");
}

#[test]
fn test_strings() {
    assert!(match_data(lex(r#""a string""#), |lexed| lexed
        == Ok(&string(&[r#""a string""#]))));
    // escapes stay as written
    assert!(match_data(lex(r#""with \"escapes\\""#), |lexed| lexed
        == Ok(&string(&[r#""with \"escapes\\""#]))));
    // adjacent literals collect into one token, each segment keeping its quotes
    assert!(match_data(lex(r#""consecutive " "strings""#), |lexed| {
        lexed == Ok(&string(&[r#""consecutive ""#, r#""strings""#]))
    }));
    assert_err("\"");
    assert_err("\"unterminated\nnope\"");
}

#[test]
fn test_no_newline() {
    assert!(cpp_no_newline("").next().is_none());
    let mut tokens: Vec<_> = cpp_no_newline(" ").collect();
    assert_eq!(tokens.len(), 2); // the whitespace, then the error
    assert!(tokens.remove(1).unwrap_err().is_lex_err());
}

// Integration tests
#[test]
fn test_for_loop() {
    assert!(lex_all(
        "for (int i = 0; i < 100; ++i {
        a[i] = i << 2 + i*4;
        }"
    )
    .into_iter()
    .all(|x| x.is_ok()))
}
