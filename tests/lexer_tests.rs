//! Scanner behavior over whole-token-stream inputs.

use gscript::lexer::{Lexer, TokenKind};
use gscript::source::SourceBuffer;
use proptest::prelude::*;

fn scan(src: &str) -> Vec<(TokenKind, String)> {
    let buf = SourceBuffer::new("input.gs", src);
    let (tokens, diags) = Lexer::new(&buf).tokenize();
    assert!(diags.is_empty(), "unexpected diagnostics: {:?}", diags);
    tokens
        .into_iter()
        .filter(|t| !t.is_eof())
        .map(|t| (t.kind, t.lexeme))
        .collect()
}

#[test]
fn numeric_suffixes_split_into_their_own_tokens() {
    // `1b 1ub 1ULL`
    let tokens = scan("1b 1ub 1ULL");
    assert_eq!(
        tokens,
        vec![
            (TokenKind::Number, "1".to_string()),
            (TokenKind::NumberSuffix, "b".to_string()),
            (TokenKind::Number, "1".to_string()),
            (TokenKind::NumberSuffix, "ub".to_string()),
            (TokenKind::Number, "1".to_string()),
            (TokenKind::NumberSuffix, "ULL".to_string()),
        ]
    );
}

#[test]
fn dot_after_complete_number_is_its_own_token() {
    let tokens = scan("0.4532.");
    assert_eq!(
        tokens,
        vec![
            (TokenKind::Number, "0.4532".to_string()),
            (TokenKind::Symbol, ".".to_string()),
        ]
    );
}

#[test]
fn mixed_statement_tokenizes() {
    let tokens = scan("let x: i32 = -5; x += 2;");
    let kinds: Vec<TokenKind> = tokens.iter().map(|(k, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::Keyword,
            TokenKind::Identifier,
            TokenKind::Symbol,
            TokenKind::Identifier, // i32 is a type name, not a reserved word
            TokenKind::Symbol,
            TokenKind::Number,
            TokenKind::Symbol,
            TokenKind::Identifier,
            TokenKind::Symbol,
            TokenKind::Number,
            TokenKind::Symbol,
        ]
    );
    assert_eq!(tokens[5].1, "-5");
}

#[test]
fn template_string_is_distinct_kind() {
    let tokens = scan("`hello` 'hello' \"hello\"");
    assert_eq!(tokens[0].0, TokenKind::TemplateString);
    assert_eq!(tokens[1].0, TokenKind::String);
    assert_eq!(tokens[2].0, TokenKind::String);
}

proptest! {
    /// The scanner terminates on arbitrary input, never panics, and the
    /// stream always ends with Eof.
    #[test]
    fn scanner_total_on_arbitrary_input(src in ".{0,200}") {
        let buf = SourceBuffer::new("fuzz.gs", src.as_str());
        let (tokens, _diags) = Lexer::new(&buf).tokenize();
        prop_assert!(tokens.last().map(|t| t.is_eof()).unwrap_or(false));
    }

    /// Identifiers always lex back as a single identifier token.
    #[test]
    fn identifiers_roundtrip(name in "[a-zA-Z_][a-zA-Z0-9_]{0,20}") {
        let buf = SourceBuffer::new("id.gs", name.as_str());
        let (tokens, diags) = Lexer::new(&buf).tokenize();
        prop_assert!(diags.is_empty());
        let non_eof: Vec<_> = tokens.iter().filter(|t| !t.is_eof()).collect();
        prop_assert_eq!(non_eof.len(), 1);
        let expected = if gscript::lexer::is_reserved(&name) {
            TokenKind::Keyword
        } else {
            TokenKind::Identifier
        };
        prop_assert_eq!(non_eof[0].kind, expected);
        prop_assert_eq!(&non_eof[0].lexeme, &name);
    }
}
