//! Token definitions and the keyword/suffix tables.

use crate::source::SourceSpan;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// All token classes produced by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    /// Reserved word
    Keyword,
    /// Name that is not a keyword
    Identifier,
    /// Integer or decimal numeric literal
    Number,
    /// Width/signedness suffix emitted directly after a number
    NumberSuffix,
    /// `'...'` or `"..."`
    String,
    /// Backtick-delimited string
    TemplateString,
    /// Operator or punctuation
    Symbol,
    /// End of input
    Eof,
}

/// A single token from the source code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// The class of token
    pub kind: TokenKind,
    /// Token text. For string literals this is the unescaped content.
    pub lexeme: String,
    /// Location in the source buffer
    pub span: SourceSpan,
}

impl Token {
    /// Creates a new token with the given properties
    pub fn new(kind: TokenKind, lexeme: String, span: SourceSpan) -> Self {
        Token { kind, lexeme, span }
    }

    /// True for the given keyword
    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Keyword && self.lexeme == kw
    }

    /// True for the given operator/punctuation text
    pub fn is_symbol(&self, sym: &str) -> bool {
        self.kind == TokenKind::Symbol && self.lexeme == sym
    }

    /// True at end of input
    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    /// True if an expression may end with this token. Used to decide
    /// whether a following `-` begins a negative literal.
    pub fn may_terminate_expression(&self) -> bool {
        match self.kind {
            TokenKind::Number
            | TokenKind::NumberSuffix
            | TokenKind::Identifier
            | TokenKind::String
            | TokenKind::TemplateString => true,
            TokenKind::Keyword => matches!(self.lexeme.as_str(), "this" | "null" | "true" | "false"),
            TokenKind::Symbol => matches!(self.lexeme.as_str(), ")" | "]" | "++" | "--"),
            _ => false,
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.kind {
            TokenKind::Eof => write!(f, "<eof>"),
            TokenKind::String => write!(f, "'{}'", self.lexeme),
            TokenKind::TemplateString => write!(f, "`{}`", self.lexeme),
            _ => write!(f, "{}", self.lexeme),
        }
    }
}

lazy_static! {
    /// Reserved words of the language
    pub static ref KEYWORDS: HashSet<&'static str> = [
        "import", "export", "from", "as", "if", "else", "do", "while", "for", "break",
        "continue", "return", "switch", "case", "default", "class", "extends", "function",
        "let", "const", "static", "private", "get", "set", "new", "delete", "try", "catch",
        "throw", "this", "null", "true", "false", "sizeof", "operator", "constructor",
        "destructor", "type",
    ]
    .into_iter()
    .collect();

    /// Numeric suffixes, longest first so the scanner can take the first hit
    pub static ref NUMBER_SUFFIXES: Vec<&'static str> = vec!["ull", "ub", "us", "ul", "b", "s"];

    /// Multi-character operators, longest first
    pub static ref OPERATORS: Vec<&'static str> = vec![
        "<<=", ">>=", "&&=", "||=",
        "==", "!=", "<=", ">=", "&&", "||", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
        "<<", ">>", "++", "--", "->",
        "+", "-", "*", "/", "%", "&", "|", "^", "~", "!", "<", ">", "=",
        ".", ",", ";", ":", "?", "(", ")", "{", "}", "[", "]",
    ];
}

/// Returns true if `word` is a reserved word.
pub fn is_reserved(word: &str) -> bool {
    KEYWORDS.contains(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_detection() {
        assert!(is_reserved("if"));
        assert!(is_reserved("constructor"));
        assert!(!is_reserved("foo"));
    }

    #[test]
    fn test_expression_terminators() {
        let span = SourceSpan::default();
        assert!(Token::new(TokenKind::Number, "1".into(), span).may_terminate_expression());
        assert!(Token::new(TokenKind::Symbol, ")".into(), span).may_terminate_expression());
        assert!(!Token::new(TokenKind::Symbol, "+".into(), span).may_terminate_expression());
        assert!(!Token::new(TokenKind::Keyword, "return".into(), span).may_terminate_expression());
        assert!(Token::new(TokenKind::Keyword, "this".into(), span).may_terminate_expression());
    }
}
