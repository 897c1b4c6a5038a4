//! The scanner: source text to a token stream.

use super::token::{is_reserved, Token, TokenKind, NUMBER_SUFFIXES, OPERATORS};
use crate::error::{Diagnostic, ErrorCode};
use crate::source::{SourceBuffer, SourceSpan};

/// Scanner over one source buffer
pub struct Lexer<'src> {
    source: &'src SourceBuffer,
    chars: Vec<char>,
    tokens: Vec<Token>,
    diagnostics: Vec<Diagnostic>,
    start: usize,
    current: usize,
}

impl<'src> Lexer<'src> {
    /// Creates a scanner over the given buffer.
    pub fn new(source: &'src SourceBuffer) -> Self {
        Lexer {
            source,
            chars: source.text().chars().collect(),
            tokens: Vec::new(),
            diagnostics: Vec::new(),
            start: 0,
            current: 0,
        }
    }

    /// Scans the whole buffer. Unknown characters are reported and skipped;
    /// the stream always ends with an `Eof` token.
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<Diagnostic>) {
        while !self.is_at_end() {
            self.start = self.current;
            self.scan_token();
        }

        let span = self.span_from(self.current);
        self.tokens.push(Token::new(TokenKind::Eof, String::new(), span));
        (self.tokens, self.diagnostics)
    }

    fn scan_token(&mut self) {
        let c = self.advance();

        match c {
            ' ' | '\r' | '\t' | '\n' => {}

            '/' if self.peek() == '/' => self.skip_line_comment(),
            '/' if self.peek() == '*' => self.skip_block_comment(),

            '\'' | '"' => self.scan_string(c, TokenKind::String),
            '`' => self.scan_string(c, TokenKind::TemplateString),

            '-' if self.peek().is_ascii_digit() && !self.prev_may_terminate_expression() => {
                self.scan_number()
            }

            c if c.is_ascii_digit() => self.scan_number(),

            c if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier_or_keyword(),

            _ => self.scan_operator(c),
        }
    }

    fn prev_may_terminate_expression(&self) -> bool {
        self.tokens
            .last()
            .map(|t| t.may_terminate_expression())
            .unwrap_or(false)
    }

    fn skip_line_comment(&mut self) {
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) {
        self.advance(); // '*'
        while !self.is_at_end() {
            if self.peek() == '*' && self.peek_next() == '/' {
                self.advance();
                self.advance();
                return;
            }
            self.advance();
        }
    }

    fn scan_string(&mut self, delim: char, kind: TokenKind) {
        let open = self.span_from(self.start);
        let mut value = String::new();

        while !self.is_at_end() && self.peek() != delim {
            if self.peek() == '\\' {
                self.advance();
                let escaped = self.advance();
                // Only the delimiter and the backslash itself are escapable;
                // any other pair is preserved verbatim.
                if escaped == delim || escaped == '\\' {
                    value.push(escaped);
                } else {
                    value.push('\\');
                    value.push(escaped);
                }
            } else {
                value.push(self.advance());
            }
        }

        if self.is_at_end() {
            self.diagnostics.push(Diagnostic::error(
                ErrorCode::UnterminatedString,
                "Unterminated string literal",
                open,
            ));
            return;
        }

        self.advance(); // closing delimiter
        self.add_token_with_text(kind, value);
    }

    fn scan_number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        // One dot may join the number, with or without a fractional part
        // ("12345." is a single literal). A second dot is its own token.
        if self.peek() == '.' {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.add_token(TokenKind::Number);

        // A recognized width suffix becomes its own token, longest match
        // first, but only when it is not the head of a longer identifier.
        self.start = self.current;
        let rest: Vec<char> = self.chars[self.current..]
            .iter()
            .take(4)
            .copied()
            .collect();
        for suffix in NUMBER_SUFFIXES.iter() {
            let len = suffix.len();
            let matches = rest.len() >= len
                && rest[..len]
                    .iter()
                    .zip(suffix.chars())
                    .all(|(a, b)| a.eq_ignore_ascii_case(&b));
            let runs_on = rest
                .get(len)
                .map(|c| c.is_ascii_alphanumeric() || *c == '_')
                .unwrap_or(false);
            if matches && !runs_on {
                for _ in 0..len {
                    self.advance();
                }
                self.add_token(TokenKind::NumberSuffix);
                break;
            }
        }
    }

    fn scan_identifier_or_keyword(&mut self) {
        while self.peek().is_ascii_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let text: String = self.chars[self.start..self.current].iter().collect();
        if is_reserved(&text) {
            self.add_token(TokenKind::Keyword);
        } else {
            self.add_token(TokenKind::Identifier);
        }
    }

    fn scan_operator(&mut self, first: char) {
        // Longest match against the operator table; `first` is consumed.
        let mut text = String::from(first);
        text.push(self.peek());
        text.push(self.peek_next());

        for op in OPERATORS.iter() {
            if text.starts_with(op) {
                for _ in 1..op.len() {
                    self.advance();
                }
                self.add_token(TokenKind::Symbol);
                return;
            }
        }

        let span = self.span_from(self.start);
        self.diagnostics.push(Diagnostic::error(
            ErrorCode::UnknownToken,
            format!("Unknown token '{}'", first),
            span,
        ));
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.chars[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.chars.len() {
            '\0'
        } else {
            self.chars[self.current + 1]
        }
    }

    fn span_from(&self, start: usize) -> SourceSpan {
        let offset: u32 = self.chars[..start].iter().map(|c| c.len_utf8() as u32).sum();
        let len: u32 = self.chars[start..self.current]
            .iter()
            .map(|c| c.len_utf8() as u32)
            .sum();
        let (line, col) = self.source.line_col(offset);
        SourceSpan::new(offset, len, line, col)
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        self.add_token_with_text(kind, lexeme);
    }

    fn add_token_with_text(&mut self, kind: TokenKind, text: String) {
        let span = self.span_from(self.start);
        self.tokens.push(Token::new(kind, text, span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Token> {
        let buf = SourceBuffer::new("test.gs", source);
        let (tokens, diagnostics) = Lexer::new(&buf).tokenize();
        assert!(diagnostics.is_empty(), "unexpected: {:?}", diagnostics);
        tokens
    }

    fn kinds_and_text(tokens: &[Token]) -> Vec<(TokenKind, &str)> {
        tokens
            .iter()
            .filter(|t| !t.is_eof())
            .map(|t| (t.kind, t.lexeme.as_str()))
            .collect()
    }

    #[test]
    fn test_string_forms() {
        let tokens = scan("'test' \"test\" `test`");
        assert_eq!(
            kinds_and_text(&tokens),
            vec![
                (TokenKind::String, "test"),
                (TokenKind::String, "test"),
                (TokenKind::TemplateString, "test"),
            ]
        );
    }

    #[test]
    fn test_escaped_quotes() {
        let tokens = scan(r"'te\'st' `te\`st`");
        assert_eq!(tokens[0].lexeme, "te'st");
        assert_eq!(tokens[1].lexeme, "te`st");
    }

    #[test]
    fn test_unterminated_string() {
        let buf = SourceBuffer::new("test.gs", "let s = 'oops");
        let (_, diagnostics) = Lexer::new(&buf).tokenize();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, ErrorCode::UnterminatedString);
        assert_eq!(diagnostics[0].span.col, 9);
    }

    #[test]
    fn test_negative_numbers() {
        let tokens = scan("12345 1 0 -1 -12345");
        let texts: Vec<&str> = tokens
            .iter()
            .filter(|t| !t.is_eof())
            .map(|t| t.lexeme.as_str())
            .collect();
        assert_eq!(texts, vec!["12345", "1", "0", "-1", "-12345"]);
        assert!(tokens.iter().filter(|t| !t.is_eof()).all(|t| t.kind == TokenKind::Number));
    }

    #[test]
    fn test_minus_after_expression_is_operator() {
        let tokens = scan("a -1");
        assert_eq!(
            kinds_and_text(&tokens),
            vec![
                (TokenKind::Identifier, "a"),
                (TokenKind::Symbol, "-"),
                (TokenKind::Number, "1"),
            ]
        );
    }

    #[test]
    fn test_number_suffixes() {
        let tokens = scan("1b 1ub 1ULL");
        assert_eq!(
            kinds_and_text(&tokens),
            vec![
                (TokenKind::Number, "1"),
                (TokenKind::NumberSuffix, "b"),
                (TokenKind::Number, "1"),
                (TokenKind::NumberSuffix, "ub"),
                (TokenKind::Number, "1"),
                (TokenKind::NumberSuffix, "ULL"),
            ]
        );
    }

    #[test]
    fn test_all_suffix_spellings() {
        for s in [
            "b", "B", "s", "S", "ub", "UB", "uB", "Ub", "us", "US", "uS", "Us", "ul", "UL", "uL",
            "Ul", "Ull", "ULl", "ULL", "UlL", "ull", "uLl", "uLL", "ulL",
        ] {
            let src = format!("1{}", s);
            let tokens = scan(&src);
            assert_eq!(tokens.len(), 3, "for {}", src);
            assert_eq!(tokens[0].kind, TokenKind::Number);
            assert_eq!(tokens[1].kind, TokenKind::NumberSuffix);
            assert_eq!(tokens[1].lexeme, s);
        }
    }

    #[test]
    fn test_suffix_does_not_eat_identifier() {
        let tokens = scan("1bx");
        assert_eq!(
            kinds_and_text(&tokens),
            vec![(TokenKind::Number, "1"), (TokenKind::Identifier, "bx")]
        );
    }

    #[test]
    fn test_floats_and_trailing_dot() {
        let tokens = scan("12345. 1.0 0.4532. -0.1 -123.45");
        assert_eq!(
            kinds_and_text(&tokens),
            vec![
                (TokenKind::Number, "12345."),
                (TokenKind::Number, "1.0"),
                (TokenKind::Number, "0.4532"),
                (TokenKind::Symbol, "."),
                (TokenKind::Number, "-0.1"),
                (TokenKind::Number, "-123.45"),
            ]
        );
    }

    #[test]
    fn test_operators_longest_match() {
        let tokens = scan("a <<= b >>= c && d &&= e");
        let syms: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Symbol)
            .map(|t| t.lexeme.as_str())
            .collect();
        assert_eq!(syms, vec!["<<=", ">>=", "&&", "&&="]);
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = scan("if ifier class classy");
        assert_eq!(
            kinds_and_text(&tokens),
            vec![
                (TokenKind::Keyword, "if"),
                (TokenKind::Identifier, "ifier"),
                (TokenKind::Keyword, "class"),
                (TokenKind::Identifier, "classy"),
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = scan("a // comment\nb /* block\nstill */ c");
        assert_eq!(
            kinds_and_text(&tokens),
            vec![
                (TokenKind::Identifier, "a"),
                (TokenKind::Identifier, "b"),
                (TokenKind::Identifier, "c"),
            ]
        );
    }

    #[test]
    fn test_unknown_character_recovers() {
        let buf = SourceBuffer::new("test.gs", "a # b");
        let (tokens, diagnostics) = Lexer::new(&buf).tokenize();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, ErrorCode::UnknownToken);
        assert_eq!(
            kinds_and_text(&tokens),
            vec![(TokenKind::Identifier, "a"), (TokenKind::Identifier, "b")]
        );
    }

    #[test]
    fn test_spans() {
        let tokens = scan("let x\nlet y");
        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[0].span.col, 1);
        assert_eq!(tokens[1].span.col, 5);
        assert_eq!(tokens[2].span.line, 2);
        assert_eq!(tokens[3].span.col, 5);
    }
}
