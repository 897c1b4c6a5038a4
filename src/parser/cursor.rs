//! Transactional cursor over a token stream.

use crate::lexer::{Token, TokenKind};
use crate::source::SourceSpan;

/// A cursor with a stack of saved positions. `begin` saves the position,
/// `revert` restores it, `commit` folds the save away. Productions that
/// attempt an alternative wrap it in a transaction and back out cleanly.
#[derive(Debug)]
pub struct TokenCursor {
    tokens: Vec<Token>,
    saved: Vec<usize>,
    current: usize,
}

impl TokenCursor {
    /// Creates a cursor over a token stream. The stream is expected to end
    /// with an `Eof` token; one is appended if missing.
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if !tokens.last().map(|t| t.is_eof()).unwrap_or(false) {
            let span = tokens.last().map(|t| t.span).unwrap_or_default();
            tokens.push(Token::new(TokenKind::Eof, String::new(), span));
        }
        TokenCursor {
            tokens,
            saved: Vec::new(),
            current: 0,
        }
    }

    /// Opens a transaction.
    pub fn begin(&mut self) {
        self.saved.push(self.current);
    }

    /// Commits the innermost transaction, keeping the current position.
    pub fn commit(&mut self) {
        self.saved.pop();
    }

    /// Reverts the innermost transaction, restoring its saved position.
    pub fn revert(&mut self) {
        if let Some(pos) = self.saved.pop() {
            self.current = pos;
        }
    }

    /// The current token.
    pub fn get(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    /// The previously consumed token.
    pub fn prev(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    /// Advances past the current token.
    pub fn consume(&mut self) {
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
    }

    /// True at the `Eof` token.
    pub fn at_end(&self) -> bool {
        self.get().is_eof()
    }

    /// Current position, for tests and error recovery bookkeeping.
    pub fn position(&self) -> usize {
        self.current
    }

    /// Span of the current token.
    pub fn span(&self) -> SourceSpan {
        self.get().span
    }

    /// Consumes the first character of the current multi-character symbol,
    /// leaving the remainder in place. Closes the inner argument list of
    /// nested templates when `>>` lexed as one shift token.
    pub fn split_symbol_head(&mut self) {
        let idx = self.current.min(self.tokens.len() - 1);
        let t = &mut self.tokens[idx];
        if t.kind == TokenKind::Symbol && t.lexeme.len() > 1 {
            t.lexeme.remove(0);
            t.span.offset += 1;
            t.span.col += 1;
            t.span.len = t.span.len.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(words: &[&str]) -> TokenCursor {
        TokenCursor::new(
            words
                .iter()
                .map(|w| Token::new(TokenKind::Identifier, w.to_string(), SourceSpan::default()))
                .collect(),
        )
    }

    #[test]
    fn test_revert_restores_position() {
        let mut c = cursor(&["a", "b", "c"]);
        c.begin();
        c.consume();
        c.consume();
        assert_eq!(c.get().lexeme, "c");
        c.revert();
        assert_eq!(c.get().lexeme, "a");
    }

    #[test]
    fn test_commit_keeps_position() {
        let mut c = cursor(&["a", "b"]);
        c.begin();
        c.consume();
        c.commit();
        assert_eq!(c.get().lexeme, "b");
    }

    #[test]
    fn test_nested_transactions() {
        let mut c = cursor(&["a", "b", "c", "d"]);
        c.begin();
        c.consume();
        c.begin();
        c.consume();
        c.revert();
        assert_eq!(c.get().lexeme, "b");
        c.revert();
        assert_eq!(c.get().lexeme, "a");
    }

    #[test]
    fn test_eof_appended_and_sticky() {
        let mut c = cursor(&["a"]);
        c.consume();
        assert!(c.at_end());
        c.consume();
        assert!(c.at_end());
    }
}
