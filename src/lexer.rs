//! Hand-rolled lexer (scanner) for the Ark language.
//!
//! The [`Lexer`] consumes a source string and produces a flat `Vec<Token>`.
//! Tokens carry [`Span`] information for precise error reporting.
//!
//! # Atoms
//!
//! Anything that is not a delimiter, a string or a comment is scanned as one
//! atom.  An atom that parses as `f64` becomes a [`TokenKind::Number`];
//! everything else is an [`TokenKind::Identifier`].  This is what lets `-`,
//! `+`, `<=`, `empty?`, `append!` and `list:reverse` all be ordinary
//! identifiers without a dedicated operator table in the lexer.
//!
//! # Error Handling
//!
//! Lexer errors are collected into an internal list rather than immediately
//! aborting.  This lets the lexer report multiple problems in a single pass.
//! Call [`Lexer::scan`] to get both the token stream and the error list.

use std::fmt;

use crate::token::{Span, Token, TokenKind};

// ─────────────────────────────────────────────────────────────────────────────
// Lexer error
// ─────────────────────────────────────────────────────────────────────────────

/// A lexical error with the span of the offending text.
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.span, self.message)
    }
}

impl std::error::Error for LexError {}

// ─────────────────────────────────────────────────────────────────────────────
// Lexer struct
// ─────────────────────────────────────────────────────────────────────────────

/// The Ark lexical scanner.
///
/// Construct one with [`Lexer::new`] and then call [`Lexer::scan`] to obtain
/// the full token stream.  The lexer itself is consumed after scanning.
pub struct Lexer<'src> {
    /// The full source text being scanned.
    src: &'src str,
    /// Byte offset of the next unconsumed character.
    pos: usize,
    /// Current source line (1-indexed).
    line: u32,
    /// Current source column in chars (1-indexed).
    col: u32,
    /// Tokens produced so far.
    tokens: Vec<Token>,
    /// Errors collected so far.
    errors: Vec<LexError>,
}

/// Convenience entry point: scan `src` into tokens and errors.
pub fn lex(src: &str) -> (Vec<Token>, Vec<LexError>) {
    Lexer::new(src).scan()
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Scan the whole source, returning the token stream (always terminated by
    /// an [`TokenKind::Eof`] token) and any errors encountered.
    pub fn scan(mut self) -> (Vec<Token>, Vec<LexError>) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '#' => self.skip_comment(),
                '(' => self.delimiter(TokenKind::LParen),
                ')' => self.delimiter(TokenKind::RParen),
                '{' => self.delimiter(TokenKind::LBrace),
                '}' => self.delimiter(TokenKind::RBrace),
                '[' => self.delimiter(TokenKind::LBracket),
                ']' => self.delimiter(TokenKind::RBracket),
                '\'' => self.delimiter(TokenKind::Quote),
                '"' => self.string(),
                '&' => self.capture(),
                _ => self.atom(),
            }
        }
        let span = self.span_here(self.pos);
        self.tokens.push(Token::new(TokenKind::Eof, span));
        (self.tokens, self.errors)
    }

    // ── Character helpers ────────────────────────────────────────────────────

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn span_here(&self, start: usize) -> Span {
        Span::new(start, self.pos, self.line, self.col)
    }

    /// Span from `start` with the line/col captured *before* scanning began.
    fn span_from(&self, start: usize, line: u32, col: u32) -> Span {
        Span::new(start, self.pos, line, col)
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.errors.push(LexError {
            message: message.into(),
            span,
        });
    }

    // ── Scanners ─────────────────────────────────────────────────────────────

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn delimiter(&mut self, kind: TokenKind) {
        let (start, line, col) = (self.pos, self.line, self.col);
        self.advance();
        let span = self.span_from(start, line, col);
        self.tokens.push(Token::new(kind, span));
    }

    fn string(&mut self) {
        let (start, line, col) = (self.pos, self.line, self.col);
        self.advance(); // opening quote
        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = self.advance() {
            match c {
                '"' => {
                    closed = true;
                    break;
                }
                '\\' => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some('0') => value.push('\0'),
                    Some(other) => {
                        let span = self.span_from(start, line, col);
                        self.error(format!("unknown escape sequence `\\{other}'"), span);
                    }
                    None => break,
                },
                other => value.push(other),
            }
        }
        let span = self.span_from(start, line, col);
        if !closed {
            self.error("unterminated string literal", span);
        }
        self.tokens.push(Token::new(TokenKind::Str(value), span));
    }

    fn capture(&mut self) {
        let (start, line, col) = (self.pos, self.line, self.col);
        self.advance(); // `&`
        let name = self.read_atom_text();
        let span = self.span_from(start, line, col);
        if name.is_empty() {
            self.error("expected a variable name after `&'", span);
            return;
        }
        self.tokens.push(Token::new(TokenKind::Capture(name), span));
    }

    fn atom(&mut self) {
        let (start, line, col) = (self.pos, self.line, self.col);
        let text = self.read_atom_text();
        let span = self.span_from(start, line, col);
        // Number or identifier: whichever `f64` says it is.
        let kind = match text.parse::<f64>() {
            Ok(n) => TokenKind::Number(n),
            Err(_) => TokenKind::Identifier(text),
        };
        self.tokens.push(Token::new(kind, span));
    }

    /// Consume characters up to the next delimiter, whitespace or comment.
    fn read_atom_text(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' | '(' | ')' | '{' | '}' | '[' | ']' | '"' | '\''
                | '#' => break,
                _ => {
                    text.push(c);
                    self.advance();
                }
            }
        }
        text
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, errors) = lex(src);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_delimiters_and_atoms() {
        assert_eq!(
            kinds("(let x 6)"),
            vec![
                TokenKind::LParen,
                TokenKind::Identifier("let".into()),
                TokenKind::Identifier("x".into()),
                TokenKind::Number(6.0),
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators_are_identifiers() {
        assert_eq!(
            kinds("+ - <= empty? append! list:reverse"),
            vec![
                TokenKind::Identifier("+".into()),
                TokenKind::Identifier("-".into()),
                TokenKind::Identifier("<=".into()),
                TokenKind::Identifier("empty?".into()),
                TokenKind::Identifier("append!".into()),
                TokenKind::Identifier("list:reverse".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_negative_number() {
        assert_eq!(
            kinds("-3.5"),
            vec![TokenKind::Number(-3.5), TokenKind::Eof]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb\"c""#),
            vec![TokenKind::Str("a\nb\"c".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_capture_and_quote_sugar() {
        assert_eq!(
            kinds("(fun (&x) 'x)"),
            vec![
                TokenKind::LParen,
                TokenKind::Identifier("fun".into()),
                TokenKind::LParen,
                TokenKind::Capture("x".into()),
                TokenKind::RParen,
                TokenKind::Quote,
                TokenKind::Identifier("x".into()),
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 # the rest is ignored\n2"),
            vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        let (_, errors) = lex("\"oops");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unterminated"));
    }

    #[test]
    fn test_spans_track_lines() {
        let (tokens, _) = lex("a\n  b");
        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[1].span.line, 2);
        assert_eq!(tokens[1].span.col, 3);
    }
}
