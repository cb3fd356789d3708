//! S-expression reader for the Ark language: tokens → [`Node`] tree.
//!
//! The reader is deliberately small.  It resolves the three pieces of surface
//! sugar (`{…}` → `begin`, `[…]` → `list`, `'e` → `quote`), classifies
//! identifier atoms (keyword / capture / plain symbol), and flattens dotted
//! identifiers: `closure.field.field` becomes the sibling sequence
//! `Symbol closure, GetField field, GetField field`, which is the shape the
//! compiler's call and specific-form emitters expect.
//!
//! The whole program is wrapped in a single top-level `(begin …)` node so the
//! compiler always receives exactly one root.

use std::fmt;

use crate::ast::{Keyword, Node, NodeKind};
use crate::token::{Span, Token, TokenKind};

// ─────────────────────────────────────────────────────────────────────────────
// Parse error
// ─────────────────────────────────────────────────────────────────────────────

/// A syntax error with the span of the offending token.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.span, self.message)
    }
}

impl std::error::Error for ParseError {}

type ParseResult<T> = Result<T, ParseError>;

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a token stream into the root `(begin …)` node.
pub fn parse_tokens(tokens: Vec<Token>) -> ParseResult<Node> {
    Parser::new(tokens).parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error<T>(&self, message: impl Into<String>, span: Span) -> ParseResult<T> {
        Err(ParseError {
            message: message.into(),
            span,
        })
    }

    // ── Entry point ──────────────────────────────────────────────────────────

    fn parse_program(mut self) -> ParseResult<Node> {
        let start_span = self.peek().span;
        let mut children = vec![Node::keyword(Keyword::Begin, start_span)];
        while self.peek().kind != TokenKind::Eof {
            self.parse_expr_into(&mut children)?;
        }
        let span = children
            .iter()
            .skip(1)
            .fold(start_span, |acc, n| acc.merge(n.span));
        Ok(Node::list(children, span))
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    /// Parse one expression and append the node(s) it produces to `out`.
    ///
    /// A dotted identifier produces more than one node, which is why this
    /// appends rather than returns: the extra `GetField` nodes must land as
    /// siblings in the surrounding list.
    fn parse_expr_into(&mut self, out: &mut Vec<Node>) -> ParseResult<()> {
        let token = self.advance();
        match token.kind {
            TokenKind::LParen => {
                let node = self.parse_list(TokenKind::RParen, token.span, None)?;
                out.push(node);
            }
            TokenKind::LBrace => {
                let head = Node::keyword(Keyword::Begin, token.span);
                let node = self.parse_list(TokenKind::RBrace, token.span, Some(head))?;
                out.push(node);
            }
            TokenKind::LBracket => {
                let head = Node::symbol("list", token.span);
                let node = self.parse_list(TokenKind::RBracket, token.span, Some(head))?;
                out.push(node);
            }
            TokenKind::Quote => {
                let mut children = vec![Node::keyword(Keyword::Quote, token.span)];
                if self.peek().kind == TokenKind::Eof {
                    return self.error("expected an expression after `''", token.span);
                }
                self.parse_expr_into(&mut children)?;
                let span = token.span.merge(children.last().map(|n| n.span).unwrap_or(token.span));
                out.push(Node::list(children, span));
            }
            TokenKind::Number(n) => out.push(Node::number(n, token.span)),
            TokenKind::Str(s) => out.push(Node::string(s, token.span)),
            TokenKind::Capture(name) => {
                out.push(Node::new(NodeKind::Capture(name), token.span));
            }
            TokenKind::Identifier(name) => {
                self.identifier_into(name, token.span, out)?;
            }
            TokenKind::RParen | TokenKind::RBrace | TokenKind::RBracket => {
                return self.error(format!("unexpected `{}'", token.kind), token.span);
            }
            TokenKind::Eof => {
                return self.error("unexpected end of input", token.span);
            }
        }
        Ok(())
    }

    /// Parse list children until `closing`, optionally seeding a sugar head.
    fn parse_list(
        &mut self,
        closing: TokenKind,
        open_span: Span,
        head: Option<Node>,
    ) -> ParseResult<Node> {
        let mut children = Vec::new();
        if let Some(head) = head {
            children.push(head);
        }
        loop {
            if self.peek().kind == closing {
                let close = self.advance();
                return Ok(Node::list(children, open_span.merge(close.span)));
            }
            if self.peek().kind == TokenKind::Eof {
                return self.error(format!("missing `{closing}' before end of input"), open_span);
            }
            self.parse_expr_into(&mut children)?;
        }
    }

    /// Classify an identifier: keyword, dotted access chain, or plain symbol.
    fn identifier_into(
        &mut self,
        name: String,
        span: Span,
        out: &mut Vec<Node>,
    ) -> ParseResult<()> {
        if let Some(kw) = Keyword::from_name(&name) {
            out.push(Node::keyword(kw, span));
            return Ok(());
        }
        if !name.contains('.') {
            out.push(Node::symbol(name, span));
            return Ok(());
        }

        // Dotted access: `base.f1.f2` → Symbol base, GetField f1, GetField f2.
        let mut parts = name.split('.');
        let base = parts.next().unwrap_or_default();
        if base.is_empty() {
            return self.error(format!("malformed dotted identifier `{name}'"), span);
        }
        out.push(Node::symbol(base, span));
        for field in parts {
            if field.is_empty() {
                return self.error(format!("malformed dotted identifier `{name}'"), span);
            }
            out.push(Node::new(NodeKind::GetField(field.to_string()), span));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse(src: &str) -> Node {
        let (tokens, errors) = lex(src);
        assert!(errors.is_empty(), "lex errors: {errors:?}");
        parse_tokens(tokens).expect("parse failed")
    }

    /// The children of the implicit top-level begin block.
    fn top(src: &str) -> Vec<Node> {
        let root = parse(src);
        root.children()[1..].to_vec()
    }

    #[test]
    fn test_program_is_wrapped_in_begin() {
        let root = parse("1 2");
        assert_eq!(root.children().len(), 3);
        assert!(matches!(
            root.children()[0].kind,
            NodeKind::Keyword(Keyword::Begin)
        ));
    }

    #[test]
    fn test_keywords_and_symbols() {
        let exprs = top("(let x 6)");
        let children = exprs[0].children();
        assert!(matches!(children[0].kind, NodeKind::Keyword(Keyword::Let)));
        assert!(matches!(children[1].kind, NodeKind::Symbol(ref s) if s == "x"));
        assert!(matches!(children[2].kind, NodeKind::Number(n) if n == 6.0));
    }

    #[test]
    fn test_block_and_list_sugar() {
        let exprs = top("{1 2} [3 4]");
        assert!(matches!(
            exprs[0].children()[0].kind,
            NodeKind::Keyword(Keyword::Begin)
        ));
        assert!(matches!(exprs[1].children()[0].kind, NodeKind::Symbol(ref s) if s == "list"));
        assert_eq!(exprs[1].children().len(), 3);
    }

    #[test]
    fn test_quote_sugar() {
        let exprs = top("'(+ 1 2)");
        let children = exprs[0].children();
        assert!(matches!(
            children[0].kind,
            NodeKind::Keyword(Keyword::Quote)
        ));
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_dotted_identifier_flattens_to_siblings() {
        let exprs = top("(obj.field.inner 1)");
        let children = exprs[0].children();
        assert!(matches!(children[0].kind, NodeKind::Symbol(ref s) if s == "obj"));
        assert!(matches!(children[1].kind, NodeKind::GetField(ref s) if s == "field"));
        assert!(matches!(children[2].kind, NodeKind::GetField(ref s) if s == "inner"));
        assert!(matches!(children[3].kind, NodeKind::Number(n) if n == 1.0));
    }

    #[test]
    fn test_capture_node() {
        let exprs = top("(fun (&count) count)");
        let params = exprs[0].children()[1].children();
        assert!(matches!(params[0].kind, NodeKind::Capture(ref s) if s == "count"));
    }

    #[test]
    fn test_empty_list() {
        let exprs = top("()");
        assert!(exprs[0].children().is_empty());
    }

    #[test]
    fn test_unbalanced_paren_is_an_error() {
        let (tokens, _) = lex("(let x 6");
        let err = parse_tokens(tokens).unwrap_err();
        assert!(err.message.contains("missing `)'"));
    }

    #[test]
    fn test_stray_closer_is_an_error() {
        let (tokens, _) = lex(")");
        assert!(parse_tokens(tokens).is_err());
    }
}
