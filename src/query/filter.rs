//! Where-clause filter expressions
//!
//! Parses expressions such as
//! `srcIp = '10.0.0.1' AND (action != 'deny' OR severity = 'high')`
//! into a [`FilterNode`] tree and renders it as an OpenSearch bool query.
//!
//! Grammar (keywords are case-insensitive, `AND` binds tighter than `OR`):
//!
//! ```text
//! expr      := and_expr ( OR and_expr )*
//! and_expr  := primary ( AND primary )*
//! primary   := '(' expr ')' | field ( '=' | '!=' ) string
//! string    := "'" chars "'"        ('' inside a string is a literal quote)
//! ```

use std::ops::Range;

use serde_json::{Value, json};

use crate::error::ParseError;

/// Token type enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    String(String),
    Eq,
    Ne,
    And,
    Or,
    LParen,
    RParen,
    EOF,
}

/// Token with position information
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
}

impl Token {
    fn new(kind: TokenKind, span: Range<usize>) -> Self {
        Self { kind, span }
    }

    fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Ident(name) => name.clone(),
            TokenKind::String(value) => format!("'{value}'"),
            TokenKind::Eq => "=".into(),
            TokenKind::Ne => "!=".into(),
            TokenKind::And => "AND".into(),
            TokenKind::Or => "OR".into(),
            TokenKind::LParen => "(".into(),
            TokenKind::RParen => ")".into(),
            TokenKind::EOF => "end of input".into(),
        }
    }
}

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterNode {
    Condition {
        field: String,
        op: Operator,
        value: String,
    },
    And(Box<FilterNode>, Box<FilterNode>),
    Or(Box<FilterNode>, Box<FilterNode>),
}

impl FilterNode {
    /// Render as an OpenSearch query clause.
    pub fn to_query(&self) -> Value {
        match self {
            FilterNode::Condition {
                field,
                op: Operator::Eq,
                value,
            } => json!({ "match": { field: value } }),
            FilterNode::Condition {
                field,
                op: Operator::Ne,
                value,
            } => json!({ "bool": { "must_not": [{ "match": { field: value } }] } }),
            FilterNode::And(left, right) => {
                json!({ "bool": { "must": [left.to_query(), right.to_query()] } })
            }
            FilterNode::Or(left, right) => json!({
                "bool": {
                    "should": [left.to_query(), right.to_query()],
                    "minimum_should_match": 1
                }
            }),
        }
    }
}

/// Filter lexer
struct FilterLexer {
    input: Vec<char>,
    pos: usize,
}

impl FilterLexer {
    fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
        let mut lexer = Self {
            input: input.chars().collect(),
            pos: 0,
        };
        let mut tokens = Vec::new();

        loop {
            let token = lexer.next_token()?;
            let is_eof = token.kind == TokenKind::EOF;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        while self.current().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }

        let start = self.pos;
        let Some(ch) = self.current() else {
            return Ok(Token::new(TokenKind::EOF, start..start));
        };

        match ch {
            '(' => {
                self.pos += 1;
                Ok(Token::new(TokenKind::LParen, start..self.pos))
            }
            ')' => {
                self.pos += 1;
                Ok(Token::new(TokenKind::RParen, start..self.pos))
            }
            '=' => {
                self.pos += 1;
                Ok(Token::new(TokenKind::Eq, start..self.pos))
            }
            '!' if self.peek() == Some('=') => {
                self.pos += 2;
                Ok(Token::new(TokenKind::Ne, start..self.pos))
            }
            '\'' => self.scan_string(start),
            c if is_field_char(c) => Ok(self.scan_identifier(start)),
            found => Err(ParseError::UnexpectedChar {
                found,
                position: start,
            }),
        }
    }

    fn scan_string(&mut self, start: usize) -> Result<Token, ParseError> {
        self.pos += 1;
        let mut value = String::new();

        loop {
            match self.current() {
                None => return Err(ParseError::UnterminatedString(start)),
                Some('\'') if self.peek() == Some('\'') => {
                    value.push('\'');
                    self.pos += 2;
                }
                Some('\'') => {
                    self.pos += 1;
                    return Ok(Token::new(TokenKind::String(value), start..self.pos));
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn scan_identifier(&mut self, start: usize) -> Token {
        let mut value = String::new();
        while let Some(c) = self.current().filter(|c| is_field_char(*c)) {
            value.push(c);
            self.pos += 1;
        }

        let kind = match value.to_uppercase().as_str() {
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            _ => TokenKind::Ident(value),
        };
        Token::new(kind, start..self.pos)
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos + 1).copied()
    }
}

fn is_field_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '@' | '-')
}

/// Recursive-descent parser over the token stream
struct FilterParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl FilterParser {
    fn peek(&self) -> &Token {
        // The stream always ends with EOF and parsing never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::EOF {
            self.pos += 1;
        }
        token
    }

    fn expected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        if token.kind == TokenKind::EOF {
            return ParseError::UnexpectedEnd;
        }
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: token.describe(),
            position: token.span.start,
        }
    }

    fn parse_or(&mut self) -> Result<FilterNode, ParseError> {
        let mut left = self.parse_and()?;
        while self.peek().kind == TokenKind::Or {
            self.bump();
            let right = self.parse_and()?;
            left = FilterNode::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterNode, ParseError> {
        let mut left = self.parse_primary()?;
        while self.peek().kind == TokenKind::And {
            self.bump();
            let right = self.parse_primary()?;
            left = FilterNode::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<FilterNode, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::LParen => {
                self.bump();
                let node = self.parse_or()?;
                if self.peek().kind != TokenKind::RParen {
                    return Err(self.expected("')'"));
                }
                self.bump();
                Ok(node)
            }
            TokenKind::Ident(field) => {
                self.bump();
                let op = match self.peek().kind {
                    TokenKind::Eq => Operator::Eq,
                    TokenKind::Ne => Operator::Ne,
                    _ => return Err(self.expected("'=' or '!='")),
                };
                self.bump();
                let TokenKind::String(value) = self.peek().kind.clone() else {
                    return Err(self.expected("a quoted value"));
                };
                self.bump();
                Ok(FilterNode::Condition { field, op, value })
            }
            _ => Err(self.expected("a field name or '('")),
        }
    }
}

/// Parse a where-clause filter expression.
pub fn parse_filter(input: &str) -> Result<FilterNode, ParseError> {
    let tokens = FilterLexer::tokenize(input)?;
    let mut parser = FilterParser { tokens, pos: 0 };
    let node = parser.parse_or()?;
    if parser.peek().kind != TokenKind::EOF {
        return Err(parser.expected("AND, OR or end of input"));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(field: &str, op: Operator, value: &str) -> FilterNode {
        FilterNode::Condition {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    #[test]
    fn test_single_condition() {
        let node = parse_filter("srcIp = '10.0.0.1'").unwrap();
        assert_eq!(node, cond("srcIp", Operator::Eq, "10.0.0.1"));
        assert_eq!(node.to_query(), json!({ "match": { "srcIp": "10.0.0.1" } }));
    }

    #[test]
    fn test_not_equal_renders_must_not() {
        let node = parse_filter("action!='deny'").unwrap();
        assert_eq!(
            node.to_query(),
            json!({ "bool": { "must_not": [{ "match": { "action": "deny" } }] } })
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let node = parse_filter("a = '1' OR b = '2' and c = '3'").unwrap();
        assert_eq!(
            node,
            FilterNode::Or(
                Box::new(cond("a", Operator::Eq, "1")),
                Box::new(FilterNode::And(
                    Box::new(cond("b", Operator::Eq, "2")),
                    Box::new(cond("c", Operator::Eq, "3")),
                )),
            )
        );
    }

    #[test]
    fn test_parentheses_and_or_rendering() {
        let node = parse_filter("(a = '1' OR b != '2') AND c = '3'").unwrap();
        assert_eq!(
            node.to_query(),
            json!({
                "bool": {
                    "must": [
                        {
                            "bool": {
                                "should": [
                                    { "match": { "a": "1" } },
                                    { "bool": { "must_not": [{ "match": { "b": "2" } }] } }
                                ],
                                "minimum_should_match": 1
                            }
                        },
                        { "match": { "c": "3" } }
                    ]
                }
            })
        );
    }

    #[test]
    fn test_doubled_quote_and_spaces_in_value() {
        let node = parse_filter("user.name = 'O''Brien jr'").unwrap();
        assert_eq!(node, cond("user.name", Operator::Eq, "O'Brien jr"));
    }

    #[test]
    fn test_errors_carry_position() {
        assert_eq!(
            parse_filter("a = 1"),
            Err(ParseError::UnexpectedToken {
                expected: "a quoted value".into(),
                found: "1".into(),
                position: 4,
            })
        );
        assert_eq!(
            parse_filter("a = 'x"),
            Err(ParseError::UnterminatedString(4))
        );
        assert_eq!(parse_filter("(a = 'x'"), Err(ParseError::UnexpectedEnd));
        assert_eq!(
            parse_filter("a = 'x' b = 'y'"),
            Err(ParseError::UnexpectedToken {
                expected: "AND, OR or end of input".into(),
                found: "b".into(),
                position: 8,
            })
        );
        assert_eq!(
            parse_filter("a ~ 'x'"),
            Err(ParseError::UnexpectedChar {
                found: '~',
                position: 2
            })
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(parse_filter("   "), Err(ParseError::UnexpectedEnd));
    }
}
