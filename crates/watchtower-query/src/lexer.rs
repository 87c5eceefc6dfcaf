//! SQL tokenizer
//!
//! Produces tokens with byte spans into the original text so that the
//! rewriter can splice edits without re-rendering the whole statement.

use std::ops::Range;
use watchtower_core::{Error, Result};

/// Kind of a lexical token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Whitespace,
    Comment,
    /// Bare identifier or keyword
    Word,
    /// `"quoted identifier"`
    QuotedIdent,
    /// `'literal'`, `E'literal'` body or `$tag$literal$tag$`
    String,
    Number,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    /// Any other single character (operators, casts, brackets)
    Symbol,
}

/// A token with its position in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

impl<'a> Token<'a> {
    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Whitespace and comments carry no meaning for the parser
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    /// Case-insensitive keyword match on bare words
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }

    /// Identifier value with quotes removed and bare words folded to lowercase
    pub fn identifier(&self) -> String {
        match self.kind {
            TokenKind::QuotedIdent => {
                let inner = &self.text[1..self.text.len().saturating_sub(1).max(1)];
                inner.replace("\"\"", "\"")
            }
            _ => self.text.to_ascii_lowercase(),
        }
    }
}

/// Split `sql` into tokens covering every byte of the input
pub fn tokenize(sql: &str) -> Result<Vec<Token<'_>>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos];

        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' | b'\x0c' => {
                while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                TokenKind::Whitespace
            }
            b'-' if bytes.get(pos + 1) == Some(&b'-') => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
                TokenKind::Comment
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos = block_comment_end(bytes, pos)?;
                TokenKind::Comment
            }
            b'\'' => {
                pos = quoted_end(bytes, pos, b'\'').ok_or_else(|| {
                    Error::parse("Unterminated string literal in query.")
                })?;
                TokenKind::String
            }
            b'"' => {
                pos = quoted_end(bytes, pos, b'"').ok_or_else(|| {
                    Error::parse("Unterminated quoted identifier in query.")
                })?;
                TokenKind::QuotedIdent
            }
            b'$' => match dollar_quote_end(sql, pos) {
                Some(end) => {
                    pos = end;
                    TokenKind::String
                }
                None => {
                    pos += 1;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    TokenKind::Symbol
                }
            },
            b'0'..=b'9' => {
                pos = number_end(bytes, pos);
                TokenKind::Number
            }
            b'.' if bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) => {
                pos = number_end(bytes, pos);
                TokenKind::Number
            }
            b'(' => {
                pos += 1;
                TokenKind::LParen
            }
            b')' => {
                pos += 1;
                TokenKind::RParen
            }
            b',' => {
                pos += 1;
                TokenKind::Comma
            }
            b';' => {
                pos += 1;
                TokenKind::Semicolon
            }
            b'.' => {
                pos += 1;
                TokenKind::Dot
            }
            c if is_word_start(c) => {
                while pos < bytes.len() && is_word_continue(bytes[pos]) {
                    pos += 1;
                }
                TokenKind::Word
            }
            _ => {
                // Advance a whole UTF-8 scalar so spans stay on char boundaries
                let width = sql[pos..].chars().next().map_or(1, char::len_utf8);
                pos += width;
                TokenKind::Symbol
            }
        };

        tokens.push(Token {
            kind,
            text: &sql[start..pos],
            start,
            end: pos,
        });
    }

    Ok(tokens)
}

fn is_word_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c >= 0x80
}

fn is_word_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80
}

fn block_comment_end(bytes: &[u8], start: usize) -> Result<usize> {
    let mut depth = 0usize;
    let mut pos = start;
    while pos + 1 < bytes.len() {
        match (bytes[pos], bytes[pos + 1]) {
            (b'/', b'*') => {
                depth += 1;
                pos += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                pos += 2;
                if depth == 0 {
                    return Ok(pos);
                }
            }
            _ => pos += 1,
        }
    }
    Err(Error::parse("Unterminated comment in query."))
}

/// End of a quoted run where the quote is escaped by doubling it
fn quoted_end(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut pos = start + 1;
    while pos < bytes.len() {
        if bytes[pos] == quote {
            if bytes.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return Some(pos + 1);
        }
        pos += 1;
    }
    None
}

/// End of a `$tag$ ... $tag$` literal, if one starts at `start`
fn dollar_quote_end(sql: &str, start: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut pos = start + 1;
    while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
        pos += 1;
    }
    if bytes.get(pos) != Some(&b'$') {
        return None;
    }
    let tag = &sql[start..=pos];
    if tag[1..tag.len() - 1].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let body_start = pos + 1;
    sql[body_start..]
        .find(tag)
        .map(|offset| body_start + offset + tag.len())
}

fn number_end(bytes: &[u8], start: usize) -> usize {
    let mut pos = start;
    let mut seen_dot = false;
    while pos < bytes.len() {
        match bytes[pos] {
            b'0'..=b'9' => pos += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                pos += 1;
            }
            b'e' | b'E' => {
                let mut next = pos + 1;
                if matches!(bytes.get(next), Some(b'+') | Some(b'-')) {
                    next += 1;
                }
                if bytes.get(next).is_some_and(u8::is_ascii_digit) {
                    pos = next;
                    seen_dot = true;
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    pos
}
