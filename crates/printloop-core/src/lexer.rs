//! Tokenizer for shorthand lines.
//!
//! A shorthand line starts with the `#` marker (optionally closed by a second
//! `#`), block body lines carry no marker. Both are split into the same flat
//! token stream.

use crate::ast::BinOp;
use crate::error::ParseError;

/// The shorthand marker character.
pub const MARKER: char = '#';

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Dot-separated identifier path (`moveto`, `lp.cx`).
    Path(String),
    /// `name:` introducing a named argument.
    NamedArg(String),
    Number(f64),
    Str(String),
    Pipe,
    Op(BinOp),
    LParen,
    RParen,
}

impl TokenKind {
    /// Tokens that can start an argument value.
    pub(crate) fn starts_value(&self) -> bool {
        matches!(
            self,
            TokenKind::Path(_) | TokenKind::Number(_) | TokenKind::Str(_) | TokenKind::LParen
        )
    }

    fn ends_value(&self) -> bool {
        matches!(
            self,
            TokenKind::Path(_) | TokenKind::Number(_) | TokenKind::Str(_) | TokenKind::RParen
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw source text of the token.
    pub text: String,
    pub line: usize,
    pub column: usize,
}

/// Strip the leading marker (and an optional closing marker) from a
/// shorthand line.
///
/// Returns the body and the 1-based column at which it starts, or `None` if
/// the line is not a shorthand line.
pub fn strip_marker(line: &str) -> Option<(&str, usize)> {
    let indent = line.len() - line.trim_start().len();
    let rest = line[indent..].strip_prefix(MARKER)?;
    let column = line[..indent].chars().count() + 2;
    let body = rest.trim_end();
    let body = body.strip_suffix(MARKER).unwrap_or(body);
    Some((body, column))
}

/// Tokenize a shorthand line that begins with the marker.
pub fn tokenize_line(line: &str, line_no: usize) -> Result<Vec<Token>, ParseError> {
    let (body, column) = strip_marker(line).ok_or_else(|| {
        ParseError::new(line_no, 1, format!("shorthand line must start with '{}'", MARKER))
    })?;
    tokenize(body, line_no, column)
}

/// Tokenize text with no marker, e.g. a block body line.
///
/// `first_column` is the 1-based column of the first character of `text` in
/// the original source line.
pub fn tokenize(text: &str, line: usize, first_column: usize) -> Result<Vec<Token>, ParseError> {
    Lexer {
        chars: text.chars().collect(),
        pos: 0,
        line,
        first_column,
        tokens: Vec::new(),
    }
    .run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    first_column: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn column(&self, pos: usize) -> usize {
        self.first_column + pos
    }

    fn peek_at(&self, pos: usize) -> Option<char> {
        self.chars.get(pos).copied()
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, self.column(pos), message)
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        let text: String = self.chars[start..self.pos].iter().collect();
        self.tokens.push(Token {
            kind,
            text,
            line: self.line,
            column: self.column(start),
        });
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        while let Some(ch) = self.peek_at(self.pos) {
            let start = self.pos;
            match ch {
                ' ' | '\t' | '\r' => {
                    self.pos += 1;
                }
                '|' => {
                    self.pos += 1;
                    self.push(TokenKind::Pipe, start);
                }
                '(' => {
                    self.pos += 1;
                    self.push(TokenKind::LParen, start);
                }
                ')' => {
                    self.pos += 1;
                    self.push(TokenKind::RParen, start);
                }
                '+' | '*' | '/' => {
                    self.pos += 1;
                    let op = match ch {
                        '+' => BinOp::Add,
                        '*' => BinOp::Mul,
                        _ => BinOp::Div,
                    };
                    self.push(TokenKind::Op(op), start);
                }
                '-' => {
                    if self.negative_literal_here() {
                        self.number(start)?;
                    } else {
                        self.pos += 1;
                        self.push(TokenKind::Op(BinOp::Sub), start);
                    }
                }
                '"' | '\'' => self.string(start, ch)?,
                c if c.is_ascii_digit() => self.number(start)?,
                '.' if self.peek_at(self.pos + 1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.number(start)?
                }
                c if is_ident_start(c) => self.path(start)?,
                ':' => return Err(self.error(start, "argument separator ':' without a name")),
                other => {
                    return Err(self.error(start, format!("unexpected character '{}'", other)));
                }
            }
        }
        Ok(self.tokens)
    }

    /// `-` followed by a digit is a negative literal unless it reads as
    /// subtraction: `a - 5` and `a-5` subtract, `a -5` and `x:-5` are literals.
    fn negative_literal_here(&self) -> bool {
        let next_is_digit = self
            .peek_at(self.pos + 1)
            .is_some_and(|c| c.is_ascii_digit() || c == '.');
        if !next_is_digit {
            return false;
        }
        match self.tokens.last() {
            None => true,
            Some(prev) if !prev.kind.ends_value() => true,
            Some(_) => {
                let spaced_before = self.pos > 0
                    && self
                        .peek_at(self.pos - 1)
                        .is_some_and(|c| c.is_whitespace());
                spaced_before
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<(), ParseError> {
        if self.peek_at(self.pos) == Some('-') {
            self.pos += 1;
        }
        let mut seen_dot = false;
        while let Some(c) = self.peek_at(self.pos) {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.peek_at(self.pos).is_some_and(is_ident_char) {
            return Err(self.error(start, "malformed number"));
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(start, format!("invalid number: {}", text)))?;
        self.push(TokenKind::Number(value), start);
        Ok(())
    }

    fn string(&mut self, start: usize, quote: char) -> Result<(), ParseError> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek_at(self.pos) {
                Some('\\') => {
                    self.pos += 1;
                    match self.peek_at(self.pos) {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('\\') => value.push('\\'),
                        Some(c) if c == quote => value.push(c),
                        Some(c) => {
                            value.push('\\');
                            value.push(c);
                        }
                        None => return Err(self.error(start, "unterminated string")),
                    }
                    self.pos += 1;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
                None => return Err(self.error(start, "unterminated string")),
            }
        }
        self.push(TokenKind::Str(value), start);
        Ok(())
    }

    fn path(&mut self, start: usize) -> Result<(), ParseError> {
        loop {
            while self.peek_at(self.pos).is_some_and(is_ident_char) {
                self.pos += 1;
            }
            if self.peek_at(self.pos) == Some('.') {
                if !self.peek_at(self.pos + 1).is_some_and(is_ident_start) {
                    return Err(self.error(self.pos, "expected identifier after '.'"));
                }
                self.pos += 1;
            } else {
                break;
            }
        }
        let path: String = self.chars[start..self.pos].iter().collect();

        // `name :` with optional spaces before the separator.
        let mut look = self.pos;
        while self.peek_at(look).is_some_and(|c| c == ' ' || c == '\t') {
            look += 1;
        }
        if self.peek_at(look) == Some(':') {
            if path.contains('.') {
                return Err(self.error(start, format!("argument name `{}` cannot be a path", path)));
            }
            self.pos = look + 1;
            self.push(TokenKind::NamedArg(path), start);
        } else {
            self.push(TokenKind::Path(path), start);
        }
        Ok(())
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}
