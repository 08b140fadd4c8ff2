//! Shorthand compiler.
//!
//! Turns shorthand lines (`# moveto x: 20 y: 20 | turn 45`) and `##` blocks
//! into [`Statement`]s. Compilation never executes anything: identifiers stay
//! symbolic until the statement runs, so one compiled statement can be
//! re-executed any number of times.

use std::collections::HashSet;

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{self, Token, TokenKind, MARKER};

/// Line that opens or closes a block.
pub const BLOCK_DELIMITER: &str = "##";

/// Result of compiling a block: every good statement plus one error per bad
/// line, both in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockOutput {
    pub statements: Vec<Statement>,
    pub errors: Vec<ParseError>,
}

/// One item found while scanning a script.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    Statement(Statement),
    Error(ParseError),
    /// A line the compiler does not touch (full calls, comments).
    Passthrough { line: usize, text: String },
}

/// Compile a single shorthand line beginning with the `#` marker.
pub fn compile_line(line: &str, line_no: usize) -> Result<Statement, ParseError> {
    let tokens = lexer::tokenize_line(line, line_no)?;
    Parser::new(tokens, line_no).parse_statement()
}

/// Compile one line of a block body.
///
/// The marker is optional inside a block. Blank and `//` lines yield `None`.
pub fn compile_block_line(line: &str, line_no: usize) -> Result<Option<Statement>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("//") {
        return Ok(None);
    }
    let tokens = match lexer::strip_marker(line) {
        Some((body, column)) => lexer::tokenize(body, line_no, column)?,
        None => {
            let indent = line.len() - line.trim_start().len();
            let column = line[..indent].chars().count() + 1;
            lexer::tokenize(line.trim_start(), line_no, column)?
        }
    };
    if tokens.is_empty() {
        return Ok(None);
    }
    Parser::new(tokens, line_no).parse_statement().map(Some)
}

/// Compile a block body (the lines between two `##` delimiters).
///
/// `first_line` is the source line number of the first body line. A bad line
/// contributes a [`ParseError`] and compilation continues with the next one.
pub fn compile_block(body: &str, first_line: usize) -> BlockOutput {
    let mut out = BlockOutput::default();
    for (offset, line) in body.lines().enumerate() {
        match compile_block_line(line, first_line + offset) {
            Ok(Some(stmt)) => out.statements.push(stmt),
            Ok(None) => {}
            Err(err) => out.errors.push(err),
        }
    }
    out
}

/// Scan a whole script.
///
/// Shorthand lines and block bodies are compiled; everything else is handed
/// back untouched as [`SourceItem::Passthrough`]. Blank lines are dropped. An
/// unterminated block still compiles its lines and reports an error at the
/// opening delimiter.
pub fn compile_source(source: &str) -> Vec<SourceItem> {
    let mut items = Vec::new();
    let mut open_block: Option<usize> = None;

    for (idx, line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();

        if trimmed == BLOCK_DELIMITER {
            open_block = match open_block {
                Some(_) => None,
                None => Some(line_no),
            };
            continue;
        }

        if open_block.is_some() {
            match compile_block_line(line, line_no) {
                Ok(Some(stmt)) => items.push(SourceItem::Statement(stmt)),
                Ok(None) => {}
                Err(err) => items.push(SourceItem::Error(err)),
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with(MARKER) {
            match compile_line(line, line_no) {
                Ok(stmt) => items.push(SourceItem::Statement(stmt)),
                Err(err) => items.push(SourceItem::Error(err)),
            }
        } else {
            items.push(SourceItem::Passthrough {
                line: line_no,
                text: line.to_string(),
            });
        }
    }

    if let Some(opened_at) = open_block {
        items.push(SourceItem::Error(ParseError::new(
            opened_at,
            1,
            "unterminated block: missing closing '##'",
        )));
    }
    items
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, line: usize) -> Self {
        Self { tokens, pos: 0, line }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    /// Column of the current token, or just past the last one at end of input.
    fn current_column(&self) -> usize {
        match self.tokens.get(self.pos) {
            Some(t) => t.column,
            None => self
                .tokens
                .last()
                .map_or(1, |t| t.column + t.text.chars().count()),
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, self.current_column(), message)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let (path, column) = self.expect_path("expected a method name")?;
        let (root, method) = match path.rsplit_once('.') {
            Some((receiver, method)) => (receiver.to_string(), method.to_string()),
            None => (ROOT_RECEIVER.to_string(), path),
        };
        let args = self.parse_args(&method)?;
        let mut steps = vec![CallStep {
            receiver: Receiver::Path(root.clone()),
            method,
            args,
            line: self.line,
            column,
        }];

        while self.peek() == Some(&TokenKind::Pipe) {
            self.advance();
            let (path, column) = self.expect_path("expected a method name after '|'")?;
            let method = match path.rsplit_once('.') {
                Some((prefix, method)) if prefix == root => method.to_string(),
                Some((prefix, _)) => {
                    return Err(ParseError::new(
                        self.line,
                        column,
                        format!(
                            "pipe segment `{}` names receiver `{}` but the statement starts from `{}`",
                            path, prefix, root
                        ),
                    ));
                }
                None => path,
            };
            let args = self.parse_args(&method)?;
            steps.push(CallStep {
                receiver: Receiver::Previous,
                method,
                args,
                line: self.line,
                column,
            });
        }

        if self.pos < self.tokens.len() {
            return Err(self.error("unexpected token"));
        }
        Ok(Statement {
            steps,
            line: self.line,
        })
    }

    fn expect_path(&mut self, message: &str) -> Result<(String, usize), ParseError> {
        let column = self.current_column();
        match self.peek() {
            Some(TokenKind::Path(path)) => {
                let path = path.clone();
                self.advance();
                Ok((path, column))
            }
            _ => Err(self.error(message)),
        }
    }

    fn parse_args(&mut self, method: &str) -> Result<Args, ParseError> {
        let start_column = self.current_column();
        let mut args = Args::default();
        let mut seen = HashSet::new();

        loop {
            match self.peek() {
                None | Some(TokenKind::Pipe) => break,
                Some(TokenKind::NamedArg(name)) => {
                    let name = name.clone();
                    let name_column = self.current_column();
                    self.advance();
                    if !self.peek().is_some_and(|k| k.starts_value() || is_unary_minus(k)) {
                        return Err(ParseError::new(
                            self.line,
                            name_column,
                            format!("missing value for argument `{}`", name),
                        ));
                    }
                    if !seen.insert(name.clone()) {
                        return Err(ParseError::new(
                            self.line,
                            name_column,
                            format!("argument `{}` given more than once", name),
                        ));
                    }
                    let value = self.parse_expr()?;
                    args.named.push((name, value));
                }
                Some(kind) if kind.starts_value() || is_unary_minus(kind) => {
                    let value = self.parse_expr()?;
                    args.positional.push(value);
                }
                Some(_) => return Err(self.error(format!("unexpected token in `{}` arguments", method))),
            }
        }

        if !args.named.is_empty() && !args.positional.is_empty() {
            return Err(ParseError::new(
                self.line,
                start_column,
                format!("`{}` mixes positional and named arguments", method),
            ));
        }
        Ok(args)
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        while let Some(TokenKind::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        while let Some(TokenKind::Op(op @ (BinOp::Mul | BinOp::Div))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let kind = match self.peek() {
            Some(kind) => kind.clone(),
            None => return Err(self.error("expected a value, got end of line")),
        };
        match kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::Path(path) => {
                self.advance();
                Ok(Expr::Ident(path))
            }
            TokenKind::Op(BinOp::Sub) => {
                self.advance();
                let operand = self.parse_factor()?;
                Ok(Expr::Binary {
                    op: BinOp::Sub,
                    left: Box::new(Expr::Number(0.0)),
                    right: Box::new(operand),
                })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                if self.peek() != Some(&TokenKind::RParen) {
                    return Err(self.error("expected ')'"));
                }
                self.advance();
                Ok(inner)
            }
            _ => Err(self.error("expected a value")),
        }
    }
}

fn is_unary_minus(kind: &TokenKind) -> bool {
    matches!(kind, TokenKind::Op(BinOp::Sub))
}
