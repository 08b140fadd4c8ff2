//! Compiled shorthand: statements made of chained call steps.

use std::fmt;

/// Name of the live-coding context every statement starts from unless it
/// names a receiver explicitly.
pub const ROOT_RECEIVER: &str = "lp";

/// A compiled shorthand statement.
///
/// Steps execute in order; every step after the first is invoked on the value
/// the previous step returned. Statements are immutable and can be executed
/// any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub steps: Vec<CallStep>,
    pub line: usize,
}

impl Statement {
    /// The receiver path the chain starts from.
    pub fn root(&self) -> &str {
        match self.steps.first().map(|s| &s.receiver) {
            Some(Receiver::Path(path)) => path,
            _ => ROOT_RECEIVER,
        }
    }
}

/// Where a step's method is looked up.
#[derive(Debug, Clone, PartialEq)]
pub enum Receiver {
    /// An explicit object path (first step only).
    Path(String),
    /// The value returned by the previous step.
    Previous,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallStep {
    pub receiver: Receiver,
    pub method: String,
    pub args: Args,
    pub line: usize,
    pub column: usize,
}

/// Arguments of a single call.
///
/// Named arguments collapse into one argument bag; a step carries either
/// named or positional arguments, never both.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args {
    pub positional: Vec<Expr>,
    pub named: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    /// A bare identifier path, resolved when the statement runs.
    Ident(String),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn symbol(self) -> char {
        match self {
            BinOp::Add => '+',
            BinOp::Sub => '-',
            BinOp::Mul => '*',
            BinOp::Div => '/',
        }
    }
}

// Display renders the fully expanded chained call, e.g.
// `lp.start(210).move({x:23,y:50,z:10})`.

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root())?;
        for step in &self.steps {
            write!(f, ".{}{}", step.method, step.args)?;
        }
        Ok(())
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        if !self.named.is_empty() {
            write!(f, "{{")?;
            for (i, (name, value)) in self.named.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}:{}", name, value)?;
            }
            write!(f, "}}")?;
        } else {
            for (i, value) in self.positional.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", value)?;
            }
        }
        write!(f, ")")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Str(s) => write!(f, "{:?}", s),
            Expr::Ident(path) => write!(f, "{}", path),
            Expr::Binary { op, left, right } => {
                write!(f, "({}{}{})", left, op.symbol(), right)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(receiver: Receiver, method: &str, args: Args) -> CallStep {
        CallStep {
            receiver,
            method: method.to_string(),
            args,
            line: 1,
            column: 1,
        }
    }

    #[test]
    fn display_named_and_positional() {
        let stmt = Statement {
            steps: vec![
                step(
                    Receiver::Path("lp".into()),
                    "start",
                    Args {
                        positional: vec![Expr::Number(210.0)],
                        named: vec![],
                    },
                ),
                step(
                    Receiver::Previous,
                    "move",
                    Args {
                        positional: vec![],
                        named: vec![
                            ("x".into(), Expr::Number(23.0)),
                            ("y".into(), Expr::Number(0.5)),
                        ],
                    },
                ),
                step(Receiver::Previous, "sync", Args::default()),
            ],
            line: 1,
        };
        assert_eq!(stmt.to_string(), "lp.start(210).move({x:23,y:0.5}).sync()");
    }

    #[test]
    fn display_expressions() {
        let expr = Expr::Binary {
            op: BinOp::Div,
            left: Box::new(Expr::Ident("lp.cx".into())),
            right: Box::new(Expr::Number(2.0)),
        };
        assert_eq!(expr.to_string(), "(lp.cx/2)");
        assert_eq!(Expr::Str("G28".into()).to_string(), "\"G28\"");
    }

    #[test]
    fn root_defaults_to_lp() {
        let stmt = Statement { steps: vec![], line: 1 };
        assert_eq!(stmt.root(), ROOT_RECEIVER);
    }
}
