//! Runtime values and argument evaluation.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::{Args, BinOp, Expr};
use crate::error::LiveError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

/// Format a number with at most four decimals and no trailing zeros.
pub fn format_number(n: f64) -> String {
    let s = format!("{:.4}", n);
    let s = if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    };
    if s == "-0" {
        "0".to_string()
    } else {
        s
    }
}

/// Resolves bare identifier paths when a statement runs.
pub trait Scope {
    fn resolve(&self, path: &str) -> Option<Value>;
}

impl Scope for HashMap<String, Value> {
    fn resolve(&self, path: &str) -> Option<Value> {
        self.get(path).cloned()
    }
}

/// Evaluate an argument expression.
pub fn eval(expr: &Expr, scope: &dyn Scope) -> Result<Value, LiveError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Ident(path) => scope
            .resolve(path)
            .ok_or_else(|| LiveError::UnresolvedIdentifier(path.clone())),
        Expr::Binary { op, left, right } => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            apply(*op, left, right)
        }
    }
}

fn apply(op: BinOp, left: Value, right: Value) -> Result<Value, LiveError> {
    match (op, &left, &right) {
        (_, Value::Number(a), Value::Number(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(LiveError::InvalidArgument {
                            method: "/".to_string(),
                            message: "division by zero".to_string(),
                        });
                    }
                    a / b
                }
            };
            Ok(Value::Number(result))
        }
        (BinOp::Add, Value::Str(_), _) | (BinOp::Add, _, Value::Str(_)) => {
            Ok(Value::Str(format!("{}{}", left, right)))
        }
        _ => Err(LiveError::InvalidArgument {
            method: op.symbol().to_string(),
            message: format!(
                "cannot apply '{}' to {} and {}",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ),
        }),
    }
}

/// Arguments of one call after evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub method: String,
    pub positional: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn evaluate(method: &str, args: &Args, scope: &dyn Scope) -> Result<Self, LiveError> {
        let positional = args
            .positional
            .iter()
            .map(|e| eval(e, scope))
            .collect::<Result<Vec<_>, _>>()?;
        let named = args
            .named
            .iter()
            .map(|(name, e)| Ok((name.clone(), eval(e, scope)?)))
            .collect::<Result<Vec<_>, LiveError>>()?;
        Ok(Self {
            method: method.to_string(),
            positional,
            named,
        })
    }

    /// Look up an argument by name, falling back to its position.
    pub fn get(&self, name: &str, index: usize) -> Option<&Value> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.positional.get(index))
    }

    pub fn number(&self, name: &str, index: usize) -> Result<Option<f64>, LiveError> {
        match self.get(name, index) {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(Some(*n)),
            Some(other) => Err(self.invalid(format!(
                "`{}` must be a number, got {}",
                name,
                other.type_name()
            ))),
        }
    }

    pub fn require_number(&self, name: &str, index: usize) -> Result<f64, LiveError> {
        self.number(name, index)?
            .ok_or_else(|| self.invalid(format!("missing required argument `{}`", name)))
    }

    pub fn string(&self, name: &str, index: usize) -> Result<Option<String>, LiveError> {
        match self.get(name, index) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.invalid(format!(
                "`{}` must be a string, got {}",
                name,
                other.type_name()
            ))),
        }
    }

    pub fn require_string(&self, name: &str, index: usize) -> Result<String, LiveError> {
        self.string(name, index)?
            .ok_or_else(|| self.invalid(format!("missing required argument `{}`", name)))
    }

    /// Reject named arguments outside `allowed` and surplus positional ones.
    pub fn check(&self, allowed: &[&str]) -> Result<(), LiveError> {
        if let Some((name, _)) = self.named.iter().find(|(n, _)| !allowed.contains(&n.as_str())) {
            return Err(self.invalid(format!("unknown argument `{}`", name)));
        }
        if self.positional.len() > allowed.len() {
            return Err(self.invalid(format!(
                "takes at most {} arguments, got {}",
                allowed.len(),
                self.positional.len()
            )));
        }
        Ok(())
    }

    fn invalid(&self, message: String) -> LiveError {
        LiveError::InvalidArgument {
            method: self.method.clone(),
            message,
        }
    }
}
