//! A small sandboxed expression language for extracting values from messages.
//!
//! Expressions can read the parsed payload and the topic, access fields and
//! indices, do arithmetic and comparisons, and call a fixed set of pure
//! builtins. They cannot reach anything outside the message.
//!
//! | Variable  | Value                                        |
//! |-----------|----------------------------------------------|
//! | `data`    | parsed payload (`payload` is an alias)       |
//! | `topic`   | full topic string                            |
//! | `tlist`   | topic segments                               |
//! | `msg`     | object with `topic`, `payload`, `data`, `tlist` |
//!
//! ```
//! use promqtt::expr::{Context, Expr};
//! use serde_json::json;
//!
//! let expr = Expr::parse("data.BME280.Temperature * 2")?;
//! let data = json!({"BME280": {"Temperature": 20.5}});
//! let segments = vec!["tele".to_string(), "node1".to_string()];
//! let ctx = Context { topic: "tele/node1", segments: &segments, payload: b"", data: &data };
//!
//! assert_eq!(expr.eval(&ctx).unwrap().as_f64(), Some(41.0));
//! # Ok::<(), promqtt::expr::ExprError>(())
//! ```

mod eval;
mod lexer;
mod parser;
mod template;
mod value;

use std::borrow::Cow;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

pub use eval::{Context, EvalError};
pub use template::Template;
pub use value::{to_label_value, to_metric_value};

use parser::Ast;

/// Syntax error in an expression, with the byte offset where it was found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ExprError {
    pub offset: usize,
    pub message: String,
}

impl ExprError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    ast: Ast,
}

impl Expr {
    /// Compile an expression.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            source: source.to_string(),
            ast: parser::parse(source)?,
        })
    }

    /// Evaluate against a message context.
    pub fn eval<'a>(&self, ctx: &Context<'a>) -> Result<Cow<'a, Value>, EvalError> {
        eval::evaluate(&self.ast, ctx)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
