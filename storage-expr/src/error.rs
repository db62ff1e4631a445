// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Errors raised while compiling or evaluating an expression.
///
/// Compile errors are cached next to the compiled program, so the type is
/// `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),

    #[error("undefined field '{field}' on {on}")]
    NoSuchField { on: String, field: String },

    #[error("found no matching overload for '{0}'")]
    NoMatchingOverload(String),

    #[error("expression must evaluate to {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("expression is empty")]
    Empty,
}

pub type Result<T> = std::result::Result<T, ExprError>;
