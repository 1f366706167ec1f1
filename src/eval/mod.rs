//! Expression and statement evaluation.
//!
//! # Components
//!
//! ## Evaluation Context
//! [`context::EvaluationContext`] is the per-execution bundle: the entity
//! snapshot under evaluation, the pre-change values, bound variables and a
//! handle to the entity store. It is created fresh for every execution and is
//! never shared between concurrent executions.
//!
//! ## Expression Evaluator
//! [`expression::ExpressionEvaluator`] evaluates the closed expression
//! language: literals, paths, logical and comparison operators, builtin and
//! store-defined functions, and `EXISTS` queries. Evaluation never mutates
//! state.
//!
//! ## Statement Evaluator
//! [`statement::StatementEvaluator`] runs `SET`, `CALL` and `TRIGGER`
//! statements in order and accumulates the resulting property changes. It does
//! not persist anything; callers decide what happens to the
//! [`statement::ChangeSet`].
//!
//! # Pipeline
//!
//! 1. The executor (or rule engine) builds a context from a store snapshot
//! 2. Preconditions / WHERE filters go through the expression evaluator
//! 3. Effect statements go through the statement evaluator
//! 4. The caller persists the change set and emits events

pub mod context;
pub mod expression;
pub mod statement;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Type mismatch: cannot apply {op} to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },
    #[error("Invalid argument for {function}: {message}")]
    InvalidArgument { function: String, message: String },
    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
    #[error("{0} requires an entity store")]
    NoStore(String),
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EvalError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UnknownFunction(name) => EvalError::UnknownFunction(name),
            other => EvalError::Store(other),
        }
    }
}

pub type EvalResult<T> = Result<T, EvalError>;
