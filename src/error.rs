use thiserror::Error;

use crate::ast::ASTError;
use crate::config::ConfigError;
use crate::eval::statement::StatementError;
use crate::eval::EvalError;
use crate::event::EventError;
use crate::executor::ExecutionError;
use crate::parser::ParseError;
use crate::registry::RegistryError;
use crate::rule_engine::RuleError;
use crate::service::ServiceError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("AST error: {0}")]
    AST(#[from] ASTError),
    // evaluation
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("Statement error: {0}")]
    Statement(#[from] StatementError),
    // collaborators
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
