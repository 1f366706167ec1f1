use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::context::{lookup_property, EvaluationContext};
use super::expression::ExpressionEvaluator;
use super::EvalError;
use crate::ast::{NamedArgument, PathRef, Statement};
use crate::service::{ServiceError, ServiceRegistry};
use crate::value::{Properties, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatementError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("Cannot assign to '{0}'")]
    InvalidTarget(String),
    #[error("TRIGGER target '{0}' is not bound to an entity")]
    UnboundTarget(String),
    #[error("TRIGGER is only allowed inside RULE bodies")]
    TriggerNotAllowed,
}

/// Property assignments in first-assignment order. A later `SET` of the same
/// property overwrites the value but keeps the position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    entries: Vec<(String, Value)>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, property: String, value: Value) {
        match self.entries.iter_mut().find(|(name, _)| *name == property) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((property, value)),
        }
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops assignments that leave the property at its current value.
    pub fn retain_changed(&mut self, current: &Properties) {
        self.entries.retain(|(name, value)| {
            !lookup_property(current, name)
                .unwrap_or_default()
                .loose_eq(value)
        });
    }

    pub fn to_properties(&self) -> Properties {
        self.entries.iter().cloned().collect()
    }
}

/// An action execution requested by a `TRIGGER` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequest {
    pub entity_type: String,
    pub action_name: String,
    pub entity_id: String,
    pub params: Properties,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutcome {
    pub changes: ChangeSet,
    pub triggers: Vec<TriggerRequest>,
}

/// Runs effect statements in order against one variable scope.
pub struct StatementEvaluator {
    expression_evaluator: ExpressionEvaluator,
    services: Arc<ServiceRegistry>,
}

impl StatementEvaluator {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self {
            expression_evaluator: ExpressionEvaluator::new(),
            services,
        }
    }

    pub fn expression_evaluator(&self) -> &ExpressionEvaluator {
        &self.expression_evaluator
    }

    /// `subject` names the root whose properties `SET` writes: `this` for
    /// actions, the FOR variable for rules.
    pub async fn eval_block(
        &self,
        statements: &[Statement],
        context: &mut EvaluationContext,
        subject: &str,
    ) -> Result<StatementOutcome, StatementError> {
        let mut outcome = StatementOutcome::default();
        for statement in statements {
            self.eval_statement(statement, context, subject, &mut outcome)
                .await?;
        }
        Ok(outcome)
    }

    async fn eval_statement(
        &self,
        statement: &Statement,
        context: &mut EvaluationContext,
        subject: &str,
        outcome: &mut StatementOutcome,
    ) -> Result<(), StatementError> {
        match statement {
            Statement::Set { target, value } => {
                let property = assignment_property(target, subject)?;
                let value = self
                    .expression_evaluator
                    .eval_expression(value, context)
                    .await?;
                debug!("SET {} = {}", property, value);
                outcome.changes.set(property, value);
            }
            Statement::Call {
                service,
                method,
                arguments,
                into,
            } => {
                let resolved = self.services.resolve(service)?;
                let args = self.eval_arguments(arguments, context).await?;
                let response = resolved.invoke(method, args).await?;
                info!("CALL {}.{} response: {}", service, method, response);
                if let Some(var) = into {
                    if !response.is_null() {
                        context.bind(var, response);
                    }
                }
            }
            Statement::Trigger {
                entity_type,
                action_name,
                target,
                params,
            } => {
                let entity_id = match context.resolve_path(&PathRef(vec![
                    target.clone(),
                    "id".to_string(),
                ])) {
                    Value::String(id) => id,
                    Value::Integer(id) => id.to_string(),
                    _ => return Err(StatementError::UnboundTarget(target.clone())),
                };
                let params = self.eval_arguments(params, context).await?;
                outcome.triggers.push(TriggerRequest {
                    entity_type: entity_type.clone(),
                    action_name: action_name.clone(),
                    entity_id,
                    params,
                });
            }
        }
        Ok(())
    }

    async fn eval_arguments(
        &self,
        arguments: &[NamedArgument],
        context: &EvaluationContext,
    ) -> Result<Properties, StatementError> {
        let mut values = Properties::new();
        for argument in arguments {
            let value = self
                .expression_evaluator
                .eval_expression(&argument.value, context)
                .await?;
            values.insert(argument.name.clone(), value);
        }
        Ok(values)
    }
}

fn assignment_property(target: &PathRef, subject: &str) -> Result<String, StatementError> {
    if subject == PathRef::THIS {
        return Ok(target.property_name());
    }
    match target.0.as_slice() {
        [root, rest @ ..] if root == subject && !rest.is_empty() => Ok(rest.join(".")),
        [bare] if bare != subject && bare != PathRef::THIS => Ok(bare.clone()),
        _ => Err(StatementError::InvalidTarget(target.to_string())),
    }
}
