//! ACTION execution.
//!
//! [`ActionExecutor::execute`] is fail-fast: preconditions run in declared
//! order and the first one that does not hold ends the execution with its
//! failure message. [`ActionExecutor::validate_preconditions`] is the
//! inspection path: it evaluates every precondition and reports each result.
//!
//! A successful execution persists its diff with one store write, then emits
//! one [`UpdateEvent`] per changed property (in assignment order), then appends
//! one audit entry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::ast::{ActionDef, PathRef};
use crate::audit::{Actor, AuditEntry, AuditKind, AuditLog};
use crate::eval::context::{lookup_property, EvaluationContext};
use crate::eval::expression::ExpressionEvaluator;
use crate::eval::statement::{ChangeSet, StatementError, StatementEvaluator, TriggerRequest};
use crate::eval::EvalError;
use crate::event::{EventEmitter, EventError, UpdateEvent};
use crate::registry::ActionRegistry;
use crate::rule_engine::RuleExecution;
use crate::service::ServiceRegistry;
use crate::store::{EntityStore, StoreError};
use crate::value::{Properties, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Action {entity_type}.{action_name} not found")]
    ActionNotFound {
        entity_type: String,
        action_name: String,
    },
    #[error("Entity {entity_type} {id} not found")]
    EntityNotFound { entity_type: String, id: String },
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),
    /// Business-rule rejection; displays as the declared failure message.
    #[error("{message}")]
    PreconditionFailed { precondition: String, message: String },
    #[error("Error evaluating: {source}")]
    Evaluation {
        precondition: String,
        source: EvalError,
    },
    #[error(transparent)]
    Statement(#[from] StatementError),
    #[error("Persistence failed: {0}")]
    Persistence(StoreError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

/// One action against one entity, as submitted by callers and batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub entity_type: String,
    pub action_name: String,
    pub entity_id: String,
    #[serde(default)]
    pub params: Properties,
}

impl ExecutionRequest {
    pub fn new(entity_type: &str, action_name: &str, entity_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            action_name: action_name.to_string(),
            entity_id: entity_id.to_string(),
            params: Properties::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

impl From<TriggerRequest> for ExecutionRequest {
    fn from(request: TriggerRequest) -> Self {
        Self {
            entity_type: request.entity_type,
            action_name: request.action_name,
            entity_id: request.entity_id,
            params: request.params,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub error: Option<String>,
    /// Properties whose value actually changed.
    pub changes: Properties,
    /// Rules that ran because of this execution, cascades included.
    pub rule_executions: Vec<RuleExecution>,
}

impl ExecutionResult {
    pub fn succeeded(changes: Properties, rule_executions: Vec<RuleExecution>) -> Self {
        Self {
            success: true,
            error: None,
            changes,
            rule_executions,
        }
    }

    pub fn failed(error: &ExecutionError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreconditionCheck {
    pub label: String,
    pub passed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub action: String,
    pub checks: Vec<PreconditionCheck>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    /// Failure messages in declared order.
    pub fn errors(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|check| !check.passed)
            .filter_map(|check| check.message.clone())
            .collect()
    }
}

/// Seam through which rules and batches run actions.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(
        &self,
        request: &ExecutionRequest,
        actor: Option<&Actor>,
        depth: usize,
    ) -> ExecutionResult;
}

#[derive(Clone)]
pub struct ActionExecutor {
    actions: Arc<ActionRegistry>,
    store: Arc<dyn EntityStore>,
    statements: Arc<StatementEvaluator>,
    audit: Arc<dyn AuditLog>,
    emitter: Arc<EventEmitter>,
}

impl ActionExecutor {
    pub fn new(
        actions: Arc<ActionRegistry>,
        store: Arc<dyn EntityStore>,
        services: Arc<ServiceRegistry>,
        audit: Arc<dyn AuditLog>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            actions,
            store,
            statements: Arc::new(StatementEvaluator::new(services)),
            audit,
            emitter,
        }
    }

    fn evaluator(&self) -> &ExpressionEvaluator {
        self.statements.expression_evaluator()
    }

    /// Runs an action against the entity in `context`. Never panics and never
    /// returns an `Err`: every failure is folded into the result.
    #[instrument(level = "debug", skip(self, context, actor))]
    pub async fn execute(
        &self,
        entity_type: &str,
        action_name: &str,
        context: EvaluationContext,
        actor: Option<&Actor>,
    ) -> ExecutionResult {
        match self.try_execute(entity_type, action_name, context, actor).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failed(&e),
        }
    }

    async fn try_execute(
        &self,
        entity_type: &str,
        action_name: &str,
        context: EvaluationContext,
        actor: Option<&Actor>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let action = self.lookup(entity_type, action_name)?;
        let name = action.qualified_name();
        let mut context = if context.store().is_some() {
            context
        } else {
            context.with_store(self.store.clone())
        };
        let entity_id = context.entity_id().unwrap_or_default();

        if let Err(e) = self.check_preconditions(&action, &context).await {
            self.record(&name, &entity_id, actor, false, json!({ "error": e.to_string() }))
                .await;
            return Err(e);
        }

        let outcome = match &action.effect {
            Some(statements) => {
                let evaluated = self
                    .statements
                    .eval_block(statements, &mut context, PathRef::THIS)
                    .await
                    .and_then(|outcome| match outcome.triggers.is_empty() {
                        true => Ok(outcome),
                        false => Err(StatementError::TriggerNotAllowed),
                    });
                match evaluated {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("effect of {} failed: {}", name, e);
                        self.record(&name, &entity_id, actor, false, json!({ "error": e.to_string() }))
                            .await;
                        return Err(e.into());
                    }
                }
            }
            None => Default::default(),
        };

        let mut changes = outcome.changes;
        changes.retain_changed(&context.entity);
        if changes.is_empty() {
            debug!("{} on {} changed nothing", name, entity_id);
            self.record(&name, &entity_id, actor, true, json!({ "changes": {} }))
                .await;
            return Ok(ExecutionResult::succeeded(Properties::new(), vec![]));
        }

        if let Err(e) = self
            .store
            .merge_properties(entity_type, &entity_id, changes.to_properties())
            .await
        {
            error!("persisting {} on {} failed: {}", name, entity_id, e);
            let e = ExecutionError::Persistence(e);
            self.record(&name, &entity_id, actor, false, json!({ "error": e.to_string() }))
                .await;
            return Err(e);
        }

        let detail = json!({ "changes": serde_json::Value::from(Value::Map(changes.to_properties())) });
        match self
            .emit_changes(entity_type, &entity_id, &changes, &context, actor)
            .await
        {
            Ok(rule_executions) => {
                self.record(&name, &entity_id, actor, true, detail).await;
                info!("{} on {} applied {} changes", name, entity_id, changes.len());
                Ok(ExecutionResult::succeeded(
                    changes.to_properties(),
                    rule_executions,
                ))
            }
            Err(e) => {
                // 変更は永続化済み
                warn!("rules after {} on {} failed: {}", name, entity_id, e);
                self.record(&name, &entity_id, actor, false, json!({ "error": e.to_string() }))
                    .await;
                Err(e.into())
            }
        }
    }

    async fn check_preconditions(
        &self,
        action: &ActionDef,
        context: &EvaluationContext,
    ) -> Result<(), ExecutionError> {
        for (i, precondition) in action.preconditions.iter().enumerate() {
            let label = precondition.label(i + 1);
            match self
                .evaluator()
                .eval_condition(&precondition.condition, context)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "precondition {} of {} failed: {}",
                        label,
                        action.qualified_name(),
                        precondition.on_failure
                    );
                    return Err(ExecutionError::PreconditionFailed {
                        precondition: label,
                        message: precondition.on_failure.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        "precondition {} of {} could not be evaluated: {}",
                        label,
                        action.qualified_name(),
                        e
                    );
                    return Err(ExecutionError::Evaluation {
                        precondition: label,
                        source: e,
                    });
                }
            }
        }
        Ok(())
    }

    async fn emit_changes(
        &self,
        entity_type: &str,
        entity_id: &str,
        changes: &ChangeSet,
        context: &EvaluationContext,
        actor: Option<&Actor>,
    ) -> Result<Vec<RuleExecution>, EventError> {
        let mut rule_executions = vec![];
        for (property, new_value) in changes.iter() {
            let old_value = lookup_property(&context.entity, property).unwrap_or_default();
            let event = UpdateEvent::new(entity_type, entity_id, property, old_value, new_value.clone())
                .with_actor(actor.cloned())
                .with_depth(context.depth);
            if let Some(records) = self.emitter.emit(&event).await? {
                rule_executions.extend(records);
            }
        }
        Ok(rule_executions)
    }

    async fn record(
        &self,
        name: &str,
        entity_id: &str,
        actor: Option<&Actor>,
        success: bool,
        detail: serde_json::Value,
    ) {
        self.audit
            .append(AuditEntry::new(
                AuditKind::Action,
                name,
                entity_id,
                actor,
                success,
                detail,
            ))
            .await;
    }

    fn lookup(&self, entity_type: &str, action_name: &str) -> Result<Arc<ActionDef>, ExecutionError> {
        self.actions
            .lookup(entity_type, action_name)
            .ok_or_else(|| ExecutionError::ActionNotFound {
                entity_type: entity_type.to_string(),
                action_name: action_name.to_string(),
            })
    }

    /// Evaluates every precondition, collecting each outcome. Evaluation
    /// errors become that precondition's failure message.
    #[instrument(level = "debug", skip(self, context))]
    pub async fn validate_preconditions(
        &self,
        entity_type: &str,
        action_name: &str,
        context: &EvaluationContext,
    ) -> Result<ValidationReport, ExecutionError> {
        let action = self.lookup(entity_type, action_name)?;
        let mut checks = Vec::with_capacity(action.preconditions.len());
        for (i, precondition) in action.preconditions.iter().enumerate() {
            let check = match self
                .evaluator()
                .eval_condition(&precondition.condition, context)
                .await
            {
                Ok(passed) => PreconditionCheck {
                    label: precondition.label(i + 1),
                    passed,
                    message: (!passed).then(|| precondition.on_failure.clone()),
                },
                Err(e) => PreconditionCheck {
                    label: precondition.label(i + 1),
                    passed: false,
                    message: Some(format!("Error evaluating: {}", e)),
                },
            };
            checks.push(check);
        }
        Ok(ValidationReport {
            action: action.qualified_name(),
            checks,
        })
    }

    /// Fetches the target entity and validates without executing.
    pub async fn validate_request(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ValidationReport, ExecutionError> {
        let action = self.lookup(&request.entity_type, &request.action_name)?;
        let context = self.request_context(&action, request, 0).await?;
        self.validate_preconditions(&request.entity_type, &request.action_name, &context)
            .await
    }

    /// Fetches the target entity, binds parameters, and executes.
    pub async fn execute_request(
        &self,
        request: &ExecutionRequest,
        actor: Option<&Actor>,
    ) -> ExecutionResult {
        self.execute_request_at(request, actor, 0).await
    }

    async fn execute_request_at(
        &self,
        request: &ExecutionRequest,
        actor: Option<&Actor>,
        depth: usize,
    ) -> ExecutionResult {
        let action = match self.lookup(&request.entity_type, &request.action_name) {
            Ok(action) => action,
            Err(e) => return ExecutionResult::failed(&e),
        };
        match self.request_context(&action, request, depth).await {
            Ok(context) => {
                self.execute(&request.entity_type, &request.action_name, context, actor)
                    .await
            }
            Err(e) => ExecutionResult::failed(&e),
        }
    }

    async fn request_context(
        &self,
        action: &ActionDef,
        request: &ExecutionRequest,
        depth: usize,
    ) -> Result<EvaluationContext, ExecutionError> {
        let entity = self
            .store
            .fetch(&request.entity_type, &request.entity_id)
            .await
            .map_err(ExecutionError::Persistence)?
            .ok_or_else(|| ExecutionError::EntityNotFound {
                entity_type: request.entity_type.clone(),
                id: request.entity_id.clone(),
            })?;

        if let Some(missing) = action.parameters.iter().find(|p| {
            !p.optional && request.params.get(&p.name).map_or(true, Value::is_null)
        }) {
            return Err(ExecutionError::MissingParameter(missing.name.clone()));
        }

        Ok(EvaluationContext::for_entity(&entity)
            .with_store(self.store.clone())
            .with_variables(request.params.clone())
            .with_depth(depth))
    }
}

#[async_trait]
impl ActionRunner for ActionExecutor {
    async fn run(
        &self,
        request: &ExecutionRequest,
        actor: Option<&Actor>,
        depth: usize,
    ) -> ExecutionResult {
        self.execute_request_at(request, actor, depth).await
    }
}
