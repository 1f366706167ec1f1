//! Reactive RULE execution.
//!
//! The [`RuleEngine`] listens on the [`EventEmitter`]. For each update event it
//! asks the [`RuleRegistry`] for matching rules, binds each rule's FOR variable
//! to every qualifying entity and runs the body against it. Changes made by a
//! rule are persisted and emitted again, one level deeper; a cascade deeper
//! than `rules.max_cascade_depth` fails with [`RuleError::RecursionLimit`].

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ast::RuleDef;
use crate::audit::{AuditEntry, AuditKind, AuditLog};
use crate::config::RuleConfig;
use crate::eval::context::{lookup_property, EvaluationContext};
use crate::eval::statement::{StatementError, StatementEvaluator};
use crate::eval::EvalError;
use crate::event::emitter::ListenerOutput;
use crate::event::{EventEmitter, EventListener, EventResult, UpdateEvent};
use crate::executor::{ActionRunner, ExecutionRequest};
use crate::registry::RuleRegistry;
use crate::service::ServiceRegistry;
use crate::store::{Entity, EntityStore, StoreError};
use crate::value::{Properties, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("rule recursion limit exceeded: cascade depth {depth} > {max}")]
    RecursionLimit { depth: usize, max: usize },
    #[error("Rule '{rule}' WHERE failed: {source}")]
    Filter { rule: String, source: EvalError },
    #[error("Rule '{rule}' failed: {source}")]
    Statement {
        rule: String,
        source: StatementError,
    },
    #[error("Rule store access failed: {0}")]
    Store(#[from] StoreError),
}

pub type RuleResult<T> = Result<T, RuleError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredAction {
    pub action: String,
    pub entity_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// What one rule did to one bound entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecution {
    pub rule: String,
    pub entity_type: String,
    pub entity_id: String,
    pub changes: Properties,
    pub triggered: Vec<TriggeredAction>,
    pub depth: usize,
}

pub struct RuleEngine {
    rules: Arc<RuleRegistry>,
    store: Arc<dyn EntityStore>,
    statements: StatementEvaluator,
    audit: Arc<dyn AuditLog>,
    config: RuleConfig,
    emitter: OnceLock<Weak<EventEmitter>>,
    runner: OnceLock<Weak<dyn ActionRunner>>,
}

impl RuleEngine {
    pub fn new(
        rules: Arc<RuleRegistry>,
        store: Arc<dyn EntityStore>,
        services: Arc<ServiceRegistry>,
        audit: Arc<dyn AuditLog>,
        config: RuleConfig,
    ) -> Self {
        Self {
            rules,
            store,
            statements: StatementEvaluator::new(services),
            audit,
            config,
            emitter: OnceLock::new(),
            runner: OnceLock::new(),
        }
    }

    /// Wires the emitter used for cascading events and the runner used by
    /// `TRIGGER`. Both are held weakly; the emitter owns the engine.
    pub fn attach(&self, emitter: &Arc<EventEmitter>, runner: Weak<dyn ActionRunner>) {
        if self.emitter.set(Arc::downgrade(emitter)).is_err()
            || self.runner.set(runner).is_err()
        {
            warn!("rule engine already attached, keeping the first wiring");
        }
    }

    fn emitter(&self) -> Option<Arc<EventEmitter>> {
        self.emitter.get().and_then(Weak::upgrade)
    }

    fn runner(&self) -> Option<Arc<dyn ActionRunner>> {
        self.runner.get().and_then(Weak::upgrade)
    }

    /// `None` when no rule matches the event; otherwise one record per bound
    /// entity that a rule changed or triggered an action for, cascades
    /// included.
    pub async fn on_update(&self, event: &UpdateEvent) -> EventResult<ListenerOutput> {
        if !self.config.enabled {
            return Ok(None);
        }
        let matched = self.rules.get_by_trigger(&event.trigger());
        if matched.is_empty() {
            return Ok(None);
        }
        debug!(
            "{} rules match {} on {}",
            matched.len(),
            event.trigger().key(),
            event.entity_id
        );

        let this = self
            .store
            .fetch(&event.entity_type, &event.entity_id)
            .await
            .map_err(RuleError::from)?
            .map(|entity| entity.snapshot())
            .unwrap_or_else(|| {
                Properties::from([("id".to_string(), Value::from(event.entity_id.as_str()))])
            });

        let mut records = vec![];
        for rule in matched {
            records.extend(self.run_rule(&rule, event, &this).await?);
        }
        Ok(Some(records))
    }

    async fn run_rule(
        &self,
        rule: &RuleDef,
        event: &UpdateEvent,
        this: &Properties,
    ) -> EventResult<Vec<RuleExecution>> {
        let body = &rule.body;
        let base = EvaluationContext::new(this.clone())
            .with_store(self.store.clone())
            .with_old_values(Properties::from([(
                event.property.clone(),
                event.old_value.clone(),
            )]))
            .with_variables(Properties::from([
                ("event_old".to_string(), event.old_value.clone()),
                ("event_new".to_string(), event.new_value.clone()),
            ]))
            .with_depth(event.depth + 1);

        let mut records = vec![];
        for candidate in self.store.scan(&body.entity_type).await.map_err(RuleError::from)? {
            let mut context = base.clone();
            context.bind(&body.variable, Value::Map(candidate.snapshot()));

            if let Some(condition) = &body.condition {
                let qualifies = self
                    .statements
                    .expression_evaluator()
                    .eval_condition(condition, &context)
                    .await
                    .map_err(|source| RuleError::Filter {
                        rule: rule.name.clone(),
                        source,
                    })?;
                if !qualifies {
                    continue;
                }
            }

            records.extend(self.apply(rule, event, &candidate, context).await?);
        }
        Ok(records)
    }

    /// Runs the body against one bound entity.
    async fn apply(
        &self,
        rule: &RuleDef,
        event: &UpdateEvent,
        candidate: &Entity,
        mut context: EvaluationContext,
    ) -> EventResult<Vec<RuleExecution>> {
        let body = &rule.body;
        let outcome = match self
            .statements
            .eval_block(&body.statements, &mut context, &body.variable)
            .await
        {
            Ok(outcome) => outcome,
            Err(source) => {
                error!("rule {} failed on {}: {}", rule.name, candidate.id, source);
                self.record(rule, &candidate.id, event, false, json!({ "error": source.to_string() }))
                    .await;
                return Err(RuleError::Statement {
                    rule: rule.name.clone(),
                    source,
                }
                .into());
            }
        };

        let mut changes = outcome.changes;
        changes.retain_changed(&candidate.properties);
        if changes.is_empty() && outcome.triggers.is_empty() {
            return Ok(vec![]);
        }
        let depth = self.next_depth(event)?;

        let mut record = RuleExecution {
            rule: rule.name.clone(),
            entity_type: body.entity_type.clone(),
            entity_id: candidate.id.clone(),
            changes: changes.to_properties(),
            triggered: vec![],
            depth,
        };
        let mut cascaded = vec![];

        if !changes.is_empty() {
            self.store
                .merge_properties(&body.entity_type, &candidate.id, changes.to_properties())
                .await
                .map_err(RuleError::from)?;
            info!(
                "rule {} changed {} properties on {}",
                rule.name,
                changes.len(),
                candidate.id
            );
            if let Some(emitter) = self.emitter() {
                for (property, new_value) in changes.iter() {
                    let cascade = UpdateEvent::new(
                        &body.entity_type,
                        &candidate.id,
                        property,
                        lookup_property(&candidate.properties, property).unwrap_or_default(),
                        new_value.clone(),
                    )
                    .with_actor(event.actor.clone())
                    .with_depth(depth);
                    if let Some(nested) = emitter.emit(&cascade).await? {
                        cascaded.extend(nested);
                    }
                }
            }
        }

        for trigger in outcome.triggers {
            let request = ExecutionRequest::from(trigger);
            let action = format!("{}.{}", request.entity_type, request.action_name);
            let triggered = match self.runner() {
                Some(runner) => {
                    let result = runner.run(&request, event.actor.as_ref(), depth).await;
                    if !result.success {
                        // 失敗してもルールの残りは続行する
                        warn!(
                            "rule {} triggered {} on {} which failed: {:?}",
                            rule.name, action, request.entity_id, result.error
                        );
                    }
                    cascaded.extend(result.rule_executions);
                    TriggeredAction {
                        action,
                        entity_id: request.entity_id,
                        success: result.success,
                        error: result.error,
                    }
                }
                None => TriggeredAction {
                    action,
                    entity_id: request.entity_id,
                    success: false,
                    error: Some("no action runner attached".to_string()),
                },
            };
            record.triggered.push(triggered);
        }

        self.record(
            rule,
            &candidate.id,
            event,
            true,
            json!({
                "changes": serde_json::Value::from(Value::Map(record.changes.clone())),
                "triggered": record.triggered.len(),
            }),
        )
        .await;

        let mut records = vec![record];
        records.extend(cascaded);
        Ok(records)
    }

    fn next_depth(&self, event: &UpdateEvent) -> RuleResult<usize> {
        let depth = event.depth + 1;
        if depth > self.config.max_cascade_depth {
            error!(
                "rule cascade from {} on {} exceeded depth {}",
                event.trigger().key(),
                event.entity_id,
                self.config.max_cascade_depth
            );
            return Err(RuleError::RecursionLimit {
                depth,
                max: self.config.max_cascade_depth,
            });
        }
        Ok(depth)
    }

    async fn record(
        &self,
        rule: &RuleDef,
        entity_id: &str,
        event: &UpdateEvent,
        success: bool,
        detail: serde_json::Value,
    ) {
        self.audit
            .append(AuditEntry::new(
                AuditKind::Rule,
                &rule.name,
                entity_id,
                event.actor.as_ref(),
                success,
                detail,
            ))
            .await;
    }
}

#[async_trait]
impl EventListener for RuleEngine {
    fn name(&self) -> String {
        "rule_engine".to_string()
    }

    async fn on_event(&self, event: &UpdateEvent) -> EventResult<ListenerOutput> {
        self.on_update(event).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::event::EventError;
    use crate::registry::DslRegistry;
    use crate::store::InMemoryEntityStore;

    const HOLD_ORDERS: &str = r#"
        RULE HoldOrders PRIORITY 10 {
            ON UPDATE(Supplier.status)
            FOR (o: PurchaseOrder WHERE o.supplier == this.id AND event_new == "Suspended") {
                SET o.status = "OnHold";
                SET o.hold_reason = CONCAT("supplier ", this.id, " suspended");
            }
        }
    "#;

    fn seeded_store() -> Arc<InMemoryEntityStore> {
        let store = InMemoryEntityStore::shared();
        store
            .load_json(&json!({
                "Supplier": [{ "id": "s-1", "status": "Suspended" }, { "id": "s-2", "status": "Active" }],
                "PurchaseOrder": [
                    { "id": "po-1", "supplier": "s-1", "status": "Submitted" },
                    { "id": "po-2", "supplier": "s-1", "status": "Draft" },
                    { "id": "po-3", "supplier": "s-2", "status": "Submitted" }
                ]
            }))
            .unwrap();
        store
    }

    fn engine(
        source: &str,
        store: Arc<InMemoryEntityStore>,
        config: RuleConfig,
    ) -> (Arc<RuleEngine>, Arc<EventEmitter>, Arc<InMemoryAuditLog>) {
        let rules = Arc::new(RuleRegistry::new());
        rules.load_from_text(source).unwrap();
        let audit = Arc::new(InMemoryAuditLog::new());
        let engine = Arc::new(RuleEngine::new(
            rules,
            store,
            Arc::new(ServiceRegistry::new()),
            audit.clone(),
            config,
        ));
        let emitter = Arc::new(EventEmitter::new());
        (engine, emitter, audit)
    }

    fn status_event(id: &str, old: &str, new: &str) -> UpdateEvent {
        UpdateEvent::new("Supplier", id, "status", Value::from(old), Value::from(new))
    }

    #[tokio::test]
    async fn test_rule_runs_once_per_bound_entity() {
        let store = seeded_store();
        let (engine, emitter, audit) = engine(HOLD_ORDERS, store.clone(), RuleConfig::default());
        emitter.subscribe(engine.clone()).await.unwrap();
        engine.attach(&emitter, Weak::<crate::executor::ActionExecutor>::new());

        let records = emitter
            .emit(&status_event("s-1", "Active", "Suspended"))
            .await
            .unwrap()
            .unwrap();

        let ids: Vec<&str> = records.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["po-1", "po-2"]);
        assert_eq!(records[0].changes["status"], Value::from("OnHold"));
        assert_eq!(
            records[0].changes["hold_reason"],
            Value::from("supplier s-1 suspended")
        );
        assert_eq!(records[0].depth, 1);
        assert_eq!(
            store.get("PurchaseOrder", "po-3").unwrap().property("status"),
            Some(&Value::from("Submitted"))
        );
        assert_eq!(audit.len().await, 2);
    }

    #[tokio::test]
    async fn test_no_match_is_none_and_no_change_is_empty() {
        let store = seeded_store();
        let (engine, _, _) = engine(HOLD_ORDERS, store, RuleConfig::default());

        let unrelated = UpdateEvent::new("Supplier", "s-1", "rating", Value::Null, Value::Integer(3));
        assert_eq!(engine.on_update(&unrelated).await.unwrap(), None);

        // WHERE が成立しない
        let reactivated = status_event("s-1", "Suspended", "Active");
        assert_eq!(engine.on_update(&reactivated).await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_disabled_engine_ignores_events() {
        let store = seeded_store();
        let config = RuleConfig {
            enabled: false,
            ..Default::default()
        };
        let (engine, _, _) = engine(HOLD_ORDERS, store, config);
        assert_eq!(
            engine
                .on_update(&status_event("s-1", "Active", "Suspended"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_cascade_hits_recursion_limit() {
        let store = InMemoryEntityStore::shared();
        store.insert(Entity::new(
            "Counter",
            "c-1",
            Properties::from([("value".to_string(), Value::Integer(0))]),
        ));
        let source = r#"
            RULE Bump {
                ON UPDATE(Counter.value)
                FOR (c: Counter WHERE c.id == this.id) {
                    SET c.value = CONCAT(c.value, "+");
                }
            }
        "#;
        let config = RuleConfig {
            enabled: true,
            max_cascade_depth: 3,
        };
        let (engine, emitter, _) = engine(source, store.clone(), config);
        emitter.subscribe(engine.clone()).await.unwrap();
        engine.attach(&emitter, Weak::<crate::executor::ActionExecutor>::new());

        let err = emitter
            .emit(&UpdateEvent::new(
                "Counter",
                "c-1",
                "value",
                Value::Integer(-1),
                Value::Integer(0),
            ))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EventError::Rule(RuleError::RecursionLimit { depth: 4, max: 3 })
        );
        assert!(err.to_string().starts_with("rule recursion limit"));
        // depth 1..=3 までの変更は永続化済み
        assert_eq!(
            store.get("Counter", "c-1").unwrap().property("value"),
            Some(&Value::from("0+++"))
        );
    }

    #[tokio::test]
    async fn test_invalid_rule_target_is_reported() {
        let store = seeded_store();
        let source = r#"
            RULE Broken {
                ON UPDATE(Supplier.status)
                FOR (o: PurchaseOrder) {
                    SET this.status = "x";
                }
            }
        "#;
        let (engine, _, audit) = engine(source, store, RuleConfig::default());
        let err = engine
            .on_update(&status_event("s-1", "Active", "Suspended"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Rule(RuleError::Statement { .. })
        ));
        assert!(!audit.entries().await[0].success);
    }
}
