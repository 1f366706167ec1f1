use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::audit::{Actor, AuditLog, TracingAuditLog};
use crate::batch::{BatchExecutionResult, BatchExecutor, ProgressCallback};
use crate::config::EngineConfig;
use crate::event::{BroadcastListener, ChangeFeed, EventEmitter, EventListener};
use crate::executor::{ActionExecutor, ActionRunner, ExecutionRequest, ExecutionResult, ValidationReport};
use crate::parser::{parse, parse_file};
use crate::registry::{ActionRegistry, DslRegistry, RuleRegistry};
use crate::rule_engine::RuleEngine;
use crate::service::{ExternalService, ServiceRegistry};
use crate::store::{EntityStore, InMemoryEntityStore};
use crate::{Definition, InternalResult};

/// Names of the definitions one load registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadSummary {
    pub actions: Vec<String>,
    pub rules: Vec<String>,
}

/// Owns and wires every component. One `System` per store.
pub struct System {
    config: EngineConfig,
    actions: Arc<ActionRegistry>,
    rules: Arc<RuleRegistry>,
    store: Arc<dyn EntityStore>,
    services: Arc<ServiceRegistry>,
    emitter: Arc<EventEmitter>,
    change_feed: Arc<BroadcastListener>,
    executor: Arc<ActionExecutor>,
    batch: BatchExecutor,
}

impl System {
    pub async fn new(
        config: EngineConfig,
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditLog>,
    ) -> InternalResult<Self> {
        config.validate()?;
        let actions = Arc::new(ActionRegistry::new());
        let rules = Arc::new(RuleRegistry::new());
        let services = Arc::new(ServiceRegistry::new());
        let emitter = Arc::new(EventEmitter::new());

        let executor = Arc::new(ActionExecutor::new(
            actions.clone(),
            store.clone(),
            services.clone(),
            audit.clone(),
            emitter.clone(),
        ));

        let rule_engine = Arc::new(RuleEngine::new(
            rules.clone(),
            store.clone(),
            services.clone(),
            audit,
            config.rules.clone(),
        ));
        let change_feed = Arc::new(BroadcastListener::new(config.event_feed_capacity));
        emitter
            .subscribe(change_feed.clone() as Arc<dyn EventListener>)
            .await?;

        let runner: Arc<dyn ActionRunner> = executor.clone();
        rule_engine.attach(&emitter, Arc::downgrade(&runner));
        // emit はルールエンジンの戻り値を返すので最後に登録する
        if config.rules.enabled {
            emitter.subscribe(rule_engine).await?;
        }

        let batch = BatchExecutor::new(runner, config.batch.clone());
        debug!("system wired");

        Ok(Self {
            config,
            actions,
            rules,
            store,
            services,
            emitter,
            change_feed,
            executor,
            batch,
        })
    }

    /// In-memory store and tracing audit log.
    pub async fn in_memory(config: EngineConfig) -> InternalResult<Self> {
        Self::new(config, InMemoryEntityStore::shared(), Arc::new(TracingAuditLog)).await
    }

    /// Registers every ACTION and RULE of a document. Nothing is registered
    /// if the document does not parse.
    pub fn load_dsl(&self, source: &str) -> InternalResult<LoadSummary> {
        self.register(parse(source)?)
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> InternalResult<LoadSummary> {
        info!("loading {}", path.as_ref().display());
        self.register(parse_file(path)?)
    }

    /// Loads every file listed in `dsl_paths`, in order.
    pub fn load_configured_sources(&self) -> InternalResult<LoadSummary> {
        let mut summary = LoadSummary::default();
        for path in &self.config.dsl_paths {
            let loaded = self.load_file(path)?;
            summary.actions.extend(loaded.actions);
            summary.rules.extend(loaded.rules);
        }
        Ok(summary)
    }

    fn register(&self, definitions: Vec<Definition>) -> InternalResult<LoadSummary> {
        let actions = self.actions.register_all(definitions.clone())?;
        let rules = self.rules.register_all(definitions)?;
        let summary = LoadSummary {
            actions: actions.iter().map(|a| a.qualified_name()).collect(),
            rules: rules.iter().map(|r| r.name.clone()).collect(),
        };
        info!(
            "registered {} actions and {} rules",
            summary.actions.len(),
            summary.rules.len()
        );
        Ok(summary)
    }

    pub fn register_service(&self, service: Arc<dyn ExternalService>) {
        self.services.register(service);
    }

    pub async fn execute(&self, request: &ExecutionRequest, actor: Option<&Actor>) -> ExecutionResult {
        self.executor.execute_request(request, actor).await
    }

    pub async fn validate(&self, request: &ExecutionRequest) -> InternalResult<ValidationReport> {
        Ok(self.executor.validate_request(request).await?)
    }

    pub async fn execute_batch(
        &self,
        requests: Vec<ExecutionRequest>,
        actor: Option<&Actor>,
        progress: Option<ProgressCallback>,
    ) -> BatchExecutionResult {
        self.batch.execute_batch(requests, actor, progress).await
    }

    /// Asynchronous feed of every emitted update event.
    pub fn subscribe_changes(&self) -> ChangeFeed {
        self.change_feed.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn batch_executor(&self) -> &BatchExecutor {
        &self.batch
    }
}
