//! In-memory catalogs of parsed ACTION and RULE definitions.
//!
//! Both registries are explicitly owned objects; the [`crate::system::System`]
//! facade constructs one of each and hands `Arc`s to the executor and the rule
//! engine.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::ast::{ActionDef, Definition, RuleDef, Trigger};
use crate::parser::{parse, parse_file, ParseError};

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Rule '{0}' is already registered")]
    DuplicateRule(String),
    #[error("Rule '{0}' not found")]
    RuleNotFound(String),
    #[error("Action {entity_type}.{action_name} not found")]
    ActionNotFound {
        entity_type: String,
        action_name: String,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Shared load-from-source primitive. Each registry picks the definitions it
/// owns out of a parsed document and registers them in source order.
pub trait DslRegistry {
    type Item;

    fn select(definition: Definition) -> Option<Self::Item>;

    fn register(&self, item: Self::Item) -> RegistryResult<Arc<Self::Item>>;

    fn register_all(&self, definitions: Vec<Definition>) -> RegistryResult<Vec<Arc<Self::Item>>> {
        definitions
            .into_iter()
            .filter_map(Self::select)
            .map(|item| self.register(item))
            .collect()
    }

    fn load_from_text(&self, source: &str) -> RegistryResult<Vec<Arc<Self::Item>>> {
        self.register_all(parse(source)?)
    }

    fn load_from_file(&self, path: &Path) -> RegistryResult<Vec<Arc<Self::Item>>> {
        info!("loading definitions from {}", path.display());
        self.register_all(parse_file(path)?)
    }
}

struct Registered<T> {
    seq: u64,
    definition: Arc<T>,
}

/// Actions keyed by `(entity_type, action_name)`; re-registering replaces.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<(String, String), Registered<ActionDef>>,
    next_seq: AtomicU64,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, entity_type: &str, action_name: &str) -> Option<Arc<ActionDef>> {
        self.actions
            .get(&(entity_type.to_string(), action_name.to_string()))
            .map(|entry| entry.definition.clone())
    }

    pub fn get(&self, entity_type: &str, action_name: &str) -> RegistryResult<Arc<ActionDef>> {
        self.lookup(entity_type, action_name)
            .ok_or_else(|| RegistryError::ActionNotFound {
                entity_type: entity_type.to_string(),
                action_name: action_name.to_string(),
            })
    }

    /// Actions of one entity type in registration order.
    pub fn list_by_entity(&self, entity_type: &str) -> Vec<Arc<ActionDef>> {
        let mut found: Vec<(u64, Arc<ActionDef>)> = self
            .actions
            .iter()
            .filter(|entry| entry.key().0 == entity_type)
            .map(|entry| (entry.seq, entry.definition.clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, action)| action).collect()
    }

    pub fn list(&self) -> Vec<Arc<ActionDef>> {
        let mut found: Vec<(u64, Arc<ActionDef>)> = self
            .actions
            .iter()
            .map(|entry| (entry.seq, entry.definition.clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, action)| action).collect()
    }

    pub fn unregister(&self, entity_type: &str, action_name: &str) -> bool {
        self.actions
            .remove(&(entity_type.to_string(), action_name.to_string()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl DslRegistry for ActionRegistry {
    type Item = ActionDef;

    fn select(definition: Definition) -> Option<ActionDef> {
        match definition {
            Definition::Action(action) => Some(action),
            Definition::Rule(_) => None,
        }
    }

    fn register(&self, action: ActionDef) -> RegistryResult<Arc<ActionDef>> {
        let key = (action.entity_type.clone(), action.action_name.clone());
        let definition = Arc::new(action);
        match self.actions.entry(key) {
            Entry::Occupied(mut entry) => {
                debug!("replacing action {}", definition.qualified_name());
                // 置き換えても一覧での位置は変えない
                entry.get_mut().definition = definition.clone();
            }
            Entry::Vacant(entry) => {
                debug!("registering action {}", definition.qualified_name());
                entry.insert(Registered {
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                    definition: definition.clone(),
                });
            }
        }
        Ok(definition)
    }
}

/// Rules keyed by unique name and indexed by trigger key.
#[derive(Default)]
pub struct RuleRegistry {
    rules: DashMap<String, Registered<RuleDef>>,
    trigger_index: DashMap<String, Vec<String>>,
    next_seq: AtomicU64,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RuleDef>> {
        self.rules.get(name).map(|entry| entry.definition.clone())
    }

    /// Rules that react to `trigger`, highest priority first, ties in
    /// registration order. Rules declared without a property match every
    /// property of the entity type.
    pub fn get_by_trigger(&self, trigger: &Trigger) -> Vec<Arc<RuleDef>> {
        let mut keys = vec![trigger.key()];
        if let Some(widened) = trigger.widened() {
            keys.push(widened.key());
        }

        let mut matched: Vec<(i64, u64, Arc<RuleDef>)> = keys
            .iter()
            .filter_map(|key| self.trigger_index.get(key).map(|names| names.value().clone()))
            .flatten()
            .filter_map(|name| {
                self.rules.get(&name).map(|entry| {
                    (
                        entry.definition.priority,
                        entry.seq,
                        entry.definition.clone(),
                    )
                })
            })
            .collect();
        matched.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        matched.dedup_by_key(|(_, seq, _)| *seq);
        matched.into_iter().map(|(_, _, rule)| rule).collect()
    }

    /// Rules whose trigger names `entity_type`, in registration order.
    pub fn list_by_entity(&self, entity_type: &str) -> Vec<Arc<RuleDef>> {
        let mut found: Vec<(u64, Arc<RuleDef>)> = self
            .rules
            .iter()
            .filter(|entry| entry.definition.trigger.entity_type == entity_type)
            .map(|entry| (entry.seq, entry.definition.clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, rule)| rule).collect()
    }

    pub fn unregister(&self, name: &str) -> RegistryResult<Arc<RuleDef>> {
        let (_, removed) = self
            .rules
            .remove(name)
            .ok_or_else(|| RegistryError::RuleNotFound(name.to_string()))?;
        let key = removed.definition.trigger.key();
        if let Some(mut names) = self.trigger_index.get_mut(&key) {
            names.retain(|n| n != name);
        }
        self.trigger_index.remove_if(&key, |_, names| names.is_empty());
        debug!("unregistered rule {}", name);
        Ok(removed.definition)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl DslRegistry for RuleRegistry {
    type Item = RuleDef;

    fn select(definition: Definition) -> Option<RuleDef> {
        match definition {
            Definition::Rule(rule) => Some(rule),
            Definition::Action(_) => None,
        }
    }

    fn register(&self, rule: RuleDef) -> RegistryResult<Arc<RuleDef>> {
        let definition = Arc::new(rule);
        match self.rules.entry(definition.name.clone()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateRule(definition.name.clone()))
            }
            Entry::Vacant(entry) => {
                entry.insert(Registered {
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                    definition: definition.clone(),
                });
            }
        }
        self.trigger_index
            .entry(definition.trigger.key())
            .or_default()
            .push(definition.name.clone());
        debug!(
            "registered rule {} on {}",
            definition.name,
            definition.trigger.key()
        );
        Ok(definition)
    }
}
