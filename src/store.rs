//! Entity storage boundary.
//!
//! The interpreter only relies on the contract below: fetch a snapshot, merge
//! a set of properties atomically, and scan an entity type. Physical storage is
//! somebody else's concern; [`InMemoryEntityStore`] exists for tests, the CLI
//! and embedding.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::value::{Properties, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: Properties,
}

impl Entity {
    pub fn new(entity_type: &str, id: &str, properties: Properties) -> Self {
        Self {
            id: id.to_string(),
            entity_type: entity_type.to_string(),
            properties,
        }
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Property map with the synthetic `id` entry, as seen by expressions.
    pub fn snapshot(&self) -> Properties {
        let mut snapshot = self.properties.clone();
        snapshot
            .entry("id".to_string())
            .or_insert_with(|| Value::String(self.id.clone()));
        snapshot
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Entity {id} not found")]
    NotFound { entity_type: String, id: String },
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Store write failed: {0}")]
    WriteFailed(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[automock]
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Looks an entity up by id, falling back to its `name` property.
    async fn fetch(&self, entity_type: &str, id: &str) -> StoreResult<Option<Entity>>;

    /// Upserts `changes` into the entity's properties. Properties not named in
    /// `changes` are left untouched.
    async fn merge_properties(
        &self,
        entity_type: &str,
        id: &str,
        changes: Properties,
    ) -> StoreResult<()>;

    async fn scan(&self, entity_type: &str) -> StoreResult<Vec<Entity>>;

    /// Store-defined functions callable from expressions.
    async fn call_function(&self, name: &str, _args: Vec<Value>) -> StoreResult<Value> {
        Err(StoreError::UnknownFunction(name.to_string()))
    }
}

#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: DashMap<(String, String), Entity>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, entity: Entity) {
        self.entities
            .insert((entity.entity_type.clone(), entity.id.clone()), entity);
    }

    pub fn get(&self, entity_type: &str, id: &str) -> Option<Entity> {
        self.entities
            .get(&(entity_type.to_string(), id.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Seeds from `{ "<EntityType>": [ { "id": "...", ...props } ] }`.
    pub fn load_json(&self, data: &serde_json::Value) -> StoreResult<usize> {
        let types = data.as_object().ok_or_else(|| {
            StoreError::WriteFailed("seed data must be an object keyed by entity type".into())
        })?;

        let mut count = 0;
        for (entity_type, items) in types {
            let items = items.as_array().ok_or_else(|| {
                StoreError::WriteFailed(format!("entities of {} must be a list", entity_type))
            })?;
            for item in items {
                let mut properties = match Value::from(item.clone()) {
                    Value::Map(map) => map,
                    other => {
                        return Err(StoreError::WriteFailed(format!(
                            "entity of {} must be an object, got {}",
                            entity_type,
                            other.type_name()
                        )))
                    }
                };
                let id = match properties.remove("id") {
                    Some(Value::String(id)) => id,
                    Some(Value::Integer(id)) => id.to_string(),
                    _ => {
                        return Err(StoreError::WriteFailed(format!(
                            "entity of {} is missing an id",
                            entity_type
                        )))
                    }
                };
                self.insert(Entity::new(entity_type, &id, properties));
                count += 1;
            }
        }
        debug!("seeded {} entities", count);
        Ok(count)
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn fetch(&self, entity_type: &str, id: &str) -> StoreResult<Option<Entity>> {
        if let Some(entity) = self.get(entity_type, id) {
            return Ok(Some(entity));
        }
        Ok(self
            .entities
            .iter()
            .find(|e| {
                e.entity_type == entity_type
                    && e.property("name").and_then(Value::as_str) == Some(id)
            })
            .map(|e| e.value().clone()))
    }

    async fn merge_properties(
        &self,
        entity_type: &str,
        id: &str,
        changes: Properties,
    ) -> StoreResult<()> {
        let key = (entity_type.to_string(), id.to_string());
        match self.entities.get_mut(&key) {
            Some(mut entity) => {
                entity.properties.extend(changes);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn scan(&self, entity_type: &str) -> StoreResult<Vec<Entity>> {
        let mut entities: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| e.value().clone())
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supplier(id: &str, name: &str) -> Entity {
        Entity::new(
            "Supplier",
            id,
            Properties::from([
                ("name".to_string(), Value::from(name)),
                ("status".to_string(), Value::from("Active")),
            ]),
        )
    }

    #[tokio::test]
    async fn test_fetch_by_id_or_name() {
        let store = InMemoryEntityStore::new();
        store.insert(supplier("s-1", "Acme"));

        assert_eq!(store.fetch("Supplier", "s-1").await.unwrap().unwrap().id, "s-1");
        assert_eq!(store.fetch("Supplier", "Acme").await.unwrap().unwrap().id, "s-1");
        assert!(store.fetch("Supplier", "nobody").await.unwrap().is_none());
        assert!(store.fetch("PurchaseOrder", "s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_is_per_property() {
        let store = InMemoryEntityStore::new();
        store.insert(supplier("s-1", "Acme"));

        store
            .merge_properties(
                "Supplier",
                "s-1",
                Properties::from([("status".to_string(), Value::from("Suspended"))]),
            )
            .await
            .unwrap();

        let entity = store.get("Supplier", "s-1").unwrap();
        assert_eq!(entity.property("status"), Some(&Value::from("Suspended")));
        assert_eq!(entity.property("name"), Some(&Value::from("Acme")));

        let missing = store
            .merge_properties("Supplier", "s-9", Properties::new())
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_scan_is_sorted_by_id() {
        let store = InMemoryEntityStore::new();
        store.insert(supplier("s-2", "B"));
        store.insert(supplier("s-1", "A"));
        store.insert(Entity::new("PurchaseOrder", "po-1", Properties::new()));

        let ids: Vec<String> = store
            .scan("Supplier")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["s-1", "s-2"]);
    }

    #[test]
    fn test_load_json() {
        let store = InMemoryEntityStore::new();
        let count = store
            .load_json(&serde_json::json!({
                "PurchaseOrder": [{"id": "po-1", "status": "Draft"}, {"id": 7}],
            }))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            store.get("PurchaseOrder", "po-1").unwrap().property("status"),
            Some(&Value::from("Draft"))
        );
        assert!(store.get("PurchaseOrder", "7").is_some());

        assert!(store
            .load_json(&serde_json::json!({"PurchaseOrder": [{"status": "Draft"}]}))
            .is_err());
    }

    #[test]
    fn test_snapshot_has_id() {
        let snapshot = supplier("s-1", "Acme").snapshot();
        assert_eq!(snapshot.get("id"), Some(&Value::from("s-1")));
    }

    #[tokio::test]
    async fn test_default_call_function_is_unknown() {
        let store = InMemoryEntityStore::new();
        assert_eq!(
            store.call_function("SCORE", vec![]).await,
            Err(StoreError::UnknownFunction("SCORE".to_string()))
        );
    }
}
