use std::sync::Arc;

use crate::ast::PathRef;
use crate::store::{Entity, EntityStore};
use crate::value::{Properties, Value};

const NESTED_PROPERTIES: &str = "properties";

#[derive(Clone, Default)]
pub struct EvaluationContext {
    /// Current snapshot of `this`, including `id`.
    pub entity: Properties,
    pub old_values: Properties,
    pub variables: Properties,
    store: Option<Arc<dyn EntityStore>>,
    /// Rule cascade depth; 0 for direct action executions.
    pub depth: usize,
}

impl EvaluationContext {
    pub fn new(entity: Properties) -> Self {
        Self {
            entity,
            ..Default::default()
        }
    }

    pub fn for_entity(entity: &Entity) -> Self {
        Self::new(entity.snapshot())
    }

    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_old_values(mut self, old_values: Properties) -> Self {
        self.old_values = old_values;
        self
    }

    pub fn with_variables(mut self, variables: Properties) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn store(&self) -> Option<&Arc<dyn EntityStore>> {
        self.store.as_ref()
    }

    pub fn bind(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// `this` resolves to the entity; otherwise a bound variable.
    pub fn variable(&self, name: &str) -> Option<Value> {
        if name == PathRef::THIS {
            return Some(Value::Map(self.entity.clone()));
        }
        self.variables.get(name).cloned()
    }

    pub fn entity_id(&self) -> Option<String> {
        match self.entity.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Integer(id)) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Resolves a path without failing: anything unresolvable is `Null`.
    ///
    /// At each hop a missing key is looked up again in a nested `properties`
    /// map, so envelope-shaped entities (`{id, properties: {...}}`) read the
    /// same as flat ones.
    pub fn resolve_path(&self, path: &PathRef) -> Value {
        let root = path.root();
        let mut current = if root == PathRef::THIS {
            match path.segments().first() {
                Some(first) => match lookup_property(&self.entity, first) {
                    Some(value) => value,
                    None => return Value::Null,
                },
                None => return Value::Map(self.entity.clone()),
            }
        } else {
            match self.variables.get(root) {
                Some(value) => match path.segments().first() {
                    Some(first) => match value.as_map().and_then(|m| lookup_property(m, first)) {
                        Some(value) => value,
                        None => return Value::Null,
                    },
                    None => return value.clone(),
                },
                None => return Value::Null,
            }
        };

        for segment in path.segments().iter().skip(1) {
            current = match current.as_map().and_then(|m| lookup_property(m, segment)) {
                Some(value) => value,
                None => return Value::Null,
            };
        }
        current
    }

    /// Pre-change value of a property, if one was recorded.
    pub fn old_value(&self, property: &str) -> Option<&Value> {
        self.old_values.get(property)
    }
}

/// One hop of path resolution: `key` itself, else `key` inside the nested
/// `properties` map.
pub fn lookup_property(map: &Properties, key: &str) -> Option<Value> {
    if let Some(value) = map.get(key) {
        return Some(value.clone());
    }
    map.get(NESTED_PROPERTIES)
        .and_then(Value::as_map)
        .and_then(|nested| nested.get(key))
        .cloned()
}
