use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    Action,
    Rule,
}

/// Who asked for an execution (`AI`, `USER`, `MCP`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub actor_type: String,
}

impl Actor {
    pub fn new(name: &str, actor_type: &str) -> Self {
        Self {
            name: name.to_string(),
            actor_type: actor_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub name: String,
    pub entity_id: String,
    pub actor: Option<Actor>,
    pub success: bool,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        name: &str,
        entity_id: &str,
        actor: Option<&Actor>,
        success: bool,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            name: name.to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.cloned(),
            success,
            detail,
        }
    }
}

/// Append-only execution log.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry);
}

#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) {
        self.entries.write().await.push(entry);
    }
}

/// Writes entries to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn append(&self, entry: AuditEntry) {
        info!(
            target: "audit",
            kind = %entry.kind,
            name = %entry.name,
            entity_id = %entry.entity_id,
            actor = ?entry.actor.as_ref().map(|a| &a.name),
            success = entry.success,
            detail = %entry.detail,
            "execution recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_log_keeps_order() {
        let log = InMemoryAuditLog::new();
        let actor = Actor::new("alice", "USER");
        log.append(AuditEntry::new(
            AuditKind::Action,
            "PurchaseOrder.submit",
            "po-1",
            Some(&actor),
            false,
            serde_json::json!({"error": "must be draft"}),
        ))
        .await;
        log.append(AuditEntry::new(
            AuditKind::Rule,
            "HoldOrders",
            "po-1",
            None,
            true,
            serde_json::json!({}),
        ))
        .await;

        let entries = log.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].actor.as_ref().unwrap().name, "alice");
        assert_eq!(entries[0].detail["error"], "must be draft");
        assert_eq!(entries[1].kind, AuditKind::Rule);
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(AuditKind::Action.to_string(), "ACTION");
        assert_eq!(serde_json::to_value(AuditKind::Rule).unwrap(), "RULE");
    }
}
