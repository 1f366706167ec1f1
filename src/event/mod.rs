//! # Property-change events
//!
//! Every successful, value-changing assignment produces one [`UpdateEvent`].
//! Events are fanned out by the [`emitter::EventEmitter`] to its listeners in
//! subscription order; the [`crate::rule_engine::RuleEngine`] is the main
//! listener and [`feed::BroadcastListener`] republishes events to
//! asynchronous observers.
//!
//! ```text
//! ┌──────────────┐     ┌────────────┐     ┌───────────┐
//! │ActionExecutor│────▶│EventEmitter│────▶│RuleEngine │──┐
//! └──────────────┘     └─────┬──────┘     └───────────┘  │
//!        ▲                   │                           │
//!        │                   ▼                           │
//!        │            ┌─────────────┐                    │
//!        │            │ChangeFeed rx│                    │
//!        │            └─────────────┘                    │
//!        └───────────── TRIGGER / cascading events ──────┘
//! ```
//!
//! Emission is synchronous with the action that caused it: the emitting
//! `execute` call does not return before every listener has run.

pub mod emitter;
pub mod feed;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ast::{Trigger, TriggerType};
use crate::audit::Actor;
use crate::rule_engine::RuleError;
use crate::value::Value;

pub use emitter::{EventEmitter, EventListener};
pub use feed::{BroadcastListener, ChangeFeed};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub property: String,
    pub old_value: Value,
    pub new_value: Value,
    pub actor: Option<Actor>,
    /// 0 for events caused directly by an action execution.
    pub depth: usize,
    pub timestamp: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn new(
        entity_type: &str,
        entity_id: &str,
        property: &str,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            property: property.to_string(),
            old_value,
            new_value,
            actor: None,
            depth: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: Option<Actor>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// `UPDATE:{entity_type}:{property}`
    pub fn trigger(&self) -> Trigger {
        Trigger::new(TriggerType::Update, &self.entity_type, Some(&self.property))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Listener '{0}' is already subscribed")]
    AlreadySubscribed(String),
    #[error("Listener '{0}' is not subscribed")]
    NotSubscribed(String),
    #[error("Change feed lagged, {count} events skipped")]
    Lagged { count: u64 },
    #[error("Change feed receive failed: {message}")]
    ReceiveFailed { message: String },
    #[error(transparent)]
    Rule(#[from] RuleError),
}

pub type EventResult<T> = Result<T, EventError>;
