use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mockall::automock;
use thiserror::Error;
use tracing::debug;

use crate::value::{Properties, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Service not found: {0}")]
    NotFound(String),
    #[error("Service call {service}.{method} failed: {message}")]
    InvocationFailed {
        service: String,
        method: String,
        message: String,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// An external system reachable from `CALL` statements.
#[automock]
#[async_trait]
pub trait ExternalService: Send + Sync {
    /// Fully qualified service name, e.g. `erp.OrderService`.
    fn service_name(&self) -> String;

    fn display_name(&self) -> Option<String> {
        None
    }

    async fn invoke(&self, method: &str, args: Properties) -> ServiceResult<Value>;
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<dyn ExternalService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn ExternalService>) {
        let name = service.service_name();
        debug!("registering service {}", name);
        self.services.insert(name, service);
    }

    pub fn unregister(&self, service_name: &str) -> bool {
        self.services.remove(service_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Exact service name, then dotted suffix (`OrderService` finds
    /// `erp.OrderService`), then display name.
    pub fn resolve(&self, name: &str) -> ServiceResult<Arc<dyn ExternalService>> {
        if let Some(service) = self.services.get(name) {
            return Ok(service.value().clone());
        }

        let suffix = format!(".{}", name);
        let mut matches: Vec<(String, Arc<dyn ExternalService>)> = self
            .services
            .iter()
            .filter(|e| e.key().ends_with(&suffix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if !matches.is_empty() {
            matches.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(matches.swap_remove(0).1);
        }

        let mut by_display: Vec<(String, Arc<dyn ExternalService>)> = self
            .services
            .iter()
            .filter(|e| e.value().display_name().as_deref() == Some(name))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        by_display.sort_by(|a, b| a.0.cmp(&b.0));
        by_display
            .into_iter()
            .next()
            .map(|(_, service)| service)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    pub async fn invoke(&self, name: &str, method: &str, args: Properties) -> ServiceResult<Value> {
        let service = self.resolve(name)?;
        service.invoke(method, args).await
    }
}
