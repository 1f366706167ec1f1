use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{EventError, EventResult, UpdateEvent};
use crate::rule_engine::RuleExecution;

/// Output a listener hands back to the emitting call site. `None` means the
/// listener had nothing to report for this event.
pub type ListenerOutput = Option<Vec<RuleExecution>>;

#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> String;

    async fn on_event(&self, event: &UpdateEvent) -> EventResult<ListenerOutput>;
}

/// Ordered publish/subscribe fan-out.
///
/// Listener identity is the `Arc` allocation: subscribing the same `Arc`
/// twice fails, two distinct instances of one listener type are fine.
#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

fn same_listener(a: &Arc<dyn EventListener>, b: &Arc<dyn EventListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) -> EventResult<()> {
        let mut listeners = self.listeners.write().await;
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return Err(EventError::AlreadySubscribed(listener.name()));
        }
        debug!("listener {} subscribed", listener.name());
        listeners.push(listener);
        Ok(())
    }

    pub async fn unsubscribe(&self, listener: &Arc<dyn EventListener>) -> EventResult<()> {
        let mut listeners = self.listeners.write().await;
        match listeners.iter().position(|l| same_listener(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                debug!("listener {} unsubscribed", listener.name());
                Ok(())
            }
            None => Err(EventError::NotSubscribed(listener.name())),
        }
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Invokes every listener in subscription order and returns the output of
    /// the last one. A failing listener aborts the remaining fan-out.
    pub async fn emit(&self, event: &UpdateEvent) -> EventResult<ListenerOutput> {
        // 再入するリスナーがいるのでロックは保持しない
        let listeners: Vec<Arc<dyn EventListener>> = self.listeners.read().await.clone();
        debug!(
            "emitting {} for {} to {} listeners",
            event.trigger().key(),
            event.entity_id,
            listeners.len()
        );

        let mut last = None;
        for listener in listeners {
            last = listener.on_event(event).await.map_err(|e| {
                warn!("listener {} failed: {}", listener.name(), e);
                e
            })?;
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::rule_engine::RuleError;
    use crate::value::Value;

    struct Recorder {
        name: String,
        calls: Arc<AtomicUsize>,
        output: ListenerOutput,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, calls: Arc<AtomicUsize>) -> Self {
            Self {
                name: name.to_string(),
                calls,
                output: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl EventListener for Recorder {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn on_event(&self, _event: &UpdateEvent) -> EventResult<ListenerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EventError::Rule(RuleError::RecursionLimit { depth: 9, max: 8 }));
            }
            Ok(self.output.clone())
        }
    }

    fn event() -> UpdateEvent {
        UpdateEvent::new(
            "Supplier",
            "s-1",
            "status",
            Value::from("Active"),
            Value::from("Suspended"),
        )
    }

    #[tokio::test]
    async fn test_subscribe_twice_fails() {
        let emitter = EventEmitter::new();
        let listener: Arc<dyn EventListener> =
            Arc::new(Recorder::new("recorder", Arc::new(AtomicUsize::new(0))));
        emitter.subscribe(listener.clone()).await.unwrap();
        assert_eq!(
            emitter.subscribe(listener.clone()).await,
            Err(EventError::AlreadySubscribed("recorder".to_string()))
        );

        emitter.unsubscribe(&listener).await.unwrap();
        assert_eq!(
            emitter.unsubscribe(&listener).await,
            Err(EventError::NotSubscribed("recorder".to_string()))
        );
        assert_eq!(emitter.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_emit_returns_last_output() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut first = Recorder::new("first", calls.clone());
        first.output = Some(vec![]);
        let second = Recorder::new("second", calls.clone());
        emitter.subscribe(Arc::new(first)).await.unwrap();
        emitter.subscribe(Arc::new(second)).await.unwrap();

        // 最後のリスナーの戻り値 (None) が返る
        assert_eq!(emitter.emit(&event()).await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_emit_without_listeners() {
        assert_eq!(EventEmitter::new().emit(&event()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_listener_aborts_fan_out() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut failing = Recorder::new("failing", calls.clone());
        failing.fail = true;
        let after_calls = Arc::new(AtomicUsize::new(0));
        emitter.subscribe(Arc::new(failing)).await.unwrap();
        emitter
            .subscribe(Arc::new(Recorder::new("after", after_calls.clone())))
            .await
            .unwrap();

        assert!(emitter.emit(&event()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }
}
