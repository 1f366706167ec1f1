use async_trait::async_trait;
use tokio::sync::broadcast;

use super::emitter::{EventListener, ListenerOutput};
use super::{EventError, EventResult, UpdateEvent};

/// Republishes emitted events on a broadcast channel for asynchronous
/// observers. It never reports rule executions.
pub struct BroadcastListener {
    sender: broadcast::Sender<UpdateEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> ChangeFeed {
        ChangeFeed::new(self.sender.subscribe())
    }
}

#[async_trait]
impl EventListener for BroadcastListener {
    fn name(&self) -> String {
        "change_feed".to_string()
    }

    async fn on_event(&self, event: &UpdateEvent) -> EventResult<ListenerOutput> {
        // 受信者がいない場合の送信エラーは無視する
        let _ = self.sender.send(event.clone());
        Ok(None)
    }
}

pub struct ChangeFeed {
    receiver: broadcast::Receiver<UpdateEvent>,
}

impl ChangeFeed {
    fn new(receiver: broadcast::Receiver<UpdateEvent>) -> Self {
        Self { receiver }
    }

    /// Laggedの場合はresubscribeしてエラーを返す。次のrecvから最新のイベントを受信する。
    pub async fn recv(&mut self) -> EventResult<UpdateEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn event(n: i64) -> UpdateEvent {
        UpdateEvent::new("Counter", "c-1", "value", Value::Integer(n - 1), Value::Integer(n))
    }

    #[tokio::test]
    async fn test_feed_receives_events() {
        let listener = BroadcastListener::new(16);
        let mut feed1 = listener.subscribe();
        let mut feed2 = listener.subscribe();

        assert_eq!(listener.on_event(&event(1)).await.unwrap(), None);

        assert_eq!(feed1.recv().await.unwrap().new_value, Value::Integer(1));
        assert_eq!(feed2.recv().await.unwrap().new_value, Value::Integer(1));
    }

    #[tokio::test]
    async fn test_feed_without_receivers() {
        let listener = BroadcastListener::new(4);
        assert!(listener.on_event(&event(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagged_feed_resubscribes() {
        let listener = BroadcastListener::new(2);
        let mut feed = listener.subscribe();
        for n in 1..=5 {
            listener.on_event(&event(n)).await.unwrap();
        }

        assert!(matches!(feed.recv().await, Err(EventError::Lagged { .. })));

        listener.on_event(&event(6)).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().new_value, Value::Integer(6));
    }
}
