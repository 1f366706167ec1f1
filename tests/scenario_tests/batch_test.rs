use std::sync::Arc;

use futures::FutureExt;
use rulekit::{
    audit::Actor,
    batch::{BatchProgress, ProgressCallback},
    ExecutionRequest, Value,
};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use super::{setup_system, PURCHASE_ORDER_DSL};

fn many_orders(count: usize) -> serde_json::Value {
    let orders: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            let status = if i % 4 == 3 { "Submitted" } else { "Draft" };
            json!({ "id": format!("PO-{:02}", i), "status": status, "total": 10 + i })
        })
        .collect();
    json!({ "PurchaseOrder": orders })
}

fn submit_all(count: usize) -> Vec<ExecutionRequest> {
    (0..count)
        .map(|i| ExecutionRequest::new("PurchaseOrder", "submit", &format!("PO-{:02}", i)))
        .collect()
}

#[tokio::test]
async fn test_batch_submit_through_system() {
    let fixture = setup_system(
        r#"{ "batch": { "max_concurrent": 3, "timeout_per_action": 5000 } }"#,
        PURCHASE_ORDER_DSL,
        many_orders(12),
    )
    .await;

    let seen = Arc::new(Mutex::new(Vec::<BatchProgress>::new()));
    let sink = seen.clone();
    let progress: ProgressCallback = Arc::new(move |progress: BatchProgress| {
        let sink = sink.clone();
        async move { sink.lock().await.push(progress) }.boxed()
    });

    let actor = Actor::new("nightly", "AI");
    let result = fixture
        .system
        .execute_batch(submit_all(12), Some(&actor), Some(progress))
        .await;

    assert_eq!(result.total, 12);
    assert_eq!(result.succeeded, 9);
    assert_eq!(result.failed, 3);
    assert_eq!(result.succeeded + result.failed, result.total);
    assert!(result
        .failures
        .iter()
        .all(|f| f.error == "Only draft orders can be submitted"));

    let seen = seen.lock().await;
    assert_eq!(seen.len(), 12);
    let mut completed: Vec<usize> = seen.iter().map(|p| p.completed).collect();
    completed.sort();
    assert_eq!(completed, (1..=12).collect::<Vec<_>>());
    assert!(seen.iter().all(|p| p.total == 12));

    assert_eq!(
        fixture.store.get("PurchaseOrder", "PO-00").unwrap().property("status"),
        Some(&Value::String("Submitted".to_string()))
    );
    let audits = fixture.audit.entries().await;
    assert_eq!(audits.len(), 12);
    assert!(audits.iter().all(|e| e.actor.as_ref() == Some(&actor)));
}

#[tokio::test]
async fn test_batch_progress_stream() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, many_orders(4)).await;

    let (stream, handle) = fixture
        .system
        .batch_executor()
        .spawn_batch(submit_all(4), None);
    let updates: Vec<BatchProgress> = stream.collect().await;
    let result = handle.await.unwrap();

    assert_eq!(updates.len(), 4);
    assert_eq!(updates.last().map(|p| p.completed), Some(4));
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failures[0].entity_id, "PO-03");
}
