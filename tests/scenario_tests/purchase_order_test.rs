use std::time::Duration;

use rulekit::{
    audit::{Actor, AuditKind},
    ExecutionRequest, Value,
};
use serde_json::json;
use tokio::time::timeout;

use super::{setup_system, PURCHASE_ORDER_DSL};

fn orders() -> serde_json::Value {
    json!({
        "PurchaseOrder": [
            { "id": "PO-1", "status": "Draft", "total": 1200 },
            { "id": "PO-2", "status": "Submitted", "total": 50 },
            { "id": "PO-3", "status": "Draft", "total": 0 }
        ]
    })
}

#[tokio::test]
async fn test_submit_draft_order() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, orders()).await;
    let mut feed = fixture.system.subscribe_changes();
    let actor = Actor::new("alice", "USER");

    let result = fixture
        .system
        .execute(
            &ExecutionRequest::new("PurchaseOrder", "submit", "PO-1"),
            Some(&actor),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.changes.get("status"),
        Some(&Value::String("Submitted".to_string()))
    );
    assert_eq!(
        fixture.store.get("PurchaseOrder", "PO-1").unwrap().property("status"),
        Some(&Value::String("Submitted".to_string()))
    );

    // 変更イベントはちょうど1件
    let event = feed.recv().await.unwrap();
    assert_eq!(event.entity_type, "PurchaseOrder");
    assert_eq!(event.entity_id, "PO-1");
    assert_eq!(event.property, "status");
    assert_eq!(event.old_value, Value::String("Draft".to_string()));
    assert_eq!(event.new_value, Value::String("Submitted".to_string()));
    assert_eq!(event.actor, Some(actor));
    assert_eq!(event.depth, 0);
    assert!(timeout(Duration::from_millis(50), feed.recv()).await.is_err());

    let entries = fixture.audit.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, AuditKind::Action);
    assert_eq!(entries[0].name, "PurchaseOrder.submit");
    assert!(entries[0].success);
}

#[tokio::test]
async fn test_submit_rejects_non_draft() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, orders()).await;
    let mut feed = fixture.system.subscribe_changes();

    let result = fixture
        .system
        .execute(&ExecutionRequest::new("PurchaseOrder", "submit", "PO-2"), None)
        .await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Only draft orders can be submitted")
    );
    assert!(result.changes.is_empty());
    assert_eq!(
        fixture.store.get("PurchaseOrder", "PO-2").unwrap().property("status"),
        Some(&Value::String("Submitted".to_string()))
    );
    assert!(timeout(Duration::from_millis(50), feed.recv()).await.is_err());

    let entries = fixture.audit.entries().await;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
}

#[tokio::test]
async fn test_validate_reports_every_failure() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, orders()).await;

    let report = fixture
        .system
        .validate(&ExecutionRequest::new("PurchaseOrder", "submit", "PO-3"))
        .await
        .unwrap();
    assert!(report.is_valid());

    let report = fixture
        .system
        .validate(&ExecutionRequest::new("PurchaseOrder", "submit", "PO-2"))
        .await
        .unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.errors(), vec!["Only draft orders can be submitted"]);
    assert_eq!(report.checks[0].label, "draft");
    assert_eq!(report.checks[1].label, "Check 2");

    // 検証は状態を変えない
    assert!(fixture.audit.entries().await.is_empty());
}

#[tokio::test]
async fn test_zero_total_fails_second_precondition() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, orders()).await;

    let result = fixture
        .system
        .execute(&ExecutionRequest::new("PurchaseOrder", "submit", "PO-3"), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Order total must be positive"));
}

#[tokio::test]
async fn test_noop_assignment_emits_nothing() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, orders()).await;
    let mut feed = fixture.system.subscribe_changes();

    let result = fixture
        .system
        .execute(&ExecutionRequest::new("PurchaseOrder", "touch", "PO-1"), None)
        .await;

    assert!(result.success);
    assert!(result.changes.is_empty());
    assert!(result.rule_executions.is_empty());
    assert!(timeout(Duration::from_millis(50), feed.recv()).await.is_err());
}

#[tokio::test]
async fn test_parameters_are_bound() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, orders()).await;

    let missing = fixture
        .system
        .execute(&ExecutionRequest::new("PurchaseOrder", "hold", "PO-1"), None)
        .await;
    assert!(!missing.success);
    assert_eq!(
        missing.error.as_deref(),
        Some("Missing required parameter: reason")
    );

    let result = fixture
        .system
        .execute(
            &ExecutionRequest::new("PurchaseOrder", "hold", "PO-1").with_param("reason", "late"),
            None,
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    let order = fixture.store.get("PurchaseOrder", "PO-1").unwrap();
    assert_eq!(order.property("status"), Some(&Value::String("OnHold".to_string())));
    assert_eq!(order.property("hold_reason"), Some(&Value::String("late".to_string())));
}

#[tokio::test]
async fn test_unknown_action_and_entity() {
    let fixture = setup_system("{}", PURCHASE_ORDER_DSL, orders()).await;

    let result = fixture
        .system
        .execute(&ExecutionRequest::new("PurchaseOrder", "cancel", "PO-1"), None)
        .await;
    assert_eq!(
        result.error.as_deref(),
        Some("Action PurchaseOrder.cancel not found")
    );

    let result = fixture
        .system
        .execute(&ExecutionRequest::new("PurchaseOrder", "submit", "PO-9"), None)
        .await;
    assert_eq!(
        result.error.as_deref(),
        Some("Entity PurchaseOrder PO-9 not found")
    );
}
