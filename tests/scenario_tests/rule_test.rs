use rulekit::{audit::AuditKind, ExecutionRequest, Value};
use serde_json::json;

use super::{setup_system, PURCHASE_ORDER_DSL};

const HOLD_RULE: &str = r#"
    RULE HoldSupplierOrders PRIORITY 5 {
        ON UPDATE(Supplier.status)
        FOR (o: PurchaseOrder WHERE o.supplier == this.id AND event_new == "Suspended") {
            SET o.status = "OnHold";
            SET o.hold_reason = CONCAT("supplier ", this.id, " suspended");
        }
    }
"#;

const TRIGGER_RULE: &str = r#"
    RULE HoldThroughAction {
        ON UPDATE(Supplier.status)
        FOR (o: PurchaseOrder WHERE o.supplier == this.id) {
            TRIGGER PurchaseOrder.hold ON o WITH { reason: CONCAT("supplier ", event_new) };
        }
    }
"#;

fn suppliers_and_orders() -> serde_json::Value {
    json!({
        "Supplier": [
            { "id": "s-1", "status": "Active" },
            { "id": "s-2", "status": "Active" }
        ],
        "PurchaseOrder": [
            { "id": "PO-1", "status": "Draft", "total": 100, "supplier": "s-1" },
            { "id": "PO-2", "status": "Submitted", "total": 200, "supplier": "s-1" },
            { "id": "PO-3", "status": "Draft", "total": 300, "supplier": "s-2" },
            { "id": "PO-4", "status": "OnHold", "total": 400, "supplier": "s-1" }
        ]
    })
}

fn status_of(fixture: &super::Fixture, id: &str) -> Value {
    fixture
        .store
        .get("PurchaseOrder", id)
        .and_then(|order| order.property("status").cloned())
        .unwrap_or_default()
}

fn suspend(id: &str) -> ExecutionRequest {
    ExecutionRequest::new("Supplier", "suspend", id)
}

#[tokio::test]
async fn test_rule_runs_once_per_qualifying_entity() {
    let dsl = format!("{}\n{}", PURCHASE_ORDER_DSL, HOLD_RULE);
    let fixture = setup_system("{}", &dsl, suppliers_and_orders()).await;

    let result = fixture.system.execute(&suspend("s-1"), None).await;
    assert!(result.success, "{:?}", result.error);

    // PO-4 は既に OnHold なので status は変わらず hold_reason だけ
    let mut touched: Vec<(String, usize)> = result
        .rule_executions
        .iter()
        .map(|r| (r.entity_id.clone(), r.changes.len()))
        .collect();
    touched.sort();
    assert_eq!(
        touched,
        vec![
            ("PO-1".to_string(), 2),
            ("PO-2".to_string(), 2),
            ("PO-4".to_string(), 1)
        ]
    );
    assert!(result.rule_executions.iter().all(|r| r.depth == 1));
    assert!(result
        .rule_executions
        .iter()
        .all(|r| r.rule == "HoldSupplierOrders"));

    assert_eq!(status_of(&fixture, "PO-1"), Value::String("OnHold".to_string()));
    assert_eq!(status_of(&fixture, "PO-2"), Value::String("OnHold".to_string()));
    assert_eq!(status_of(&fixture, "PO-3"), Value::String("Draft".to_string()));
    assert_eq!(
        fixture
            .store
            .get("PurchaseOrder", "PO-1")
            .unwrap()
            .property("hold_reason"),
        Some(&Value::String("supplier s-1 suspended".to_string()))
    );

    let rule_audits = fixture
        .audit
        .entries()
        .await
        .into_iter()
        .filter(|e| e.kind == AuditKind::Rule)
        .count();
    assert_eq!(rule_audits, 3);
}

#[tokio::test]
async fn test_rule_events_reach_change_feed() {
    let dsl = format!("{}\n{}", PURCHASE_ORDER_DSL, HOLD_RULE);
    let fixture = setup_system("{}", &dsl, suppliers_and_orders()).await;
    let mut feed = fixture.system.subscribe_changes();

    fixture.system.execute(&suspend("s-2"), None).await;

    let first = feed.recv().await.unwrap();
    assert_eq!((first.entity_type.as_str(), first.depth), ("Supplier", 0));
    let second = feed.recv().await.unwrap();
    assert_eq!(second.entity_id, "PO-3");
    assert_eq!(second.property, "status");
    assert_eq!(second.depth, 1);
}

#[tokio::test]
async fn test_rules_disabled() {
    let dsl = format!("{}\n{}", PURCHASE_ORDER_DSL, HOLD_RULE);
    let fixture = setup_system(
        r#"{ "rules": { "enabled": false } }"#,
        &dsl,
        suppliers_and_orders(),
    )
    .await;

    let result = fixture.system.execute(&suspend("s-1"), None).await;
    assert!(result.success);
    assert!(result.rule_executions.is_empty());
    assert_eq!(status_of(&fixture, "PO-1"), Value::String("Draft".to_string()));
}

#[tokio::test]
async fn test_trigger_runs_action_and_records_failures() {
    let dsl = format!("{}\n{}", PURCHASE_ORDER_DSL, TRIGGER_RULE);
    let fixture = setup_system("{}", &dsl, suppliers_and_orders()).await;

    let result = fixture.system.execute(&suspend("s-1"), None).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.rule_executions.len(), 3);

    let mut triggered: Vec<_> = result
        .rule_executions
        .iter()
        .flat_map(|r| r.triggered.clone())
        .collect();
    triggered.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    assert_eq!(triggered.len(), 3);
    assert!(triggered.iter().all(|t| t.action == "PurchaseOrder.hold"));
    assert!(triggered[0].success);
    assert!(triggered[1].success);
    assert!(!triggered[2].success);
    assert_eq!(triggered[2].error.as_deref(), Some("Already on hold"));

    let order = fixture.store.get("PurchaseOrder", "PO-2").unwrap();
    assert_eq!(order.property("status"), Some(&Value::String("OnHold".to_string())));
    assert_eq!(
        order.property("hold_reason"),
        Some(&Value::String("supplier Suspended".to_string()))
    );
}

#[tokio::test]
async fn test_cascade_stops_at_configured_depth() {
    let dsl = r#"
        ACTION Counter.bump {
            PRECONDITION: this.value IS NOT NULL ON_FAILURE: "no value"
            EFFECT { SET this.value = CONCAT(this.value, "+"); }
        }

        RULE Echo {
            ON UPDATE(Counter.value)
            FOR (c: Counter WHERE c.id == this.id) {
                SET c.value = CONCAT(c.value, "+");
            }
        }
    "#;
    let fixture = setup_system(
        r#"{ "rules": { "max_cascade_depth": 3 } }"#,
        dsl,
        json!({ "Counter": [{ "id": "c-1", "value": "0" }] }),
    )
    .await;

    let result = fixture
        .system
        .execute(&ExecutionRequest::new("Counter", "bump", "c-1"), None)
        .await;

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("rule recursion limit"));
    // 上限までの変更は残る
    assert_eq!(
        fixture.store.get("Counter", "c-1").unwrap().property("value"),
        Some(&Value::String("0++++".to_string()))
    );
}
