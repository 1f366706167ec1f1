use std::sync::Arc;

use rulekit::{
    audit::InMemoryAuditLog,
    config::{self, EngineConfig},
    store::InMemoryEntityStore,
    System,
};
use tracing::debug;

pub mod batch_test;
pub mod purchase_order_test;
pub mod rule_test;

pub const PURCHASE_ORDER_DSL: &str = r#"
    ACTION PurchaseOrder.submit {
        PRECONDITION draft: this.status == "Draft" ON_FAILURE: "Only draft orders can be submitted"
        PRECONDITION: this.total > 0 ON_FAILURE: "Order total must be positive"
        EFFECT {
            SET this.status = "Submitted";
        }
    }

    ACTION PurchaseOrder.touch {
        PRECONDITION: true ON_FAILURE: "never"
        EFFECT {
            SET this.status = this.status;
        }
    }

    ACTION PurchaseOrder.hold(reason: string) {
        PRECONDITION: this.status != "OnHold" ON_FAILURE: "Already on hold"
        EFFECT {
            SET this.status = "OnHold";
            SET this.hold_reason = reason;
        }
    }

    ACTION Supplier.suspend {
        PRECONDITION: this.status == "Active" ON_FAILURE: "Supplier is not active"
        EFFECT {
            SET this.status = "Suspended";
        }
    }
"#;

pub struct Fixture {
    pub system: System,
    pub store: Arc<InMemoryEntityStore>,
    pub audit: Arc<InMemoryAuditLog>,
}

pub async fn setup_system(config_str: &str, dsl_str: &str, data: serde_json::Value) -> Fixture {
    let config: EngineConfig = config::from_str(config_str).unwrap();
    debug!("Engine Config: {:?}", config);

    let store = InMemoryEntityStore::shared();
    store.load_json(&data).unwrap();
    let audit = Arc::new(InMemoryAuditLog::new());

    let system = System::new(config, store.clone(), audit.clone())
        .await
        .unwrap();
    let summary = system.load_dsl(dsl_str).unwrap();
    debug!("Loaded: {:?}", summary);

    Fixture {
        system,
        store,
        audit,
    }
}
