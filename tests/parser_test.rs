use proptest::prelude::*;
use rulekit::{formatter::format_definitions, parse, parse_expression};

extern crate rulekit;

const CATALOG: &str = r#"
    // 購買ドメイン
    ACTION PurchaseOrder.approve(approver: string, note: string?) {
        PRECONDITION submitted: this.status == "Submitted" ON_FAILURE: "Order must be submitted"
        PRECONDITION: this.total <= 10000 OR approver IN ["cfo", "ceo"] ON_FAILURE: "Needs executive approval"
        PRECONDITION: NOT EXISTS(h: Hold WHERE h.order == this.id) ON_FAILURE: "Order is on hold"
        EFFECT {
            SET this.status = "Approved";
            SET this.approved_by = UPPER(approver);
            CALL erp.OrderService.approve(order: this.id, total: this.total) INTO receipt;
            SET this.receipt = receipt.number;
        }
    }

    # comment styles are interchangeable
    RULE HoldOrders PRIORITY 10 {
        ON UPDATE(Supplier.status)
        FOR (o: PurchaseOrder WHERE o.supplier == this.id AND this.status == "Suspended") {
            SET o.status = "OnHold";
            TRIGGER PurchaseOrder.notify ON o WITH { reason: "supplier suspended" };
        }
    }

    RULE Audit {
        ON UPDATE(Supplier)
        FOR (s: Supplier) {
            SET s.touched = true;
        }
    }
"#;

#[test]
fn it_formats_to_a_fixed_point() {
    let definitions = parse(CATALOG).unwrap();
    assert_eq!(definitions.len(), 3);

    let formatted = format_definitions(&definitions);
    let reparsed = parse(&formatted).unwrap();
    assert_eq!(reparsed, definitions);
    assert_eq!(format_definitions(&reparsed), formatted);
}

#[test]
fn it_reports_syntax_error_position() {
    let error = parse("ACTION PurchaseOrder.submit {\n  PRECONDITION this.status ==\n}").unwrap_err();
    assert!(error.to_string().contains("line"), "{}", error);
}

proptest! {
    #[test]
    fn it_round_trips_comparisons(
        field in "f_[a-z_]{0,8}",
        text in "[A-Za-z0-9 ]{0,12}",
        number in -10_000i64..10_000,
    ) {
        let source = format!(
            r#"this.{field} == "{text}" AND this.{field}_n > {number} OR NOT this.{field} IS NULL"#
        );
        let parsed = parse_expression(&source).unwrap();
        let printed = parsed.to_string();
        prop_assert_eq!(parse_expression(&printed).unwrap(), parsed);
    }
}
