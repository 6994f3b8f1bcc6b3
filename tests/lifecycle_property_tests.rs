//! Property-based tests for the status table, amount validation and the
//! append-only exchange log.

use std::collections::BTreeSet;

use ad_work_orders::model::RawExchangeLog;
use ad_work_orders::operation::{BusinessPayload, FundsData};
use ad_work_orders::status::{ExternalStatus, Transition, WorkOrderStatus, map_external_status};
use ad_work_orders::types::Platform;
use proptest::prelude::*;
use serde_json::json;

fn status_strategy() -> impl Strategy<Value = WorkOrderStatus> {
    prop::sample::select(WorkOrderStatus::ALL.to_vec())
}

fn transition_strategy() -> impl Strategy<Value = Transition> {
    prop::sample::select(Transition::ALL.to_vec())
}

fn platform_strategy() -> impl Strategy<Value = Platform> {
    prop::sample::select(Platform::ALL.to_vec())
}

fn deposit(amount: String) -> BusinessPayload {
    BusinessPayload::Deposit(FundsData {
        amount,
        currency: "USD".into(),
    })
}

proptest! {
    #[test]
    fn external_lookup_ignores_case_and_padding(code in "[A-Za-z0-9_]{1,12}") {
        let upper = map_external_status(&code.to_ascii_uppercase());
        prop_assert_eq!(map_external_status(&code.to_ascii_lowercase()), upper);
        prop_assert_eq!(map_external_status(&format!("  {code} ")), upper);
    }

    #[test]
    fn numeric_codes_outside_the_table_are_unknown(code in any::<i64>()) {
        prop_assume!(![10, 20, 30, 40].contains(&code));
        let mapped = map_external_status(&code.to_string());
        prop_assert_eq!(mapped, ExternalStatus::Unknown);
        prop_assert_eq!(mapped.status(), WorkOrderStatus::Pending);
    }

    #[test]
    fn terminal_statuses_only_allow_resubmission(
        status in status_strategy(),
        transition in transition_strategy(),
    ) {
        if status.is_terminal() && status.permits(transition) {
            prop_assert_eq!(transition, Transition::Resubmit);
            prop_assert_eq!(status, WorkOrderStatus::Failed);
        }
        if matches!(transition, Transition::Approve | Transition::Reject) {
            prop_assert_eq!(status.permits(transition), status == WorkOrderStatus::Pending);
        }
    }

    #[test]
    fn positive_cent_amounts_validate(cents in 1u64..10_000_000_000, platform in platform_strategy()) {
        let raw = format!("{}.{:02}", cents / 100, cents % 100);
        let validated = deposit(raw.clone()).validate(platform, Some("acc-1"));
        prop_assert!(validated.is_ok(), "{} rejected", raw);
        let Ok(BusinessPayload::Deposit(funds)) = validated else {
            return Err(TestCaseError::fail("variant changed"));
        };
        let normalized: rust_decimal::Decimal = funds.amount.parse().unwrap();
        let original: rust_decimal::Decimal = raw.parse().unwrap();
        prop_assert_eq!(normalized, original);
    }

    #[test]
    fn sub_cent_amounts_are_rejected(whole in 0u64..1_000_000, mills in 1u64..10) {
        let raw = format!("{whole}.00{mills}");
        let err = deposit(raw).validate(Platform::Google, Some("acc-1")).unwrap_err();
        prop_assert!(err.field_errors().unwrap().contains_key("amount"));
    }

    #[test]
    fn exchange_log_only_grows(keys in prop::collection::btree_set("[a-z]{1,8}", 1..12)) {
        let mut log = RawExchangeLog::new("wo_1", &json!({"operation": "deposit"}), None, false);
        for (n, key) in keys.iter().enumerate() {
            if n % 2 == 0 {
                log.record_request(key, &json!({"n": n}));
            } else {
                log.record_exchange(Some((key, &json!({"n": n}))), Some((key, &json!({"ok": true}))), true);
            }
        }

        let request = log.request_json();
        let present: BTreeSet<String> = request.as_object().unwrap().keys().cloned().collect();
        prop_assert!(present.contains("operation"));
        for key in &keys {
            prop_assert!(present.contains(key), "lost key {}", key);
        }
        prop_assert_eq!(log.sync_attempts as usize, keys.len() / 2);
    }
}
