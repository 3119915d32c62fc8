//! Shared fixtures for agent tests.

use crate::context::RunContext;
use aegis_store::{AlertStore, CustomerStore, MemoryTriageStore, TransactionStore};
use aegis_types::{
    Account, Alert, AlertStatus, AnalystRole, Card, CardStatus, Customer, KycLevel, RiskLevel,
    Transaction, TriageRequest,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

/// Fixed reference instant: Wednesday 2025-06-11 14:30 UTC.
pub fn base_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 11, 14, 30, 0).unwrap()
}

pub fn suspect_txn() -> Transaction {
    Transaction::new(
        "txn-suspect",
        "cust-0001",
        "card-0001",
        "5411",
        "GROCER",
        12_000,
        base_ts(),
    )
    .with_device("device-known")
    .with_location("US", "Portland")
}

pub fn make_context() -> RunContext {
    let request = TriageRequest {
        alert_id: "alert-0001".to_string(),
        customer_id: "cust-0001".to_string(),
        suspect_txn_id: "txn-suspect".to_string(),
        role: AnalystRole::Agent,
        client_id: "analyst-7".to_string(),
    };
    let alert = Alert {
        id: "alert-0001".to_string(),
        customer_id: "cust-0001".to_string(),
        suspect_txn_id: "txn-suspect".to_string(),
        risk: RiskLevel::Medium,
        status: AlertStatus::Open,
        created_at: base_ts(),
    };
    RunContext::new("run-test", "corr-test", request, alert, suspect_txn())
}

/// Customer, card, account, suspect transaction, and the alert itself.
pub async fn seed_baseline(store: &Arc<MemoryTriageStore>) {
    store
        .upsert_customer(Customer {
            id: "cust-0001".to_string(),
            name: "Avery Stone".to_string(),
            email_masked: "av***@bank.example".to_string(),
            kyc_level: KycLevel::Verified,
            created_at: base_ts() - Duration::days(400),
        })
        .await
        .unwrap();
    store
        .insert_card(Card {
            id: "card-0001".to_string(),
            customer_id: "cust-0001".to_string(),
            last4: "4242".to_string(),
            network: "visa".to_string(),
            status: CardStatus::Active,
            created_at: base_ts() - Duration::days(400),
        })
        .await
        .unwrap();
    store
        .insert_account(Account {
            id: "acct-0001".to_string(),
            customer_id: "cust-0001".to_string(),
            balance_minor: 250_000,
            currency: "USD".to_string(),
        })
        .await
        .unwrap();
    store.insert_transaction(suspect_txn()).await.unwrap();
    store
        .insert_alert(Alert {
            id: "alert-0001".to_string(),
            customer_id: "cust-0001".to_string(),
            suspect_txn_id: "txn-suspect".to_string(),
            risk: RiskLevel::Medium,
            status: AlertStatus::Open,
            created_at: base_ts(),
        })
        .await
        .unwrap();
}

/// Daily history reaching back `days` days before the suspect timestamp.
pub async fn seed_history(store: &Arc<MemoryTriageStore>, days: i64, per_day: i64) {
    for d in 1..=days {
        for k in 0..per_day {
            let txn = Transaction::new(
                format!("hist-{d}-{k}"),
                "cust-0001",
                "card-0001",
                "5411",
                "GROCER",
                10_000 + d * 10 + k,
                base_ts() - Duration::days(d) + Duration::hours(k * 2),
            )
            .with_device("device-known")
            .with_location("US", "Portland");
            store.insert_transaction(txn).await.unwrap();
        }
    }
}
