//! Store traits, one per entity concern, plus the unit-of-work operations
//! the action executor relies on. Adapters implement every trait; the
//! blanket [`TriageStore`] bundle is what the engine and executor hold.

use crate::model::{AlertListing, CaseEventAppend, TxnCursor, TxnPage};
use crate::StoreResult;
use aegis_types::{
    Account, AgentTrace, Alert, AlertStatus, Card, Case, CaseEvent, CaseType, Customer, KbDoc,
    Policy, RiskLevel, Transaction, TriageRun,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage interface for customers and their cards/accounts.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn upsert_customer(&self, customer: Customer) -> StoreResult<()>;
    async fn get_customer(&self, id: &str) -> StoreResult<Option<Customer>>;
    async fn insert_card(&self, card: Card) -> StoreResult<()>;
    async fn get_card(&self, id: &str) -> StoreResult<Option<Card>>;
    async fn cards_for_customer(&self, customer_id: &str) -> StoreResult<Vec<Card>>;
    async fn insert_account(&self, account: Account) -> StoreResult<()>;
    async fn accounts_for_customer(&self, customer_id: &str) -> StoreResult<Vec<Account>>;
}

/// Storage interface for immutable transactions.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a transaction. Returns `false` when the
    /// `(customer_id, merchant, amount_minor, ts)` dedup key already
    /// exists and the row was skipped.
    async fn insert_transaction(&self, txn: Transaction) -> StoreResult<bool>;

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>>;

    /// Transactions for a customer since `since`, newest first, capped.
    async fn transactions_since(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<Transaction>>;

    /// Keyset-paginated scan over `(ts DESC, id DESC)`.
    async fn transactions_page(
        &self,
        customer_id: &str,
        cursor: Option<TxnCursor>,
        limit: usize,
    ) -> StoreResult<TxnPage>;
}

/// Storage interface for alerts.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: Alert) -> StoreResult<()>;
    async fn get_alert(&self, id: &str) -> StoreResult<Option<Alert>>;
    async fn set_alert_status(&self, id: &str, status: AlertStatus) -> StoreResult<()>;
    async fn alert_count_for_customer(&self, customer_id: &str) -> StoreResult<u64>;

    /// Alerts newest-first with embedded customer and suspect summaries.
    async fn list_alerts(&self, limit: usize) -> StoreResult<Vec<AlertListing>>;
}

/// Storage interface for triage runs and their traces.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: TriageRun) -> StoreResult<()>;
    async fn get_run(&self, id: &str) -> StoreResult<Option<TriageRun>>;

    /// The at-most-one run for this alert with `ended_at = NULL`.
    async fn find_active_run(&self, alert_id: &str) -> StoreResult<Option<TriageRun>>;

    /// Set the terminal fields exactly once. Finishing an already-finished
    /// run is an invariant violation.
    async fn finish_run(
        &self,
        run_id: &str,
        risk: Option<RiskLevel>,
        reasons: &[String],
        fallback_used: bool,
        latency_ms: i64,
        ended_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Append one trace row. `seq` must extend the contiguous prefix.
    async fn append_trace(&self, trace: AgentTrace) -> StoreResult<()>;

    /// Traces for a run in ascending `seq` order.
    async fn traces_for_run(&self, run_id: &str) -> StoreResult<Vec<AgentTrace>>;

    /// Runs newest-first.
    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<TriageRun>>;
}

/// Storage interface for cases and their append-only events.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn get_case(&self, id: &str) -> StoreResult<Option<Case>>;

    /// The non-terminal case of the given type attached to a transaction,
    /// if one exists.
    async fn find_open_case(
        &self,
        txn_id: &str,
        case_type: CaseType,
    ) -> StoreResult<Option<Case>>;

    async fn append_case_event(&self, append: CaseEventAppend) -> StoreResult<CaseEvent>;
    async fn events_for_case(&self, case_id: &str) -> StoreResult<Vec<CaseEvent>>;
    async fn list_cases(&self, limit: usize) -> StoreResult<Vec<Case>>;
}

/// Storage interface for the knowledge base, read-only to the engine.
#[async_trait]
pub trait KbStore: Send + Sync {
    async fn insert_doc(&self, doc: KbDoc) -> StoreResult<()>;
    async fn get_doc(&self, id: &str) -> StoreResult<Option<KbDoc>>;
    async fn all_docs(&self) -> StoreResult<Vec<KbDoc>>;
}

/// Storage interface for compliance policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn insert_policy(&self, policy: Policy) -> StoreResult<()>;
    async fn policies_by_priority(&self) -> StoreResult<Vec<Policy>>;
}

/// Unit-of-work writes for the analyst actions. Every method commits all
/// of its writes in one transaction or none of them.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Freeze a card: card to FROZEN, CARD_FREEZE case with its first
    /// event, originating alert to RESOLVED.
    async fn apply_card_freeze(
        &self,
        card_id: &str,
        case: Case,
        event: CaseEventAppend,
        alert_id: Option<&str>,
    ) -> StoreResult<Card>;

    /// Open a dispute: DISPUTE case with its first event, originating
    /// alert to INVESTIGATING_DISPUTE_OPENED.
    async fn apply_dispute(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: Option<&str>,
    ) -> StoreResult<Case>;

    /// Record a customer contact: CONTACT_CUSTOMER case with its first
    /// event, alert to CONTACTED.
    async fn apply_contact(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: &str,
    ) -> StoreResult<Case>;

    /// Close as false positive: FALSE_POSITIVE case with its first event,
    /// alert to CLOSED_FALSE_POSITIVE.
    async fn apply_false_positive(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: &str,
    ) -> StoreResult<Case>;
}

/// Unified store bundle held by the engine, executor, and evals.
pub trait TriageStore:
    CustomerStore
    + TransactionStore
    + AlertStore
    + RunStore
    + CaseStore
    + KbStore
    + PolicyStore
    + ActionStore
    + Send
    + Sync
{
}

impl<T> TriageStore for T where
    T: CustomerStore
        + TransactionStore
        + AlertStore
        + RunStore
        + CaseStore
        + KbStore
        + PolicyStore
        + ActionStore
        + Send
        + Sync
{
}
