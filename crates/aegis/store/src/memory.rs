//! In-memory reference implementation of the store traits.
//!
//! Deterministic and test-friendly. Production deployments use the
//! PostgreSQL adapter as the transactional source of truth; this twin
//! mirrors its semantics, including the unit-of-work action writes, which
//! mutate under every relevant lock at once.

use crate::model::{AlertListing, CaseEventAppend, TxnCursor, TxnPage, TxnSummary};
use crate::traits::{
    ActionStore, AlertStore, CaseStore, CustomerStore, KbStore, PolicyStore, RunStore,
    TransactionStore,
};
use crate::{StoreError, StoreResult};
use aegis_types::{
    Account, AgentTrace, Alert, AlertStatus, Card, CardStatus, Case, CaseEvent, CaseType,
    Customer, KbDoc, Policy, RiskLevel, Transaction, TriageRun,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

fn poisoned(what: &str) -> StoreError {
    StoreError::Backend(format!("{what} lock poisoned"))
}

/// In-memory triage store.
#[derive(Default)]
pub struct MemoryTriageStore {
    customers: RwLock<HashMap<String, Customer>>,
    cards: RwLock<HashMap<String, Card>>,
    accounts: RwLock<HashMap<String, Account>>,
    transactions: RwLock<HashMap<String, Transaction>>,
    alerts: RwLock<HashMap<String, Alert>>,
    runs: RwLock<HashMap<String, TriageRun>>,
    traces: RwLock<HashMap<String, Vec<AgentTrace>>>,
    cases: RwLock<HashMap<String, Case>>,
    case_events: RwLock<HashMap<String, Vec<CaseEvent>>>,
    kb_docs: RwLock<HashMap<String, KbDoc>>,
    policies: RwLock<HashMap<String, Policy>>,
}

impl MemoryTriageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CustomerStore for MemoryTriageStore {
    async fn upsert_customer(&self, customer: Customer) -> StoreResult<()> {
        let mut guard = self.customers.write().map_err(|_| poisoned("customers"))?;
        guard.insert(customer.id.clone(), customer);
        Ok(())
    }

    async fn get_customer(&self, id: &str) -> StoreResult<Option<Customer>> {
        let guard = self.customers.read().map_err(|_| poisoned("customers"))?;
        Ok(guard.get(id).cloned())
    }

    async fn insert_card(&self, card: Card) -> StoreResult<()> {
        let mut guard = self.cards.write().map_err(|_| poisoned("cards"))?;
        if guard.contains_key(&card.id) {
            return Err(StoreError::Conflict(format!("card {} already exists", card.id)));
        }
        guard.insert(card.id.clone(), card);
        Ok(())
    }

    async fn get_card(&self, id: &str) -> StoreResult<Option<Card>> {
        let guard = self.cards.read().map_err(|_| poisoned("cards"))?;
        Ok(guard.get(id).cloned())
    }

    async fn cards_for_customer(&self, customer_id: &str) -> StoreResult<Vec<Card>> {
        let guard = self.cards.read().map_err(|_| poisoned("cards"))?;
        let mut cards: Vec<Card> = guard
            .values()
            .filter(|c| c.customer_id == customer_id)
            .cloned()
            .collect();
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(cards)
    }

    async fn insert_account(&self, account: Account) -> StoreResult<()> {
        let mut guard = self.accounts.write().map_err(|_| poisoned("accounts"))?;
        guard.insert(account.id.clone(), account);
        Ok(())
    }

    async fn accounts_for_customer(&self, customer_id: &str) -> StoreResult<Vec<Account>> {
        let guard = self.accounts.read().map_err(|_| poisoned("accounts"))?;
        let mut accounts: Vec<Account> = guard
            .values()
            .filter(|a| a.customer_id == customer_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }
}

#[async_trait]
impl TransactionStore for MemoryTriageStore {
    async fn insert_transaction(&self, txn: Transaction) -> StoreResult<bool> {
        let mut guard = self
            .transactions
            .write()
            .map_err(|_| poisoned("transactions"))?;
        if guard.contains_key(&txn.id) {
            return Err(StoreError::Conflict(format!(
                "transaction {} already exists",
                txn.id
            )));
        }
        let duplicate = guard.values().any(|t| {
            t.customer_id == txn.customer_id
                && t.merchant == txn.merchant
                && t.amount_minor == txn.amount_minor
                && t.ts == txn.ts
        });
        if duplicate {
            return Ok(false);
        }
        guard.insert(txn.id.clone(), txn);
        Ok(true)
    }

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let guard = self
            .transactions
            .read()
            .map_err(|_| poisoned("transactions"))?;
        Ok(guard.get(id).cloned())
    }

    async fn transactions_since(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<Transaction>> {
        let guard = self
            .transactions
            .read()
            .map_err(|_| poisoned("transactions"))?;
        let mut txns: Vec<Transaction> = guard
            .values()
            .filter(|t| t.customer_id == customer_id && t.ts >= since)
            .cloned()
            .collect();
        txns.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| b.id.cmp(&a.id)));
        txns.truncate(cap);
        Ok(txns)
    }

    async fn transactions_page(
        &self,
        customer_id: &str,
        cursor: Option<TxnCursor>,
        limit: usize,
    ) -> StoreResult<TxnPage> {
        if limit == 0 {
            return Err(StoreError::InvalidInput("page limit must be positive".to_string()));
        }
        let guard = self
            .transactions
            .read()
            .map_err(|_| poisoned("transactions"))?;
        let mut txns: Vec<Transaction> = guard
            .values()
            .filter(|t| t.customer_id == customer_id)
            .filter(|t| match &cursor {
                // Strictly after the cursor in (ts DESC, id DESC) order.
                Some(c) => t.ts < c.last_ts || (t.ts == c.last_ts && t.id < c.last_id),
                None => true,
            })
            .cloned()
            .collect();
        txns.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| b.id.cmp(&a.id)));
        txns.truncate(limit);

        let next_cursor = if txns.len() == limit {
            txns.last().map(|t| {
                TxnCursor {
                    last_id: t.id.clone(),
                    last_ts: t.ts,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(TxnPage {
            transactions: txns,
            next_cursor,
        })
    }
}

#[async_trait]
impl AlertStore for MemoryTriageStore {
    async fn insert_alert(&self, alert: Alert) -> StoreResult<()> {
        let mut guard = self.alerts.write().map_err(|_| poisoned("alerts"))?;
        if guard.contains_key(&alert.id) {
            return Err(StoreError::Conflict(format!("alert {} already exists", alert.id)));
        }
        guard.insert(alert.id.clone(), alert);
        Ok(())
    }

    async fn get_alert(&self, id: &str) -> StoreResult<Option<Alert>> {
        let guard = self.alerts.read().map_err(|_| poisoned("alerts"))?;
        Ok(guard.get(id).cloned())
    }

    async fn set_alert_status(&self, id: &str, status: AlertStatus) -> StoreResult<()> {
        let mut guard = self.alerts.write().map_err(|_| poisoned("alerts"))?;
        let alert = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {id} not found")))?;
        alert.status = status;
        Ok(())
    }

    async fn alert_count_for_customer(&self, customer_id: &str) -> StoreResult<u64> {
        let guard = self.alerts.read().map_err(|_| poisoned("alerts"))?;
        Ok(guard.values().filter(|a| a.customer_id == customer_id).count() as u64)
    }

    async fn list_alerts(&self, limit: usize) -> StoreResult<Vec<AlertListing>> {
        let alerts = self.alerts.read().map_err(|_| poisoned("alerts"))?;
        let customers = self.customers.read().map_err(|_| poisoned("customers"))?;
        let transactions = self
            .transactions
            .read()
            .map_err(|_| poisoned("transactions"))?;

        let mut sorted: Vec<&Alert> = alerts.values().collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let listings = sorted
            .into_iter()
            .filter_map(|alert| {
                let customer = customers.get(&alert.customer_id)?;
                let suspect = transactions.get(&alert.suspect_txn_id).map(|t| TxnSummary {
                    txn_id: t.id.clone(),
                    merchant: t.merchant.clone(),
                    amount_minor: t.amount_minor,
                    currency: t.currency.clone(),
                });
                Some(AlertListing {
                    alert: alert.clone(),
                    customer_name: customer.name.clone(),
                    customer_email_masked: customer.email_masked.clone(),
                    suspect,
                })
            })
            .take(limit)
            .collect();
        Ok(listings)
    }
}

#[async_trait]
impl RunStore for MemoryTriageStore {
    async fn insert_run(&self, run: TriageRun) -> StoreResult<()> {
        let mut guard = self.runs.write().map_err(|_| poisoned("runs"))?;
        if guard.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        if let Some(active) = guard
            .values()
            .find(|r| r.alert_id == run.alert_id && r.is_active())
        {
            return Err(StoreError::Conflict(format!(
                "alert {} already has active run {}",
                run.alert_id, active.id
            )));
        }
        guard.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<TriageRun>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        Ok(guard.get(id).cloned())
    }

    async fn find_active_run(&self, alert_id: &str) -> StoreResult<Option<TriageRun>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        Ok(guard
            .values()
            .find(|r| r.alert_id == alert_id && r.is_active())
            .cloned())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        risk: Option<RiskLevel>,
        reasons: &[String],
        fallback_used: bool,
        latency_ms: i64,
        ended_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut guard = self.runs.write().map_err(|_| poisoned("runs"))?;
        let run = guard
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id} not found")))?;
        if run.ended_at.is_some() {
            return Err(StoreError::InvariantViolation(format!(
                "run {run_id} already finished"
            )));
        }
        if ended_at < run.started_at {
            return Err(StoreError::InvariantViolation(format!(
                "run {run_id} would end before it started"
            )));
        }
        run.ended_at = Some(ended_at);
        run.risk = risk;
        run.reasons = reasons.to_vec();
        run.fallback_used = fallback_used;
        run.latency_ms = Some(latency_ms);
        Ok(())
    }

    async fn append_trace(&self, trace: AgentTrace) -> StoreResult<()> {
        {
            let runs = self.runs.read().map_err(|_| poisoned("runs"))?;
            if !runs.contains_key(&trace.run_id) {
                return Err(StoreError::NotFound(format!(
                    "run {} not found",
                    trace.run_id
                )));
            }
        }
        let mut guard = self.traces.write().map_err(|_| poisoned("traces"))?;
        let entries = guard.entry(trace.run_id.clone()).or_default();
        let expected = entries.len() as i64;
        if trace.seq != expected {
            return Err(StoreError::InvariantViolation(format!(
                "trace seq {} breaks contiguous prefix (expected {expected})",
                trace.seq
            )));
        }
        entries.push(trace);
        Ok(())
    }

    async fn traces_for_run(&self, run_id: &str) -> StoreResult<Vec<AgentTrace>> {
        let guard = self.traces.read().map_err(|_| poisoned("traces"))?;
        Ok(guard.get(run_id).cloned().unwrap_or_default())
    }

    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<TriageRun>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        let mut runs: Vec<TriageRun> = guard.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[async_trait]
impl CaseStore for MemoryTriageStore {
    async fn get_case(&self, id: &str) -> StoreResult<Option<Case>> {
        let guard = self.cases.read().map_err(|_| poisoned("cases"))?;
        Ok(guard.get(id).cloned())
    }

    async fn find_open_case(
        &self,
        txn_id: &str,
        case_type: CaseType,
    ) -> StoreResult<Option<Case>> {
        let guard = self.cases.read().map_err(|_| poisoned("cases"))?;
        Ok(guard
            .values()
            .find(|c| {
                c.txn_id.as_deref() == Some(txn_id)
                    && c.case_type == case_type
                    && !c.status.is_terminal()
            })
            .cloned())
    }

    async fn append_case_event(&self, append: CaseEventAppend) -> StoreResult<CaseEvent> {
        {
            let cases = self.cases.read().map_err(|_| poisoned("cases"))?;
            if !cases.contains_key(&append.case_id) {
                return Err(StoreError::NotFound(format!(
                    "case {} not found",
                    append.case_id
                )));
            }
        }
        let mut guard = self.case_events.write().map_err(|_| poisoned("case events"))?;
        let entries = guard.entry(append.case_id.clone()).or_default();
        let event = CaseEvent {
            case_id: append.case_id,
            seq: entries.len() as i64,
            actor: append.actor,
            action: append.action,
            ts: Utc::now(),
            payload: append.payload,
        };
        entries.push(event.clone());
        Ok(event)
    }

    async fn events_for_case(&self, case_id: &str) -> StoreResult<Vec<CaseEvent>> {
        let guard = self.case_events.read().map_err(|_| poisoned("case events"))?;
        Ok(guard.get(case_id).cloned().unwrap_or_default())
    }

    async fn list_cases(&self, limit: usize) -> StoreResult<Vec<Case>> {
        let guard = self.cases.read().map_err(|_| poisoned("cases"))?;
        let mut cases: Vec<Case> = guard.values().cloned().collect();
        cases.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        cases.truncate(limit);
        Ok(cases)
    }
}

#[async_trait]
impl KbStore for MemoryTriageStore {
    async fn insert_doc(&self, doc: KbDoc) -> StoreResult<()> {
        let mut guard = self.kb_docs.write().map_err(|_| poisoned("kb docs"))?;
        guard.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn get_doc(&self, id: &str) -> StoreResult<Option<KbDoc>> {
        let guard = self.kb_docs.read().map_err(|_| poisoned("kb docs"))?;
        Ok(guard.get(id).cloned())
    }

    async fn all_docs(&self) -> StoreResult<Vec<KbDoc>> {
        let guard = self.kb_docs.read().map_err(|_| poisoned("kb docs"))?;
        let mut docs: Vec<KbDoc> = guard.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}

#[async_trait]
impl PolicyStore for MemoryTriageStore {
    async fn insert_policy(&self, policy: Policy) -> StoreResult<()> {
        let mut guard = self.policies.write().map_err(|_| poisoned("policies"))?;
        guard.insert(policy.id.clone(), policy);
        Ok(())
    }

    async fn policies_by_priority(&self) -> StoreResult<Vec<Policy>> {
        let guard = self.policies.read().map_err(|_| poisoned("policies"))?;
        let mut policies: Vec<Policy> = guard.values().cloned().collect();
        policies.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(policies)
    }
}

#[async_trait]
impl ActionStore for MemoryTriageStore {
    async fn apply_card_freeze(
        &self,
        card_id: &str,
        case: Case,
        event: CaseEventAppend,
        alert_id: Option<&str>,
    ) -> StoreResult<Card> {
        // Lock order: cards, cases, case events, alerts. Holding all four
        // for the duration makes the multi-write atomic.
        let mut cards = self.cards.write().map_err(|_| poisoned("cards"))?;
        let mut cases = self.cases.write().map_err(|_| poisoned("cases"))?;
        let mut events = self.case_events.write().map_err(|_| poisoned("case events"))?;
        let mut alerts = self.alerts.write().map_err(|_| poisoned("alerts"))?;

        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| StoreError::NotFound(format!("card {card_id} not found")))?;
        if let Some(alert_id) = alert_id {
            if !alerts.contains_key(alert_id) {
                return Err(StoreError::NotFound(format!("alert {alert_id} not found")));
            }
        }
        if cases.contains_key(&case.id) {
            return Err(StoreError::Conflict(format!("case {} already exists", case.id)));
        }

        card.status = CardStatus::Frozen;
        insert_case_with_first_event(&mut cases, &mut events, case, event);
        if let Some(alert_id) = alert_id {
            if let Some(alert) = alerts.get_mut(alert_id) {
                alert.status = AlertStatus::Resolved;
            }
        }
        Ok(card.clone())
    }

    async fn apply_dispute(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: Option<&str>,
    ) -> StoreResult<Case> {
        let mut cases = self.cases.write().map_err(|_| poisoned("cases"))?;
        let mut events = self.case_events.write().map_err(|_| poisoned("case events"))?;
        let mut alerts = self.alerts.write().map_err(|_| poisoned("alerts"))?;

        if cases.contains_key(&case.id) {
            return Err(StoreError::Conflict(format!("case {} already exists", case.id)));
        }
        if let Some(alert_id) = alert_id {
            if !alerts.contains_key(alert_id) {
                return Err(StoreError::NotFound(format!("alert {alert_id} not found")));
            }
        }

        let stored = insert_case_with_first_event(&mut cases, &mut events, case, event);
        if let Some(alert_id) = alert_id {
            if let Some(alert) = alerts.get_mut(alert_id) {
                alert.status = AlertStatus::InvestigatingDisputeOpened;
            }
        }
        Ok(stored)
    }

    async fn apply_contact(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: &str,
    ) -> StoreResult<Case> {
        self.apply_closing_action(case, event, alert_id, AlertStatus::Contacted)
            .await
    }

    async fn apply_false_positive(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: &str,
    ) -> StoreResult<Case> {
        self.apply_closing_action(case, event, alert_id, AlertStatus::ClosedFalsePositive)
            .await
    }
}

impl MemoryTriageStore {
    async fn apply_closing_action(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: &str,
        alert_status: AlertStatus,
    ) -> StoreResult<Case> {
        let mut cases = self.cases.write().map_err(|_| poisoned("cases"))?;
        let mut events = self.case_events.write().map_err(|_| poisoned("case events"))?;
        let mut alerts = self.alerts.write().map_err(|_| poisoned("alerts"))?;

        let alert = alerts
            .get_mut(alert_id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {alert_id} not found")))?;
        if cases.contains_key(&case.id) {
            return Err(StoreError::Conflict(format!("case {} already exists", case.id)));
        }

        let stored = insert_case_with_first_event(&mut cases, &mut events, case, event);
        alert.status = alert_status;
        Ok(stored)
    }
}

fn insert_case_with_first_event(
    cases: &mut HashMap<String, Case>,
    events: &mut HashMap<String, Vec<CaseEvent>>,
    case: Case,
    event: CaseEventAppend,
) -> Case {
    let stored = case.clone();
    cases.insert(case.id.clone(), case);
    events.entry(stored.id.clone()).or_default().push(CaseEvent {
        case_id: event.case_id,
        seq: 0,
        actor: event.actor,
        action: event.action,
        ts: Utc::now(),
        payload: event.payload,
    });
    stored
}
