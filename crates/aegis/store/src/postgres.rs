//! PostgreSQL adapter for the triage store.
//!
//! The transactional source-of-truth backend. Schema creation is
//! idempotent; the active-run invariant is enforced by a partial unique
//! index, and every analyst action commits its writes in one transaction.

use crate::model::{AlertListing, CaseEventAppend, TxnCursor, TxnPage, TxnSummary};
use crate::traits::{
    ActionStore, AlertStore, CaseStore, CustomerStore, KbStore, PolicyStore, RunStore,
    TransactionStore,
};
use crate::{StoreError, StoreResult};
use aegis_types::{
    Account, AgentTrace, Alert, AlertStatus, Card, CardStatus, Case, CaseEvent, CaseStatus,
    CaseType, Customer, KbDoc, KycLevel, Policy, RiskLevel, StepDetail, StepName, Transaction,
    TriageRun,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

/// PostgreSQL-backed triage store.
#[derive(Clone)]
pub struct PostgresTriageStore {
    pool: PgPool,
}

impl PostgresTriageStore {
    /// Connect to PostgreSQL and initialize the schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS aegis_customers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email_masked TEXT NOT NULL,
                kyc_level TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aegis_cards (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                last4 TEXT NOT NULL,
                network TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS aegis_cards_customer ON aegis_cards (customer_id)",
            r#"
            CREATE TABLE IF NOT EXISTS aegis_accounts (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                balance_minor BIGINT NOT NULL,
                currency TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS aegis_accounts_customer ON aegis_accounts (customer_id)",
            r#"
            CREATE TABLE IF NOT EXISTS aegis_transactions (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                card_id TEXT NOT NULL,
                mcc TEXT NOT NULL,
                merchant TEXT NOT NULL,
                amount_minor BIGINT NOT NULL,
                currency TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                device_id TEXT,
                country TEXT,
                city TEXT
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS aegis_transactions_dedup
                ON aegis_transactions (customer_id, merchant, amount_minor, ts)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS aegis_transactions_keyset
                ON aegis_transactions (customer_id, ts DESC, id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aegis_alerts (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                suspect_txn_id TEXT NOT NULL,
                risk TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS aegis_alerts_customer ON aegis_alerts (customer_id)",
            r#"
            CREATE TABLE IF NOT EXISTS aegis_triage_runs (
                id TEXT PRIMARY KEY,
                alert_id TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ,
                risk TEXT,
                reasons JSONB NOT NULL,
                fallback_used BOOLEAN NOT NULL,
                latency_ms BIGINT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS aegis_triage_runs_alert ON aegis_triage_runs (alert_id)",
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS aegis_triage_runs_active
                ON aegis_triage_runs (alert_id) WHERE ended_at IS NULL
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aegis_agent_traces (
                run_id TEXT NOT NULL,
                seq BIGINT NOT NULL,
                step TEXT NOT NULL,
                ok BOOLEAN NOT NULL,
                duration_ms BIGINT NOT NULL,
                detail JSONB NOT NULL,
                PRIMARY KEY (run_id, seq)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aegis_cases (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                txn_id TEXT,
                case_type TEXT NOT NULL,
                status TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS aegis_cases_txn ON aegis_cases (txn_id)",
            r#"
            CREATE TABLE IF NOT EXISTS aegis_case_events (
                case_id TEXT NOT NULL,
                seq BIGINT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (case_id, seq)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aegis_kb_docs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                anchor TEXT NOT NULL,
                content_text TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aegis_policies (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                title TEXT NOT NULL,
                content_text TEXT NOT NULL,
                priority INTEGER NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CustomerStore for PostgresTriageStore {
    async fn upsert_customer(&self, customer: Customer) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aegis_customers (id, name, email_masked, kyc_level, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                email_masked = EXCLUDED.email_masked,
                kyc_level = EXCLUDED.kyc_level
            "#,
        )
        .bind(customer.id)
        .bind(customer.name)
        .bind(customer.email_masked)
        .bind(customer.kyc_level.as_str())
        .bind(customer.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_customer(&self, id: &str) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(
            "SELECT id, name, email_masked, kyc_level, created_at FROM aegis_customers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(customer_row).transpose()
    }

    async fn insert_card(&self, card: Card) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aegis_cards (id, customer_id, last4, network, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(card.id)
        .bind(card.customer_id)
        .bind(card.last4)
        .bind(card.network)
        .bind(card.status.as_str())
        .bind(card.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_card(&self, id: &str) -> StoreResult<Option<Card>> {
        let row = sqlx::query(
            "SELECT id, customer_id, last4, network, status, created_at FROM aegis_cards WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(card_row).transpose()
    }

    async fn cards_for_customer(&self, customer_id: &str) -> StoreResult<Vec<Card>> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_id, last4, network, status, created_at
              FROM aegis_cards
             WHERE customer_id = $1
             ORDER BY created_at ASC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(card_row).collect()
    }

    async fn insert_account(&self, account: Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aegis_accounts (id, customer_id, balance_minor, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                balance_minor = EXCLUDED.balance_minor,
                currency = EXCLUDED.currency
            "#,
        )
        .bind(account.id)
        .bind(account.customer_id)
        .bind(account.balance_minor)
        .bind(account.currency)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn accounts_for_customer(&self, customer_id: &str) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_id, balance_minor, currency
              FROM aegis_accounts
             WHERE customer_id = $1
             ORDER BY id ASC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(account_row).collect()
    }
}

#[async_trait]
impl TransactionStore for PostgresTriageStore {
    async fn insert_transaction(&self, txn: Transaction) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO aegis_transactions
                (id, customer_id, card_id, mcc, merchant, amount_minor, currency, ts, device_id, country, city)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (customer_id, merchant, amount_minor, ts) DO NOTHING
            "#,
        )
        .bind(txn.id)
        .bind(txn.customer_id)
        .bind(txn.card_id)
        .bind(txn.mcc)
        .bind(txn.merchant)
        .bind(txn.amount_minor)
        .bind(txn.currency)
        .bind(txn.ts)
        .bind(txn.device_id)
        .bind(txn.country)
        .bind(txn.city)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_id, card_id, mcc, merchant, amount_minor, currency, ts, device_id, country, city
              FROM aegis_transactions
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(txn_row).transpose()
    }

    async fn transactions_since(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_id, card_id, mcc, merchant, amount_minor, currency, ts, device_id, country, city
              FROM aegis_transactions
             WHERE customer_id = $1 AND ts >= $2
             ORDER BY ts DESC, id DESC
             LIMIT $3
            "#,
        )
        .bind(customer_id)
        .bind(since)
        .bind(to_i64(cap)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(txn_row).collect()
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
        let rows = match &cursor {
            Some(c) => {
                sqlx::query(
                    r#"
                    SELECT id, customer_id, card_id, mcc, merchant, amount_minor, currency, ts, device_id, country, city
                      FROM aegis_transactions
                     WHERE customer_id = $1 AND (ts, id) < ($2, $3)
                     ORDER BY ts DESC, id DESC
                     LIMIT $4
                    "#,
                )
                .bind(customer_id)
                .bind(c.last_ts)
                .bind(c.last_id.clone())
                .bind(to_i64(limit)?)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, customer_id, card_id, mcc, merchant, amount_minor, currency, ts, device_id, country, city
                      FROM aegis_transactions
                     WHERE customer_id = $1
                     ORDER BY ts DESC, id DESC
                     LIMIT $2
                    "#,
                )
                .bind(customer_id)
                .bind(to_i64(limit)?)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let transactions: Vec<Transaction> =
            rows.into_iter().map(txn_row).collect::<StoreResult<_>>()?;
        let next_cursor = if transactions.len() == limit {
            transactions.last().map(|t| {
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
            transactions,
            next_cursor,
        })
    }
}

#[async_trait]
impl AlertStore for PostgresTriageStore {
    async fn insert_alert(&self, alert: Alert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aegis_alerts (id, customer_id, suspect_txn_id, risk, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(alert.id)
        .bind(alert.customer_id)
        .bind(alert.suspect_txn_id)
        .bind(alert.risk.as_str())
        .bind(alert.status.as_str())
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_alert(&self, id: &str) -> StoreResult<Option<Alert>> {
        let row = sqlx::query(
            "SELECT id, customer_id, suspect_txn_id, risk, status, created_at FROM aegis_alerts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(alert_row).transpose()
    }

    async fn set_alert_status(&self, id: &str, status: AlertStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE aegis_alerts SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("alert {id} not found")));
        }
        Ok(())
    }

    async fn alert_count_for_customer(&self, customer_id: &str) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM aegis_alerts WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let count: i64 = row
            .try_get("count")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn list_alerts(&self, limit: usize) -> StoreResult<Vec<AlertListing>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.customer_id, a.suspect_txn_id, a.risk, a.status, a.created_at,
                   c.name AS customer_name, c.email_masked AS customer_email_masked,
                   t.id AS txn_id, t.merchant, t.amount_minor, t.currency
              FROM aegis_alerts a
              JOIN aegis_customers c ON c.id = a.customer_id
              LEFT JOIN aegis_transactions t ON t.id = a.suspect_txn_id
             ORDER BY a.created_at DESC, a.id DESC
             LIMIT $1
            "#,
        )
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(alert_listing_row).collect()
    }
}

#[async_trait]
impl RunStore for PostgresTriageStore {
    async fn insert_run(&self, run: TriageRun) -> StoreResult<()> {
        let reasons = serde_json::to_value(&run.reasons)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO aegis_triage_runs
                (id, alert_id, started_at, ended_at, risk, reasons, fallback_used, latency_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.id)
        .bind(run.alert_id)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.risk.map(|r| r.as_str()))
        .bind(reasons)
        .bind(run.fallback_used)
        .bind(run.latency_ms)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<TriageRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, alert_id, started_at, ended_at, risk, reasons, fallback_used, latency_ms
              FROM aegis_triage_runs
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(run_row).transpose()
    }

    async fn find_active_run(&self, alert_id: &str) -> StoreResult<Option<TriageRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, alert_id, started_at, ended_at, risk, reasons, fallback_used, latency_ms
              FROM aegis_triage_runs
             WHERE alert_id = $1 AND ended_at IS NULL
            "#,
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(run_row).transpose()
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
        let reasons = serde_json::to_value(reasons)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE aegis_triage_runs
               SET ended_at = $1,
                   risk = $2,
                   reasons = $3,
                   fallback_used = $4,
                   latency_ms = $5
             WHERE id = $6
               AND ended_at IS NULL
               AND started_at <= $1
            "#,
        )
        .bind(ended_at)
        .bind(risk.map(|r| r.as_str()))
        .bind(reasons)
        .bind(fallback_used)
        .bind(latency_ms)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = self.get_run(run_id).await?.is_some();
            if exists {
                return Err(StoreError::InvariantViolation(format!(
                    "run {run_id} already finished or end precedes start"
                )));
            }
            return Err(StoreError::NotFound(format!("run {run_id} not found")));
        }
        Ok(())
    }

    async fn append_trace(&self, trace: AgentTrace) -> StoreResult<()> {
        let detail = serde_json::to_value(&trace.detail)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq) + 1, 0) AS next FROM aegis_agent_traces WHERE run_id = $1",
        )
        .bind(trace.run_id.clone())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        let next: i64 = row
            .try_get("next")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if trace.seq != next {
            return Err(StoreError::InvariantViolation(format!(
                "trace seq {} breaks contiguous prefix (expected {next})",
                trace.seq
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO aegis_agent_traces (run_id, seq, step, ok, duration_ms, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(trace.run_id)
        .bind(trace.seq)
        .bind(trace.step.as_str())
        .bind(trace.ok)
        .bind(trace.duration_ms)
        .bind(detail)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn traces_for_run(&self, run_id: &str) -> StoreResult<Vec<AgentTrace>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, seq, step, ok, duration_ms, detail
              FROM aegis_agent_traces
             WHERE run_id = $1
             ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(trace_row).collect()
    }

    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<TriageRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_id, started_at, ended_at, risk, reasons, fallback_used, latency_ms
              FROM aegis_triage_runs
             ORDER BY started_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(run_row).collect()
    }
}

#[async_trait]
impl CaseStore for PostgresTriageStore {
    async fn get_case(&self, id: &str) -> StoreResult<Option<Case>> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_id, txn_id, case_type, status, reason_code, created_at
              FROM aegis_cases
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(case_row).transpose()
    }

    async fn find_open_case(
        &self,
        txn_id: &str,
        case_type: CaseType,
    ) -> StoreResult<Option<Case>> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_id, txn_id, case_type, status, reason_code, created_at
              FROM aegis_cases
             WHERE txn_id = $1 AND case_type = $2 AND status = 'OPEN'
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(txn_id)
        .bind(case_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(case_row).transpose()
    }

    async fn append_case_event(&self, append: CaseEventAppend) -> StoreResult<CaseEvent> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let exists = sqlx::query("SELECT id FROM aegis_cases WHERE id = $1")
            .bind(append.case_id.clone())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!(
                "case {} not found",
                append.case_id
            )));
        }

        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq) + 1, 0) AS next FROM aegis_case_events WHERE case_id = $1",
        )
        .bind(append.case_id.clone())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        let seq: i64 = row
            .try_get("next")
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let ts = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO aegis_case_events (case_id, seq, actor, action, ts, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(append.case_id.clone())
        .bind(seq)
        .bind(append.actor.clone())
        .bind(append.action.clone())
        .bind(ts)
        .bind(append.payload.clone())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(CaseEvent {
            case_id: append.case_id,
            seq,
            actor: append.actor,
            action: append.action,
            ts,
            payload: append.payload,
        })
    }

    async fn events_for_case(&self, case_id: &str) -> StoreResult<Vec<CaseEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT case_id, seq, actor, action, ts, payload
              FROM aegis_case_events
             WHERE case_id = $1
             ORDER BY seq ASC
            "#,
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(case_event_row).collect()
    }

    async fn list_cases(&self, limit: usize) -> StoreResult<Vec<Case>> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_id, txn_id, case_type, status, reason_code, created_at
              FROM aegis_cases
             ORDER BY created_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(case_row).collect()
    }
}

#[async_trait]
impl KbStore for PostgresTriageStore {
    async fn insert_doc(&self, doc: KbDoc) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aegis_kb_docs (id, title, anchor, content_text)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                anchor = EXCLUDED.anchor,
                content_text = EXCLUDED.content_text
            "#,
        )
        .bind(doc.id)
        .bind(doc.title)
        .bind(doc.anchor)
        .bind(doc.content_text)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_doc(&self, id: &str) -> StoreResult<Option<KbDoc>> {
        let row = sqlx::query(
            "SELECT id, title, anchor, content_text FROM aegis_kb_docs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(kb_row).transpose()
    }

    async fn all_docs(&self) -> StoreResult<Vec<KbDoc>> {
        let rows = sqlx::query("SELECT id, title, anchor, content_text FROM aegis_kb_docs ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(kb_row).collect()
    }
}

#[async_trait]
impl PolicyStore for PostgresTriageStore {
    async fn insert_policy(&self, policy: Policy) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aegis_policies (id, code, title, content_text, priority)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                code = EXCLUDED.code,
                title = EXCLUDED.title,
                content_text = EXCLUDED.content_text,
                priority = EXCLUDED.priority
            "#,
        )
        .bind(policy.id)
        .bind(policy.code)
        .bind(policy.title)
        .bind(policy.content_text)
        .bind(policy.priority)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn policies_by_priority(&self) -> StoreResult<Vec<Policy>> {
        let rows = sqlx::query(
            "SELECT id, code, title, content_text, priority FROM aegis_policies ORDER BY priority ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.into_iter().map(policy_row).collect()
    }
}

#[async_trait]
impl ActionStore for PostgresTriageStore {
    async fn apply_card_freeze(
        &self,
        card_id: &str,
        case: Case,
        event: CaseEventAppend,
        alert_id: Option<&str>,
    ) -> StoreResult<Card> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let row = sqlx::query(
            r#"
            UPDATE aegis_cards SET status = 'FROZEN'
             WHERE id = $1
            RETURNING id, customer_id, last4, network, status, created_at
            "#,
        )
        .bind(card_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        let card = match row {
            Some(row) => card_row(row)?,
            None => return Err(StoreError::NotFound(format!("card {card_id} not found"))),
        };

        insert_case_in_tx(&mut tx, &case).await?;
        insert_first_event_in_tx(&mut tx, &event).await?;
        if let Some(alert_id) = alert_id {
            update_alert_in_tx(&mut tx, alert_id, AlertStatus::Resolved).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(card)
    }

    async fn apply_dispute(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: Option<&str>,
    ) -> StoreResult<Case> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        insert_case_in_tx(&mut tx, &case).await?;
        insert_first_event_in_tx(&mut tx, &event).await?;
        if let Some(alert_id) = alert_id {
            update_alert_in_tx(&mut tx, alert_id, AlertStatus::InvestigatingDisputeOpened).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(case)
    }

    async fn apply_contact(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: &str,
    ) -> StoreResult<Case> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        insert_case_in_tx(&mut tx, &case).await?;
        insert_first_event_in_tx(&mut tx, &event).await?;
        update_alert_in_tx(&mut tx, alert_id, AlertStatus::Contacted).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(case)
    }

    async fn apply_false_positive(
        &self,
        case: Case,
        event: CaseEventAppend,
        alert_id: &str,
    ) -> StoreResult<Case> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        insert_case_in_tx(&mut tx, &case).await?;
        insert_first_event_in_tx(&mut tx, &event).await?;
        update_alert_in_tx(&mut tx, alert_id, AlertStatus::ClosedFalsePositive).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(case)
    }
}

async fn insert_case_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    case: &Case,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO aegis_cases (id, customer_id, txn_id, case_type, status, reason_code, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(case.id.clone())
    .bind(case.customer_id.clone())
    .bind(case.txn_id.clone())
    .bind(case.case_type.as_str())
    .bind(case.status.as_str())
    .bind(case.reason_code.clone())
    .bind(case.created_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_conflict)?;
    Ok(())
}

async fn insert_first_event_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &CaseEventAppend,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO aegis_case_events (case_id, seq, actor, action, ts, payload)
        VALUES ($1, 0, $2, $3, $4, $5)
        "#,
    )
    .bind(event.case_id.clone())
    .bind(event.actor.clone())
    .bind(event.action.clone())
    .bind(Utc::now())
    .bind(event.payload.clone())
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_conflict)?;
    Ok(())
}

async fn update_alert_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    alert_id: &str,
    status: AlertStatus,
) -> StoreResult<()> {
    let result = sqlx::query("UPDATE aegis_alerts SET status = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(alert_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("alert {alert_id} not found")));
    }
    Ok(())
}

// ── Row mappers ──────────────────────────────────────────────────────

fn customer_row(row: PgRow) -> StoreResult<Customer> {
    let kyc: String = row
        .try_get("kyc_level")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(Customer {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        name: row
            .try_get("name")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        email_masked: row
            .try_get("email_masked")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        kyc_level: KycLevel::parse(&kyc).map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn card_row(row: PgRow) -> StoreResult<Card> {
    let status: String = row
        .try_get("status")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(Card {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        customer_id: row
            .try_get("customer_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        last4: row
            .try_get("last4")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        network: row
            .try_get("network")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        status: CardStatus::parse(&status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn account_row(row: PgRow) -> StoreResult<Account> {
    Ok(Account {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        customer_id: row
            .try_get("customer_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        balance_minor: row
            .try_get("balance_minor")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        currency: row
            .try_get("currency")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn txn_row(row: PgRow) -> StoreResult<Transaction> {
    Ok(Transaction {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        customer_id: row
            .try_get("customer_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        card_id: row
            .try_get("card_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        mcc: row
            .try_get("mcc")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        merchant: row
            .try_get("merchant")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        amount_minor: row
            .try_get("amount_minor")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        currency: row
            .try_get("currency")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        ts: row
            .try_get("ts")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        device_id: row
            .try_get("device_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        country: row
            .try_get("country")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        city: row
            .try_get("city")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn alert_row(row: PgRow) -> StoreResult<Alert> {
    let risk: String = row
        .try_get("risk")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(Alert {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        customer_id: row
            .try_get("customer_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        suspect_txn_id: row
            .try_get("suspect_txn_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        risk: RiskLevel::parse(&risk).map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: AlertStatus::parse(&status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn alert_listing_row(row: PgRow) -> StoreResult<AlertListing> {
    let txn_id: Option<String> = row
        .try_get("txn_id")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let suspect = match txn_id {
        Some(txn_id) => Some(TxnSummary {
            txn_id,
            merchant: row
                .try_get("merchant")
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            amount_minor: row
                .try_get("amount_minor")
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            currency: row
                .try_get("currency")
                .map_err(|e| StoreError::Backend(e.to_string()))?,
        }),
        None => None,
    };
    let customer_name: String = row
        .try_get("customer_name")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let customer_email_masked: String = row
        .try_get("customer_email_masked")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(AlertListing {
        alert: alert_row(row)?,
        customer_name,
        customer_email_masked,
        suspect,
    })
}

fn run_row(row: PgRow) -> StoreResult<TriageRun> {
    let risk: Option<String> = row
        .try_get("risk")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let reasons_json: serde_json::Value = row
        .try_get("reasons")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let reasons: Vec<String> = serde_json::from_value(reasons_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(TriageRun {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        alert_id: row
            .try_get("alert_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        ended_at: row
            .try_get("ended_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        risk: risk
            .map(|r| RiskLevel::parse(&r))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        reasons,
        fallback_used: row
            .try_get("fallback_used")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        latency_ms: row
            .try_get("latency_ms")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn trace_row(row: PgRow) -> StoreResult<AgentTrace> {
    let step: String = row
        .try_get("step")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let detail_json: serde_json::Value = row
        .try_get("detail")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let detail: StepDetail = serde_json::from_value(detail_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(AgentTrace {
        run_id: row
            .try_get("run_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        seq: row
            .try_get("seq")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        step: StepName::parse(&step).map_err(|e| StoreError::Serialization(e.to_string()))?,
        ok: row
            .try_get("ok")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        duration_ms: row
            .try_get("duration_ms")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        detail,
    })
}

fn case_row(row: PgRow) -> StoreResult<Case> {
    let case_type: String = row
        .try_get("case_type")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(Case {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        customer_id: row
            .try_get("customer_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        txn_id: row
            .try_get("txn_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        case_type: CaseType::parse(&case_type)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: CaseStatus::parse(&status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        reason_code: row
            .try_get("reason_code")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn case_event_row(row: PgRow) -> StoreResult<CaseEvent> {
    Ok(CaseEvent {
        case_id: row
            .try_get("case_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        seq: row
            .try_get("seq")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        actor: row
            .try_get("actor")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        action: row
            .try_get("action")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        ts: row
            .try_get("ts")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        payload: row
            .try_get("payload")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn kb_row(row: PgRow) -> StoreResult<KbDoc> {
    Ok(KbDoc {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        title: row
            .try_get("title")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        anchor: row
            .try_get("anchor")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        content_text: row
            .try_get("content_text")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn policy_row(row: PgRow) -> StoreResult<Policy> {
    Ok(Policy {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        code: row
            .try_get("code")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        title: row
            .try_get("title")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        content_text: row
            .try_get("content_text")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        priority: row
            .try_get("priority")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

fn map_sqlx_conflict(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(db_err.message().to_string());
        }
    }
    StoreError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("limit too large".to_string()))
}
