//! Recent-transactions step: the last 30 days of card activity.

use crate::context::RunContext;
use crate::{AgentResult, StepAgent};
use aegis_store::{TransactionStore, TriageStore};
use aegis_types::{RecentActivity, StepName, StepOutput};
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

/// Window and cap for the recent-activity read.
const WINDOW_DAYS: i64 = 30;
const CAP: usize = 100;

/// Reads the customer's recent transactions, newest first. Critical:
/// every downstream step consumes this output.
pub struct RecentTxAgent {
    store: Arc<dyn TriageStore>,
}

impl RecentTxAgent {
    pub fn new(store: Arc<dyn TriageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepAgent for RecentTxAgent {
    fn step(&self) -> StepName {
        StepName::RecentTx
    }

    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput> {
        let since = ctx.suspect.ts - Duration::days(WINDOW_DAYS);
        let transactions = self
            .store
            .transactions_since(&ctx.request.customer_id, since, CAP)
            .await?;
        Ok(StepOutput::RecentTx(RecentActivity { transactions }))
    }
}
