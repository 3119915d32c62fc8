//! Profile step: who is this customer.

use crate::context::RunContext;
use crate::{AgentError, AgentResult, StepAgent};
use aegis_store::{AlertStore, CustomerStore, TriageStore};
use aegis_types::{ProfileSnapshot, StepName, StepOutput};
use async_trait::async_trait;
use std::sync::Arc;

/// Reads customer, cards, accounts, and alert history. Critical: without
/// a profile the pipeline aborts.
pub struct ProfileAgent {
    store: Arc<dyn TriageStore>,
}

impl ProfileAgent {
    pub fn new(store: Arc<dyn TriageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepAgent for ProfileAgent {
    fn step(&self) -> StepName {
        StepName::GetProfile
    }

    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput> {
        let customer_id = ctx.request.customer_id.as_str();
        let customer = self
            .store
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("customer {customer_id}")))?;
        let cards = self.store.cards_for_customer(customer_id).await?;
        let accounts = self.store.accounts_for_customer(customer_id).await?;
        let prior_alerts = self.store.alert_count_for_customer(customer_id).await?;

        Ok(StepOutput::Profile(ProfileSnapshot {
            customer,
            cards,
            accounts,
            prior_alerts,
        }))
    }
}
