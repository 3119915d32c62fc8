//! KB-lookup step: fetch guidance documents for the risk reasons.

use crate::context::RunContext;
use crate::{AgentResult, StepAgent};
use aegis_kb::KbRetriever;
use aegis_types::{StepName, StepOutput};
use async_trait::async_trait;

/// Retrieves supporting documents and citations. The retriever itself
/// never fails, so this step only times out or trips its breaker.
pub struct KbLookupAgent {
    retriever: KbRetriever,
}

impl KbLookupAgent {
    pub fn new(retriever: KbRetriever) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl StepAgent for KbLookupAgent {
    fn step(&self) -> StepName {
        StepName::KbLookup
    }

    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput> {
        let reasons = ctx
            .signals
            .as_ref()
            .map(|s| s.reasons.clone())
            .unwrap_or_default();
        Ok(StepOutput::KbLookup(self.retriever.lookup(&reasons).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_context;
    use aegis_store::MemoryTriageStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn no_signals_yields_empty_lookup() {
        let store = Arc::new(MemoryTriageStore::new());
        let agent = KbLookupAgent::new(KbRetriever::new(store));
        let output = agent.run(&make_context()).await.unwrap();
        let StepOutput::KbLookup(lookup) = output else {
            panic!("expected kb output");
        };
        assert!(lookup.results.is_empty());
        assert!(lookup.citations.is_empty());
    }
}
