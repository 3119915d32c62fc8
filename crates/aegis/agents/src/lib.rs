//! Pipeline step agents.
//!
//! Each agent is a value implementing the [`StepAgent`] capability:
//! `run(context) -> output` under the orchestrator's deadline. Agents are
//! selected through a dispatch map keyed by step name, so the pipeline
//! never hard-codes concrete types and tests can swap any step out.

#![deny(unsafe_code)]

pub mod compliance;
pub mod context;
pub mod insights;
pub mod kb_lookup;
pub mod profile;
pub mod recent_tx;
pub mod risk_signals;
pub mod summarizer;

#[cfg(test)]
pub(crate) mod testutil;

use aegis_cache::RateLimiter;
use aegis_kb::KbRetriever;
use aegis_store::{StoreError, TriageStore};
use aegis_types::{StepName, StepOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use compliance::{
    action_for_score, annotate_with_policies, evaluate_gate, ComplianceAgent, ComplianceConfig,
    GateInput,
};
pub use context::RunContext;
pub use insights::{decide, InsightsAgent};
pub use kb_lookup::KbLookupAgent;
pub use profile::ProfileAgent;
pub use recent_tx::RecentTxAgent;
pub use risk_signals::{compute_signals, RiskSignalsAgent, RiskSignalsConfig};
pub use summarizer::{fallback_summary, summarize, SummarizerAgent};

/// Result type for agent runs.
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent-level errors. The orchestrator absorbs these into traces and
/// fallbacks; they never reach a client raw.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("missing dependency: {0} output not in context")]
    MissingDependency(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal: {0}")]
    Internal(String),
}

/// Capability contract every pipeline step implements.
#[async_trait]
pub trait StepAgent: Send + Sync {
    fn step(&self) -> StepName;

    /// Critical steps abort the run on failure instead of falling back.
    fn critical(&self) -> bool {
        self.step().is_critical()
    }

    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput>;
}

/// Dispatch map from step name to agent.
pub struct AgentSet {
    agents: HashMap<StepName, Arc<dyn StepAgent>>,
}

impl AgentSet {
    /// The standard six agents wired against the given store and limiter.
    pub fn standard<S>(
        store: Arc<S>,
        limiter: Arc<RateLimiter>,
        signals_config: RiskSignalsConfig,
        compliance_config: ComplianceConfig,
    ) -> Self
    where
        S: TriageStore + 'static,
    {
        let mut set = Self {
            agents: HashMap::new(),
        };
        set.insert(Arc::new(ProfileAgent::new(store.clone())));
        set.insert(Arc::new(RecentTxAgent::new(store.clone())));
        set.insert(Arc::new(RiskSignalsAgent::new(store.clone(), signals_config)));
        set.insert(Arc::new(KbLookupAgent::new(KbRetriever::new(store.clone()))));
        set.insert(Arc::new(InsightsAgent::new()));
        set.insert(Arc::new(ComplianceAgent::new(
            store,
            limiter,
            compliance_config,
        )));
        set.insert(Arc::new(SummarizerAgent::new()));
        set
    }

    /// Register or replace the agent for its step.
    pub fn insert(&mut self, agent: Arc<dyn StepAgent>) {
        self.agents.insert(agent.step(), agent);
    }

    /// Replace an agent, builder-style; used to inject faults in tests.
    pub fn with_agent(mut self, agent: Arc<dyn StepAgent>) -> Self {
        self.insert(agent);
        self
    }

    pub fn get(&self, step: StepName) -> Option<Arc<dyn StepAgent>> {
        self.agents.get(&step).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_cache::{MemoryKv, RateLimiterConfig};
    use aegis_store::MemoryTriageStore;
    use aegis_types::PLAN;

    #[test]
    fn standard_set_covers_the_plan_and_summarizer() {
        let store = Arc::new(MemoryTriageStore::new());
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryKv::new()),
            RateLimiterConfig::default(),
        ));
        let set = AgentSet::standard(
            store,
            limiter,
            RiskSignalsConfig::default(),
            ComplianceConfig::default(),
        );
        for step in PLAN {
            let agent = set.get(step).expect("agent for planned step");
            assert_eq!(agent.step(), step);
        }
        assert!(set.get(StepName::Summarize).is_some());
        assert!(set.get(StepName::GetProfile).unwrap().critical());
        assert!(!set.get(StepName::KbLookup).unwrap().critical());
    }
}
