//! Deadline-bounded step execution.

use crate::breaker::CircuitBreakerRegistry;
use aegis_agents::{AgentError, RunContext, StepAgent};
use aegis_types::StepOutput;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of attempting one step.
#[derive(Debug)]
pub enum StepOutcome {
    Ok(StepOutput),
    Timeout,
    Error(AgentError),
    CircuitOpen,
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Failure text recorded on the trace.
    pub fn failure_text(&self) -> Option<String> {
        match self {
            Self::Ok(_) => None,
            Self::Timeout => Some("step deadline exceeded".to_string()),
            Self::Error(e) => Some(e.to_string()),
            Self::CircuitOpen => Some("circuit open".to_string()),
        }
    }
}

/// Run one agent under the breaker and the per-step deadline. A timed-out
/// agent is abandoned; a result arriving later is dropped with its future.
pub async fn run_step(
    agent: &Arc<dyn StepAgent>,
    ctx: &RunContext,
    breakers: &CircuitBreakerRegistry,
    deadline: Duration,
) -> StepOutcome {
    let step = agent.step();
    if breakers.is_open(step) {
        return StepOutcome::CircuitOpen;
    }

    match tokio::time::timeout(deadline, agent.run(ctx)).await {
        Ok(Ok(output)) => {
            breakers.record_success(step);
            StepOutcome::Ok(output)
        }
        Ok(Err(error)) => {
            breakers.record_failure(step);
            StepOutcome::Error(error)
        }
        Err(_) => {
            breakers.record_failure(step);
            StepOutcome::Timeout
        }
    }
}
