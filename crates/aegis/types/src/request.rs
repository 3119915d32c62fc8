//! Triage request/response shapes exchanged with callers of the engine.

use crate::entities::{RiskLevel, UnknownVariant};
use crate::step::{ActionProposal, AgentTrace, CaseSummary, TriageAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller role taken from the auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalystRole {
    Agent,
    Lead,
}

impl AnalystRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Lead => "lead",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "agent" => Ok(Self::Agent),
            "lead" => Ok(Self::Lead),
            other => Err(UnknownVariant {
                field: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Request to triage one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRequest {
    pub alert_id: String,
    pub customer_id: String,
    pub suspect_txn_id: String,
    pub role: AnalystRole,
    /// Rate-limit principal; for analyst-initiated runs this is the
    /// analyst id.
    pub client_id: String,
}

/// Final outcome of a triage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub run_id: String,
    pub correlation_id: String,
    pub risk: RiskLevel,
    pub proposed_action: TriageAction,
    /// 0..=100; capped at 70 when a fallback was substituted.
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub citations: Vec<String>,
    pub fallback_used: bool,
    pub latency_ms: i64,
    /// Present when the propose-action step completed.
    pub proposal: Option<ActionProposal>,
    /// Best-effort post-decision summary.
    pub summary: Option<CaseSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
}

/// Status-fetch shape for a run, traces included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub status: RunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub risk: Option<RiskLevel>,
    pub reasons: Vec<String>,
    pub fallback_used: bool,
    pub latency_ms: Option<i64>,
    pub traces: Vec<AgentTrace>,
}
