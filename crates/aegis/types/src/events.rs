//! Typed event envelope published on the per-run stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event kinds carried by the run stream. Clients treat unknown types as
/// no-ops, so additions here are backward compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    Connected,
    PlanBuilt,
    ToolUpdate,
    FallbackTriggered,
    DecisionFinalized,
    Error,
    Heartbeat,
    Completed,
}

impl EngineEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::PlanBuilt => "plan_built",
            Self::ToolUpdate => "tool_update",
            Self::FallbackTriggered => "fallback_triggered",
            Self::DecisionFinalized => "decision_finalized",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::Completed => "completed",
        }
    }
}

/// One stream event. `data` is redacted before the event leaves the
/// orchestrator; subscribers never see raw step payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: EngineEventType,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub data: serde_json::Value,
}

impl EngineEvent {
    pub fn new(
        event_type: EngineEventType,
        run_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            run_id: run_id.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_field() {
        let event = EngineEvent::new(
            EngineEventType::PlanBuilt,
            "run-1",
            serde_json::json!({"steps": ["get_profile"]}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "plan_built");
        assert_eq!(value["run_id"], "run-1");
        assert!(value["timestamp"].is_string());
    }
}
