//! Step contracts for the triage pipeline.
//!
//! Each pipeline step produces a typed [`StepOutput`]; the compact
//! [`StepDetail`] variant of that output is what gets persisted on the
//! trace and serialized onto the event stream. The storage boundary turns
//! the tagged variant into a schema-free JSON blob.

use crate::entities::{Account, Card, Customer, KycLevel, RiskLevel, Transaction, UnknownVariant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline step identifiers. The first six form the fixed plan; the
/// summarizer runs after decision composition and never appears in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    GetProfile,
    RecentTx,
    RiskSignals,
    KbLookup,
    Decide,
    ProposeAction,
    Summarize,
}

/// Execution order of the planned pipeline steps.
pub const PLAN: [StepName; 6] = [
    StepName::GetProfile,
    StepName::RecentTx,
    StepName::RiskSignals,
    StepName::KbLookup,
    StepName::Decide,
    StepName::ProposeAction,
];

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetProfile => "get_profile",
            Self::RecentTx => "recent_tx",
            Self::RiskSignals => "risk_signals",
            Self::KbLookup => "kb_lookup",
            Self::Decide => "decide",
            Self::ProposeAction => "propose_action",
            Self::Summarize => "summarize",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "get_profile" => Ok(Self::GetProfile),
            "recent_tx" => Ok(Self::RecentTx),
            "risk_signals" => Ok(Self::RiskSignals),
            "kb_lookup" => Ok(Self::KbLookup),
            "decide" => Ok(Self::Decide),
            "propose_action" => Ok(Self::ProposeAction),
            "summarize" => Ok(Self::Summarize),
            other => Err(UnknownVariant {
                field: "step",
                value: other.to_string(),
            }),
        }
    }

    /// Critical steps abort the pipeline on failure instead of falling back.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::GetProfile | Self::RecentTx)
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action the engine recommends to the analyst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageAction {
    FreezeCard,
    OpenDispute,
    ContactCustomer,
    FalsePositive,
    Monitor,
}

impl TriageAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreezeCard => "freeze_card",
            Self::OpenDispute => "open_dispute",
            Self::ContactCustomer => "contact_customer",
            Self::FalsePositive => "false_positive",
            Self::Monitor => "monitor",
        }
    }
}

// ── Step outputs ─────────────────────────────────────────────────────

/// Output of the profile step: everything known about the customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub customer: Customer,
    pub cards: Vec<Card>,
    pub accounts: Vec<Account>,
    /// Total alerts ever raised for this customer, the suspect one included.
    pub prior_alerts: u64,
}

/// Output of the recent-transactions step: last 30 days, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentActivity {
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VelocityStats {
    /// Transactions in the 24 h window ending at the suspect timestamp.
    pub txns_24h: u64,
    pub amount_24h_minor: i64,
    /// Historical daily average over the remaining 89 days of the window.
    pub daily_avg_txns: f64,
    pub daily_avg_amount_minor: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceStats {
    pub new_device: bool,
    pub device_changes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MerchantStats {
    pub new_merchant: bool,
    /// 0..=100 merchant risk from MCC set, name pattern, and novelty.
    pub risk_score: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternFlags {
    pub unusual_time: bool,
    pub unusual_location: bool,
    pub velocity_spike: bool,
}

/// Output of the risk-signals step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSignalsReport {
    /// Composite score clamped to 0..=100.
    pub score: u8,
    pub velocity: VelocityStats,
    pub device: DeviceStats,
    pub merchant: MerchantStats,
    pub patterns: PatternFlags,
    pub reasons: Vec<String>,
    pub suggested_action: TriageAction,
}

/// Customer spending shape inferred from the 90-day history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendingPattern {
    Regular,
    Concentrated,
    HighFrequency,
    HighValue,
}

impl SpendingPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Concentrated => "concentrated",
            Self::HighFrequency => "high_frequency",
            Self::HighValue => "high_value",
        }
    }
}

/// Output of the decide step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsReport {
    pub level: RiskLevel,
    /// 0..=95.
    pub confidence: u8,
    pub key_factors: Vec<String>,
    pub summary: String,
    pub recommendations: Vec<String>,
    pub pattern: SpendingPattern,
    /// Risk tier inferred from the customer profile alone.
    pub profile_risk: RiskLevel,
}

/// The six compliance checks, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCheck {
    RoleAuthorization,
    AmountLimit,
    CustomerStatus,
    RateLimit,
    BusinessHours,
    Escalation,
}

impl PolicyCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoleAuthorization => "role_authorization",
            Self::AmountLimit => "amount_limit",
            Self::CustomerStatus => "customer_status",
            Self::RateLimit => "rate_limit",
            Self::BusinessHours => "business_hours",
            Self::Escalation => "escalation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: PolicyCheck,
    pub passed: bool,
    pub detail: String,
}

/// Output of the propose-action step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    pub action: TriageAction,
    pub approved: bool,
    /// First failing check, when not approved.
    pub blocked_by: Option<PolicyCheck>,
    pub requires_otp: bool,
    pub checks: Vec<CheckResult>,
}

/// Output of the post-decision summarizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSummary {
    pub customer_message: String,
    pub internal_note: String,
    pub risk_summary: String,
    pub action_summary: String,
    pub next_steps: Vec<String>,
}

/// Knowledge-base hit returned by the retriever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbSearchResult {
    pub doc_id: String,
    pub title: String,
    pub anchor: String,
    /// Snippet windowed around the first matched term, at most 150 chars.
    pub extract: String,
    pub relevance_score: u32,
}

/// Output of the kb-lookup step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KbLookup {
    pub results: Vec<KbSearchResult>,
    pub citations: Vec<String>,
}

/// Response shape of the direct KB search interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbSearchResponse {
    pub results: Vec<KbSearchResult>,
    pub total_results: usize,
    pub query: String,
}

/// Typed result of one pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepOutput {
    Profile(ProfileSnapshot),
    RecentTx(RecentActivity),
    RiskSignals(RiskSignalsReport),
    KbLookup(KbLookup),
    Decision(InsightsReport),
    Proposal(ActionProposal),
    Summary(CaseSummary),
}

impl StepOutput {
    /// Compact trace detail for this output. Full payloads stay in memory;
    /// traces carry what an analyst needs to audit the step.
    pub fn detail(&self) -> StepDetail {
        match self {
            Self::Profile(p) => StepDetail::Profile {
                kyc_level: p.customer.kyc_level,
                card_count: p.cards.len(),
                account_count: p.accounts.len(),
                prior_alerts: p.prior_alerts,
            },
            Self::RecentTx(r) => StepDetail::RecentTx {
                count: r.transactions.len(),
                total_minor: r.transactions.iter().map(|t| t.amount_minor).sum(),
            },
            Self::RiskSignals(s) => StepDetail::RiskSignals {
                score: s.score,
                reasons: s.reasons.clone(),
                suggested_action: s.suggested_action,
                new_device: s.device.new_device,
                new_merchant: s.merchant.new_merchant,
            },
            Self::KbLookup(k) => StepDetail::KbLookup {
                result_count: k.results.len(),
                citations: k.citations.clone(),
            },
            Self::Decision(d) => StepDetail::Decision {
                level: d.level,
                confidence: d.confidence,
                key_factors: d.key_factors.clone(),
            },
            Self::Proposal(p) => StepDetail::Proposal {
                action: p.action,
                approved: p.approved,
                blocked_by: p.blocked_by,
                requires_otp: p.requires_otp,
            },
            Self::Summary(_) => StepDetail::Summary,
        }
    }
}

/// Tagged per-step trace detail. Serialized as a schema-free blob at the
/// storage boundary and as the event payload at the stream boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDetail {
    Profile {
        kyc_level: KycLevel,
        card_count: usize,
        account_count: usize,
        prior_alerts: u64,
    },
    RecentTx {
        count: usize,
        total_minor: i64,
    },
    RiskSignals {
        score: u8,
        reasons: Vec<String>,
        suggested_action: TriageAction,
        new_device: bool,
        new_merchant: bool,
    },
    KbLookup {
        result_count: usize,
        citations: Vec<String>,
    },
    Decision {
        level: RiskLevel,
        confidence: u8,
        key_factors: Vec<String>,
    },
    Proposal {
        action: TriageAction,
        approved: bool,
        blocked_by: Option<PolicyCheck>,
        requires_otp: bool,
    },
    Summary,
    /// Substituted deterministic result for a failed non-critical step.
    Fallback {
        reason: String,
    },
    /// Step failed; the error text is redacted before persistence.
    Failure {
        error: String,
    },
}

/// One persisted trace row. `seq` values form a contiguous prefix 0..n-1
/// per run; `detail` is redacted before it reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTrace {
    pub run_id: String,
    pub seq: i64,
    pub step: StepName,
    pub ok: bool,
    pub duration_ms: i64,
    pub detail: StepDetail,
}

impl AgentTrace {
    pub fn new(
        run_id: impl Into<String>,
        seq: i64,
        step: StepName,
        ok: bool,
        duration_ms: i64,
        detail: StepDetail,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            seq,
            step,
            ok,
            duration_ms,
            detail,
        }
    }
}

/// Timestamped marker used by latency accounting.
pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_has_expected_order_and_critical_prefix() {
        assert_eq!(PLAN.len(), 6);
        assert_eq!(PLAN[0], StepName::GetProfile);
        assert_eq!(PLAN[1], StepName::RecentTx);
        assert!(PLAN[0].is_critical());
        assert!(PLAN[1].is_critical());
        assert!(PLAN[2..].iter().all(|s| !s.is_critical()));
        assert!(!StepName::Summarize.is_critical());
    }

    #[test]
    fn step_name_round_trips() {
        for step in PLAN {
            assert_eq!(StepName::parse(step.as_str()).unwrap(), step);
        }
    }

    #[test]
    fn detail_serializes_with_kind_tag() {
        let detail = StepDetail::Fallback {
            reason: "risk_analysis_unavailable".to_string(),
        };
        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["kind"], "fallback");
        assert_eq!(value["reason"], "risk_analysis_unavailable");
    }
}
