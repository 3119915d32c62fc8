//! Persistent entities of the triage domain.
//!
//! Amounts are integer minor units (cents); timestamps are UTC. Enum
//! variants carry explicit `as_str`/`parse` mappings because the storage
//! adapters persist them as text columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minor units per major unit of currency (cents per dollar).
pub const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Raised when a persisted enum value no longer maps to a known variant.
#[derive(Debug, Error)]
#[error("unknown {field} value `{value}`")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

fn unknown(field: &'static str, value: &str) -> UnknownVariant {
    UnknownVariant {
        field,
        value: value.to_string(),
    }
}

/// Identity-verification level assigned to a customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycLevel {
    Pending,
    Verified,
    Restricted,
}

impl KycLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Restricted => "restricted",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "restricted" => Ok(Self::Restricted),
            other => Err(unknown("kyc_level", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email_masked: String,
    pub kyc_level: KycLevel,
    pub created_at: DateTime<Utc>,
}

/// Card lifecycle state. Transitions are monotonic except
/// Active <-> Frozen, which a lead-role override may reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    Active,
    Frozen,
    Expired,
}

impl CardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Frozen => "FROZEN",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "ACTIVE" => Ok(Self::Active),
            "FROZEN" => Ok(Self::Frozen),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(unknown("card_status", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub customer_id: String,
    pub last4: String,
    pub network: String,
    pub status: CardStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub customer_id: String,
    pub balance_minor: i64,
    pub currency: String,
}

/// Immutable card transaction. Deduplicated by
/// `(customer_id, merchant, amount_minor, ts)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub customer_id: String,
    pub card_id: String,
    pub mcc: String,
    pub merchant: String,
    pub amount_minor: i64,
    pub currency: String,
    pub ts: DateTime<Utc>,
    pub device_id: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl Transaction {
    /// Minimal constructor for the common fields; optional location and
    /// device attributes attach via the `with_*` helpers.
    pub fn new(
        id: impl Into<String>,
        customer_id: impl Into<String>,
        card_id: impl Into<String>,
        mcc: impl Into<String>,
        merchant: impl Into<String>,
        amount_minor: i64,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            customer_id: customer_id.into(),
            card_id: card_id.into(),
            mcc: mcc.into(),
            merchant: merchant.into(),
            amount_minor,
            currency: "USD".to_string(),
            ts,
            device_id: None,
            country: None,
            city: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_location(
        mut self,
        country: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        self.country = Some(country.into());
        self.city = Some(city.into());
        self
    }
}

/// Analyst-facing severity bucket, also the triage outcome level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(unknown("risk_level", other)),
        }
    }

    /// Score-to-level mapping shared by the signals and decision layers.
    pub fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::High
        } else if score >= 50 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    ClosedFalsePositive,
    Contacted,
    InvestigatingDisputeOpened,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Investigating => "INVESTIGATING",
            Self::Resolved => "RESOLVED",
            Self::ClosedFalsePositive => "CLOSED_FALSE_POSITIVE",
            Self::Contacted => "CONTACTED",
            Self::InvestigatingDisputeOpened => "INVESTIGATING_DISPUTE_OPENED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "OPEN" => Ok(Self::Open),
            "INVESTIGATING" => Ok(Self::Investigating),
            "RESOLVED" => Ok(Self::Resolved),
            "CLOSED_FALSE_POSITIVE" => Ok(Self::ClosedFalsePositive),
            "CONTACTED" => Ok(Self::Contacted),
            "INVESTIGATING_DISPUTE_OPENED" => Ok(Self::InvestigatingDisputeOpened),
            other => Err(unknown("alert_status", other)),
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open | Self::Investigating)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub customer_id: String,
    pub suspect_txn_id: String,
    pub risk: RiskLevel,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

/// One execution of the triage pipeline for a single alert.
///
/// `ended_at` is set exactly once, on completion or terminal error, and
/// `ended_at >= started_at` always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRun {
    pub id: String,
    pub alert_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub risk: Option<RiskLevel>,
    pub reasons: Vec<String>,
    pub fallback_used: bool,
    pub latency_ms: Option<i64>,
}

impl TriageRun {
    pub fn started(id: impl Into<String>, alert_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            alert_id: alert_id.into(),
            started_at: at,
            ended_at: None,
            risk: None,
            reasons: Vec::new(),
            fallback_used: false,
            latency_ms: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseType {
    CardFreeze,
    Dispute,
    ContactCustomer,
    FalsePositive,
}

impl CaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CardFreeze => "CARD_FREEZE",
            Self::Dispute => "DISPUTE",
            Self::ContactCustomer => "CONTACT_CUSTOMER",
            Self::FalsePositive => "FALSE_POSITIVE",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "CARD_FREEZE" => Ok(Self::CardFreeze),
            "DISPUTE" => Ok(Self::Dispute),
            "CONTACT_CUSTOMER" => Ok(Self::ContactCustomer),
            "FALSE_POSITIVE" => Ok(Self::FalsePositive),
            other => Err(unknown("case_type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Open,
    Closed,
    ClosedFalsePositive,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::ClosedFalsePositive => "CLOSED_FALSE_POSITIVE",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownVariant> {
        match raw {
            "OPEN" => Ok(Self::Open),
            "CLOSED" => Ok(Self::Closed),
            "CLOSED_FALSE_POSITIVE" => Ok(Self::ClosedFalsePositive),
            other => Err(unknown("case_status", other)),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Investigation case opened by an analyst action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub customer_id: String,
    pub txn_id: Option<String>,
    pub case_type: CaseType,
    pub status: CaseStatus,
    pub reason_code: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record attached to a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEvent {
    pub case_id: String,
    pub seq: i64,
    pub actor: String,
    pub action: String,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Knowledge-base document, read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbDoc {
    pub id: String,
    pub title: String,
    pub anchor: String,
    pub content_text: String,
}

/// Compliance policy evaluated by the propose-action gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub code: String,
    pub title: String,
    pub content_text: String,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_from_score_thresholds() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(49), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(50), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(79), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(80), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::High);
    }

    #[test]
    fn enum_round_trips_through_text() {
        for status in [
            AlertStatus::Open,
            AlertStatus::Investigating,
            AlertStatus::Resolved,
            AlertStatus::ClosedFalsePositive,
            AlertStatus::Contacted,
            AlertStatus::InvestigatingDisputeOpened,
        ] {
            assert_eq!(AlertStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [CardStatus::Active, CardStatus::Frozen, CardStatus::Expired] {
            assert_eq!(CardStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(AlertStatus::parse("NOT_A_STATUS").is_err());
    }

    #[test]
    fn alert_terminal_statuses() {
        assert!(!AlertStatus::Open.is_terminal());
        assert!(!AlertStatus::Investigating.is_terminal());
        assert!(AlertStatus::Resolved.is_terminal());
        assert!(AlertStatus::Contacted.is_terminal());
    }
}
