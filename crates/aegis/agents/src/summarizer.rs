//! Post-decision summarizer: deterministic analyst- and customer-facing
//! text for the decided action. Best-effort; a fixed fallback covers any
//! gap in the inputs.

use crate::context::RunContext;
use crate::{AgentResult, StepAgent};
use aegis_types::{CaseSummary, RiskLevel, StepName, StepOutput, TriageAction};
use async_trait::async_trait;

/// Produces the closing summary after the decision is composed.
pub struct SummarizerAgent;

impl SummarizerAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SummarizerAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepAgent for SummarizerAgent {
    fn step(&self) -> StepName {
        StepName::Summarize
    }

    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput> {
        let customer_ref = aegis_redact::mask_customer_id(&ctx.request.customer_id);
        let summary = match (&ctx.insights, &ctx.proposal) {
            (Some(insights), Some(proposal)) => summarize(
                insights.level,
                proposal.action,
                &customer_ref,
                &ctx.suspect.merchant,
                ctx.suspect.amount_minor,
                ctx.signals.as_ref().map(|s| s.reasons.as_slice()).unwrap_or(&[]),
            ),
            _ => fallback_summary(),
        };
        Ok(StepOutput::Summary(summary))
    }
}

/// Deterministic templates keyed by the decided action. `customer_ref`
/// must already be masked; it lands in the internal note.
pub fn summarize(
    level: RiskLevel,
    action: TriageAction,
    customer_ref: &str,
    merchant: &str,
    amount_minor: i64,
    reasons: &[String],
) -> CaseSummary {
    let amount = format!("${}.{:02}", amount_minor / 100, (amount_minor % 100).abs());
    let risk_summary = format!(
        "Reviewed as {} risk. Contributing signals: {}.",
        level.as_str(),
        if reasons.is_empty() {
            "none recorded".to_string()
        } else {
            reasons.join("; ")
        }
    );

    let (customer_message, action_summary, next_steps) = match action {
        TriageAction::FreezeCard => (
            format!(
                "We noticed unusual activity on your card ({amount} at {merchant}) and placed a \
                 temporary hold for your protection. Please contact us to verify recent purchases."
            ),
            "Card freeze proposed pending OTP verification.".to_string(),
            vec![
                "verify the one-time passcode with the customer".to_string(),
                "confirm recent transactions once the customer responds".to_string(),
                "review the freeze after verification".to_string(),
            ],
        ),
        TriageAction::OpenDispute => (
            format!(
                "We flagged a charge of {amount} at {merchant}. If you do not recognize it, we \
                 will open a dispute on your behalf."
            ),
            "Dispute recommended for the suspect transaction.".to_string(),
            vec![
                "confirm the charge with the customer".to_string(),
                "open the dispute with the suspect transaction attached".to_string(),
            ],
        ),
        TriageAction::ContactCustomer => (
            format!(
                "Please get in touch about a recent charge of {amount} at {merchant} so we can \
                 confirm it was you."
            ),
            "Outbound customer contact recommended.".to_string(),
            vec!["reach the customer through a verified channel".to_string()],
        ),
        TriageAction::FalsePositive | TriageAction::Monitor => (
            format!(
                "A routine review of a charge of {amount} at {merchant} found nothing unusual. \
                 No action is needed."
            ),
            "Alert assessed as a likely false positive.".to_string(),
            vec![
                "close the alert as a false positive".to_string(),
                "keep standard monitoring in place".to_string(),
            ],
        ),
    };

    CaseSummary {
        customer_message,
        internal_note: format!(
            "Triage proposed {} at {} risk for customer {customer_ref} ({merchant} {amount}).",
            action.as_str(),
            level.as_str()
        ),
        risk_summary,
        action_summary,
        next_steps,
    }
}

/// Fixed template used when the pipeline could not supply the inputs.
pub fn fallback_summary() -> CaseSummary {
    CaseSummary {
        customer_message: "We are reviewing recent activity on your account and will follow up \
                           if anything needs your attention."
            .to_string(),
        internal_note: "Automated summary unavailable; review the run traces.".to_string(),
        risk_summary: "Risk summary unavailable for this run.".to_string(),
        action_summary: "Manual review recommended.".to_string(),
        next_steps: vec!["review the alert manually".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_context;

    #[test]
    fn templates_are_deterministic_per_action() {
        let reasons = vec!["first use of this device".to_string()];
        let a = summarize(
            RiskLevel::High,
            TriageAction::FreezeCard,
            "cust***01",
            "LUXE",
            180_000,
            &reasons,
        );
        let b = summarize(
            RiskLevel::High,
            TriageAction::FreezeCard,
            "cust***01",
            "LUXE",
            180_000,
            &reasons,
        );
        assert_eq!(a.customer_message, b.customer_message);
        assert!(a.customer_message.contains("$1800.00"));
        assert!(a.customer_message.contains("LUXE"));
        assert!(a.internal_note.contains("cust***01"));
        assert!(a.next_steps.len() == 3);
    }

    #[test]
    fn each_action_has_distinct_messaging() {
        let actions = [
            TriageAction::FreezeCard,
            TriageAction::OpenDispute,
            TriageAction::ContactCustomer,
            TriageAction::FalsePositive,
        ];
        let mut messages = std::collections::BTreeSet::new();
        for action in actions {
            let summary = summarize(RiskLevel::Medium, action, "cust***01", "SHOP", 5_000, &[]);
            messages.insert(summary.action_summary);
        }
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn missing_inputs_fall_back() {
        let agent = SummarizerAgent::new();
        let output = agent.run(&make_context()).await.unwrap();
        let StepOutput::Summary(summary) = output else {
            panic!("expected summary output");
        };
        assert_eq!(summary.action_summary, "Manual review recommended.");
    }
}
