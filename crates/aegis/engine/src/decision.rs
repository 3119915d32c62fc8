//! Final decision composition.
//!
//! Folds whatever the pipeline produced into the outcome contract: level
//! from the score (demoted under fallback), action preferring the
//! compliance proposal, confidence capped when a fallback was used.

use aegis_agents::RunContext;
use aegis_types::{RiskLevel, TriageAction};

/// Composed outcome before persistence.
#[derive(Debug, Clone)]
pub struct ComposedDecision {
    pub risk: RiskLevel,
    pub proposed_action: TriageAction,
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub citations: Vec<String>,
}

/// Confidence ceiling when any fallback was substituted.
const FALLBACK_CONFIDENCE_CAP: u8 = 70;

/// Confidence ceiling overall.
const CONFIDENCE_CAP: u8 = 95;

pub fn compose(ctx: &RunContext, fallback_used: bool) -> ComposedDecision {
    let score = ctx.score();

    let mut risk = ctx
        .insights
        .as_ref()
        .map(|i| i.level)
        .unwrap_or_else(|| RiskLevel::from_score(score));
    if fallback_used && risk == RiskLevel::High {
        // Uncertainty penalty: a decision built on substitutes does not
        // report the highest severity.
        risk = RiskLevel::Medium;
    }

    let proposed_action = match ctx.proposal.as_ref() {
        Some(proposal) => proposal.action,
        None => match risk {
            RiskLevel::High => TriageAction::FreezeCard,
            RiskLevel::Medium => TriageAction::OpenDispute,
            RiskLevel::Low => TriageAction::FalsePositive,
        },
    };

    let confidence = if fallback_used {
        ((f64::from(score) * 0.7) as u8).min(FALLBACK_CONFIDENCE_CAP)
    } else {
        score.min(CONFIDENCE_CAP)
    };

    ComposedDecision {
        risk,
        proposed_action,
        confidence,
        reasons: ctx
            .signals
            .as_ref()
            .map(|s| s.reasons.clone())
            .unwrap_or_default(),
        citations: ctx
            .kb
            .as_ref()
            .map(|k| k.citations.clone())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{
        ActionProposal, Alert, AlertStatus, AnalystRole, InsightsReport, SpendingPattern,
        Transaction, TriageRequest,
    };

    fn make_ctx() -> RunContext {
        let request = TriageRequest {
            alert_id: "a".to_string(),
            customer_id: "c".to_string(),
            suspect_txn_id: "t".to_string(),
            role: AnalystRole::Agent,
            client_id: "cli".to_string(),
        };
        let alert = Alert {
            id: "a".to_string(),
            customer_id: "c".to_string(),
            suspect_txn_id: "t".to_string(),
            risk: RiskLevel::Low,
            status: AlertStatus::Open,
            created_at: chrono::Utc::now(),
        };
        let suspect = Transaction::new("t", "c", "card", "5411", "SHOP", 1_000, chrono::Utc::now());
        RunContext::new("run", "corr", request, alert, suspect)
    }

    fn insights(level: RiskLevel) -> InsightsReport {
        InsightsReport {
            level,
            confidence: 80,
            key_factors: vec![],
            summary: String::new(),
            recommendations: vec![],
            pattern: SpendingPattern::Regular,
            profile_risk: RiskLevel::Low,
        }
    }

    #[test]
    fn empty_context_composes_safe_defaults() {
        let decision = compose(&make_ctx(), true);
        assert_eq!(decision.risk, RiskLevel::Low);
        assert_eq!(decision.proposed_action, TriageAction::FalsePositive);
        assert_eq!(decision.confidence, 0);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn fallback_demotes_high_to_medium() {
        let mut ctx = make_ctx();
        ctx.insights = Some(insights(RiskLevel::High));
        let decision = compose(&ctx, true);
        assert_eq!(decision.risk, RiskLevel::Medium);

        let decision = compose(&ctx, false);
        assert_eq!(decision.risk, RiskLevel::High);
    }

    #[test]
    fn proposal_action_is_preferred() {
        let mut ctx = make_ctx();
        ctx.insights = Some(insights(RiskLevel::Medium));
        ctx.proposal = Some(ActionProposal {
            action: TriageAction::ContactCustomer,
            approved: true,
            blocked_by: None,
            requires_otp: false,
            checks: vec![],
        });
        let decision = compose(&ctx, false);
        assert_eq!(decision.proposed_action, TriageAction::ContactCustomer);
    }

    #[test]
    fn fallback_caps_confidence_at_70() {
        let mut ctx = make_ctx();
        let suspect = ctx.suspect.clone();
        ctx.signals = Some(aegis_agents::compute_signals(
            &aegis_agents::RiskSignalsConfig::default(),
            &suspect,
            &[],
        ));
        if let Some(signals) = ctx.signals.as_mut() {
            signals.score = 100;
        }
        let decision = compose(&ctx, true);
        assert_eq!(decision.confidence, 70);

        let decision = compose(&ctx, false);
        assert_eq!(decision.confidence, 95);
    }
}
