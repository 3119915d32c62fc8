//! Propose-action step: map the decision to a concrete action and run it
//! through the compliance gate.
//!
//! Six ordered checks; the proposal records every check's outcome and
//! `blocked_by` names the first failure. The gate is deterministic apart
//! from the rate-limit check, which the agent resolves against the cache
//! layer before evaluation.

use crate::context::RunContext;
use crate::{AgentError, AgentResult, StepAgent};
use aegis_cache::RateLimiter;
use aegis_store::{PolicyStore, TriageStore};
use aegis_types::{
    ActionProposal, AnalystRole, CheckResult, KycLevel, Policy, PolicyCheck, StepName,
    StepOutput, TriageAction,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use std::sync::Arc;

/// Compliance gate parameters.
#[derive(Debug, Clone)]
pub struct ComplianceConfig {
    /// Agents may not freeze above this suspect amount; leads may.
    pub freeze_amount_cap_minor: i64,
    /// Agents may not open disputes above this suspect amount; leads may.
    pub dispute_amount_cap_minor: i64,
    /// Business-hours timezone as minutes east of UTC.
    pub business_tz_offset_minutes: i32,
    pub business_open_hour: u32,
    pub business_close_hour: u32,
    /// Score at or above this with low confidence forces lead review.
    pub escalation_score: u8,
    pub escalation_confidence: u8,
    /// Disputes at or above this score require an OTP.
    pub otp_dispute_score: u8,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            freeze_amount_cap_minor: 100_000,
            dispute_amount_cap_minor: 500_000,
            business_tz_offset_minutes: 0,
            business_open_hour: 9,
            business_close_hour: 17,
            escalation_score: 80,
            escalation_confidence: 60,
            otp_dispute_score: 70,
        }
    }
}

/// Inputs to the pure gate evaluation.
#[derive(Debug, Clone)]
pub struct GateInput {
    pub role: AnalystRole,
    pub kyc_level: KycLevel,
    pub suspect_amount_minor: i64,
    pub score: u8,
    pub confidence: u8,
    pub rate_allowed: bool,
    pub now: DateTime<Utc>,
}

/// Runs the compliance gate against the accumulated context.
pub struct ComplianceAgent {
    store: Arc<dyn TriageStore>,
    limiter: Arc<RateLimiter>,
    config: ComplianceConfig,
}

impl ComplianceAgent {
    pub fn new(
        store: Arc<dyn TriageStore>,
        limiter: Arc<RateLimiter>,
        config: ComplianceConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            config,
        }
    }
}

#[async_trait]
impl StepAgent for ComplianceAgent {
    fn step(&self) -> StepName {
        StepName::ProposeAction
    }

    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput> {
        let profile = ctx
            .profile
            .as_ref()
            .ok_or(AgentError::MissingDependency("profile"))?;
        let score = ctx.score();
        let action = action_for_score(score);

        let rate_key = format!(
            "action:{}:{}",
            ctx.request.client_id,
            action.as_str()
        );
        let rate_allowed = self.limiter.check(&rate_key).await.allowed;

        let input = GateInput {
            role: ctx.role(),
            kyc_level: profile.customer.kyc_level,
            suspect_amount_minor: ctx.suspect.amount_minor,
            score,
            confidence: ctx.insights.as_ref().map(|i| i.confidence).unwrap_or(0),
            rate_allowed,
            now: Utc::now(),
        };

        let mut proposal = evaluate_gate(&self.config, action, &input);
        // Annotation only; a missing policy catalogue never blocks triage.
        match self.store.policies_by_priority().await {
            Ok(policies) => annotate_with_policies(&mut proposal, &policies),
            Err(e) => {
                tracing::debug!(run_id = %ctx.run_id, error = %e, "policy catalogue unavailable");
            }
        }
        if let Some(blocked_by) = proposal.blocked_by {
            tracing::info!(
                run_id = %ctx.run_id,
                action = proposal.action.as_str(),
                blocked_by = blocked_by.as_str(),
                "compliance gate blocked the proposed action"
            );
        }
        Ok(StepOutput::Proposal(proposal))
    }
}

/// Score-to-action mapping shared with the final composition.
pub fn action_for_score(score: u8) -> TriageAction {
    if score >= 80 {
        TriageAction::FreezeCard
    } else if score >= 50 {
        TriageAction::OpenDispute
    } else {
        TriageAction::FalsePositive
    }
}

/// Pure gate evaluation: all six checks, in order.
pub fn evaluate_gate(
    config: &ComplianceConfig,
    action: TriageAction,
    input: &GateInput,
) -> ActionProposal {
    let mut checks = Vec::with_capacity(6);

    // 1. Role authorization: freezing is a lead capability.
    let role_ok = !(action == TriageAction::FreezeCard && input.role == AnalystRole::Agent);
    checks.push(CheckResult {
        check: PolicyCheck::RoleAuthorization,
        passed: role_ok,
        detail: if role_ok {
            format!("{} may {}", input.role.as_str(), action.as_str())
        } else {
            "freeze_card requires the lead role".to_string()
        },
    });

    // 2. Amount limits bind the agent role; leads may exceed them.
    let over_cap = match action {
        TriageAction::FreezeCard => input.suspect_amount_minor > config.freeze_amount_cap_minor,
        TriageAction::OpenDispute => input.suspect_amount_minor > config.dispute_amount_cap_minor,
        _ => false,
    };
    let amount_ok = !(over_cap && input.role == AnalystRole::Agent);
    checks.push(CheckResult {
        check: PolicyCheck::AmountLimit,
        passed: amount_ok,
        detail: if amount_ok {
            "amount within limits".to_string()
        } else {
            format!("suspect amount exceeds the {} cap for agents", action.as_str())
        },
    });

    // 3. Customer status: restricted KYC blocks every write action.
    let status_ok = input.kyc_level != KycLevel::Restricted;
    checks.push(CheckResult {
        check: PolicyCheck::CustomerStatus,
        passed: status_ok,
        detail: if status_ok {
            format!("kyc level {}", input.kyc_level.as_str())
        } else {
            "customer is KYC-restricted".to_string()
        },
    });

    // 4. Per-user per-action rate limit, resolved by the caller.
    checks.push(CheckResult {
        check: PolicyCheck::RateLimit,
        passed: input.rate_allowed,
        detail: if input.rate_allowed {
            "within the action rate limit".to_string()
        } else {
            "action rate limit exceeded".to_string()
        },
    });

    // 5. Business hours: agents freeze only Mon-Fri within office hours.
    let hours_ok = action != TriageAction::FreezeCard
        || input.role == AnalystRole::Lead
        || within_business_hours(config, input.now);
    checks.push(CheckResult {
        check: PolicyCheck::BusinessHours,
        passed: hours_ok,
        detail: if hours_ok {
            "within business hours or lead override".to_string()
        } else {
            "freeze_card outside business hours requires a lead".to_string()
        },
    });

    // 6. Escalation: a high score the model is unsure about goes to a lead.
    let escalation_ok = !(input.score >= config.escalation_score
        && input.confidence < config.escalation_confidence
        && input.role == AnalystRole::Agent);
    checks.push(CheckResult {
        check: PolicyCheck::Escalation,
        passed: escalation_ok,
        detail: if escalation_ok {
            "no escalation required".to_string()
        } else {
            format!(
                "score {} with confidence {} requires lead review",
                input.score, input.confidence
            )
        },
    });

    let blocked_by = checks.iter().find(|c| !c.passed).map(|c| c.check);
    let requires_otp = match action {
        TriageAction::FreezeCard => true,
        TriageAction::OpenDispute => input.score >= config.otp_dispute_score,
        _ => false,
    };

    ActionProposal {
        action,
        approved: blocked_by.is_none(),
        blocked_by,
        requires_otp,
        checks,
    }
}

/// Attach the governing policy reference to every failed check that has
/// one in the catalogue.
pub fn annotate_with_policies(proposal: &mut ActionProposal, policies: &[Policy]) {
    for check in proposal.checks.iter_mut().filter(|c| !c.passed) {
        let code = policy_code(check.check);
        if let Some(policy) = policies.iter().find(|p| p.code == code) {
            check.detail = format!("{} [policy {}: {}]", check.detail, policy.code, policy.title);
        }
    }
}

fn policy_code(check: PolicyCheck) -> &'static str {
    match check {
        PolicyCheck::RoleAuthorization => "ROLE_AUTHORIZATION",
        PolicyCheck::AmountLimit => "AMOUNT_LIMIT",
        PolicyCheck::CustomerStatus => "CUSTOMER_STATUS",
        PolicyCheck::RateLimit => "RATE_LIMIT",
        PolicyCheck::BusinessHours => "BUSINESS_HOURS",
        PolicyCheck::Escalation => "ESCALATION",
    }
}

fn within_business_hours(config: &ComplianceConfig, now: DateTime<Utc>) -> bool {
    let local = now + Duration::minutes(config.business_tz_offset_minutes as i64);
    let weekday = matches!(
        local.weekday(),
        Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri
    );
    weekday && local.hour() >= config.business_open_hour && local.hour() < config.business_close_hour
}
