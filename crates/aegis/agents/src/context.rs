//! Accumulated run context threaded through the pipeline.

use aegis_types::{
    ActionProposal, Alert, AnalystRole, InsightsReport, KbLookup, ProfileSnapshot, RecentActivity,
    RiskSignalsReport, StepOutput, Transaction, TriageRequest,
};

/// Everything a step may read: the request, the alert and suspect
/// transaction resolved up front, and the outputs of earlier steps.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub correlation_id: String,
    pub request: TriageRequest,
    pub alert: Alert,
    pub suspect: Transaction,
    pub profile: Option<ProfileSnapshot>,
    pub recent: Option<RecentActivity>,
    pub signals: Option<RiskSignalsReport>,
    pub kb: Option<KbLookup>,
    pub insights: Option<InsightsReport>,
    pub proposal: Option<ActionProposal>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        correlation_id: impl Into<String>,
        request: TriageRequest,
        alert: Alert,
        suspect: Transaction,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            correlation_id: correlation_id.into(),
            request,
            alert,
            suspect,
            profile: None,
            recent: None,
            signals: None,
            kb: None,
            insights: None,
            proposal: None,
        }
    }

    pub fn role(&self) -> AnalystRole {
        self.request.role
    }

    /// Fold a completed step's output back into the context so later
    /// steps can consume it.
    pub fn absorb(&mut self, output: StepOutput) {
        match output {
            StepOutput::Profile(p) => self.profile = Some(p),
            StepOutput::RecentTx(r) => self.recent = Some(r),
            StepOutput::RiskSignals(s) => self.signals = Some(s),
            StepOutput::KbLookup(k) => self.kb = Some(k),
            StepOutput::Decision(d) => self.insights = Some(d),
            StepOutput::Proposal(p) => self.proposal = Some(p),
            StepOutput::Summary(_) => {}
        }
    }

    /// Composite score as seen so far; the substituted fallback score when
    /// the signals step failed.
    pub fn score(&self) -> u8 {
        self.signals.as_ref().map(|s| s.score).unwrap_or(0)
    }
}
