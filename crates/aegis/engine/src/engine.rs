//! The triage orchestrator.
//!
//! `execute` drives one alert through the fixed plan: every step runs
//! under the breaker and a per-step deadline, produces a redacted trace
//! and a `tool_update` event, and on failure either falls back
//! (non-critical) or aborts the pipeline (critical). The composed
//! decision is persisted set-once, finalized on the stream, and the
//! stream is closed. The orchestrator never surfaces raw step errors.

use crate::breaker::CircuitBreakerRegistry;
use crate::config::EngineConfig;
use crate::decision::compose;
use crate::runner::{run_step, StepOutcome};
use crate::{EngineError, EngineResult};
use aegis_agents::{AgentSet, RunContext};
use aegis_cache::{CacheError, KeyValueStore, RateLimiter};
use aegis_redact::redact_value;
use aegis_store::{AlertStore, RunStore, StoreError, TransactionStore, TriageStore};
use aegis_stream::{RunSubscription, StreamHub, StreamHubStats};
use aegis_types::{
    elapsed_ms, Alert, AlertStatus, AgentTrace, DeviceStats, EngineEvent, EngineEventType,
    KbLookup, MerchantStats, PatternFlags, RiskSignalsReport, RunState, RunStatus, StepDetail,
    StepName, StepOutput, Transaction, TriageAction, TriageRequest, TriageResult, TriageRun,
    VelocityStats, PLAN,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Orchestrates triage runs over the store, agents, cache, and stream.
pub struct TriageEngine {
    store: Arc<dyn TriageStore>,
    agents: AgentSet,
    breakers: Arc<CircuitBreakerRegistry>,
    hub: Arc<StreamHub>,
    limiter: Arc<RateLimiter>,
    /// Alert id -> run id for runs currently executing in this process.
    active: Mutex<HashMap<String, String>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    config: EngineConfig,
}

impl TriageEngine {
    /// Standard wiring: agents, limiter, breakers, and stream built from
    /// the store, key/value backend, and configuration.
    pub fn new<S>(store: Arc<S>, kv: Arc<dyn KeyValueStore>, config: EngineConfig) -> Self
    where
        S: TriageStore + 'static,
    {
        let limiter = Arc::new(RateLimiter::new(kv, config.rate_limit));
        let agents = AgentSet::standard(
            store.clone(),
            limiter.clone(),
            config.signals.clone(),
            config.compliance.clone(),
        );
        Self::with_agents(store, agents, limiter, config)
    }

    /// Wiring with an explicit agent set; tests use this to inject
    /// failing or slow steps.
    pub fn with_agents<S>(
        store: Arc<S>,
        agents: AgentSet,
        limiter: Arc<RateLimiter>,
        config: EngineConfig,
    ) -> Self
    where
        S: TriageStore + 'static,
    {
        Self {
            store,
            agents,
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit)),
            hub: Arc::new(StreamHub::new(config.stream)),
            limiter,
            active: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Execute one triage request to completion.
    pub async fn execute(&self, request: TriageRequest) -> EngineResult<TriageResult> {
        self.limiter
            .enforce(&request.client_id)
            .await
            .map_err(|e| match e {
                CacheError::RateLimited { retry_after_secs } => {
                    EngineError::RateLimited { retry_after_secs }
                }
                other => EngineError::Internal(other.to_string()),
            })?;

        let alert = self
            .store
            .get_alert(&request.alert_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("alert {}", request.alert_id)))?;
        if alert.customer_id != request.customer_id {
            return Err(EngineError::Validation(
                "alert does not belong to the given customer".to_string(),
            ));
        }
        if alert.suspect_txn_id != request.suspect_txn_id {
            return Err(EngineError::Validation(
                "suspect transaction does not match the alert".to_string(),
            ));
        }
        let suspect = self
            .store
            .get_transaction(&request.suspect_txn_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("transaction {}", request.suspect_txn_id))
            })?;

        // One active run per alert: consult both the persisted state and
        // this process's registry before creating the run.
        if let Some(existing) = self.store.find_active_run(&request.alert_id).await? {
            return Err(EngineError::Conflict {
                message: format!("alert {} already has an active run", request.alert_id),
                existing_run_id: existing.id,
            });
        }
        if let Some(existing) = self.lock_active().get(&request.alert_id).cloned() {
            return Err(EngineError::Conflict {
                message: format!("alert {} already has an active run", request.alert_id),
                existing_run_id: existing,
            });
        }

        let run_id = format!("run-{}", Uuid::new_v4());
        let correlation_id = format!("corr-{}", Uuid::new_v4());
        let started_at = Utc::now();

        match self
            .store
            .insert_run(TriageRun::started(&run_id, &request.alert_id, started_at))
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict(message)) => {
                let existing_run_id = self
                    .store
                    .find_active_run(&request.alert_id)
                    .await?
                    .map(|r| r.id)
                    .unwrap_or_default();
                return Err(EngineError::Conflict {
                    message,
                    existing_run_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let alert_id = request.alert_id.clone();
        self.lock_active().insert(alert_id.clone(), run_id.clone());
        self.lock_cancel().insert(run_id.clone(), cancel.clone());
        self.hub.open_run(&run_id);

        tracing::info!(
            run_id = %run_id,
            correlation_id = %correlation_id,
            alert_id = %alert_id,
            "triage run started"
        );

        let result = self
            .drive(&run_id, &correlation_id, request, alert, suspect, started_at, cancel)
            .await;

        if let Err(e) = &result {
            tracing::error!(
                run_id = %run_id,
                correlation_id = %correlation_id,
                kind = e.kind(),
                error = %e,
                "triage run failed"
            );
            self.emit(
                &run_id,
                EngineEventType::Error,
                json!({
                    "kind": e.kind(),
                    "message": "triage run failed",
                    "correlation_id": correlation_id,
                }),
            );
            // Close the run record best-effort so the alert is not wedged.
            let _ = self
                .store
                .finish_run(
                    &run_id,
                    None,
                    &[],
                    true,
                    elapsed_ms(started_at, Utc::now()),
                    Utc::now(),
                )
                .await;
            self.hub.complete(&run_id).await;
        }

        self.lock_active().remove(&alert_id);
        self.lock_cancel().remove(&run_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run_id: &str,
        correlation_id: &str,
        request: TriageRequest,
        alert: Alert,
        suspect: Transaction,
        started_at: chrono::DateTime<Utc>,
        cancel: Arc<AtomicBool>,
    ) -> EngineResult<TriageResult> {
        if alert.status == AlertStatus::Open {
            if let Err(e) = self
                .store
                .set_alert_status(&alert.id, AlertStatus::Investigating)
                .await
            {
                tracing::warn!(run_id, error = %e, "could not mark alert investigating");
            }
        }

        let mut ctx = RunContext::new(run_id, correlation_id, request, alert, suspect);
        self.emit(
            run_id,
            EngineEventType::PlanBuilt,
            json!({
                "correlation_id": correlation_id,
                "steps": PLAN.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            }),
        );

        let run_budget = Duration::from_millis(self.config.run_timeout_ms);
        let started = tokio::time::Instant::now();
        let mut fallback_used = false;
        let mut seq: i64 = 0;

        for step in PLAN {
            if cancel.load(Ordering::Relaxed) {
                fallback_used = true;
                tracing::info!(run_id, step = %step, "run cancelled, composing early");
                break;
            }
            let remaining = run_budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                fallback_used = true;
                tracing::warn!(run_id, "run budget exceeded, composing from available steps");
                break;
            }

            let agent = self
                .agents
                .get(step)
                .ok_or_else(|| EngineError::Internal(format!("no agent for step {step}")))?;
            let deadline = Duration::from_millis(self.config.agent_timeout_ms).min(remaining);

            let step_started = tokio::time::Instant::now();
            let outcome = run_step(&agent, &ctx, &self.breakers, deadline).await;
            let duration_ms = step_started.elapsed().as_millis() as i64;

            match outcome {
                StepOutcome::Ok(output) => {
                    let detail = redacted_detail(output.detail());
                    self.persist_trace(run_id, seq, step, true, duration_ms, detail.clone())
                        .await?;
                    self.emit(
                        run_id,
                        EngineEventType::ToolUpdate,
                        json!({
                            "seq": seq,
                            "step": step.as_str(),
                            "ok": true,
                            "duration_ms": duration_ms,
                            "detail": serde_json::to_value(&detail).unwrap_or_default(),
                        }),
                    );
                    ctx.absorb(output);
                }
                failure => {
                    let error_text = failure.failure_text().unwrap_or_default();
                    tracing::warn!(
                        run_id,
                        step = %step,
                        error = %error_text,
                        "pipeline step failed"
                    );
                    let detail = redacted_detail(StepDetail::Failure {
                        error: error_text.clone(),
                    });
                    self.persist_trace(run_id, seq, step, false, duration_ms, detail)
                        .await?;
                    self.emit(
                        run_id,
                        EngineEventType::ToolUpdate,
                        json!({
                            "seq": seq,
                            "step": step.as_str(),
                            "ok": false,
                            "duration_ms": duration_ms,
                            "error": error_text,
                        }),
                    );
                    fallback_used = true;

                    if step.is_critical() {
                        seq += 1;
                        tracing::warn!(run_id, step = %step, "critical step failed, aborting pipeline");
                        break;
                    }

                    let reason = fallback_reason(step);
                    self.emit(
                        run_id,
                        EngineEventType::FallbackTriggered,
                        json!({"failed_step": step.as_str(), "reason": reason}),
                    );
                    if let Some(substitute) = fallback_output(step) {
                        ctx.absorb(substitute);
                    }
                }
            }
            seq += 1;
        }

        let decision = compose(&ctx, fallback_used);

        // Best-effort closing summary; never traced, never fatal.
        let summary = match self.agents.get(StepName::Summarize) {
            Some(agent) => {
                let deadline = Duration::from_millis(self.config.agent_timeout_ms);
                match run_step(&agent, &ctx, &self.breakers, deadline).await {
                    StepOutcome::Ok(StepOutput::Summary(summary)) => Some(summary),
                    _ => Some(aegis_agents::fallback_summary()),
                }
            }
            None => None,
        };

        let ended_at = Utc::now();
        let latency_ms = elapsed_ms(started_at, ended_at);
        self.store
            .finish_run(
                run_id,
                Some(decision.risk),
                &decision.reasons,
                fallback_used,
                latency_ms,
                ended_at,
            )
            .await?;

        self.emit(
            run_id,
            EngineEventType::DecisionFinalized,
            json!({
                "risk": decision.risk.as_str(),
                "proposed_action": decision.proposed_action.as_str(),
                "confidence": decision.confidence,
                "fallback_used": fallback_used,
                "reasons": decision.reasons,
                "citations": decision.citations,
                "latency_ms": latency_ms,
                "correlation_id": correlation_id,
            }),
        );
        self.hub.complete(run_id).await;

        tracing::info!(
            run_id,
            risk = decision.risk.as_str(),
            action = decision.proposed_action.as_str(),
            fallback_used,
            latency_ms,
            "triage run finished"
        );

        Ok(TriageResult {
            run_id: run_id.to_string(),
            correlation_id: correlation_id.to_string(),
            risk: decision.risk,
            proposed_action: decision.proposed_action,
            confidence: decision.confidence,
            reasons: decision.reasons,
            citations: decision.citations,
            fallback_used,
            latency_ms,
            proposal: ctx.proposal.clone(),
            summary,
        })
    }

    /// Status fetch backed entirely by persisted state.
    pub async fn status(&self, run_id: &str) -> EngineResult<RunStatus> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
        let traces = self.store.traces_for_run(run_id).await?;
        Ok(RunStatus {
            run_id: run.id,
            status: if run.ended_at.is_some() {
                RunState::Completed
            } else {
                RunState::Running
            },
            started_at: run.started_at,
            ended_at: run.ended_at,
            risk: run.risk,
            reasons: run.reasons,
            fallback_used: run.fallback_used,
            latency_ms: run.latency_ms,
            traces,
        })
    }

    /// Subscribe to a run's event stream; `None` once the run completed.
    pub fn subscribe(&self, run_id: &str) -> Option<RunSubscription> {
        self.hub.subscribe(run_id)
    }

    /// Request cooperative cancellation of an in-flight run.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.lock_cancel().get(run_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn stream_stats(&self) -> StreamHubStats {
        self.hub.stats()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    async fn persist_trace(
        &self,
        run_id: &str,
        seq: i64,
        step: StepName,
        ok: bool,
        duration_ms: i64,
        detail: StepDetail,
    ) -> EngineResult<()> {
        self.store
            .append_trace(AgentTrace::new(run_id, seq, step, ok, duration_ms, detail))
            .await?;
        Ok(())
    }

    fn emit(&self, run_id: &str, event_type: EngineEventType, data: serde_json::Value) {
        self.hub.publish(EngineEvent::new(event_type, run_id, data));
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        match self.cancel_flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// Round-trip the detail through JSON so every string leaf passes the
// redactor before persistence.
fn redacted_detail(detail: StepDetail) -> StepDetail {
    match serde_json::to_value(&detail) {
        Ok(mut value) => {
            redact_value(&mut value);
            serde_json::from_value(value).unwrap_or(detail)
        }
        Err(_) => detail,
    }
}

/// Deterministic substitute for a failed non-critical step.
fn fallback_output(step: StepName) -> Option<StepOutput> {
    match step {
        StepName::RiskSignals => Some(StepOutput::RiskSignals(RiskSignalsReport {
            score: 50,
            velocity: VelocityStats {
                txns_24h: 0,
                amount_24h_minor: 0,
                daily_avg_txns: 0.0,
                daily_avg_amount_minor: 0.0,
            },
            device: DeviceStats {
                new_device: false,
                device_changes: 0,
            },
            merchant: MerchantStats {
                new_merchant: false,
                risk_score: 0,
            },
            patterns: PatternFlags {
                unusual_time: false,
                unusual_location: false,
                velocity_spike: false,
            },
            reasons: vec!["risk_analysis_unavailable".to_string()],
            suggested_action: TriageAction::Monitor,
        })),
        StepName::KbLookup => Some(StepOutput::KbLookup(KbLookup {
            results: Vec::new(),
            citations: vec!["Fallback: Manual review recommended".to_string()],
        })),
        _ => None,
    }
}

fn fallback_reason(step: StepName) -> &'static str {
    match step {
        StepName::RiskSignals => "risk_analysis_unavailable",
        StepName::KbLookup => "knowledge_base_unavailable",
        _ => "Service unavailable",
    }
}
