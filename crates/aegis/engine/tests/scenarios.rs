//! End-to-end engine scenarios over the in-memory store.

use aegis_agents::{
    AgentError, AgentResult, AgentSet, ProfileAgent, RunContext, StepAgent,
};
use aegis_cache::{MemoryKv, RateLimiter, RateLimiterConfig};
use aegis_engine::{EngineConfig, EngineError, TriageEngine};
use aegis_store::{
    AlertStore, CustomerStore, MemoryTriageStore, RunStore, TransactionStore,
};
use aegis_types::{
    Account, Alert, AlertStatus, AnalystRole, Card, CardStatus, Customer, EngineEventType,
    KycLevel, RiskLevel, RunState, StepName, StepOutput, Transaction, TriageAction, TriageRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

fn base_ts() -> DateTime<Utc> {
    // Wednesday.
    Utc.with_ymd_and_hms(2025, 6, 11, 14, 30, 0).unwrap()
}

fn suspect_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 11, 2, 0, 0).unwrap()
}

fn request(role: AnalystRole) -> TriageRequest {
    TriageRequest {
        alert_id: "alert-0001".to_string(),
        customer_id: "cust-0001".to_string(),
        suspect_txn_id: "txn-suspect".to_string(),
        role,
        client_id: "analyst-7".to_string(),
    }
}

async fn seed_customer(store: &Arc<MemoryTriageStore>) {
    store
        .upsert_customer(Customer {
            id: "cust-0001".to_string(),
            name: "Avery Stone".to_string(),
            email_masked: "av***@bank.example".to_string(),
            kyc_level: KycLevel::Verified,
            created_at: base_ts() - Duration::days(400),
        })
        .await
        .unwrap();
    store
        .insert_card(Card {
            id: "card-0001".to_string(),
            customer_id: "cust-0001".to_string(),
            last4: "4242".to_string(),
            network: "visa".to_string(),
            status: CardStatus::Active,
            created_at: base_ts() - Duration::days(400),
        })
        .await
        .unwrap();
    store
        .insert_account(Account {
            id: "acct-0001".to_string(),
            customer_id: "cust-0001".to_string(),
            balance_minor: 500_000,
            currency: "USD".to_string(),
        })
        .await
        .unwrap();
}

async fn seed_alert(store: &Arc<MemoryTriageStore>, suspect: Transaction) {
    store.insert_transaction(suspect).await.unwrap();
    store
        .insert_alert(Alert {
            id: "alert-0001".to_string(),
            customer_id: "cust-0001".to_string(),
            suspect_txn_id: "txn-suspect".to_string(),
            risk: RiskLevel::Medium,
            status: AlertStatus::Open,
            created_at: suspect_ts(),
        })
        .await
        .unwrap();
}

/// Steady customer: three transactions a day for 90 days at familiar
/// hours, one merchant, one device, one city. Suspect is a small charge
/// at 02:00.
async fn seed_quiet_world(store: &Arc<MemoryTriageStore>) {
    seed_customer(store).await;
    for d in 1..=90i64 {
        for k in 0..3i64 {
            let txn = Transaction::new(
                format!("hist-{d}-{k}"),
                "cust-0001",
                "card-0001",
                "5411",
                "GROCER",
                10_000 + d * 10 + k,
                base_ts() - Duration::days(d) + Duration::hours(k * 2),
            )
            .with_device("device-known")
            .with_location("US", "Portland");
            store.insert_transaction(txn).await.unwrap();
        }
    }
    let suspect = Transaction::new(
        "txn-suspect",
        "cust-0001",
        "card-0001",
        "5411",
        "GROCER",
        12_000,
        suspect_ts(),
    )
    .with_device("device-known")
    .with_location("US", "Portland");
    seed_alert(store, suspect).await;
}

/// Sparse history with a 24 h burst; suspect is a large charge on a new
/// device at a new merchant in an unseen city.
async fn seed_burst_world(store: &Arc<MemoryTriageStore>) {
    seed_customer(store).await;
    for d in 2..=60i64 {
        for k in 0..2i64 {
            let txn = Transaction::new(
                format!("hist-{d}-{k}"),
                "cust-0001",
                "card-0001",
                "5411",
                "GROCER",
                5_000 + d * 10 + k,
                base_ts() - Duration::days(d) + Duration::hours(k * 2),
            )
            .with_device("device-known")
            .with_location("US", "Portland");
            store.insert_transaction(txn).await.unwrap();
        }
    }
    for i in 0..20i64 {
        let txn = Transaction::new(
            format!("burst-{i}"),
            "cust-0001",
            "card-0001",
            "5411",
            "GROCER",
            9_000 + i,
            suspect_ts() - Duration::minutes((i + 1) * 30),
        )
        .with_device("device-known")
        .with_location("US", "Portland");
        store.insert_transaction(txn).await.unwrap();
    }
    let suspect = Transaction::new(
        "txn-suspect",
        "cust-0001",
        "card-0001",
        "5999",
        "LUXE IMPORTS",
        180_000,
        suspect_ts(),
    )
    .with_device("device-new")
    .with_location("RO", "Bucharest");
    seed_alert(store, suspect).await;
}

fn build_engine(
    store: Arc<MemoryTriageStore>,
    config: EngineConfig,
    faults: Vec<Arc<dyn StepAgent>>,
) -> Arc<TriageEngine> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let kv = Arc::new(MemoryKv::new());
    let limiter = Arc::new(RateLimiter::new(kv, config.rate_limit));
    let mut agents = AgentSet::standard(
        store.clone(),
        limiter.clone(),
        config.signals.clone(),
        config.compliance.clone(),
    );
    for agent in faults {
        agents.insert(agent);
    }
    Arc::new(TriageEngine::with_agents(store, agents, limiter, config))
}

struct FailingAgent {
    step: StepName,
}

#[async_trait]
impl StepAgent for FailingAgent {
    fn step(&self) -> StepName {
        self.step
    }
    async fn run(&self, _ctx: &RunContext) -> AgentResult<StepOutput> {
        Err(AgentError::Internal("injected failure".to_string()))
    }
}

struct SlowAgent {
    step: StepName,
}

#[async_trait]
impl StepAgent for SlowAgent {
    fn step(&self) -> StepName {
        self.step
    }
    async fn run(&self, _ctx: &RunContext) -> AgentResult<StepOutput> {
        tokio::time::sleep(std::time::Duration::from_millis(2_000)).await;
        Err(AgentError::Internal("never reached".to_string()))
    }
}

/// Delegates to the real profile agent after the test opens the gate.
struct GatedProfileAgent {
    inner: ProfileAgent,
    gate: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl StepAgent for GatedProfileAgent {
    fn step(&self) -> StepName {
        StepName::GetProfile
    }
    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput> {
        self.gate.notified().await;
        self.inner.run(ctx).await
    }
}

// ── S1: happy path ───────────────────────────────────────────────────

#[tokio::test]
async fn quiet_customer_resolves_low_risk_false_positive() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let engine = build_engine(store.clone(), EngineConfig::default(), vec![]);

    let result = engine.execute(request(AnalystRole::Agent)).await.unwrap();

    assert_eq!(result.risk, RiskLevel::Low);
    assert_eq!(result.proposed_action, TriageAction::FalsePositive);
    assert!(!result.fallback_used);
    assert!(result.summary.is_some());

    let status = engine.status(&result.run_id).await.unwrap();
    assert_eq!(status.status, RunState::Completed);
    assert_eq!(status.traces.len(), 6);
    assert!(status.traces.iter().all(|t| t.ok));
    for (i, trace) in status.traces.iter().enumerate() {
        assert_eq!(trace.seq, i as i64);
    }
    assert!(status.latency_ms.is_some());
}

// ── S2: velocity burst, lead role ────────────────────────────────────

#[tokio::test]
async fn burst_resolves_high_risk_freeze_with_otp() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_burst_world(&store).await;
    let engine = build_engine(store.clone(), EngineConfig::default(), vec![]);

    let result = engine.execute(request(AnalystRole::Lead)).await.unwrap();

    assert_eq!(result.risk, RiskLevel::High);
    assert_eq!(result.proposed_action, TriageAction::FreezeCard);
    assert!(!result.fallback_used);
    assert_eq!(result.confidence, 95);

    let proposal = result.proposal.expect("proposal present");
    assert!(proposal.approved, "blocked by {:?}", proposal.blocked_by);
    assert!(proposal.requires_otp);
    assert!(!result.reasons.is_empty());
}

// ── S3: non-critical step times out ──────────────────────────────────

#[tokio::test(start_paused = true)]
async fn risk_signals_timeout_falls_back_to_medium() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let engine = build_engine(
        store.clone(),
        EngineConfig::default(),
        vec![Arc::new(SlowAgent {
            step: StepName::RiskSignals,
        }) as Arc<dyn StepAgent>],
    );

    let result = engine.execute(request(AnalystRole::Agent)).await.unwrap();

    assert_eq!(result.risk, RiskLevel::Medium);
    assert_eq!(result.proposed_action, TriageAction::OpenDispute);
    assert!(result.fallback_used);
    assert_eq!(result.confidence, 35);
    assert_eq!(result.reasons, vec!["risk_analysis_unavailable".to_string()]);

    let status = engine.status(&result.run_id).await.unwrap();
    assert_eq!(status.traces.len(), 6);
    let signals_trace = &status.traces[2];
    assert_eq!(signals_trace.step, StepName::RiskSignals);
    assert!(!signals_trace.ok);
    assert!(status.traces.iter().filter(|t| !t.ok).count() == 1);
}

// ── S4: critical step fails ──────────────────────────────────────────

#[tokio::test]
async fn profile_failure_aborts_to_safe_defaults() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let engine = build_engine(
        store.clone(),
        EngineConfig::default(),
        vec![Arc::new(FailingAgent {
            step: StepName::GetProfile,
        }) as Arc<dyn StepAgent>],
    );

    let result = engine.execute(request(AnalystRole::Agent)).await.unwrap();

    assert_eq!(result.risk, RiskLevel::Low);
    assert_eq!(result.proposed_action, TriageAction::FalsePositive);
    assert!(result.fallback_used);

    let status = engine.status(&result.run_id).await.unwrap();
    assert_eq!(status.traces.len(), 1);
    assert_eq!(status.traces[0].seq, 0);
    assert!(!status.traces[0].ok);
    assert_eq!(status.status, RunState::Completed);
}

// ── Fallback demotion ────────────────────────────────────────────────

#[tokio::test]
async fn kb_fallback_demotes_high_to_medium() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_burst_world(&store).await;
    let engine = build_engine(
        store.clone(),
        EngineConfig::default(),
        vec![Arc::new(FailingAgent {
            step: StepName::KbLookup,
        }) as Arc<dyn StepAgent>],
    );

    let result = engine.execute(request(AnalystRole::Lead)).await.unwrap();

    // The signals still score high, but a substituted step caps severity.
    assert!(result.fallback_used);
    assert_eq!(result.risk, RiskLevel::Medium);
    assert_eq!(result.confidence, 70);
    assert!(result
        .citations
        .contains(&"Fallback: Manual review recommended".to_string()));
}

// ── Conflict on concurrent runs ──────────────────────────────────────

#[tokio::test]
async fn second_start_for_same_alert_conflicts() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let gate = Arc::new(tokio::sync::Notify::new());
    let engine = build_engine(
        store.clone(),
        EngineConfig::default(),
        vec![Arc::new(GatedProfileAgent {
            inner: ProfileAgent::new(store.clone()),
            gate: gate.clone(),
        }) as Arc<dyn StepAgent>],
    );

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(request(AnalystRole::Agent)).await }
    });

    // Wait until the first run is registered.
    let active = loop {
        if let Some(run) = store.find_active_run("alert-0001").await.unwrap() {
            break run;
        }
        tokio::task::yield_now().await;
    };

    let err = engine
        .execute(request(AnalystRole::Agent))
        .await
        .expect_err("second start must conflict");
    match err {
        EngineError::Conflict {
            existing_run_id, ..
        } => assert_eq!(existing_run_id, active.id),
        other => panic!("expected conflict, got {other:?}"),
    }

    gate.notify_one();
    first.await.unwrap().unwrap();
}

// ── S5: rate limiting at the engine edge ─────────────────────────────

#[tokio::test]
async fn sixth_start_in_window_is_rate_limited() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let config = EngineConfig {
        rate_limit: RateLimiterConfig {
            window_ms: 60_000,
            max_requests: 5,
        },
        ..EngineConfig::default()
    };
    let engine = build_engine(store.clone(), config, vec![]);

    for _ in 0..5 {
        engine.execute(request(AnalystRole::Agent)).await.unwrap();
    }
    match engine.execute(request(AnalystRole::Agent)).await {
        Err(EngineError::RateLimited { retry_after_secs }) => {
            assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

// ── Stream ordering ──────────────────────────────────────────────────

#[tokio::test]
async fn subscribers_see_events_in_emit_order_with_single_finalize() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let gate = Arc::new(tokio::sync::Notify::new());
    let engine = build_engine(
        store.clone(),
        EngineConfig::default(),
        vec![Arc::new(GatedProfileAgent {
            inner: ProfileAgent::new(store.clone()),
            gate: gate.clone(),
        }) as Arc<dyn StepAgent>],
    );

    let run_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(request(AnalystRole::Agent)).await }
    });
    let active = loop {
        if let Some(run) = store.find_active_run("alert-0001").await.unwrap() {
            break run;
        }
        tokio::task::yield_now().await;
    };
    let mut sub = engine.subscribe(&active.id).expect("stream open");
    gate.notify_one();

    let mut events = Vec::new();
    while let Some(event) = sub.recv().await {
        events.push(event);
    }

    assert_eq!(events[0].event_type, EngineEventType::Connected);
    let finalized = events
        .iter()
        .filter(|e| e.event_type == EngineEventType::DecisionFinalized)
        .count();
    assert_eq!(finalized, 1);
    assert_eq!(
        events.last().unwrap().event_type,
        EngineEventType::Completed
    );

    // tool_update sequence numbers are strictly increasing.
    let seqs: Vec<i64> = events
        .iter()
        .filter(|e| e.event_type == EngineEventType::ToolUpdate)
        .map(|e| e.data["seq"].as_i64().unwrap())
        .collect();
    for pair in seqs.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    run_task.await.unwrap().unwrap();
}

// ── Cancellation ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_run_persists_terminal_state() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let gate = Arc::new(tokio::sync::Notify::new());
    let engine = build_engine(
        store.clone(),
        EngineConfig::default(),
        vec![Arc::new(GatedProfileAgent {
            inner: ProfileAgent::new(store.clone()),
            gate: gate.clone(),
        }) as Arc<dyn StepAgent>],
    );

    let run_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(request(AnalystRole::Agent)).await }
    });
    let active = loop {
        if let Some(run) = store.find_active_run("alert-0001").await.unwrap() {
            break run;
        }
        tokio::task::yield_now().await;
    };

    assert!(engine.cancel(&active.id));
    gate.notify_one();

    let result = run_task.await.unwrap().unwrap();
    assert!(result.fallback_used);

    let status = engine.status(&result.run_id).await.unwrap();
    assert_eq!(status.status, RunState::Completed);
    // Only the gated profile step ran before the cancellation check.
    assert_eq!(status.traces.len(), 1);
}

// ── Validation and redaction ─────────────────────────────────────────

#[tokio::test]
async fn unknown_alert_is_not_found() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_customer(&store).await;
    let engine = build_engine(store, EngineConfig::default(), vec![]);

    match engine.execute(request(AnalystRole::Agent)).await {
        Err(EngineError::NotFound(message)) => assert!(message.contains("alert-0001")),
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn persisted_trace_details_are_redaction_fixpoints() {
    let store = Arc::new(MemoryTriageStore::new());
    seed_quiet_world(&store).await;
    let engine = build_engine(store.clone(), EngineConfig::default(), vec![]);
    let result = engine.execute(request(AnalystRole::Agent)).await.unwrap();

    let traces = store.traces_for_run(&result.run_id).await.unwrap();
    assert_eq!(traces.len(), 6);
    for trace in traces {
        let value = serde_json::to_value(&trace.detail).unwrap();
        assert_redacted(&value);
    }
}

fn assert_redacted(value: &serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            assert_eq!(aegis_redact::redact_str(s).as_ref(), s.as_str());
        }
        serde_json::Value::Array(items) => items.iter().for_each(assert_redacted),
        serde_json::Value::Object(map) => map.values().for_each(assert_redacted),
        _ => {}
    }
}
