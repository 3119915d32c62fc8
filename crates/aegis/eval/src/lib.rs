//! Evaluation families over persisted triage state.
//!
//! Read-only analytics with no authority: each family replays what the
//! store already knows and produces a scored report. Four families cover
//! detection quality, pipeline health, retrieval usefulness, and case
//! hygiene.

#![deny(unsafe_code)]

use aegis_store::{AlertStore, CaseStore, RunStore, StoreError, TriageStore};
use aegis_types::{CaseType, RiskLevel, StepDetail, StepName};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Result type for evaluations.
pub type EvalResult<T> = Result<T, EvalError>;

/// Evaluation errors.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How many records each family scans at most.
const SCAN_LIMIT: usize = 1_000;

/// How many failure descriptions a report retains.
const TOP_FAILURES: usize = 5;

/// Rows are actual risk (low, medium, high); columns are predicted.
pub type ConfusionMatrix = [[u64; 3]; 3];

/// One evaluation family's report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub id: String,
    pub name: String,
    pub test_cases: usize,
    pub passed: usize,
    pub failed: usize,
    /// passed / test_cases, 0.0 when nothing was scanned.
    pub accuracy: f64,
    pub confusion_matrix: ConfusionMatrix,
    pub top_failures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_metrics: Option<serde_json::Value>,
}

fn finish_report(
    name: &str,
    passed: usize,
    failed: usize,
    confusion_matrix: ConfusionMatrix,
    mut top_failures: Vec<String>,
    additional_metrics: Option<serde_json::Value>,
) -> EvalReport {
    let test_cases = passed + failed;
    top_failures.truncate(TOP_FAILURES);
    EvalReport {
        id: format!("eval-{}", Uuid::new_v4()),
        name: name.to_string(),
        test_cases,
        passed,
        failed,
        accuracy: if test_cases == 0 {
            0.0
        } else {
            passed as f64 / test_cases as f64
        },
        confusion_matrix,
        top_failures,
        additional_metrics,
    }
}

fn level_index(level: RiskLevel) -> usize {
    match level {
        RiskLevel::Low => 0,
        RiskLevel::Medium => 1,
        RiskLevel::High => 2,
    }
}

/// Runs the evaluation families against a store.
pub struct EvalHarness {
    store: Arc<dyn TriageStore>,
}

impl EvalHarness {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: TriageStore + 'static,
    {
        Self { store }
    }

    /// All four families, in a stable order.
    pub async fn run_all(&self) -> EvalResult<Vec<EvalReport>> {
        Ok(vec![
            self.fraud_detection().await?,
            self.agent_performance().await?,
            self.knowledge_base().await?,
            self.case_handling().await?,
        ])
    }

    /// Compare finished runs against the alert's risk as ground truth.
    pub async fn fraud_detection(&self) -> EvalResult<EvalReport> {
        let runs = self.store.list_runs(SCAN_LIMIT).await?;
        let mut passed = 0;
        let mut failed = 0;
        let mut matrix: ConfusionMatrix = [[0; 3]; 3];
        let mut failures = Vec::new();

        for run in runs {
            let Some(predicted) = run.risk else {
                continue;
            };
            let Some(alert) = self.store.get_alert(&run.alert_id).await? else {
                continue;
            };
            let actual = alert.risk;
            matrix[level_index(actual)][level_index(predicted)] += 1;
            if actual == predicted {
                passed += 1;
            } else {
                failed += 1;
                failures.push(format!(
                    "run {} predicted {} for alert {} labelled {}",
                    run.id,
                    predicted.as_str(),
                    alert.id,
                    actual.as_str()
                ));
            }
        }

        Ok(finish_report(
            "fraud_detection",
            passed,
            failed,
            matrix,
            failures,
            None,
        ))
    }

    /// Per-step success rates, latencies, and fallback frequency.
    pub async fn agent_performance(&self) -> EvalResult<EvalReport> {
        let runs = self.store.list_runs(SCAN_LIMIT).await?;
        let mut passed = 0;
        let mut failed = 0;
        let mut failures = Vec::new();
        let mut fallback_runs = 0u64;
        let mut per_step: HashMap<StepName, (u64, u64, i64)> = HashMap::new();

        for run in &runs {
            if run.fallback_used {
                fallback_runs += 1;
            }
            for trace in self.store.traces_for_run(&run.id).await? {
                let entry = per_step.entry(trace.step).or_insert((0, 0, 0));
                entry.2 += trace.duration_ms;
                if trace.ok {
                    entry.0 += 1;
                    passed += 1;
                } else {
                    entry.1 += 1;
                    failed += 1;
                    failures.push(format!(
                        "run {} step {} failed after {}ms",
                        run.id, trace.step, trace.duration_ms
                    ));
                }
            }
        }

        let steps_json: serde_json::Value = per_step
            .iter()
            .map(|(step, (ok, not_ok, total_ms))| {
                let total = ok + not_ok;
                (
                    step.as_str().to_string(),
                    json!({
                        "invocations": total,
                        "success_rate": if total == 0 { 0.0 } else { *ok as f64 / total as f64 },
                        "avg_duration_ms": if total == 0 { 0.0 } else { *total_ms as f64 / total as f64 },
                    }),
                )
            })
            .collect::<serde_json::Map<String, serde_json::Value>>()
            .into();

        Ok(finish_report(
            "agent_performance",
            passed,
            failed,
            [[0; 3]; 3],
            failures,
            Some(json!({
                "runs_scanned": runs.len(),
                "fallback_runs": fallback_runs,
                "steps": steps_json,
            })),
        ))
    }

    /// How often the kb-lookup step actually surfaced material.
    pub async fn knowledge_base(&self) -> EvalResult<EvalReport> {
        let runs = self.store.list_runs(SCAN_LIMIT).await?;
        let mut passed = 0;
        let mut failed = 0;
        let mut failures = Vec::new();
        let mut total_results = 0u64;

        for run in &runs {
            for trace in self.store.traces_for_run(&run.id).await? {
                if trace.step != StepName::KbLookup {
                    continue;
                }
                match &trace.detail {
                    StepDetail::KbLookup {
                        result_count,
                        citations,
                    } => {
                        total_results += *result_count as u64;
                        if *result_count > 0 || !citations.is_empty() {
                            passed += 1;
                        } else {
                            failed += 1;
                            failures.push(format!("run {} kb lookup found nothing", run.id));
                        }
                    }
                    _ => {
                        failed += 1;
                        failures.push(format!("run {} kb lookup did not complete", run.id));
                    }
                }
            }
        }

        Ok(finish_report(
            "knowledge_base",
            passed,
            failed,
            [[0; 3]; 3],
            failures,
            Some(json!({"total_results": total_results})),
        ))
    }

    /// Case hygiene: every case carries a coherent first event.
    pub async fn case_handling(&self) -> EvalResult<EvalReport> {
        let cases = self.store.list_cases(SCAN_LIMIT).await?;
        let mut passed = 0;
        let mut failed = 0;
        let mut failures = Vec::new();
        let mut by_type: HashMap<&'static str, u64> = HashMap::new();

        for case in &cases {
            *by_type.entry(case.case_type.as_str()).or_insert(0) += 1;
            let events = self.store.events_for_case(&case.id).await?;

            let contiguous = events
                .iter()
                .enumerate()
                .all(|(i, e)| e.seq == i as i64);
            let first_matches = events
                .first()
                .map(|e| e.action == expected_first_action(case.case_type))
                .unwrap_or(false);

            if !events.is_empty() && contiguous && first_matches {
                passed += 1;
            } else {
                failed += 1;
                failures.push(format!(
                    "case {} ({}) has an inconsistent event log",
                    case.id,
                    case.case_type.as_str()
                ));
            }
        }

        Ok(finish_report(
            "case_handling",
            passed,
            failed,
            [[0; 3]; 3],
            failures,
            Some(json!({"cases_by_type": by_type})),
        ))
    }
}

fn expected_first_action(case_type: CaseType) -> &'static str {
    match case_type {
        CaseType::CardFreeze => "CARD_FROZEN",
        CaseType::Dispute => "DISPUTE_OPENED",
        CaseType::ContactCustomer => "CUSTOMER_CONTACTED",
        CaseType::FalsePositive => "MARKED_FALSE_POSITIVE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_store::{ActionStore, CaseEventAppend, CustomerStore, MemoryTriageStore, TransactionStore};
    use aegis_types::{
        AgentTrace, Alert, AlertStatus, Case, CaseStatus, Customer, KycLevel, Transaction,
        TriageRun,
    };
    use chrono::Utc;

    async fn seed_runs(store: &Arc<MemoryTriageStore>) {
        for (i, (actual, predicted)) in [
            (RiskLevel::High, RiskLevel::High),
            (RiskLevel::High, RiskLevel::Medium),
            (RiskLevel::Low, RiskLevel::Low),
            (RiskLevel::Medium, RiskLevel::Medium),
        ]
        .into_iter()
        .enumerate()
        {
            let alert_id = format!("alert-{i}");
            let txn_id = format!("txn-{i}");
            store
                .insert_transaction(Transaction::new(
                    &txn_id,
                    "cust-0001",
                    "card-0001",
                    "5411",
                    "GROCER",
                    1_000 + i as i64,
                    Utc::now(),
                ))
                .await
                .unwrap();
            store
                .insert_alert(Alert {
                    id: alert_id.clone(),
                    customer_id: "cust-0001".to_string(),
                    suspect_txn_id: txn_id,
                    risk: actual,
                    status: AlertStatus::Open,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();

            let run_id = format!("run-{i}");
            store
                .insert_run(TriageRun::started(&run_id, &alert_id, Utc::now()))
                .await
                .unwrap();
            store
                .append_trace(AgentTrace::new(
                    &run_id,
                    0,
                    StepName::KbLookup,
                    true,
                    12,
                    StepDetail::KbLookup {
                        result_count: if i % 2 == 0 { 2 } else { 0 },
                        citations: vec![],
                    },
                ))
                .await
                .unwrap();
            store
                .finish_run(&run_id, Some(predicted), &[], i == 1, 50, Utc::now())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fraud_detection_builds_confusion_matrix() {
        let store = Arc::new(MemoryTriageStore::new());
        seed_runs(&store).await;
        let harness = EvalHarness::new(store);

        let report = harness.fraud_detection().await.unwrap();
        assert_eq!(report.name, "fraud_detection");
        assert_eq!(report.test_cases, 4);
        assert_eq!(report.passed, 3);
        assert_eq!(report.failed, 1);
        assert!((report.accuracy - 0.75).abs() < 1e-9);
        // One high alert predicted medium.
        assert_eq!(report.confusion_matrix[2][1], 1);
        assert_eq!(report.confusion_matrix[2][2], 1);
        assert_eq!(report.top_failures.len(), 1);
    }

    #[tokio::test]
    async fn agent_performance_aggregates_steps() {
        let store = Arc::new(MemoryTriageStore::new());
        seed_runs(&store).await;
        let harness = EvalHarness::new(store);

        let report = harness.agent_performance().await.unwrap();
        assert_eq!(report.test_cases, 4);
        assert_eq!(report.failed, 0);
        let metrics = report.additional_metrics.unwrap();
        assert_eq!(metrics["fallback_runs"], 1);
        assert_eq!(metrics["steps"]["kb_lookup"]["invocations"], 4);
    }

    #[tokio::test]
    async fn knowledge_base_measures_hit_rate() {
        let store = Arc::new(MemoryTriageStore::new());
        seed_runs(&store).await;
        let harness = EvalHarness::new(store);

        let report = harness.knowledge_base().await.unwrap();
        assert_eq!(report.test_cases, 4);
        assert_eq!(report.passed, 2);
        assert!((report.accuracy - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn case_handling_checks_event_coherence() {
        let store = Arc::new(MemoryTriageStore::new());
        store
            .upsert_customer(Customer {
                id: "cust-0001".to_string(),
                name: "Avery Stone".to_string(),
                email_masked: "av***@bank.example".to_string(),
                kyc_level: KycLevel::Verified,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .insert_alert(Alert {
                id: "alert-0001".to_string(),
                customer_id: "cust-0001".to_string(),
                suspect_txn_id: "txn-0001".to_string(),
                risk: RiskLevel::Low,
                status: AlertStatus::Open,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .apply_false_positive(
                Case {
                    id: "case-0001".to_string(),
                    customer_id: "cust-0001".to_string(),
                    txn_id: None,
                    case_type: CaseType::FalsePositive,
                    status: CaseStatus::ClosedFalsePositive,
                    reason_code: "FALSE_POSITIVE".to_string(),
                    created_at: Utc::now(),
                },
                CaseEventAppend::new(
                    "case-0001",
                    "analyst-7",
                    "MARKED_FALSE_POSITIVE",
                    serde_json::json!({}),
                ),
                "alert-0001",
            )
            .await
            .unwrap();

        let harness = EvalHarness::new(store);
        let report = harness.case_handling().await.unwrap();
        assert_eq!(report.test_cases, 1);
        assert_eq!(report.passed, 1);
        assert!((report.accuracy - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn run_all_returns_four_families_in_order() {
        let store = Arc::new(MemoryTriageStore::new());
        seed_runs(&store).await;
        let harness = EvalHarness::new(store);

        let reports = harness.run_all().await.unwrap();
        let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "fraud_detection",
                "agent_performance",
                "knowledge_base",
                "case_handling"
            ]
        );
    }
}
