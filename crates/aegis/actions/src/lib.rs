//! Action executor: applies engine decisions to cards, alerts, and cases.
//!
//! Every operation is idempotent twice over: replays under the same
//! idempotency key return the recorded response verbatim, and the
//! operations themselves converge (freezing a frozen card succeeds, a
//! second dispute returns the existing case). Card freezes additionally
//! gate on a single-use OTP. All writes of one operation commit in a
//! single store transaction.

#![deny(unsafe_code)]

use aegis_cache::{fingerprint, CacheError, IdempotencyCache, KeyValueStore, OtpStore};
use aegis_store::{
    ActionStore, CaseEventAppend, CaseStore, CustomerStore, StoreError, TransactionStore,
    TriageStore,
};
use aegis_types::{Case, CaseStatus, CaseType};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for executor operations.
pub type ActionResult<T> = Result<T, ActionError>;

/// Executor errors. OTP outcomes are domain results, not failures; they
/// appear in [`FreezeOutcome`], while a wrong code is `OtpInvalid`.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("otp invalid or expired")]
    OtpInvalid,

    #[error("idempotency key reused with a different payload: {0}")]
    KeyReuse(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// TTL configuration for the executor's cache usage.
#[derive(Debug, Clone, Copy)]
pub struct ActionConfig {
    pub otp_ttl_ms: u64,
    pub idempotency_ttl_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            otp_ttl_ms: 300_000,
            idempotency_ttl_ms: 3_600_000,
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FreezeCardRequest {
    pub card_id: String,
    pub alert_id: Option<String>,
    pub otp: Option<String>,
    pub actor: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenDisputeRequest {
    pub txn_id: String,
    pub reason_code: String,
    pub alert_id: Option<String>,
    pub actor: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseAlertRequest {
    pub alert_id: String,
    pub customer_id: String,
    pub suspect_txn_id: Option<String>,
    pub actor: String,
    pub idempotency_key: String,
}

// ── Outcomes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreezeStatus {
    Frozen,
    PendingOtp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeOutcome {
    pub status: FreezeStatus,
    pub card_id: String,
    pub case_id: Option<String>,
    pub alert_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeOutcome {
    pub case_id: String,
    pub txn_id: String,
    pub status: CaseStatus,
    /// True when an earlier non-terminal dispute was returned instead of
    /// opening a new one.
    pub already_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub case_id: String,
    pub alert_id: String,
    pub status: CaseStatus,
}

/// Applies analyst actions against the store with OTP and idempotency
/// gates.
pub struct ActionExecutor {
    store: Arc<dyn TriageStore>,
    otp: OtpStore,
    idempotency: IdempotencyCache,
}

impl ActionExecutor {
    pub fn new<S>(store: Arc<S>, kv: Arc<dyn KeyValueStore>, config: ActionConfig) -> Self
    where
        S: TriageStore + 'static,
    {
        Self {
            store,
            otp: OtpStore::new(kv.clone(), Duration::from_millis(config.otp_ttl_ms)),
            idempotency: IdempotencyCache::new(
                kv,
                Duration::from_millis(config.idempotency_ttl_ms),
            ),
        }
    }

    /// Freeze a card. Without an OTP this issues one and reports
    /// `PENDING_OTP` with no state change; with a valid OTP the freeze,
    /// its case, and the alert resolution commit atomically.
    pub async fn freeze_card(&self, request: FreezeCardRequest) -> ActionResult<FreezeOutcome> {
        let payload = json!({
            "card_id": request.card_id,
            "alert_id": request.alert_id,
            "otp_present": request.otp.is_some(),
        });
        let key = request.idempotency_key.clone();
        self.with_idempotency("freeze_card", &key, &payload, || async {
            self.do_freeze(&request).await
        })
        .await
    }

    async fn do_freeze(&self, request: &FreezeCardRequest) -> ActionResult<FreezeOutcome> {
        let card = self
            .store
            .get_card(&request.card_id)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("card {}", request.card_id)))?;

        match card.status {
            aegis_types::CardStatus::Frozen => {
                // Converged already; nothing to write.
                return Ok(FreezeOutcome {
                    status: FreezeStatus::Frozen,
                    card_id: card.id,
                    case_id: None,
                    alert_id: request.alert_id.clone(),
                });
            }
            aegis_types::CardStatus::Expired => {
                return Err(ActionError::Validation(
                    "an expired card cannot be frozen".to_string(),
                ));
            }
            aegis_types::CardStatus::Active => {}
        }

        let Some(code) = request.otp.as_deref() else {
            self.otp
                .issue(&request.card_id)
                .await
                .map_err(map_cache_error)?;
            tracing::info!(card_id = %request.card_id, "otp issued for card freeze");
            return Ok(FreezeOutcome {
                status: FreezeStatus::PendingOtp,
                card_id: card.id,
                case_id: None,
                alert_id: request.alert_id.clone(),
            });
        };

        let verified = self
            .otp
            .verify(&request.card_id, code)
            .await
            .map_err(map_cache_error)?;
        if !verified {
            return Err(ActionError::OtpInvalid);
        }

        let case = Case {
            id: format!("case-{}", Uuid::new_v4()),
            customer_id: card.customer_id.clone(),
            txn_id: None,
            case_type: CaseType::CardFreeze,
            status: CaseStatus::Open,
            reason_code: "SUSPECTED_FRAUD".to_string(),
            created_at: Utc::now(),
        };
        let event = CaseEventAppend::new(
            case.id.clone(),
            request.actor.clone(),
            "CARD_FROZEN",
            json!({"card_id": request.card_id, "alert_id": request.alert_id}),
        );
        let case_id = case.id.clone();
        let card = self
            .store
            .apply_card_freeze(&request.card_id, case, event, request.alert_id.as_deref())
            .await?;

        tracing::info!(card_id = %card.id, case_id = %case_id, "card frozen");
        Ok(FreezeOutcome {
            status: FreezeStatus::Frozen,
            card_id: card.id,
            case_id: Some(case_id),
            alert_id: request.alert_id.clone(),
        })
    }

    /// Open a dispute for a transaction, or return the one already open.
    pub async fn open_dispute(&self, request: OpenDisputeRequest) -> ActionResult<DisputeOutcome> {
        let payload = json!({
            "txn_id": request.txn_id,
            "reason_code": request.reason_code,
            "alert_id": request.alert_id,
        });
        let key = request.idempotency_key.clone();
        self.with_idempotency("open_dispute", &key, &payload, || async {
            self.do_open_dispute(&request).await
        })
        .await
    }

    async fn do_open_dispute(&self, request: &OpenDisputeRequest) -> ActionResult<DisputeOutcome> {
        let txn = self
            .store
            .get_transaction(&request.txn_id)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("transaction {}", request.txn_id)))?;

        if let Some(existing) = self
            .store
            .find_open_case(&request.txn_id, CaseType::Dispute)
            .await?
        {
            return Ok(DisputeOutcome {
                case_id: existing.id,
                txn_id: txn.id,
                status: existing.status,
                already_open: true,
            });
        }

        let case = Case {
            id: format!("case-{}", Uuid::new_v4()),
            customer_id: txn.customer_id.clone(),
            txn_id: Some(txn.id.clone()),
            case_type: CaseType::Dispute,
            status: CaseStatus::Open,
            reason_code: request.reason_code.clone(),
            created_at: Utc::now(),
        };
        let event = CaseEventAppend::new(
            case.id.clone(),
            request.actor.clone(),
            "DISPUTE_OPENED",
            json!({"txn_id": txn.id, "reason_code": request.reason_code}),
        );
        let case = self
            .store
            .apply_dispute(case, event, request.alert_id.as_deref())
            .await?;

        tracing::info!(case_id = %case.id, txn_id = %txn.id, "dispute opened");
        Ok(DisputeOutcome {
            case_id: case.id,
            txn_id: txn.id,
            status: CaseStatus::Open,
            already_open: false,
        })
    }

    /// Record an outbound customer contact and mark the alert contacted.
    pub async fn contact_customer(&self, request: CloseAlertRequest) -> ActionResult<CaseOutcome> {
        let payload = json!({
            "alert_id": request.alert_id,
            "customer_id": request.customer_id,
            "suspect_txn_id": request.suspect_txn_id,
        });
        let key = request.idempotency_key.clone();
        self.with_idempotency("contact_customer", &key, &payload, || async {
            self.close_alert(
                &request,
                CaseType::ContactCustomer,
                CaseStatus::Closed,
                "CUSTOMER_CONTACTED",
                "CUSTOMER_CONTACTED",
            )
            .await
        })
        .await
    }

    /// Close the alert as a false positive.
    pub async fn mark_false_positive(
        &self,
        request: CloseAlertRequest,
    ) -> ActionResult<CaseOutcome> {
        let payload = json!({
            "alert_id": request.alert_id,
            "customer_id": request.customer_id,
            "suspect_txn_id": request.suspect_txn_id,
        });
        let key = request.idempotency_key.clone();
        self.with_idempotency("mark_false_positive", &key, &payload, || async {
            self.close_alert(
                &request,
                CaseType::FalsePositive,
                CaseStatus::ClosedFalsePositive,
                "FALSE_POSITIVE",
                "MARKED_FALSE_POSITIVE",
            )
            .await
        })
        .await
    }

    async fn close_alert(
        &self,
        request: &CloseAlertRequest,
        case_type: CaseType,
        status: CaseStatus,
        reason_code: &str,
        event_action: &str,
    ) -> ActionResult<CaseOutcome> {
        let customer = self
            .store
            .get_customer(&request.customer_id)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("customer {}", request.customer_id)))?;

        let case = Case {
            id: format!("case-{}", Uuid::new_v4()),
            customer_id: customer.id,
            txn_id: request.suspect_txn_id.clone(),
            case_type,
            status,
            reason_code: reason_code.to_string(),
            created_at: Utc::now(),
        };
        let event = CaseEventAppend::new(
            case.id.clone(),
            request.actor.clone(),
            event_action,
            json!({"alert_id": request.alert_id}),
        );

        let case = match case_type {
            CaseType::ContactCustomer => {
                self.store
                    .apply_contact(case, event, &request.alert_id)
                    .await?
            }
            _ => {
                self.store
                    .apply_false_positive(case, event, &request.alert_id)
                    .await?
            }
        };

        tracing::info!(case_id = %case.id, alert_id = %request.alert_id, action = event_action, "alert closed");
        Ok(CaseOutcome {
            case_id: case.id,
            alert_id: request.alert_id.clone(),
            status,
        })
    }

    async fn with_idempotency<T, F, Fut>(
        &self,
        op: &str,
        key: &str,
        payload: &serde_json::Value,
        run: F,
    ) -> ActionResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ActionResult<T>>,
    {
        let fp = fingerprint(payload);
        match self.idempotency.check(op, key, &fp).await {
            Ok(Some(cached)) => {
                tracing::debug!(op, key, "idempotent replay served from cache");
                return serde_json::from_value(cached)
                    .map_err(|e| ActionError::Serialization(e.to_string()));
            }
            Ok(None) => {}
            Err(CacheError::KeyReuse(message)) => return Err(ActionError::KeyReuse(message)),
            Err(e) => {
                // The cache being down must not block actions; the
                // operations converge on replay anyway.
                tracing::warn!(op, key, error = %e, "idempotency cache unavailable");
            }
        }

        let result = run().await?;

        match serde_json::to_value(&result) {
            Ok(value) => {
                if let Err(e) = self.idempotency.record(op, key, &fp, &value).await {
                    tracing::warn!(op, key, error = %e, "failed to record idempotency result");
                }
            }
            Err(e) => {
                tracing::warn!(op, key, error = %e, "unserializable action result");
            }
        }
        Ok(result)
    }
}

fn map_cache_error(e: CacheError) -> ActionError {
    ActionError::Serialization(e.to_string())
}
