//! Read models and append shapes used by the store traits.

use crate::{StoreError, StoreResult};
use aegis_types::Alert;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suspect-transaction summary embedded in alert listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnSummary {
    pub txn_id: String,
    pub merchant: String,
    pub amount_minor: i64,
    pub currency: String,
}

/// Alert with the embedded customer and suspect-transaction summaries the
/// listing surface returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertListing {
    pub alert: Alert,
    pub customer_name: String,
    pub customer_email_masked: String,
    pub suspect: Option<TxnSummary>,
}

/// Keyset cursor over `(ts DESC, id DESC)`, encoded `"{last_id}|{last_ts}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnCursor {
    pub last_id: String,
    pub last_ts: DateTime<Utc>,
}

impl TxnCursor {
    pub fn encode(&self) -> String {
        format!("{}|{}", self.last_id, self.last_ts.to_rfc3339())
    }

    pub fn parse(raw: &str) -> StoreResult<Self> {
        let (id, ts) = raw
            .split_once('|')
            .ok_or_else(|| StoreError::InvalidInput(format!("malformed cursor `{raw}`")))?;
        if id.is_empty() {
            return Err(StoreError::InvalidInput(format!("malformed cursor `{raw}`")));
        }
        let last_ts = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| StoreError::InvalidInput(format!("malformed cursor timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            last_id: id.to_string(),
            last_ts,
        })
    }
}

/// One page of a keyset-paginated transaction scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnPage {
    pub transactions: Vec<aegis_types::Transaction>,
    /// Cursor for the next page; `None` when the scan is exhausted.
    pub next_cursor: Option<String>,
}

/// Append shape for a case event; the store assigns `seq` and `ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEventAppend {
    pub case_id: String,
    pub actor: String,
    pub action: String,
    pub payload: serde_json::Value,
}

impl CaseEventAppend {
    pub fn new(
        case_id: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            actor: actor.into(),
            action: action.into(),
            payload,
        }
    }
}
