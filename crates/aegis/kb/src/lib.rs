//! Knowledge-base retrieval.
//!
//! Deterministic in-process scoring over stored docs: terms extracted
//! from risk reasons (words of four or more characters plus a fixed fraud
//! vocabulary), case-insensitive substring matching weighted three-to-one
//! toward titles, snippets windowed around the first hit, and contextual
//! citations keyed by reason keywords. The pipeline lookup never fails;
//! a broken store yields empty results and a warning.

#![deny(unsafe_code)]

use aegis_store::{KbStore, StoreError};
use aegis_types::{KbDoc, KbLookup, KbSearchResponse, KbSearchResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Result type for the direct search interface.
pub type KbResult<T> = Result<T, KbError>;

/// Errors surfaced by the direct search interface.
#[derive(Debug, Error)]
pub enum KbError {
    #[error("invalid query: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maximum results returned by a lookup.
const MAX_RESULTS: usize = 5;

/// Hard cap for the direct search interface.
const MAX_SEARCH_LIMIT: usize = 50;

/// Snippet budget, ellipses included.
const SNIPPET_MAX: usize = 150;

/// Title hits weigh three body hits.
const TITLE_WEIGHT: u32 = 3;

/// Fraud terms recognized inside reason strings even when token
/// extraction would miss them.
const FRAUD_VOCAB: &[&str] = &[
    "velocity",
    "device",
    "location",
    "merchant",
    "dispute",
    "chargeback",
    "freeze",
    "travel",
    "limit",
];

/// Contextual citations keyed by reason keywords.
const CITATION_MAP: &[(&str, &str)] = &[
    ("velocity", "Reference: Transaction Velocity Guidelines"),
    ("device", "Reference: Device Fingerprinting Playbook"),
    ("location", "Reference: Geographic Anomaly Procedures"),
    ("merchant", "Reference: Merchant Risk Classification"),
    ("dispute", "Reference: Dispute Intake Checklist"),
    ("freeze", "Reference: Card Freeze Authorization Policy"),
];

/// Retrieval over the stored knowledge base.
pub struct KbRetriever {
    store: Arc<dyn KbStore>,
}

impl KbRetriever {
    pub fn new(store: Arc<dyn KbStore>) -> Self {
        Self { store }
    }

    /// Pipeline lookup driven by risk reasons. Never fails: store errors
    /// degrade to empty results.
    pub async fn lookup(&self, reasons: &[String]) -> KbLookup {
        let terms = extract_terms(reasons);
        let citations = contextual_citations(reasons);
        if terms.is_empty() {
            return KbLookup {
                results: Vec::new(),
                citations,
            };
        }

        let docs = match self.store.all_docs().await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!(error = %e, "kb lookup degraded to empty results");
                return KbLookup {
                    results: Vec::new(),
                    citations,
                };
            }
        };

        KbLookup {
            results: rank_docs(&docs, &terms, MAX_RESULTS),
            citations,
        }
    }

    /// Direct search interface: `q` must be 1..=500 chars, `limit` at
    /// most 50 (default 10).
    pub async fn search_query(
        &self,
        q: &str,
        limit: Option<usize>,
    ) -> KbResult<KbSearchResponse> {
        let query = q.trim();
        let query_chars = query.chars().count();
        if query_chars == 0 {
            return Err(KbError::Validation("query must not be empty".to_string()));
        }
        if query_chars > 500 {
            return Err(KbError::Validation("query exceeds 500 characters".to_string()));
        }
        let limit = limit.unwrap_or(10);
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(KbError::Validation(format!(
                "limit must be between 1 and {MAX_SEARCH_LIMIT}"
            )));
        }

        let mut terms = extract_terms(&[query.to_string()]);
        if terms.is_empty() {
            // Short queries still search as a single literal term.
            terms.push(query.to_lowercase());
        }

        let docs = self.store.all_docs().await?;
        let results = rank_docs(&docs, &terms, limit);
        Ok(KbSearchResponse {
            total_results: results.len(),
            results,
            query: query.to_string(),
        })
    }
}

fn extract_terms(reasons: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut terms = Vec::new();

    for reason in reasons {
        let lower = reason.to_lowercase();
        for word in lower.split(|c: char| !c.is_alphanumeric()) {
            if word.chars().count() >= 4 && seen.insert(word.to_string()) {
                terms.push(word.to_string());
            }
        }
        for vocab in FRAUD_VOCAB {
            if lower.contains(vocab) && seen.insert((*vocab).to_string()) {
                terms.push((*vocab).to_string());
            }
        }
    }
    terms
}

fn contextual_citations(reasons: &[String]) -> Vec<String> {
    let mut citations = Vec::new();
    for (keyword, citation) in CITATION_MAP {
        let mentioned = reasons
            .iter()
            .any(|r| r.to_lowercase().contains(keyword));
        if mentioned && !citations.iter().any(|c| c == citation) {
            citations.push((*citation).to_string());
        }
    }
    citations
}

fn rank_docs(docs: &[KbDoc], terms: &[String], limit: usize) -> Vec<KbSearchResult> {
    let mut scored: Vec<KbSearchResult> = docs
        .iter()
        .filter_map(|doc| score_doc(doc, terms))
        .collect();
    scored.sort_by(|a, b| {
        b.relevance_score
            .cmp(&a.relevance_score)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    scored.truncate(limit);
    scored
}

fn score_doc(doc: &KbDoc, terms: &[String]) -> Option<KbSearchResult> {
    let title_lower = doc.title.to_lowercase();
    let body_lower = doc.content_text.to_lowercase();

    let mut score = 0u32;
    let mut first_hit: Option<usize> = None;
    for term in terms {
        let title_matches = count_matches(&title_lower, term);
        let body_matches = count_matches(&body_lower, term);
        score += TITLE_WEIGHT * title_matches + body_matches;
        if body_matches > 0 {
            let pos = body_lower.find(term.as_str());
            first_hit = match (first_hit, pos) {
                (Some(existing), Some(pos)) => Some(existing.min(pos)),
                (None, pos) => pos,
                (existing, None) => existing,
            };
        }
    }

    if score == 0 {
        return None;
    }
    Some(KbSearchResult {
        doc_id: doc.id.clone(),
        title: doc.title.clone(),
        anchor: doc.anchor.clone(),
        extract: snippet(&doc.content_text, first_hit.unwrap_or(0)),
        relevance_score: score,
    })
}

fn count_matches(haystack: &str, needle: &str) -> u32 {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count() as u32
}

// Window the snippet around the first matched term, trimming at char
// boundaries and spending the budget on ellipses where text is cut.
fn snippet(content: &str, byte_hit: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= SNIPPET_MAX {
        return content.to_string();
    }

    // Translate the byte offset of the hit into a char offset.
    let char_hit = content
        .char_indices()
        .take_while(|(idx, _)| *idx < byte_hit)
        .count();

    let budget = SNIPPET_MAX - 2; // room for both ellipses
    let start = char_hit.saturating_sub(budget / 3);
    let end = (start + budget).min(chars.len());
    let start = end.saturating_sub(budget);

    let mut out = String::new();
    if start > 0 {
        out.push('…');
    }
    out.extend(&chars[start..end]);
    if end < chars.len() {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_store::MemoryTriageStore;

    async fn seeded_store() -> Arc<MemoryTriageStore> {
        let store = Arc::new(MemoryTriageStore::new());
        let docs = [
            (
                "kb-velocity",
                "Transaction Velocity Guidelines",
                "High transaction velocity within a short window is a primary fraud indicator. \
                 Compare the last 24 hours against the customer's daily average and review \
                 velocity spikes above three times the norm before taking action.",
            ),
            (
                "kb-device",
                "Device Fingerprinting Playbook",
                "A new device on a high-value transaction warrants extra scrutiny. Device \
                 changes correlate with account takeover.",
            ),
            (
                "kb-merchant",
                "Merchant Risk Classification",
                "Certain merchant category codes carry elevated risk. Review merchant name \
                 patterns for temporary or test storefronts.",
            ),
        ];
        for (id, title, body) in docs {
            store
                .insert_doc(KbDoc {
                    id: id.to_string(),
                    title: title.to_string(),
                    anchor: format!("#{id}"),
                    content_text: body.to_string(),
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn reasons_drive_ranked_results() {
        let retriever = KbRetriever::new(seeded_store().await);
        let lookup = retriever
            .lookup(&["velocity spike: 20 txns in 24h".to_string()])
            .await;

        assert!(!lookup.results.is_empty());
        assert_eq!(lookup.results[0].doc_id, "kb-velocity");
        assert!(lookup
            .citations
            .contains(&"Reference: Transaction Velocity Guidelines".to_string()));
    }

    #[tokio::test]
    async fn title_matches_outweigh_body_matches() {
        let retriever = KbRetriever::new(seeded_store().await);
        let lookup = retriever.lookup(&["new device seen".to_string()]).await;
        assert_eq!(lookup.results[0].doc_id, "kb-device");
    }

    #[tokio::test]
    async fn snippets_stay_within_budget() {
        let store = Arc::new(MemoryTriageStore::new());
        let long_body = format!(
            "{} velocity appears exactly here {}",
            "padding ".repeat(40),
            "padding ".repeat(40)
        );
        store
            .insert_doc(KbDoc {
                id: "kb-long".to_string(),
                title: "Long Document".to_string(),
                anchor: "#kb-long".to_string(),
                content_text: long_body,
            })
            .await
            .unwrap();
        let retriever = KbRetriever::new(store);

        let lookup = retriever.lookup(&["velocity".to_string()]).await;
        let extract = &lookup.results[0].extract;
        assert!(extract.chars().count() <= 150, "snippet too long: {extract}");
        assert!(extract.contains("velocity"));
        assert!(extract.starts_with('…'));
    }

    #[tokio::test]
    async fn no_matches_returns_empty() {
        let retriever = KbRetriever::new(seeded_store().await);
        let lookup = retriever.lookup(&["zzzz qqqq".to_string()]).await;
        assert!(lookup.results.is_empty());
    }

    #[tokio::test]
    async fn search_query_validates_bounds() {
        let retriever = KbRetriever::new(seeded_store().await);
        assert!(matches!(
            retriever.search_query("", None).await,
            Err(KbError::Validation(_))
        ));
        assert!(matches!(
            retriever.search_query(&"x".repeat(501), None).await,
            Err(KbError::Validation(_))
        ));
        assert!(matches!(
            retriever.search_query("velocity", Some(51)).await,
            Err(KbError::Validation(_))
        ));

        let response = retriever.search_query("velocity review", None).await.unwrap();
        assert_eq!(response.query, "velocity review");
        assert_eq!(response.total_results, response.results.len());
        assert!(response.total_results >= 1);
    }
}
