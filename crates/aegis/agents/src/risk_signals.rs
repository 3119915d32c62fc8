//! Risk-signals step: deterministic scoring over 90 days of activity.
//!
//! The scoring is rule-based and free of probabilistic side effects, so
//! the same history and suspect transaction always yield the same score,
//! reasons, and suggestion.

use crate::context::RunContext;
use crate::{AgentResult, StepAgent};
use aegis_store::{TransactionStore, TriageStore};
use aegis_types::{
    DeviceStats, MerchantStats, PatternFlags, RiskSignalsReport, StepName, StepOutput,
    Transaction, TriageAction, VelocityStats,
};
use async_trait::async_trait;
use chrono::{Duration, Timelike};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Merchant category codes with elevated fraud rates (quasi-cash, crypto,
/// gambling, wire transfer).
const HIGH_RISK_MCCS: &[&str] = &["5960", "6051", "7995", "4829"];

/// Name fragments typical of throwaway or cash-conversion storefronts.
const SUSPICIOUS_NAME_FRAGMENTS: &[&str] = &["temp", "test", "unknown", "cash", "atm"];

/// Scoring thresholds for the signals computation.
#[derive(Debug, Clone)]
pub struct RiskSignalsConfig {
    pub history_days: i64,
    pub history_cap: usize,
    /// 24 h spend above this adds the high-spend contribution.
    pub high_spend_24h_minor: i64,
    /// Suspect amounts above these add the large-amount contributions.
    pub large_txn_minor: i64,
    pub very_large_txn_minor: i64,
    /// More distinct devices than this is itself a signal.
    pub device_change_limit: u64,
    /// Share of history that makes an hour "common" for the customer.
    pub common_hour_share: f64,
    /// Spike multiplier against the mean of the last ten transactions.
    pub spike_multiplier: f64,
}

impl Default for RiskSignalsConfig {
    fn default() -> Self {
        Self {
            history_days: 90,
            history_cap: 1_000,
            high_spend_24h_minor: 100_000,
            large_txn_minor: 50_000,
            very_large_txn_minor: 100_000,
            device_change_limit: 5,
            common_hour_share: 0.05,
            spike_multiplier: 3.0,
        }
    }
}

/// Computes velocity, device, merchant, and pattern signals plus the
/// composite score.
pub struct RiskSignalsAgent {
    store: Arc<dyn TriageStore>,
    config: RiskSignalsConfig,
}

impl RiskSignalsAgent {
    pub fn new(store: Arc<dyn TriageStore>, config: RiskSignalsConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl StepAgent for RiskSignalsAgent {
    fn step(&self) -> StepName {
        StepName::RiskSignals
    }

    async fn run(&self, ctx: &RunContext) -> AgentResult<StepOutput> {
        let since = ctx.suspect.ts - Duration::days(self.config.history_days);
        let mut history = self
            .store
            .transactions_since(&ctx.request.customer_id, since, self.config.history_cap)
            .await?;
        // The suspect transaction is the one being judged; everything it
        // is compared against must predate it.
        history.retain(|t| t.id != ctx.suspect.id && t.ts <= ctx.suspect.ts);

        let report = compute_signals(&self.config, &ctx.suspect, &history);
        tracing::debug!(
            run_id = %ctx.run_id,
            score = report.score,
            reasons = report.reasons.len(),
            "risk signals computed"
        );
        Ok(StepOutput::RiskSignals(report))
    }
}

/// Pure signal computation over the suspect transaction and its history
/// (newest first, suspect excluded).
pub fn compute_signals(
    config: &RiskSignalsConfig,
    suspect: &Transaction,
    history: &[Transaction],
) -> RiskSignalsReport {
    let window_start = suspect.ts - Duration::hours(24);
    let in_window: Vec<&Transaction> = history
        .iter()
        .filter(|t| t.ts > window_start && t.ts <= suspect.ts)
        .collect();
    let older: Vec<&Transaction> = history.iter().filter(|t| t.ts <= window_start).collect();

    let remaining_days = (config.history_days - 1).max(1) as f64;
    let velocity = VelocityStats {
        txns_24h: in_window.len() as u64,
        amount_24h_minor: in_window.iter().map(|t| t.amount_minor).sum(),
        daily_avg_txns: older.len() as f64 / remaining_days,
        daily_avg_amount_minor: older.iter().map(|t| t.amount_minor).sum::<i64>() as f64
            / remaining_days,
    };

    let devices: HashSet<&str> = history
        .iter()
        .filter_map(|t| t.device_id.as_deref())
        .collect();
    let device = DeviceStats {
        new_device: suspect
            .device_id
            .as_deref()
            .map(|d| !devices.contains(d))
            .unwrap_or(false),
        device_changes: devices.len() as u64,
    };

    let merchants: HashSet<&str> = history.iter().map(|t| t.merchant.as_str()).collect();
    let merchant = merchant_stats(suspect, !merchants.contains(suspect.merchant.as_str()));

    let patterns = pattern_flags(config, suspect, history);

    let mut score = 0u32;
    let mut reasons = Vec::new();

    let txns_24h = velocity.txns_24h as f64;
    if txns_24h > 3.0 * velocity.daily_avg_txns {
        score += 25;
        reasons.push(format!(
            "velocity: {} transactions in 24h against a daily average of {:.1}",
            velocity.txns_24h, velocity.daily_avg_txns
        ));
    } else if txns_24h > 2.0 * velocity.daily_avg_txns {
        score += 15;
        reasons.push(format!(
            "elevated velocity: {} transactions in 24h against a daily average of {:.1}",
            velocity.txns_24h, velocity.daily_avg_txns
        ));
    }

    if velocity.amount_24h_minor > config.high_spend_24h_minor {
        score += 20;
        reasons.push(format!(
            "24h spend {} exceeds {}",
            fmt_minor(velocity.amount_24h_minor),
            fmt_minor(config.high_spend_24h_minor)
        ));
    }

    if device.new_device {
        score += 20;
        reasons.push("first use of this device".to_string());
    }
    if device.device_changes > config.device_change_limit {
        score += 10;
        reasons.push(format!(
            "{} distinct devices in the last {} days",
            device.device_changes, config.history_days
        ));
    }

    if merchant.risk_score > 0 {
        score += merchant.risk_score as u32 / 2;
        if HIGH_RISK_MCCS.contains(&suspect.mcc.as_str()) {
            reasons.push(format!("high-risk merchant category {}", suspect.mcc));
        }
        if has_suspicious_name(&suspect.merchant) {
            reasons.push(format!("suspicious merchant name `{}`", suspect.merchant));
        }
        if merchant.new_merchant {
            reasons.push(format!("first transaction at merchant {}", suspect.merchant));
        }
    }

    if patterns.unusual_time {
        score += 15;
        reasons.push(format!(
            "transaction at unusual hour {:02}:00",
            suspect.ts.hour()
        ));
    }
    if patterns.unusual_location {
        score += 20;
        let place = match (&suspect.city, &suspect.country) {
            (Some(city), Some(country)) => format!("{city}, {country}"),
            _ => "unknown location".to_string(),
        };
        reasons.push(format!("location {place} not seen before"));
    }
    if patterns.velocity_spike {
        score += 25;
        reasons.push(format!(
            "amount {} is a spike against recent spending",
            fmt_minor(suspect.amount_minor)
        ));
    }

    if suspect.amount_minor > config.large_txn_minor {
        score += 15;
        reasons.push(format!(
            "amount {} exceeds {}",
            fmt_minor(suspect.amount_minor),
            fmt_minor(config.large_txn_minor)
        ));
    }
    if suspect.amount_minor > config.very_large_txn_minor {
        score += 10;
        reasons.push(format!(
            "amount {} exceeds {}",
            fmt_minor(suspect.amount_minor),
            fmt_minor(config.very_large_txn_minor)
        ));
    }

    let score = score.min(100) as u8;
    let suggested_action = if score >= 80 {
        TriageAction::FreezeCard
    } else if score >= 50 {
        TriageAction::OpenDispute
    } else {
        TriageAction::Monitor
    };

    RiskSignalsReport {
        score,
        velocity,
        device,
        merchant,
        patterns,
        reasons,
        suggested_action,
    }
}

fn merchant_stats(suspect: &Transaction, new_merchant: bool) -> MerchantStats {
    let mut risk_score = 0u32;
    if HIGH_RISK_MCCS.contains(&suspect.mcc.as_str()) {
        risk_score += 30;
    }
    if has_suspicious_name(&suspect.merchant) {
        risk_score += 20;
    }
    if new_merchant {
        risk_score += 15;
    }
    MerchantStats {
        new_merchant,
        risk_score: risk_score.min(100) as u8,
    }
}

fn has_suspicious_name(merchant: &str) -> bool {
    let lower = merchant.to_lowercase();
    SUSPICIOUS_NAME_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

fn pattern_flags(
    config: &RiskSignalsConfig,
    suspect: &Transaction,
    history: &[Transaction],
) -> PatternFlags {
    // Hours in which at least the configured share of history falls are
    // "common" for this customer.
    let mut hour_counts: HashMap<u32, usize> = HashMap::new();
    for txn in history {
        *hour_counts.entry(txn.ts.hour()).or_insert(0) += 1;
    }
    let total = history.len().max(1) as f64;
    let common_hours: HashSet<u32> = hour_counts
        .iter()
        .filter(|(_, count)| **count as f64 / total >= config.common_hour_share)
        .map(|(hour, _)| *hour)
        .collect();

    let hour = suspect.ts.hour();
    let unusual_time = (hour < 6 || hour > 23) && !common_hours.contains(&hour);

    let locations: HashSet<(&str, &str)> = history
        .iter()
        .filter_map(|t| Some((t.country.as_deref()?, t.city.as_deref()?)))
        .collect();
    let unusual_location = match (suspect.country.as_deref(), suspect.city.as_deref()) {
        (Some(country), Some(city)) => !locations.contains(&(country, city)),
        _ => false,
    };

    // History arrives newest first; the spike baseline is the mean of the
    // ten most recent amounts.
    let recent: Vec<i64> = history.iter().take(10).map(|t| t.amount_minor).collect();
    let velocity_spike = if recent.is_empty() {
        false
    } else {
        let mean = recent.iter().sum::<i64>() as f64 / recent.len() as f64;
        suspect.amount_minor as f64 > config.spike_multiplier * mean
    };

    PatternFlags {
        unusual_time,
        unusual_location,
        velocity_spike,
    }
}

fn fmt_minor(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}
