//! Engine configuration with environment overrides.

use crate::breaker::BreakerConfig;
use aegis_agents::{ComplianceConfig, RiskSignalsConfig};
use aegis_cache::RateLimiterConfig;
use aegis_stream::StreamHubConfig;

/// Complete engine configuration. Defaults match the documented contract;
/// each knob can be overridden through its environment variable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rate_limit: RateLimiterConfig,
    /// Per-step deadline.
    pub agent_timeout_ms: u64,
    /// Overall run budget.
    pub run_timeout_ms: u64,
    pub circuit: BreakerConfig,
    pub otp_ttl_ms: u64,
    pub idempotency_ttl_ms: u64,
    pub stream: StreamHubConfig,
    pub signals: RiskSignalsConfig,
    pub compliance: ComplianceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimiterConfig::default(),
            agent_timeout_ms: 1_000,
            run_timeout_ms: 5_000,
            circuit: BreakerConfig::default(),
            otp_ttl_ms: 300_000,
            idempotency_ttl_ms: 3_600_000,
            stream: StreamHubConfig::default(),
            signals: RiskSignalsConfig::default(),
            compliance: ComplianceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any recognized environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.rate_limit.window_ms = env_u64("RATE_LIMIT_WINDOW_MS", config.rate_limit.window_ms);
        config.rate_limit.max_requests =
            env_u64("RATE_LIMIT_MAX_REQUESTS", config.rate_limit.max_requests);
        config.agent_timeout_ms = env_u64("AGENT_TIMEOUT_MS", config.agent_timeout_ms);
        config.run_timeout_ms = env_u64("RUN_TIMEOUT_MS", config.run_timeout_ms);
        config.circuit.fail_threshold = env_u64("CIRCUIT_FAIL_THRESHOLD", u64::from(config.circuit.fail_threshold))
            .try_into()
            .unwrap_or(config.circuit.fail_threshold);
        config.circuit.reset_ms = env_u64("CIRCUIT_RESET_MS", config.circuit.reset_ms);
        config.otp_ttl_ms = env_u64("OTP_TTL_MS", config.otp_ttl_ms);
        config.idempotency_ttl_ms = env_u64("IDEMPOTENCY_TTL_MS", config.idempotency_ttl_ms);
        config.stream.heartbeat_interval_ms =
            env_u64("HEARTBEAT_INTERVAL_MS", config.stream.heartbeat_interval_ms);
        config.compliance.business_tz_offset_minutes = env_i32(
            "BUSINESS_TZ_OFFSET_MINUTES",
            config.compliance.business_tz_offset_minutes,
        );
        config
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.rate_limit.max_requests, 300);
        assert_eq!(config.agent_timeout_ms, 1_000);
        assert_eq!(config.run_timeout_ms, 5_000);
        assert_eq!(config.circuit.fail_threshold, 3);
        assert_eq!(config.circuit.reset_ms, 30_000);
        assert_eq!(config.otp_ttl_ms, 300_000);
        assert_eq!(config.idempotency_ttl_ms, 3_600_000);
    }
}
