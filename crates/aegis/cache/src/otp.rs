//! One-time passwords for consequential card actions.
//!
//! Codes are minted here, live for a bounded TTL under `otp:{card_id}`,
//! and are consumed on the first successful verification.

use crate::kv::KeyValueStore;
use crate::CacheResult;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Issues and verifies single-use OTP codes.
pub struct OtpStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl OtpStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Mint a fresh 6-digit code for a card, replacing any outstanding one.
    pub async fn issue(&self, card_id: &str) -> CacheResult<String> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        self.kv
            .put(&otp_key(card_id), code.clone(), self.ttl)
            .await?;
        Ok(code)
    }

    /// Verify a code. A match consumes the stored code; an expired or
    /// mismatched code verifies false without side effects.
    pub async fn verify(&self, card_id: &str, code: &str) -> CacheResult<bool> {
        let key = otp_key(card_id);
        match self.kv.get(&key).await? {
            Some(stored) if stored == code => {
                self.kv.delete(&key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn otp_key(card_id: &str) -> String {
    format!("otp:{card_id}")
}
