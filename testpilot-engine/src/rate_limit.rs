//! Token-bucket rate limiting
//!
//! One bucket per key (host name, or a single global key). `acquire` returns
//! the delay the caller must sleep to stay inside the configured rate; it
//! never blocks internally, so concurrent executors can gate themselves
//! without serializing on the limiter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::RateLimitSettings;

/// Key used when per-host limiting is off
pub const GLOBAL_KEY: &str = "__global__";

const MIN_RATE: f64 = 0.1;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
    rate: f64,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        Self {
            // One token up front so the first request goes out immediately
            tokens: 1.0,
            last_update: Instant::now(),
            rate,
        }
    }
}

/// Snapshot of one bucket, for diagnostics
#[derive(Debug, Clone)]
pub struct BucketStatus {
    pub key: String,
    pub rate: f64,
    pub tokens: f64,
    pub burst_size: u32,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    default_rate: f64,
    per_host: bool,
    burst_size: u32,
}

impl RateLimiter {
    pub fn new(default_rate: f64, per_host: bool, burst_size: Option<u32>) -> Self {
        let default_rate = default_rate.max(MIN_RATE);
        Self {
            buckets: Mutex::new(HashMap::new()),
            default_rate,
            per_host,
            burst_size: burst_size.unwrap_or_else(|| (default_rate as u32).max(1)),
        }
    }

    /// Build from config; `None` when rate limiting is disabled
    pub fn from_settings(settings: &RateLimitSettings) -> Option<Self> {
        if !settings.enabled {
            debug!("Rate limiting disabled");
            return None;
        }
        Some(Self::new(
            settings.default_reqs_per_sec,
            settings.per_host,
            settings.burst_size,
        ))
    }

    fn bucket_key(&self, host: &str) -> String {
        if self.per_host {
            host.to_string()
        } else {
            GLOBAL_KEY.to_string()
        }
    }

    /// Acquire one token for `host`, optionally at a step-specific rate.
    /// Returns the delay the caller must observe before sending.
    pub async fn acquire(&self, host: &str, rate_override: Option<f64>) -> Duration {
        let key = self.bucket_key(host);
        let mut buckets = self.buckets.lock().await;
        let default_rate = self.default_rate;
        let bucket = buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(default_rate));

        if let Some(rate) = rate_override {
            bucket.rate = rate.max(MIN_RATE);
        }

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(self.burst_size as f64);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            debug!(key = %key, remaining = bucket.tokens, "token acquired");
            Duration::ZERO
        } else {
            let deficit = 1.0 - bucket.tokens;
            bucket.tokens = 0.0;
            let delay = Duration::from_secs_f64(deficit / bucket.rate);
            debug!(key = %key, delay_ms = delay.as_millis() as u64, "rate limit delay");
            delay
        }
    }

    /// Update the standing rate for a key
    pub async fn set_rate(&self, host: &str, rate: f64) {
        let key = self.bucket_key(host);
        let mut buckets = self.buckets.lock().await;
        let default_rate = self.default_rate;
        buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(default_rate))
            .rate = rate.max(MIN_RATE);
    }

    pub async fn status(&self, host: &str) -> BucketStatus {
        let key = self.bucket_key(host);
        let buckets = self.buckets.lock().await;
        let (rate, tokens) = buckets
            .get(&key)
            .map(|b| (b.rate, b.tokens))
            .unwrap_or((self.default_rate, self.burst_size as f64));
        BucketStatus {
            key,
            rate,
            tokens,
            burst_size: self.burst_size,
        }
    }
}

/// Effective rate for one step: the step column wins over the CLI override,
/// which wins over the configured default.
pub fn effective_rate(
    step_rate: Option<f64>,
    cli_rate: Option<f64>,
    settings: &RateLimitSettings,
) -> Option<f64> {
    step_rate
        .or(cli_rate)
        .or(if settings.enabled {
            Some(settings.default_reqs_per_sec)
        } else {
            None
        })
        .map(|r| r.max(MIN_RATE))
}
