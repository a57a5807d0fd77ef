//! Rate limiting.
//!
//! Sliding window call counters keyed by provider (server) name.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Rate limit caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RateLimitConfig {
    pub calls_per_minute: u32,
    pub calls_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: 60,
            calls_per_hour: 1000,
        }
    }
}

/// Sliding window for tracking calls.
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    /// Admit and record a call if both windows have room.
    fn check_and_record(&mut self, now: DateTime<Utc>, config: &RateLimitConfig) -> bool {
        // Remove timestamps outside the hour window
        let hour_ago = now - Duration::hours(1);
        while let Some(&ts) = self.timestamps.front() {
            if ts <= hour_ago {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.timestamps.len() >= config.calls_per_hour as usize {
            return false;
        }

        if self.count_since(now - Duration::minutes(1)) >= config.calls_per_minute as usize {
            return false;
        }

        self.timestamps.push_back(now);
        true
    }

    fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.timestamps.iter().filter(|&&ts| ts > since).count()
    }
}

/// Rate limiter - enforces per-provider call caps.
///
/// NOT a separate actor - owned by the gateway state and called via &mut self.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<String, SlidingWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Admit one call for `key`, recording it only if admitted.
    pub fn try_consume(&mut self, key: &str) -> bool {
        self.try_consume_at(key, Utc::now())
    }

    pub fn try_consume_at(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        let allowed = self
            .windows
            .entry(key.to_string())
            .or_default()
            .check_and_record(now, &self.config);
        if !allowed {
            tracing::debug!(key, "rate limit exceeded");
        }
        allowed
    }

    /// Calls recorded for `key` in the trailing minute.
    pub fn current_rate(&self, key: &str) -> usize {
        self.windows
            .get(key)
            .map(|w| w.count_since(Utc::now() - Duration::minutes(1)))
            .unwrap_or(0)
    }

    /// Replace the caps. Recorded history is kept.
    pub fn set_config(&mut self, config: RateLimitConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Forget all history for `key`.
    pub fn clear(&mut self, key: &str) {
        self.windows.remove(key);
    }
}
