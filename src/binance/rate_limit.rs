// =============================================================================
// Rate-Limit Tracker - monitors Binance request weight to avoid 429s
// =============================================================================
//
// Binance allows 1200 request weight per minute; we hard-cap ourselves at
// 1000. The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after
// every request. Binance resets the counter each wall-clock minute, so a
// reading taken in an earlier minute counts as zero.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    /// Unix minute in which `used_weight_1m` was last observed.
    observed_minute: AtomicI64,
}

fn current_minute() -> i64 {
    chrono::Utc::now().timestamp().div_euclid(60)
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            observed_minute: AtomicI64::new(0),
        }
    }

    /// Update the weight counter from the HTTP response headers returned by
    /// Binance.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record_weight(w, current_minute());
    }

    fn record_weight(&self, w: u32, minute: i64) {
        let prev = self.used_weight_at(minute);
        self.used_weight_1m.store(w, Ordering::Relaxed);
        self.observed_minute.store(minute, Ordering::Relaxed);

        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    fn used_weight_at(&self, minute: i64) -> u32 {
        if self.observed_minute.load(Ordering::Relaxed) == minute {
            self.used_weight_1m.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        self.can_send_at(weight, current_minute())
    }

    fn can_send_at(&self, weight: u32, minute: i64) -> bool {
        let current = self.used_weight_at(minute);
        let allowed = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked, would exceed rate-limit"
            );
        }
        allowed
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("observed_minute", &self.observed_minute.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn blocks_requests_over_the_hard_cap() {
        let t = RateLimitTracker::new();
        t.record_weight(995, 100);
        assert!(t.can_send_at(5, 100));
        assert!(!t.can_send_at(6, 100));
    }

    #[test]
    fn weight_from_an_earlier_minute_is_ignored() {
        let t = RateLimitTracker::new();
        t.record_weight(1000, 100);
        assert!(!t.can_send_at(2, 100));
        assert!(t.can_send_at(2, 101));
    }

    #[test]
    fn reads_weight_header() {
        let t = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("42"));
        t.update_from_headers(&headers);
        assert_eq!(t.used_weight_1m.load(Ordering::Relaxed), 42);

        let mut junk = HeaderMap::new();
        junk.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("lots"));
        t.update_from_headers(&junk);
        assert_eq!(t.used_weight_1m.load(Ordering::Relaxed), 42);
    }
}
