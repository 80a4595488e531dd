//! Per-route admission control over fixed time windows
//!
//! The limiter keeps an in-memory map from request key to `(count, window_start)`.
//! A key without a window, or whose window has elapsed, starts a fresh window
//! and is admitted. Otherwise the request is admitted only while the count is
//! below the limit. Check and increment happen under one lock, so concurrent
//! requests cannot both claim the last slot.
//!
//! State is per-process and is lost on restart; it gates fair use on a single
//! instance, not exact global quotas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

const DEFAULT_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

/// Limit and window for one route, plus the message returned on rejection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
    pub message: String,
}

impl RateLimitRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub permitted: bool,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    resets_at: Instant,
}

impl Window {
    fn elapsed(&self, now: Instant) -> bool {
        now >= self.resets_at
    }
}

/// Shared fixed-window limiter. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission check against the current instant.
    pub fn allow(&self, key: &str, rule: &RateLimitRule) -> RateDecision {
        self.allow_at(key, rule.limit, rule.window, Instant::now())
    }

    /// Admission check against an explicit instant.
    pub fn allow_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> RateDecision {
        // A poisoned map still holds valid counters; keep serving.
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        windows.retain(|_, w| !w.elapsed(now));

        match windows.get_mut(key) {
            Some(w) if w.count >= limit => {
                tracing::debug!(key, count = w.count, limit, "rate limit rejected");
                RateDecision {
                    permitted: false,
                    remaining: 0,
                }
            }
            Some(w) => {
                w.count += 1;
                RateDecision {
                    permitted: true,
                    remaining: limit - w.count,
                }
            }
            None => {
                if limit == 0 {
                    return RateDecision {
                        permitted: false,
                        remaining: 0,
                    };
                }
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        resets_at: now + window,
                    },
                );
                RateDecision {
                    permitted: true,
                    remaining: limit - 1,
                }
            }
        }
    }

    /// Number of live windows.
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Builds the limiter key `<client-ip>:<path>`.
///
/// The client ip is the first `x-forwarded-for` entry, then `x-real-ip`,
/// falling back to `"unknown"`.
pub fn client_key(headers: &HeaderMap, path: &str) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let ip = forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .unwrap_or("unknown");
    format!("{ip}:{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn fourth_request_in_window_is_rejected() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        for i in 0..3 {
            let d = limiter.allow_at("1.2.3.4:/api/chat", 3, MINUTE, t0 + Duration::from_secs(i));
            assert!(d.permitted);
            assert_eq!(d.remaining, 2 - i as u32);
        }
        let d = limiter.allow_at("1.2.3.4:/api/chat", 3, MINUTE, t0 + Duration::from_secs(10));
        assert_eq!(
            d,
            RateDecision {
                permitted: false,
                remaining: 0
            }
        );
    }

    #[test]
    fn elapsed_window_starts_fresh() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.allow_at("k", 1, MINUTE, t0).permitted);
        assert!(!limiter.allow_at("k", 1, MINUTE, t0 + Duration::from_secs(59)).permitted);
        let fresh = limiter.allow_at("k", 1, MINUTE, t0 + MINUTE);
        assert!(fresh.permitted);
        assert_eq!(fresh.remaining, 0);
    }

    #[test]
    fn keys_are_independent_and_expired_keys_are_swept() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.allow_at("a", 1, MINUTE, t0).permitted);
        assert!(limiter.allow_at("b", 1, MINUTE, t0).permitted);
        assert_eq!(limiter.tracked_keys(), 2);
        assert!(limiter.allow_at("c", 1, MINUTE, t0 + MINUTE * 2).permitted);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn zero_limit_never_admits() {
        let limiter = RateLimiter::new();
        assert!(!limiter.allow_at("k", 0, MINUTE, Instant::now()).permitted);
    }

    #[test]
    fn client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, "/api/x"), "unknown:/api/x");

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_key(&headers, "/api/x"), "10.0.0.2:/api/x");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_key(&headers, "/api/x"), "203.0.113.7:/api/x");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_limit() {
        let limiter = RateLimiter::new();
        let rule = RateLimitRule::new(5, MINUTE);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let rule = rule.clone();
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                limiter.allow("shared", &rule).permitted
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
