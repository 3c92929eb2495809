//! C8 — RateLimiter: sliding-window per-bucket rate limiting with
//! exponential backoff and endpoint overrides.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const BACKOFF_CAP: u32 = 32;
const IDLE_CLEANUP_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketType {
    Ip,
    Token,
    Phone,
    Endpoint,
    Global,
}

impl BucketType {
    fn as_str(self) -> &'static str {
        match self {
            BucketType::Ip => "ip",
            BucketType::Token => "token",
            BucketType::Phone => "phone",
            BucketType::Endpoint => "endpoint",
            BucketType::Global => "global",
        }
    }
}

/// Bucket key: `"{type}:{identifier}[:{endpoint}]"`.
fn bucket_key(bucket_type: BucketType, identifier: &str, endpoint: Option<&str>) -> String {
    match endpoint {
        Some(ep) => format!("{}:{identifier}:{ep}", bucket_type.as_str()),
        None => format!("{}:{identifier}", bucket_type.as_str()),
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub burst_allowance: u32,
    pub window: Duration,
    pub block_duration: Duration,
    pub exponential_backoff: bool,
}

impl RateLimitConfig {
    fn per_minute(max_requests: u32, burst_allowance: u32) -> Self {
        Self {
            max_requests,
            burst_allowance,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
            exponential_backoff: true,
        }
    }
}

struct BucketState {
    timestamps: VecDeque<Instant>,
    violations: u32,
    blocked_until: Option<Instant>,
    backoff_multiplier: u32,
    last_activity: Instant,
}

impl BucketState {
    fn new(now: Instant) -> Self {
        Self {
            timestamps: VecDeque::new(),
            violations: 0,
            blocked_until: None,
            backoff_multiplier: 1,
            last_activity: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Option<Duration>,
    pub bucket_key: String,
}

#[derive(Debug, Clone)]
pub struct MultiCheckResult {
    pub allowed: bool,
    pub first_blocking_bucket: Option<String>,
    pub results: Vec<CheckResult>,
}

/// Sliding-window rate limiter over a set of per-bucket-type defaults,
/// with endpoint-prefix overrides. Mutation is single-threaded per
/// caller, matching the rest of the crate's in-process stores — callers
/// that need shared access wrap it in a mutex.
pub struct RateLimiter {
    buckets: HashMap<String, BucketState>,
    defaults: HashMap<BucketType, RateLimitConfig>,
    endpoint_overrides: HashMap<String, RateLimitConfig>,
    pub metrics: crate::metrics::SecurityMetricsRegistry,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RateLimiter {
    /// Per-minute defaults and sensitive-endpoint overrides.
    pub fn with_defaults() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(BucketType::Ip, RateLimitConfig::per_minute(60, 10));
        defaults.insert(BucketType::Token, RateLimitConfig::per_minute(10, 3));
        defaults.insert(BucketType::Phone, RateLimitConfig::per_minute(20, 5));
        defaults.insert(BucketType::Endpoint, RateLimitConfig::per_minute(30, 5));
        defaults.insert(BucketType::Global, RateLimitConfig::per_minute(200, 50));

        let mut endpoint_overrides = HashMap::new();
        endpoint_overrides.insert(
            "/otp".to_string(),
            RateLimitConfig {
                max_requests: 5,
                burst_allowance: 0,
                window: Duration::from_secs(5 * 60),
                block_duration: Duration::from_secs(10 * 60),
                exponential_backoff: true,
            },
        );
        endpoint_overrides.insert(
            "/sign".to_string(),
            RateLimitConfig {
                max_requests: 10,
                burst_allowance: 2,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(60),
                exponential_backoff: true,
            },
        );
        endpoint_overrides.insert(
            "/webhook".to_string(),
            RateLimitConfig {
                max_requests: 30,
                burst_allowance: 10,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(60),
                exponential_backoff: true,
            },
        );
        endpoint_overrides.insert(
            "/view".to_string(),
            RateLimitConfig {
                max_requests: 20,
                burst_allowance: 5,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(60),
                exponential_backoff: true,
            },
        );

        Self {
            buckets: HashMap::new(),
            defaults,
            endpoint_overrides,
            metrics: crate::metrics::SecurityMetricsRegistry::new(),
        }
    }

    /// Used by tests and callers that want a single bespoke bucket type
    /// config instead of the full default table (e.g. S5).
    pub fn with_config(bucket_type: BucketType, config: RateLimitConfig) -> Self {
        let mut limiter = Self {
            buckets: HashMap::new(),
            defaults: HashMap::new(),
            endpoint_overrides: HashMap::new(),
            metrics: crate::metrics::SecurityMetricsRegistry::new(),
        };
        limiter.defaults.insert(bucket_type, config);
        limiter
    }

    /// Resolve effective config: type default, overridden by the
    /// longest matching endpoint prefix (exact match is the longest
    /// possible prefix, so no separate case is needed).
    fn resolve_config(&self, bucket_type: BucketType, endpoint: Option<&str>) -> RateLimitConfig {
        let mut config = self
            .defaults
            .get(&bucket_type)
            .cloned()
            .unwrap_or_else(|| RateLimitConfig::per_minute(60, 10));

        if let Some(ep) = endpoint {
            let best = self
                .endpoint_overrides
                .iter()
                .filter(|(prefix, _)| ep.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            if let Some((_, over)) = best {
                config = over.clone();
            }
        }
        config
    }

    ///  `check`: resolve config, honor an active block, slide the
    /// window, and either deny-with-backoff or admit-and-record.
    pub fn check(&mut self, bucket_type: BucketType, identifier: &str, endpoint: Option<&str>) -> CheckResult {
        let key = bucket_key(bucket_type, identifier, endpoint);
        let config = self.resolve_config(bucket_type, endpoint);
        let now = Instant::now();
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| BucketState::new(now));
        bucket.last_activity = now;

        if let Some(until) = bucket.blocked_until {
            if until > now {
                self.metrics.record_rate_limit_check(false, false);
                return CheckResult {
                    allowed: false,
                    remaining: 0,
                    retry_after: Some(until - now),
                    bucket_key: key,
                };
            }
            bucket.blocked_until = None;
        }

        let window_start = now.checked_sub(config.window).unwrap_or(now);
        while let Some(&front) = bucket.timestamps.front() {
            if front <= window_start {
                bucket.timestamps.pop_front();
            } else {
                break;
            }
        }

        let limit_with_burst = config.max_requests + config.burst_allowance;
        if bucket.timestamps.len() as u32 >= limit_with_burst {
            bucket.violations += 1;
            let mut escalated = false;
            let retry_after = if config.exponential_backoff {
                let delay = config.block_duration * bucket.backoff_multiplier;
                bucket.blocked_until = Some(now + delay);
                bucket.backoff_multiplier = (bucket.backoff_multiplier * 2).min(BACKOFF_CAP);
                escalated = true;
                Some(delay)
            } else {
                None
            };
            self.metrics.record_rate_limit_check(false, escalated);
            return CheckResult {
                allowed: false,
                remaining: 0,
                retry_after,
                bucket_key: key,
            };
        }

        bucket.timestamps.push_back(now);
        // reset only fires inside the non-burst zone
        // (`len < maxRequests`), not `< maxRequests + burstAllowance`.
        // Preserved rather than relaxed, matching the source's bias.
        if (bucket.timestamps.len() as u32) < config.max_requests {
            bucket.backoff_multiplier = 1;
        }
        let remaining = config.max_requests.saturating_sub(bucket.timestamps.len() as u32);
        self.metrics.record_rate_limit_check(true, false);
        CheckResult {
            allowed: true,
            remaining,
            retry_after: None,
            bucket_key: key,
        }
    }

    /// Allow only if every check passes; reports the first blocking
    /// bucket ( `checkMultiple`).
    pub fn check_multiple(&mut self, checks: &[(BucketType, &str, Option<&str>)]) -> MultiCheckResult {
        let mut first_blocking_bucket = None;
        let mut results = Vec::with_capacity(checks.len());
        for (bucket_type, identifier, endpoint) in checks {
            let result = self.check(*bucket_type, identifier, *endpoint);
            if !result.allowed && first_blocking_bucket.is_none() {
                first_blocking_bucket = Some(result.bucket_key.clone());
            }
            results.push(result);
        }
        MultiCheckResult {
            allowed: results.iter().all(|r| r.allowed),
            first_blocking_bucket,
            results,
        }
    }

    /// Remove buckets idle for 10+ minutes with no active block.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            let actively_blocked = bucket.blocked_until.map(|u| u > now).unwrap_or(false);
            actively_blocked || now.duration_since(bucket.last_activity) < IDLE_CLEANUP_WINDOW
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Time-scaled to milliseconds so the test runs fast: max=5, burst=2,
    /// window=100ms, block=30ms, exponential backoff on.
    #[test]
    fn s5_rate_limiter_burst_and_backoff() {
        let config = RateLimitConfig {
            max_requests: 5,
            burst_allowance: 2,
            window: Duration::from_millis(500),
            block_duration: Duration::from_millis(40),
            exponential_backoff: true,
        };
        let mut limiter = RateLimiter::with_config(BucketType::Ip, config);

        for _ in 0..7 {
            let result = limiter.check(BucketType::Ip, "1.2.3.4", None);
            assert!(result.allowed);
        }

        let eighth = limiter.check(BucketType::Ip, "1.2.3.4", None);
        assert!(!eighth.allowed);
        assert!(eighth.retry_after.is_some());

        std::thread::sleep(Duration::from_millis(45));
        let after_block = limiter.check(BucketType::Ip, "1.2.3.4", None);
        assert!(after_block.allowed, "first request after block expiry should be allowed");
    }

    #[test]
    fn check_multiple_reports_first_blocking_bucket() {
        let mut limiter = RateLimiter::with_config(
            BucketType::Token,
            RateLimitConfig {
                max_requests: 1,
                burst_allowance: 0,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(1),
                exponential_backoff: false,
            },
        );
        limiter.defaults.insert(BucketType::Ip, RateLimitConfig::per_minute(60, 10));

        assert!(limiter.check(BucketType::Token, "tok-1", None).allowed);
        let result = limiter.check_multiple(&[
            (BucketType::Ip, "1.2.3.4", None),
            (BucketType::Token, "tok-1", None),
        ]);
        assert!(!result.allowed);
        assert_eq!(result.first_blocking_bucket.as_deref(), Some("token:tok-1"));
    }

    #[test]
    fn endpoint_override_beats_type_default() {
        let limiter = RateLimiter::with_defaults();
        let otp_config = limiter.resolve_config(BucketType::Endpoint, Some("/otp/verify"));
        assert_eq!(otp_config.max_requests, 5);
        assert_eq!(otp_config.burst_allowance, 0);
    }

    #[test]
    fn cleanup_drops_idle_unblocked_buckets() {
        let mut limiter = RateLimiter::with_defaults();
        limiter.check(BucketType::Ip, "9.9.9.9", None);
        assert_eq!(limiter.bucket_count(), 1);
        if let Some(bucket) = limiter.buckets.get_mut("ip:9.9.9.9") {
            bucket.last_activity = Instant::now() - Duration::from_secs(11 * 60);
        }
        limiter.cleanup();
        assert_eq!(limiter.bucket_count(), 0);
    }
}
