//! Structured audit counters kept on the webhook validator and the rate
//! limiter, mirroring the teacher's `EnforcementStats`/`SecurityMetrics`
//! shape (`http-cage`). Backed by a `prometheus::Registry` so a caller can
//! expose them over `/metrics` later; nothing in this crate scrapes them
//! itself.

use prometheus::{IntCounter, Opts, Registry};
use serde::{Deserialize, Serialize};

/// Snapshot of webhook/perimeter counters, analogous to the teacher's
/// `EnforcementStats`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct EnforcementStats {
    pub policies_evaluated: u64,
    pub violations_detected: u64,
    pub requests_blocked: u64,
    pub threats_mitigated: u64,
}

/// Snapshot of rate limiter counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct RateLimitStats {
    pub checks_performed: u64,
    pub requests_allowed: u64,
    pub requests_blocked: u64,
    pub backoff_escalations: u64,
}

/// Thin counter/gauge registry. Cloning shares the same counters (all
/// `prometheus` counter handles are internally `Arc`-backed).
#[derive(Clone)]
pub struct SecurityMetricsRegistry {
    registry: Registry,
    policies_evaluated: IntCounter,
    violations_detected: IntCounter,
    webhook_requests_blocked: IntCounter,
    threats_mitigated: IntCounter,
    rate_limit_checks: IntCounter,
    rate_limit_allowed: IntCounter,
    rate_limit_blocked: IntCounter,
    rate_limit_backoff_escalations: IntCounter,
}

impl Default for SecurityMetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("static counter opts are always valid")
}

impl SecurityMetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();
        let policies_evaluated = counter("sdc_webhook_policies_evaluated_total", "composite webhook validations run");
        let violations_detected = counter("sdc_webhook_violations_detected_total", "webhook validations with at least one failed check");
        let webhook_requests_blocked = counter("sdc_webhook_requests_blocked_total", "webhook requests rejected by a critical check");
        let threats_mitigated = counter("sdc_webhook_threats_mitigated_total", "webhook requests scoring at or above the high-risk threshold");
        let rate_limit_checks = counter("sdc_rate_limit_checks_total", "rate limiter checks performed");
        let rate_limit_allowed = counter("sdc_rate_limit_allowed_total", "rate limiter checks that admitted the request");
        let rate_limit_blocked = counter("sdc_rate_limit_blocked_total", "rate limiter checks that denied the request");
        let rate_limit_backoff_escalations = counter("sdc_rate_limit_backoff_escalations_total", "rate limiter buckets whose backoff multiplier doubled");

        for c in [
            &policies_evaluated,
            &violations_detected,
            &webhook_requests_blocked,
            &threats_mitigated,
            &rate_limit_checks,
            &rate_limit_allowed,
            &rate_limit_blocked,
            &rate_limit_backoff_escalations,
        ] {
            registry.register(Box::new(c.clone())).ok();
        }

        Self {
            registry,
            policies_evaluated,
            violations_detected,
            webhook_requests_blocked,
            threats_mitigated,
            rate_limit_checks,
            rate_limit_allowed,
            rate_limit_blocked,
            rate_limit_backoff_escalations,
        }
    }

    pub fn record_webhook_check(&self, allowed: bool, any_check_failed: bool, risk_score: u32) {
        self.policies_evaluated.inc();
        if any_check_failed {
            self.violations_detected.inc();
        }
        if !allowed {
            self.webhook_requests_blocked.inc();
        }
        if risk_score >= 50 {
            self.threats_mitigated.inc();
        }
    }

    pub fn record_rate_limit_check(&self, allowed: bool, backoff_escalated: bool) {
        self.rate_limit_checks.inc();
        if allowed {
            self.rate_limit_allowed.inc();
        } else {
            self.rate_limit_blocked.inc();
        }
        if backoff_escalated {
            self.rate_limit_backoff_escalations.inc();
        }
    }

    pub fn enforcement_stats(&self) -> EnforcementStats {
        EnforcementStats {
            policies_evaluated: self.policies_evaluated.get(),
            violations_detected: self.violations_detected.get(),
            requests_blocked: self.webhook_requests_blocked.get(),
            threats_mitigated: self.threats_mitigated.get(),
        }
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        RateLimitStats {
            checks_performed: self.rate_limit_checks.get(),
            requests_allowed: self.rate_limit_allowed.get(),
            requests_blocked: self.rate_limit_blocked.get(),
            backoff_escalations: self.rate_limit_backoff_escalations.get(),
        }
    }

    /// Exposed so a caller can wire this into an HTTP `/metrics` endpoint
    /// via `prometheus::TextEncoder`; this crate has no HTTP server of its
    /// own to mount it on.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_counters_accumulate() {
        let m = SecurityMetricsRegistry::new();
        m.record_webhook_check(true, false, 0);
        m.record_webhook_check(false, true, 60);
        let stats = m.enforcement_stats();
        assert_eq!(stats.policies_evaluated, 2);
        assert_eq!(stats.violations_detected, 1);
        assert_eq!(stats.requests_blocked, 1);
        assert_eq!(stats.threats_mitigated, 1);
    }

    #[test]
    fn rate_limit_counters_accumulate() {
        let m = SecurityMetricsRegistry::new();
        m.record_rate_limit_check(true, false);
        m.record_rate_limit_check(false, true);
        let stats = m.rate_limit_stats();
        assert_eq!(stats.checks_performed, 2);
        assert_eq!(stats.requests_allowed, 1);
        assert_eq!(stats.requests_blocked, 1);
        assert_eq!(stats.backoff_escalations, 1);
    }
}
