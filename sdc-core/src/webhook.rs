//! C7 — WebhookValidator: composite inbound-request validation:
//! CIDR allowlisting, IP reputation, HMAC signature verification, and the
//! other perimeter checks, combined into a single risk score and
//! allow/block decision.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crypto_primitives::HmacKey;

const MAX_BODY_SIZE: usize = 1024 * 1024;
const TIMESTAMP_DRIFT: chrono::Duration = chrono::Duration::minutes(5);
const NONCE_WINDOW: Duration = Duration::from_secs(5 * 60);

const SCANNER_USER_AGENTS: &[&str] = &["sqlmap", "nikto", "nmap", "masscan", "zgrab", "curl/7.1"];

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub source_ip: String,
    pub method: String,
    pub path: String,
    pub user_agent: String,
    pub content_type: String,
    pub content_length: usize,
    pub raw_body: String,
    pub signature: Option<String>,
    pub signature_timestamp: Option<DateTime<Utc>>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub risk_contribution: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub allowed: bool,
    pub risk_score: u32,
    pub checks: Vec<CheckOutcome>,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct CidrRange {
    network: u32,
    mask: u32,
}

fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    s.parse().ok()
}

/// Normalizes IPv6 loopback and IPv4-mapped addresses to their IPv4 form
/// before matching.
fn normalize_ip(ip: &str) -> String {
    if ip == "::1" {
        return "127.0.0.1".to_string();
    }
    if let Some(stripped) = ip.strip_prefix("::ffff:") {
        return stripped.to_string();
    }
    ip.to_string()
}

/// Parses `"a.b.c.d/N"`. A failed parse falls back to treating `cidr` as
/// a literal string to exact-match against. This permissive fallback is
/// preserved rather than rejected.
fn cidr_matches(ip: &str, cidr: &str) -> bool {
    let normalized = normalize_ip(ip);
    if let Some((base, prefix)) = cidr.split_once('/') {
        if let (Some(base_addr), Ok(prefix_len)) = (parse_ipv4(base), prefix.parse::<u32>()) {
            if prefix_len <= 32 {
                if let Some(addr) = parse_ipv4(&normalized) {
                    let range = CidrRange {
                        network: u32::from(base_addr),
                        mask: if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) },
                    };
                    return (u32::from(addr) & range.mask) == (range.network & range.mask);
                }
            }
        }
    }
    normalized == cidr
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReputationTier {
    None,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
struct IpReputationEntry {
    total_requests: u64,
    blocked_requests: u64,
    first_seen: Instant,
    last_seen: Instant,
    blocked_until: Option<Instant>,
}

pub struct IpReputationTracker {
    entries: HashMap<String, IpReputationEntry>,
}

impl Default for IpReputationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl IpReputationTracker {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn record(&mut self, ip: &str, was_blocked: bool) {
        let now = Instant::now();
        let entry = self.entries.entry(ip.to_string()).or_insert_with(|| IpReputationEntry {
            total_requests: 0,
            blocked_requests: 0,
            first_seen: now,
            last_seen: now,
            blocked_until: None,
        });
        entry.total_requests += 1;
        entry.last_seen = now;
        if was_blocked {
            entry.blocked_requests += 1;
        }
        let tier = tier_for(entry.blocked_requests);
        if tier == ReputationTier::Critical {
            entry.blocked_until = Some(now + Duration::from_secs(30 * 60));
        }
    }

    /// True if the IP is currently serving an active auto-block. Expired
    /// blocks are cleared lazily on access.
    pub fn is_auto_blocked(&mut self, ip: &str) -> bool {
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(ip) {
            match entry.blocked_until {
                Some(until) if until > now => return true,
                Some(_) => entry.blocked_until = None,
                None => {}
            }
        }
        false
    }

    pub fn manual_block(&mut self, ip: &str, duration: Duration) {
        let now = Instant::now();
        let entry = self.entries.entry(ip.to_string()).or_insert_with(|| IpReputationEntry {
            total_requests: 0,
            blocked_requests: 0,
            first_seen: now,
            last_seen: now,
            blocked_until: None,
        });
        entry.blocked_until = Some(now + duration);
    }

    pub fn manual_unblock(&mut self, ip: &str) {
        if let Some(entry) = self.entries.get_mut(ip) {
            entry.blocked_until = None;
        }
    }

    pub fn tier(&self, ip: &str) -> ReputationTier {
        self.entries.get(ip).map(|e| tier_for(e.blocked_requests)).unwrap_or(ReputationTier::None)
    }
}

fn tier_for(blocked_requests: u64) -> ReputationTier {
    if blocked_requests >= 10 {
        ReputationTier::Critical
    } else if blocked_requests >= 5 {
        ReputationTier::High
    } else if blocked_requests >= 2 {
        ReputationTier::Medium
    } else {
        ReputationTier::None
    }
}

/// In-memory `nonce -> insertionTime` map with a 5 minute replay window.
pub struct NonceTracker {
    seen: HashMap<String, Instant>,
}

impl Default for NonceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceTracker {
    pub fn new() -> Self {
        Self { seen: HashMap::new() }
    }

    /// Returns false if the nonce has already been seen within the
    /// window; otherwise records it and returns true.
    pub fn check_nonce(&mut self, nonce: &str) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.seen.get(nonce) {
            if now.duration_since(*seen_at) < NONCE_WINDOW {
                return false;
            }
        }
        self.seen.insert(nonce.to_string(), now);
        true
    }

    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.seen.retain(|_, t| now.duration_since(*t) < NONCE_WINDOW);
    }
}

pub struct WebhookValidator {
    pub allowlist: Vec<String>,
    pub signing_secret: Option<String>,
    pub reputation: IpReputationTracker,
    pub nonces: NonceTracker,
    pub metrics: crate::metrics::SecurityMetricsRegistry,
}

impl WebhookValidator {
    pub fn new(allowlist: Vec<String>, signing_secret: Option<String>) -> Self {
        Self {
            allowlist,
            signing_secret,
            reputation: IpReputationTracker::new(),
            nonces: NonceTracker::new(),
            metrics: crate::metrics::SecurityMetricsRegistry::new(),
        }
    }

    /// Composite validation. Allowed iff none of the critical
    /// checks {IP allowlist, IP reputation, HMAC signature, body size}
    /// fail.
    pub fn validate(&mut self, ctx: &RequestContext) -> ValidationResult {
        let mut checks = Vec::new();
        let mut risk: u32 = 0;
        const CRITICAL: &[&str] = &["ip-allowlist", "ip-reputation", "webhook-signature", "body-size"];

        let ip_allowed = self.allowlist.is_empty() || self.allowlist.iter().any(|cidr| cidr_matches(&ctx.source_ip, cidr));
        checks.push(CheckOutcome { name: "ip-allowlist".to_string(), passed: ip_allowed, risk_contribution: if ip_allowed { 0 } else { 40 } });

        let auto_blocked = self.reputation.is_auto_blocked(&ctx.source_ip);
        checks.push(CheckOutcome { name: "ip-reputation".to_string(), passed: !auto_blocked, risk_contribution: if auto_blocked { 50 } else { 0 } });

        let method_ok = ctx.method == "POST";
        checks.push(CheckOutcome { name: "method".to_string(), passed: method_ok, risk_contribution: if method_ok { 0 } else { 10 } });

        let content_type_ok = matches!(
            ctx.content_type.as_str(),
            "application/json" | "application/json; charset=utf-8" | "application/json;charset=utf-8"
        );
        checks.push(CheckOutcome { name: "content-type".to_string(), passed: content_type_ok, risk_contribution: if content_type_ok { 0 } else { 10 } });

        let size_ok = ctx.content_length <= MAX_BODY_SIZE;
        checks.push(CheckOutcome { name: "body-size".to_string(), passed: size_ok, risk_contribution: if size_ok { 0 } else { 15 } });

        let json_ok = serde_json::from_str::<serde_json::Value>(&ctx.raw_body).is_ok();
        checks.push(CheckOutcome { name: "json-validity".to_string(), passed: json_ok, risk_contribution: if json_ok { 0 } else { 20 } });

        let (signature_passed, signature_name, signature_risk) = match (&self.signing_secret, &ctx.signature, &ctx.signature_timestamp) {
            (Some(secret), Some(sig), Some(ts)) => {
                let signed = format!("{}.{}", ts.to_rfc3339(), ctx.raw_body);
                let key = HmacKey::from_bytes(secret.as_bytes());
                let ok = key.verify_hex(signed.as_bytes(), sig).unwrap_or(false);
                ("webhook-signature", ok, if ok { 0 } else { 30 })
            }
            (Some(_), None, _) => ("webhook-signature-missing", false, 20),
            (None, _, _) => ("webhook-signature", true, 0),
        };
        checks.push(CheckOutcome { name: signature_name.to_string(), passed: signature_passed, risk_contribution: signature_risk });

        let drift_ok = match ctx.signature_timestamp {
            Some(ts) => (Utc::now() - ts).abs() <= TIMESTAMP_DRIFT,
            None => true,
        };
        checks.push(CheckOutcome { name: "timestamp-drift".to_string(), passed: drift_ok, risk_contribution: if drift_ok { 0 } else { 15 } });

        let ua_lower = ctx.user_agent.to_lowercase();
        let ua_ok = !SCANNER_USER_AGENTS.iter().any(|s| ua_lower.contains(s));
        checks.push(CheckOutcome { name: "user-agent".to_string(), passed: ua_ok, risk_contribution: if ua_ok { 0 } else { 10 } });

        for check in &checks {
            risk += check.risk_contribution;
        }
        risk = risk.min(100);

        // The "missing signature" case is only critical when a secret is
        // actually configured: with no secret, the signature check always
        // passes and never enters the critical set.
        let has_critical_failure = checks.iter().any(|c| {
            !c.passed && (CRITICAL.contains(&c.name.as_str()) || c.name == "webhook-signature-missing")
        });

        let was_blocked = has_critical_failure;
        self.reputation.record(&ctx.source_ip, was_blocked);

        let passed: Vec<String> = checks.iter().filter(|c| c.passed).map(|c| c.name.clone()).collect();
        let failed: Vec<String> = checks.iter().filter(|c| !c.passed).map(|c| c.name.clone()).collect();

        self.metrics.record_webhook_check(!has_critical_failure, !failed.is_empty(), risk);

        ValidationResult {
            allowed: !has_critical_failure,
            risk_score: risk,
            checks,
            passed,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_ctx() -> RequestContext {
        RequestContext {
            source_ip: "10.0.0.5".to_string(),
            method: "POST".to_string(),
            path: "/webhook".to_string(),
            user_agent: "sdc-client/1.0".to_string(),
            content_type: "application/json".to_string(),
            content_length: 10,
            raw_body: "{\"a\":1}".to_string(),
            signature: None,
            signature_timestamp: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn s6_hmac_acceptance_and_tamper_rejection() {
        let ts: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let body = "{\"a\":1}".to_string();
        let signed = format!("{}.{}", ts.to_rfc3339(), body);
        let key = HmacKey::from_bytes(b"shh");
        let good_sig = key.sign_hex(signed.as_bytes()).unwrap();

        let mut validator = WebhookValidator::new(vec![], Some("shh".to_string()));
        let mut ctx = base_ctx();
        ctx.raw_body = body.clone();
        ctx.signature = Some(good_sig.clone());
        ctx.signature_timestamp = Some(ts);
        let result = validator.validate(&ctx);
        assert!(result.passed.contains(&"webhook-signature".to_string()));

        let mut tampered_sig = good_sig.clone();
        let last = tampered_sig.pop().unwrap();
        tampered_sig.push(if last == '0' { '1' } else { '0' });
        ctx.signature = Some(tampered_sig);
        let mut validator2 = WebhookValidator::new(vec![], Some("shh".to_string()));
        let result2 = validator2.validate(&ctx);
        assert!(result2.failed.contains(&"webhook-signature".to_string()));
        assert!(!result2.allowed);
    }

    #[test]
    fn missing_signature_is_critical_only_when_secret_configured() {
        let mut ctx = base_ctx();
        ctx.signature = None;

        let mut validator_with_secret = WebhookValidator::new(vec![], Some("shh".to_string()));
        let result = validator_with_secret.validate(&ctx);
        assert!(!result.allowed);
        assert!(result.failed.contains(&"webhook-signature-missing".to_string()));

        let mut validator_without_secret = WebhookValidator::new(vec![], None);
        let result = validator_without_secret.validate(&ctx);
        assert!(result.allowed);
    }

    #[test]
    fn cidr_matches_exact_slash32_and_range() {
        assert!(cidr_matches("192.168.1.5", "192.168.1.5/32"));
        assert!(cidr_matches("192.168.1.5", "192.168.1.0/24"));
        assert!(!cidr_matches("192.168.2.5", "192.168.1.0/24"));
        assert!(cidr_matches("::1", "127.0.0.1/32"));
    }

    #[test]
    fn cidr_falls_back_to_exact_string_match_on_parse_failure() {
        assert!(cidr_matches("not-an-ip", "not-an-ip"));
        assert!(!cidr_matches("not-an-ip", "other"));
    }

    #[test]
    fn ip_reputation_escalates_and_auto_blocks() {
        let mut tracker = IpReputationTracker::new();
        for _ in 0..10 {
            tracker.record("6.6.6.6", true);
        }
        assert_eq!(tracker.tier("6.6.6.6"), ReputationTier::Critical);
        assert!(tracker.is_auto_blocked("6.6.6.6"));
    }

    #[test]
    fn nonce_replay_detected_within_window() {
        let mut tracker = NonceTracker::new();
        assert!(tracker.check_nonce("abc"));
        assert!(!tracker.check_nonce("abc"));
    }
}
