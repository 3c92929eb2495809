//! C12 — Orchestrator: composes the full pipeline for one request.
//! Mutation steps (intake/state/append) surface failures to the caller
//! without rollback of earlier side effects; ledgers are append-only and
//! partial-failure records are themselves evidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::certificate::{self, SignatureCertificate, SignatureCertificateBody};
use crate::document::DocumentObject;
use crate::error::{SdcError, SdcResult};
use crate::export_policy::{ExportPolicyEngine, ExportRecord, ExportRequest};
use crate::intake::{AccessPolicyOverrides, IntakeEngine, IntakeRecord, IntakeState};
use crate::ledger::{ChainLedger, LedgerPayload, Severity};
use crate::ledger_adapter::{AnchorPayload, LedgerAdapterRegistry, LedgerReceipt};
use crate::rate_limiter::{BucketType, RateLimiter};
use crate::tokens::{AccessTokenService, IssueOptions, Recipient, ValidationOutcome};
use crate::watermark::WatermarkResult;
use crate::webhook::{RequestContext, ValidationResult, WebhookValidator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerimeterEvent {
    pub kind: String,
    pub source_ip: Option<String>,
    pub detail: String,
    pub severity: Severity,
}

impl LedgerPayload for PerimeterEvent {
    fn event_type(&self) -> &str {
        &self.kind
    }
    fn severity(&self) -> Severity {
        self.severity
    }
    fn source_id(&self) -> Option<&str> {
        self.source_ip.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEvent {
    pub kind: String,
    pub document_id: String,
    pub recipient: Option<String>,
    pub detail: String,
    pub severity: Severity,
}

impl LedgerPayload for AccessEvent {
    fn event_type(&self) -> &str {
        &self.kind
    }
    fn severity(&self) -> Severity {
        self.severity
    }
    fn actor(&self) -> Option<&str> {
        self.recipient.as_deref()
    }
    fn source_id(&self) -> Option<&str> {
        Some(&self.document_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub kind: String,
    pub document_id: Option<String>,
    pub detail: String,
    pub severity: Severity,
}

impl LedgerPayload for ConversationEvent {
    fn event_type(&self) -> &str {
        &self.kind
    }
    fn severity(&self) -> Severity {
        self.severity
    }
    fn source_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub intake_record: IntakeRecord,
    pub sku: String,
    pub document_hash: String,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub record: ExportRecord,
    pub watermark: Option<WatermarkResult>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccessOutcome {
    pub validation: ValidationOutcome,
}

/// Owns the lifetime of every per-component engine plus the three
/// chain-hashed ledgers, and wires them together for the pipelines a
/// caller actually drives (,  "process-wide owned state with
/// explicit lifecycle").
pub struct Orchestrator {
    pub intake: IntakeEngine,
    pub tokens: AccessTokenService,
    pub exports: ExportPolicyEngine,
    pub webhook: WebhookValidator,
    pub rate_limiter: RateLimiter,
    pub ledger_adapters: LedgerAdapterRegistry,
    perimeter_ledger: ChainLedger<PerimeterEvent>,
    access_ledger: ChainLedger<AccessEvent>,
    conversation_ledger: ChainLedger<ConversationEvent>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        intake: IntakeEngine,
        tokens: AccessTokenService,
        exports: ExportPolicyEngine,
        webhook: WebhookValidator,
        rate_limiter: RateLimiter,
        ledger_adapters: LedgerAdapterRegistry,
        perimeter_ledger: ChainLedger<PerimeterEvent>,
        access_ledger: ChainLedger<AccessEvent>,
        conversation_ledger: ChainLedger<ConversationEvent>,
    ) -> Self {
        Self {
            intake,
            tokens,
            exports,
            webhook,
            rate_limiter,
            ledger_adapters,
            perimeter_ledger,
            access_ledger,
            conversation_ledger,
        }
    }

    pub fn perimeter_ledger(&self) -> &ChainLedger<PerimeterEvent> {
        &self.perimeter_ledger
    }

    pub fn access_ledger(&self) -> &ChainLedger<AccessEvent> {
        &self.access_ledger
    }

    pub fn conversation_ledger(&self) -> &ChainLedger<ConversationEvent> {
        &self.conversation_ledger
    }

    /// Retry transient I/O once; on the second failure, surface and
    /// record. Only applied to steps classified as transient (store
    /// writes, anchor calls) — policy denials and integrity failures are
    /// never retried.
    fn retry_once<T>(mut op: impl FnMut() -> SdcResult<T>) -> SdcResult<T> {
        match op() {
            Ok(v) => Ok(v),
            Err(first_err) => {
                warn!(error = %first_err, "transient operation failed, retrying once");
                op().map_err(|second_err| {
                    warn!(error = %second_err, "transient operation failed again, surfacing");
                    second_err
                })
            }
        }
    }

    /// Classify, tier, and open an intake record for a newly arrived
    /// document; derive its SKU; record an ingest event to the perimeter
    /// ledger.
    pub fn ingest(
        &mut self,
        doc: &DocumentObject,
        document_id: &str,
        owner: &str,
        jurisdiction: &str,
        year: u32,
        overrides: Option<AccessPolicyOverrides>,
    ) -> SdcResult<IngestOutcome> {
        let document_hash = crate::canonical::canonical_hash_hex(doc);
        let sku = certificate::generate_sku(doc, jurisdiction, year, 1);

        let intake_record = Self::retry_once(|| {
            self.intake.intake(doc, document_id, &document_hash, Some(sku.clone()), owner, overrides.clone())
        })?;

        self.perimeter_ledger.append(PerimeterEvent {
            kind: "document-ingested".to_string(),
            source_ip: None,
            detail: format!("document {document_id} classified {:?}/{:?}", intake_record.classification, intake_record.risk_tier),
            severity: Severity::Info,
        })?;

        info!(document_id, sku = %sku, "document ingested");
        Ok(IngestOutcome {
            intake_record,
            sku,
            document_hash,
        })
    }

    /// Advance an IntakeRecord's lifecycle state, recording both the
    /// transition and a conversation-ledger trace entry.
    pub fn advance_lifecycle(
        &mut self,
        document_id: &str,
        to: IntakeState,
        actor: &str,
        reason: &str,
    ) -> SdcResult<IntakeRecord> {
        let record = self.intake.advance(document_id, to, actor, reason)?;
        self.conversation_ledger.append(ConversationEvent {
            kind: "lifecycle-transition".to_string(),
            document_id: Some(document_id.to_string()),
            detail: format!("{actor}: {reason}"),
            severity: Severity::Info,
        })?;
        Ok(record)
    }

    /// Issue an access token for a recipient and log the issuance to the
    /// access ledger.
    pub fn issue_access_token(
        &mut self,
        document_id: &str,
        intake_id: &str,
        recipient: Recipient,
        opts: IssueOptions,
    ) -> SdcResult<crate::tokens::AccessToken> {
        let recipient_email = recipient.email.clone();
        let token = self.tokens.issue(document_id, intake_id, recipient, opts)?;
        self.access_ledger.append(AccessEvent {
            kind: "token-issued".to_string(),
            document_id: document_id.to_string(),
            recipient: Some(recipient_email),
            detail: format!("token {} issued", token.token_id),
            severity: Severity::Info,
        })?;
        Ok(token)
    }

    /// Validate an access attempt and record the outcome (always, pass or
    /// fail) to the access ledger (,  "policy denials always
    /// recorded").
    pub fn access_document(
        &mut self,
        document_id: &str,
        secret: &str,
        ip: Option<&str>,
        device: Option<&str>,
    ) -> SdcResult<AccessOutcome> {
        let validation = self.tokens.validate(secret, ip, device)?;
        let severity = if validation.valid { Severity::Info } else { Severity::Warn };
        self.access_ledger.append(AccessEvent {
            kind: "access-attempt".to_string(),
            document_id: document_id.to_string(),
            recipient: None,
            detail: validation.reason.clone().unwrap_or_else(|| "granted".to_string()),
            severity,
        })?;
        Ok(AccessOutcome { validation })
    }

    /// Gate + watermark + log an export request.
    pub fn export(&mut self, req: &ExportRequest) -> SdcResult<ExportOutcome> {
        let (record, watermark, password) = self.exports.process_export(req)?;
        let severity = if record.allowed { Severity::Info } else { Severity::Warn };
        self.access_ledger.append(AccessEvent {
            kind: "export-attempt".to_string(),
            document_id: req.document_id.clone(),
            recipient: Some(req.recipient_email.clone()),
            detail: record.denial_reason.clone().unwrap_or_else(|| "export allowed".to_string()),
            severity,
        })?;
        Ok(ExportOutcome { record, watermark, password })
    }

    /// Rate-limit then composite-validate an inbound webhook request; log
    /// the decision to the perimeter ledger regardless of outcome (,
    /// , ).
    pub fn handle_webhook(&mut self, ctx: &RequestContext, endpoint: &str) -> SdcResult<ValidationResult> {
        let rate = self.rate_limiter.check(BucketType::Ip, &ctx.source_ip, Some(endpoint));
        if !rate.allowed {
            self.perimeter_ledger.append(PerimeterEvent {
                kind: "rate-limit-block".to_string(),
                source_ip: Some(ctx.source_ip.clone()),
                detail: format!("bucket {} blocked", rate.bucket_key),
                severity: Severity::Alert,
            })?;
            return Err(SdcError::PolicyDenied(format!("rate limited: {}", rate.bucket_key)));
        }

        let result = self.webhook.validate(ctx);
        let severity = if result.allowed {
            Severity::Info
        } else if result.risk_score >= 50 {
            Severity::Critical
        } else {
            Severity::Alert
        };
        self.perimeter_ledger.append(PerimeterEvent {
            kind: if result.allowed { "validation-pass".to_string() } else { "validation-fail".to_string() },
            source_ip: Some(ctx.source_ip.clone()),
            detail: format!("risk={} failed={:?}", result.risk_score, result.failed),
            severity,
        })?;
        Ok(result)
    }

    /// Issue a signature certificate and record its hash to the
    /// conversation ledger.
    pub fn issue_certificate(&mut self, document_id: &str, body: SignatureCertificateBody) -> SdcResult<SignatureCertificate> {
        let cert = certificate::issue_certificate(body);
        self.conversation_ledger.append(ConversationEvent {
            kind: "certificate-issued".to_string(),
            document_id: Some(document_id.to_string()),
            detail: cert.certificate_hash.clone(),
            severity: Severity::Info,
        })?;
        Ok(cert)
    }

    /// Anchor a payload on the active chain; transient network failures
    /// are retried once by the registry call, then surfaced and logged as
    /// a perimeter-ledger `warn` event with no anchor entry written for
    /// the incomplete attempt.
    pub async fn anchor_document(&mut self, document_id: &str, payload: &AnchorPayload) -> SdcResult<LedgerReceipt> {
        let outcome = self.ledger_adapters.anchor(payload).await;
        match outcome.receipt {
            Some(receipt) => {
                self.conversation_ledger.append(ConversationEvent {
                    kind: "document-anchored".to_string(),
                    document_id: Some(document_id.to_string()),
                    detail: format!("chain={:?} receipt={}", receipt.chain, receipt.receipt_id),
                    severity: Severity::Info,
                })?;
                Ok(receipt)
            }
            None => {
                let error = outcome.error.unwrap_or_else(|| "anchor failed".to_string());
                self.perimeter_ledger.append(PerimeterEvent {
                    kind: "anchor-timeout".to_string(),
                    source_ip: None,
                    detail: format!("document {document_id}: {error}"),
                    severity: Severity::Warn,
                })?;
                Err(SdcError::Other(anyhow::anyhow!("anchor failed: {error}")))
            }
        }
    }

    /// Integrity sweep across all three ledgers, used by the CLI's
    /// `ledger-anchor`/health paths.
    pub fn verify_all_ledgers(&self) -> (crate::ledger::IntegrityReport, crate::ledger::IntegrityReport, crate::ledger::IntegrityReport) {
        (
            self.perimeter_ledger.verify_integrity(),
            self.access_ledger.verify_integrity(),
            self.conversation_ledger.verify_integrity(),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrchestratorHealth {
    pub perimeter_intact: bool,
    pub access_intact: bool,
    pub conversation_intact: bool,
    pub checked_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn health(&self) -> OrchestratorHealth {
        let (p, a, c) = self.verify_all_ledgers();
        OrchestratorHealth {
            perimeter_intact: p.intact,
            access_intact: a.intact,
            conversation_intact: c.intact,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentMetadata, DocumentObject};
    use crate::export_policy::ExportFormat;
    use crate::intake::{ExportPolicy, WatermarkPolicy};
    use crate::webhook::RequestContext;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn build_orchestrator(dir: &std::path::Path) -> Orchestrator {
        Orchestrator::new(
            IntakeEngine::open(dir.join("sdc-intake.json")),
            AccessTokenService::open(dir.join("sdc-tokens.json")),
            ExportPolicyEngine::open(dir.join("sdc-export-log.json")),
            WebhookValidator::new(vec![], None),
            RateLimiter::with_defaults(),
            LedgerAdapterRegistry::new(),
            ChainLedger::open("perimeter", dir.join("perimeter-ledger.json")),
            ChainLedger::open("access", dir.join("sdc-access-ledger.json")),
            ChainLedger::open("conversation", dir.join("sca-conversation-ledger.json")),
        )
    }

    fn sample_doc() -> DocumentObject {
        DocumentObject {
            metadata: DocumentMetadata {
                title: "Agreement between parties".to_string(),
                ..Default::default()
            },
            raw_text: "this contract is a binding agreement".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn ingest_writes_intake_record_and_perimeter_event() {
        let dir = tempdir().unwrap();
        let mut orch = build_orchestrator(dir.path());
        let outcome = orch
            .ingest(&sample_doc(), "doc-1", "owner@example.com", "US", 2026, None)
            .unwrap();
        assert_eq!(outcome.intake_record.state, IntakeState::Draft);
        assert!(!outcome.sku.is_empty());
        assert_eq!(orch.perimeter_ledger().len(), 1);
        assert!(orch.perimeter_ledger().verify_integrity().intact);
    }

    #[test]
    fn full_pipeline_ingest_advance_issue_access() {
        let dir = tempdir().unwrap();
        let mut orch = build_orchestrator(dir.path());
        let outcome = orch.ingest(&sample_doc(), "doc-1", "owner@example.com", "US", 2026, None).unwrap();

        orch.advance_lifecycle("doc-1", IntakeState::Internal, "owner", "go live").unwrap();

        let token = orch
            .issue_access_token(
                "doc-1",
                &outcome.intake_record.intake_id,
                Recipient { name: "Alice".to_string(), email: "alice@example.com".to_string(), phone: None, org: None },
                IssueOptions { max_uses: Some(1), ..Default::default() },
            )
            .unwrap();

        let access = orch.access_document("doc-1", &token.token_secret, None, None).unwrap();
        assert!(access.validation.valid);
        assert_eq!(orch.access_ledger().len(), 2);
        assert!(orch.access_ledger().verify_integrity().intact);
    }

    #[test]
    fn export_pipeline_logs_denial_reason() {
        let dir = tempdir().unwrap();
        let mut orch = build_orchestrator(dir.path());
        orch.ingest(&sample_doc(), "doc-1", "owner@example.com", "US", 2026, None).unwrap();

        let req = ExportRequest {
            document_id: "doc-1".to_string(),
            title: "Agreement".to_string(),
            recipient_name: "Alice".to_string(),
            recipient_email: "alice@example.com".to_string(),
            recipient_ip: None,
            export_policy: ExportPolicy::None,
            watermark_policy: WatermarkPolicy::None,
            format: ExportFormat::Html,
            content: "<p>body</p>".to_string(),
        };
        let outcome = orch.export(&req).unwrap();
        assert!(!outcome.record.allowed);
        assert_eq!(orch.access_ledger().len(), 1);
    }

    #[test]
    fn webhook_handling_records_perimeter_event_for_rate_limited_requests() {
        let dir = tempdir().unwrap();
        let mut orch = build_orchestrator(dir.path());
        orch.rate_limiter = RateLimiter::with_config(
            BucketType::Ip,
            crate::rate_limiter::RateLimitConfig { max_requests: 0, burst_allowance: 0, window: std::time::Duration::from_secs(60), block_duration: std::time::Duration::from_secs(60), exponential_backoff: false },
        );
        let ctx = RequestContext {
            source_ip: "1.2.3.4".to_string(),
            method: "POST".to_string(),
            path: "/webhook".to_string(),
            user_agent: "sdc-client/1.0".to_string(),
            content_type: "application/json".to_string(),
            content_length: 2,
            raw_body: "{}".to_string(),
            signature: None,
            signature_timestamp: None,
            headers: HashMap::new(),
        };
        let result = orch.handle_webhook(&ctx, "/webhook");
        assert!(result.is_err());
        assert_eq!(orch.perimeter_ledger().len(), 1);
    }

    #[tokio::test]
    async fn anchor_document_succeeds_with_offline_adapter() {
        let dir = tempdir().unwrap();
        let mut orch = build_orchestrator(dir.path());
        let payload = AnchorPayload {
            document_id: Some("doc-1".to_string()),
            sha256: Some("deadbeef".to_string()),
            ..Default::default()
        };
        let receipt = orch.anchor_document("doc-1", &payload).await.unwrap();
        assert_eq!(receipt.chain, crate::ledger_adapter::ChainKind::Offline);
        assert_eq!(orch.conversation_ledger().len(), 1);
    }

    #[test]
    fn health_reports_intact_ledgers() {
        let dir = tempdir().unwrap();
        let mut orch = build_orchestrator(dir.path());
        orch.ingest(&sample_doc(), "doc-1", "owner@example.com", "US", 2026, None).unwrap();
        let health = orch.health();
        assert!(health.perimeter_intact);
        assert!(health.access_intact);
        assert!(health.conversation_intact);
    }
}
