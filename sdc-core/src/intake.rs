//! C3 — IntakeEngine: classification, risk tiering, policy binding, and the
//! document lifecycle state machine. Nothing enters the platform
//! without passing through `intake()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storage::JsonFileStore;

use crate::document::DocumentObject;
use crate::error::{SdcError, SdcResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Legal,
    Financial,
    Compliance,
    Ip,
    Operational,
    Governance,
    Research,
    Custody,
    Issuance,
    Venue,
    Treasury,
    Risk,
    Counterparty,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Low,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeBinding {
    Infra,
    Issuer,
    Venue,
    #[serde(rename = "cross-mode")]
    CrossMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatermarkPolicy {
    None,
    Standard,
    Forensic,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportPolicy {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "VIEW_ONLY")]
    ViewOnly,
    #[serde(rename = "PDF_ONLY")]
    PdfOnly,
    #[serde(rename = "PDF_PASSWORD")]
    PdfPassword,
    #[serde(rename = "DOCX_RESTRICTED")]
    DocxRestricted,
    #[serde(rename = "FULL")]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntakeState {
    Draft,
    Internal,
    ExternalView,
    Signed,
    Locked,
    Archived,
    Revoked,
}

impl IntakeState {
    /// The transition table of , applied exactly — anything not
    /// listed is rejected with no state change.
    fn allowed_targets(self) -> &'static [IntakeState] {
        use IntakeState::*;
        match self {
            Draft => &[Internal, Revoked],
            Internal => &[ExternalView, Signed, Locked, Revoked],
            ExternalView => &[Signed, Locked, Revoked],
            Signed => &[Locked, Archived, Revoked],
            Locked => &[Archived, Revoked],
            Archived => &[Revoked],
            Revoked => &[],
        }
    }

    pub fn can_advance_to(self, target: IntakeState) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IntakeState::Revoked)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub allowed_entities: Vec<String>,
    pub max_views_per_recipient: u32,
    pub expiry_hours: u32,
    pub otp_required: bool,
    pub device_binding: bool,
    #[serde(default)]
    pub geo_allowlist: Vec<String>,
    pub reauth_minutes: u32,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    pub confidentiality_notice: String,
}

/// Field-by-field overrides a caller may supply at intake time; unset
/// fields fall through to the tier default ( "caller overrides win
/// field-by-field").
#[derive(Debug, Clone, Default)]
pub struct AccessPolicyOverrides {
    pub allowed_roles: Option<Vec<String>>,
    pub allowed_entities: Option<Vec<String>>,
    pub max_views_per_recipient: Option<u32>,
    pub expiry_hours: Option<u32>,
    pub otp_required: Option<bool>,
    pub device_binding: Option<bool>,
    pub geo_allowlist: Option<Vec<String>>,
    pub reauth_minutes: Option<u32>,
    pub ip_allowlist: Option<Vec<String>>,
}

impl AccessPolicyOverrides {
    fn apply(self, mut base: AccessPolicy) -> AccessPolicy {
        if let Some(v) = self.allowed_roles {
            base.allowed_roles = v;
        }
        if let Some(v) = self.allowed_entities {
            base.allowed_entities = v;
        }
        if let Some(v) = self.max_views_per_recipient {
            base.max_views_per_recipient = v;
        }
        if let Some(v) = self.expiry_hours {
            base.expiry_hours = v;
        }
        if let Some(v) = self.otp_required {
            base.otp_required = v;
        }
        if let Some(v) = self.device_binding {
            base.device_binding = v;
        }
        if let Some(v) = self.geo_allowlist {
            base.geo_allowlist = v;
        }
        if let Some(v) = self.reauth_minutes {
            base.reauth_minutes = v;
        }
        if let Some(v) = self.ip_allowlist {
            base.ip_allowlist = v;
        }
        base
    }
}

fn default_policy_for_tier(tier: RiskTier) -> AccessPolicy {
    match tier {
        RiskTier::Low => AccessPolicy {
            allowed_roles: vec!["admin".into(), "operator".into(), "viewer".into()],
            allowed_entities: vec![],
            max_views_per_recipient: 100,
            expiry_hours: 720,
            otp_required: false,
            device_binding: false,
            geo_allowlist: vec![],
            reauth_minutes: 60,
            ip_allowlist: vec![],
            confidentiality_notice: "Internal use only.".to_string(),
        },
        RiskTier::High => AccessPolicy {
            allowed_roles: vec!["admin".into(), "operator".into()],
            allowed_entities: vec![],
            max_views_per_recipient: 25,
            expiry_hours: 168,
            otp_required: true,
            device_binding: false,
            geo_allowlist: vec![],
            reauth_minutes: 30,
            ip_allowlist: vec![],
            confidentiality_notice: "Confidential — authorized recipients only.".to_string(),
        },
        RiskTier::Critical => AccessPolicy {
            allowed_roles: vec!["admin".into()],
            allowed_entities: vec![],
            max_views_per_recipient: 10,
            expiry_hours: 24,
            otp_required: true,
            device_binding: true,
            geo_allowlist: vec!["US".to_string()],
            reauth_minutes: 15,
            ip_allowlist: vec![],
            confidentiality_notice: "Sovereign-restricted — CRITICAL handling required.".to_string(),
        },
    }
}

struct ClassificationRule {
    classification: Classification,
    keywords: &'static [&'static str],
    risk_tier: RiskTier,
    mode_binding: ModeBinding,
    watermark_policy: WatermarkPolicy,
    export_policy: ExportPolicy,
}

/// ~13 rules, checked in declaration order; ties broken by that order
/// ( "highest non-zero score, ties broken by declaration order").
fn classification_rules() -> &'static [ClassificationRule] {
    use Classification::*;
    use ExportPolicy as EP;
    use ModeBinding::*;
    use RiskTier::*;
    use WatermarkPolicy as WP;
    &[
        ClassificationRule {
            classification: Legal,
            keywords: &["contract", "agreement", "clause", "litigation", "counsel", "indemnif"],
            risk_tier: High,
            mode_binding: CrossMode,
            watermark_policy: WP::Forensic,
            export_policy: EP::PdfPassword,
        },
        ClassificationRule {
            classification: Financial,
            keywords: &["invoice", "ledger", "balance sheet", "revenue", "financial statement"],
            risk_tier: High,
            mode_binding: Issuer,
            watermark_policy: WP::Forensic,
            export_policy: EP::PdfOnly,
        },
        ClassificationRule {
            classification: Compliance,
            keywords: &["compliance", "audit", "regulatory", "kyc", "aml"],
            risk_tier: Critical,
            mode_binding: CrossMode,
            watermark_policy: WP::Maximum,
            export_policy: EP::DocxRestricted,
        },
        ClassificationRule {
            classification: Ip,
            keywords: &["patent", "trademark", "trade secret", "intellectual property", "confidential invention"],
            risk_tier: Critical,
            mode_binding: CrossMode,
            watermark_policy: WP::Maximum,
            export_policy: EP::ViewOnly,
        },
        ClassificationRule {
            classification: Governance,
            keywords: &["bylaws", "board resolution", "governance", "charter", "voting rights"],
            risk_tier: High,
            mode_binding: Infra,
            watermark_policy: WP::Forensic,
            export_policy: EP::PdfOnly,
        },
        ClassificationRule {
            classification: Research,
            keywords: &["research", "study", "whitepaper", "experiment", "dataset"],
            risk_tier: Low,
            mode_binding: CrossMode,
            watermark_policy: WP::Standard,
            export_policy: EP::Full,
        },
        ClassificationRule {
            classification: Custody,
            keywords: &["custody", "custodian", "safekeeping", "asset holding"],
            risk_tier: Critical,
            mode_binding: Venue,
            watermark_policy: WP::Maximum,
            export_policy: EP::ViewOnly,
        },
        ClassificationRule {
            classification: Issuance,
            keywords: &["issuance", "prospectus", "offering memorandum", "subscription agreement"],
            risk_tier: High,
            mode_binding: Issuer,
            watermark_policy: WP::Forensic,
            export_policy: EP::PdfPassword,
        },
        ClassificationRule {
            classification: Venue,
            keywords: &["venue", "exchange listing", "trading rules", "market maker"],
            risk_tier: High,
            mode_binding: Venue,
            watermark_policy: WP::Forensic,
            export_policy: EP::PdfOnly,
        },
        ClassificationRule {
            classification: Treasury,
            keywords: &["treasury", "cash management", "liquidity", "reserve allocation"],
            risk_tier: High,
            mode_binding: Issuer,
            watermark_policy: WP::Forensic,
            export_policy: EP::PdfOnly,
        },
        ClassificationRule {
            classification: Risk,
            keywords: &["risk assessment", "risk register", "stress test", "exposure limit"],
            risk_tier: Critical,
            mode_binding: CrossMode,
            watermark_policy: WP::Maximum,
            export_policy: EP::DocxRestricted,
        },
        ClassificationRule {
            classification: Counterparty,
            keywords: &["counterparty", "due diligence", "onboarding questionnaire"],
            risk_tier: High,
            mode_binding: CrossMode,
            watermark_policy: WP::Forensic,
            export_policy: EP::PdfOnly,
        },
        ClassificationRule {
            classification: Public,
            keywords: &["press release", "public notice", "marketing", "announcement"],
            risk_tier: Low,
            mode_binding: CrossMode,
            watermark_policy: WP::None,
            export_policy: EP::Full,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: IntakeState,
    pub to: IntakeState,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub intake_id: String,
    pub document_id: String,
    pub document_hash: String,
    pub sku: Option<String>,
    pub classification: Classification,
    pub risk_tier: RiskTier,
    pub mode_binding: ModeBinding,
    pub watermark_policy: WatermarkPolicy,
    pub export_policy: ExportPolicy,
    pub owner: String,
    pub access_policy: AccessPolicy,
    pub state: IntakeState,
    pub state_history: Vec<StateTransition>,
    pub intake_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeFile {
    pub records: Vec<IntakeRecord>,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct IntakeEngine {
    store: JsonFileStore<IntakeFile>,
    file: IntakeFile,
}

/// Case-insensitive substring keyword count over `title ‖ rawText`.
fn score(rule: &ClassificationRule, haystack: &str) -> usize {
    rule.keywords.iter().filter(|kw| haystack.contains(*kw)).count()
}

pub fn classify(
    doc: &DocumentObject,
) -> (Classification, RiskTier, ModeBinding, WatermarkPolicy, ExportPolicy) {
    let haystack = format!("{} {}", doc.metadata.title, doc.raw_text).to_lowercase();
    let mut best: Option<(&ClassificationRule, usize)> = None;
    for rule in classification_rules() {
        let s = score(rule, &haystack);
        if s == 0 {
            continue;
        }
        match best {
            Some((_, best_score)) if s <= best_score => {}
            _ => best = Some((rule, s)),
        }
    }
    match best {
        Some((rule, _)) => (
            rule.classification,
            rule.risk_tier,
            rule.mode_binding,
            rule.watermark_policy,
            rule.export_policy,
        ),
        None => (
            Classification::Operational,
            RiskTier::Low,
            ModeBinding::CrossMode,
            WatermarkPolicy::Standard,
            ExportPolicy::PdfOnly,
        ),
    }
}

impl IntakeEngine {
    pub fn open(path: impl Into<std::path::PathBuf>) -> Self {
        let store: JsonFileStore<IntakeFile> = JsonFileStore::new(path);
        let file = store.load();
        Self { store, file }
    }

    fn persist(&mut self) -> SdcResult<()> {
        self.file.last_updated = Some(Utc::now());
        self.store.save(&self.file).map_err(SdcError::Storage)
    }

    pub fn intake(
        &mut self,
        doc: &DocumentObject,
        document_id: &str,
        document_hash: &str,
        sku: Option<String>,
        owner: &str,
        overrides: Option<AccessPolicyOverrides>,
    ) -> SdcResult<IntakeRecord> {
        let (classification, risk_tier, mode_binding, watermark_policy, export_policy) = classify(doc);
        let mut access_policy = default_policy_for_tier(risk_tier);
        if let Some(overrides) = overrides {
            access_policy = overrides.apply(access_policy);
        }

        let now = Utc::now();
        let mut record = IntakeRecord {
            intake_id: format!("intake-{}", crypto_primitives::SecureRandom::hex(8)),
            document_id: document_id.to_string(),
            document_hash: document_hash.to_string(),
            sku,
            classification,
            risk_tier,
            mode_binding,
            watermark_policy,
            export_policy,
            owner: owner.to_string(),
            access_policy,
            state: IntakeState::Draft,
            state_history: Vec::new(),
            intake_hash: String::new(),
            created_at: now,
            updated_at: now,
        };
        record.intake_hash = crate::canonical::canonical_generic_hash_hex(&record);
        self.file.records.push(record.clone());
        self.persist()?;
        Ok(record)
    }

    pub fn get(&self, document_id: &str) -> Option<&IntakeRecord> {
        self.file.records.iter().find(|r| r.document_id == document_id)
    }

    /// Advance a record's lifecycle state. Rejects anything not in the
    /// transition table with no state change; revocation from any
    /// non-terminal state is always allowed.
    pub fn advance(
        &mut self,
        document_id: &str,
        to: IntakeState,
        actor: &str,
        reason: &str,
    ) -> SdcResult<IntakeRecord> {
        let idx = self
            .file
            .records
            .iter()
            .position(|r| r.document_id == document_id)
            .ok_or_else(|| SdcError::NotFound(format!("intake record for document {document_id}")))?;

        let from = self.file.records[idx].state;
        if !from.can_advance_to(to) {
            return Err(SdcError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }

        let now = Utc::now();
        {
            let record = &mut self.file.records[idx];
            record.state_history.push(StateTransition {
                from,
                to,
                timestamp: now,
                actor: actor.to_string(),
                reason: reason.to_string(),
            });
            record.state = to;
            record.updated_at = now;
            record.intake_hash = crate::canonical::canonical_generic_hash_hex(&record.clone());
        }
        self.persist()?;
        Ok(self.file.records[idx].clone())
    }

    /// `isAuthorized`: rejects on missing record, terminal/draft
    /// state, no role/entity match, or IP allowlist miss.
    pub fn is_authorized(
        &self,
        document_id: &str,
        recipient_id: &str,
        roles: &[String],
        ip: Option<&str>,
    ) -> (bool, String) {
        let Some(record) = self.get(document_id) else {
            return (false, "no intake record for document".to_string());
        };
        if matches!(record.state, IntakeState::Revoked | IntakeState::Draft) {
            return (false, format!("document is {:?}", record.state));
        }
        let has_role = roles.iter().any(|r| record.access_policy.allowed_roles.contains(r));
        let has_entity = record.access_policy.allowed_entities.iter().any(|e| e == recipient_id);
        if !has_role && !has_entity {
            return (false, "recipient has no authorized role or entity match".to_string());
        }
        if !record.access_policy.ip_allowlist.is_empty() {
            match ip {
                Some(ip) if record.access_policy.ip_allowlist.iter().any(|a| a == ip) => {}
                _ => return (false, "ip not in allowlist".to_string()),
            }
        }
        (true, "authorized".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentMetadata, DocumentObject};
    use tempfile::tempdir;

    fn doc_with_text(title: &str, raw_text: &str) -> DocumentObject {
        DocumentObject {
            metadata: DocumentMetadata {
                title: title.to_string(),
                ..Default::default()
            },
            raw_text: raw_text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn classify_defaults_to_operational_low_on_zero_matches() {
        let doc = doc_with_text("Quarterly Newsletter", "nothing special here at all");
        let (c, tier, mode, wm, ep) = classify(&doc);
        assert_eq!(c, Classification::Operational);
        assert_eq!(tier, RiskTier::Low);
        assert_eq!(mode, ModeBinding::CrossMode);
        assert_eq!(wm, WatermarkPolicy::Standard);
        assert_eq!(ep, ExportPolicy::PdfOnly);
    }

    #[test]
    fn classify_picks_highest_scoring_rule() {
        let doc = doc_with_text(
            "Compliance Audit Report",
            "this document covers regulatory compliance and kyc checks across the audit",
        );
        let (c, tier, _, _, _) = classify(&doc);
        assert_eq!(c, Classification::Compliance);
        assert_eq!(tier, RiskTier::Critical);
    }

    #[test]
    fn s4_state_machine_sequence() {
        let dir = tempdir().unwrap();
        let mut engine = IntakeEngine::open(dir.path().join("sdc-intake.json"));
        let doc = doc_with_text("Agreement", "a contract between parties");
        engine.intake(&doc, "doc-1", "hash-1", None, "owner@example.com", None).unwrap();

        engine.advance("doc-1", IntakeState::Internal, "owner", "move to internal").unwrap();
        engine.advance("doc-1", IntakeState::Signed, "owner", "signed").unwrap();
        let archived = engine.advance("doc-1", IntakeState::Archived, "owner", "archive").unwrap();
        assert_eq!(archived.state, IntakeState::Archived);

        let rejected = engine.advance("doc-1", IntakeState::Draft, "owner", "bad");
        assert!(rejected.is_err());
        assert_eq!(engine.get("doc-1").unwrap().state, IntakeState::Archived);

        let revoked = engine.advance("doc-1", IntakeState::Revoked, "owner", "revoke").unwrap();
        assert_eq!(revoked.state, IntakeState::Revoked);

        let rejected_again = engine.advance("doc-1", IntakeState::Internal, "owner", "bad");
        assert!(rejected_again.is_err());
    }

    #[test]
    fn is_authorized_rejects_draft_and_revoked() {
        let dir = tempdir().unwrap();
        let mut engine = IntakeEngine::open(dir.path().join("sdc-intake.json"));
        let doc = doc_with_text("Public Notice", "a public notice announcement");
        engine.intake(&doc, "doc-2", "hash-2", None, "owner@example.com", None).unwrap();

        let (authorized, _) = engine.is_authorized("doc-2", "viewer@example.com", &["viewer".into()], None);
        assert!(!authorized, "draft documents are never authorized");

        engine.advance("doc-2", IntakeState::Internal, "owner", "go live").unwrap();
        let (authorized, _) = engine.is_authorized("doc-2", "viewer@example.com", &["viewer".into()], None);
        assert!(authorized);
    }
}
