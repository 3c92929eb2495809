//! C6 — ExportPolicyEngine: gate export requests by policy/format, invoke
//! watermarking, and log every attempt (allowed or denied).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storage::JsonFileStore;

use crate::error::{SdcError, SdcResult};
use crate::intake::ExportPolicy;
use crate::watermark::{self, WatermarkRequest, WatermarkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Html,
    Pdf,
    Docx,
    Json,
}

/// The policy x format gate table: which export formats a given policy allows.
pub fn check_policy(policy: ExportPolicy, format: ExportFormat) -> bool {
    use ExportFormat::*;
    use ExportPolicy::*;
    matches!(
        (policy, format),
        (ViewOnly, Html)
            | (PdfOnly, Html)
            | (PdfOnly, Pdf)
            | (PdfPassword, Html)
            | (PdfPassword, Pdf)
            | (DocxRestricted, Html)
            | (DocxRestricted, Pdf)
            | (DocxRestricted, Docx)
            | (Full, Html)
            | (Full, Pdf)
            | (Full, Docx)
            | (Full, Json)
    )
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub document_id: String,
    pub title: String,
    pub recipient_name: String,
    pub recipient_email: String,
    pub recipient_ip: Option<String>,
    pub export_policy: ExportPolicy,
    pub watermark_policy: crate::intake::WatermarkPolicy,
    pub format: ExportFormat,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub export_id: String,
    pub document_id: String,
    pub format: ExportFormat,
    pub policy: ExportPolicy,
    pub allowed: bool,
    pub denial_reason: Option<String>,
    pub export_hash: Option<String>,
    pub watermark_id: Option<String>,
    pub output_path: Option<String>,
    pub password_protected: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportLogFile {
    pub items: Vec<ExportRecord>,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct ExportPolicyEngine {
    store: JsonFileStore<ExportLogFile>,
    file: ExportLogFile,
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Deterministic readable password, delivered out-of-band; the record only
/// notes `passwordProtected = true`.
pub fn generate_export_password(email: &str, document_id: &str, now: &DateTime<Utc>) -> String {
    let hash = crypto_primitives::sha256_hex(
        format!("sdc-password:{email}{document_id}{}", now.to_rfc3339()).as_bytes(),
    );
    let prefix = hash[..16].to_uppercase();
    prefix
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect::<Vec<_>>()
        .join("-")
}

impl ExportPolicyEngine {
    pub fn open(path: impl Into<std::path::PathBuf>) -> Self {
        let store: JsonFileStore<ExportLogFile> = JsonFileStore::new(path);
        let file = store.load();
        Self { store, file }
    }

    fn persist(&mut self) -> SdcResult<()> {
        self.file.last_updated = Some(Utc::now());
        self.store.save(&self.file).map_err(SdcError::Storage)
    }

    pub fn process_export(
        &mut self,
        req: &ExportRequest,
    ) -> SdcResult<(ExportRecord, Option<WatermarkResult>, Option<String>)> {
        let export_id = format!("export-{}", crypto_primitives::SecureRandom::hex(8));
        let now = Utc::now();

        if !check_policy(req.export_policy, req.format) {
            let record = ExportRecord {
                export_id,
                document_id: req.document_id.clone(),
                format: req.format,
                policy: req.export_policy,
                allowed: false,
                denial_reason: Some(format!(
                    "export policy {:?} does not permit format {:?}",
                    req.export_policy, req.format
                )),
                export_hash: None,
                watermark_id: None,
                output_path: None,
                password_protected: false,
                timestamp: now,
            };
            self.file.items.push(record.clone());
            self.persist()?;
            return Ok((record, None, None));
        }

        let watermark_result = if matches!(req.watermark_policy, crate::intake::WatermarkPolicy::None) {
            None
        } else {
            Some(watermark::generate(&WatermarkRequest {
                document_id: req.document_id.clone(),
                title: req.title.clone(),
                recipient_name: req.recipient_name.clone(),
                recipient_email: req.recipient_email.clone(),
                recipient_ip: req.recipient_ip.clone(),
                policy: req.watermark_policy,
                confidentiality_notice: String::new(),
            }))
        };

        let password = if matches!(req.export_policy, ExportPolicy::PdfPassword) && req.format == ExportFormat::Pdf {
            Some(generate_export_password(&req.recipient_email, &req.document_id, &now))
        } else {
            None
        };

        let mut output_content = req.content.clone();
        if let Some(wm) = &watermark_result {
            if let Some(visible) = &wm.visible_text {
                output_content = match req.format {
                    ExportFormat::Json => output_content,
                    _ => format!("{output_content}\n<!-- {visible} -->"),
                };
            }
        }

        let export_hash = crypto_primitives::sha256_hex(output_content.as_bytes());
        let output_path = format!(
            "{}-{}-{}.{}",
            sanitize(&req.title),
            sanitize(&req.recipient_email),
            &export_id[export_id.len().saturating_sub(8)..],
            match req.format {
                ExportFormat::Html => "html",
                ExportFormat::Pdf => "pdf",
                ExportFormat::Docx => "docx",
                ExportFormat::Json => "json",
            }
        );

        let record = ExportRecord {
            export_id,
            document_id: req.document_id.clone(),
            format: req.format,
            policy: req.export_policy,
            allowed: true,
            denial_reason: None,
            export_hash: Some(export_hash),
            watermark_id: watermark_result.as_ref().map(|w| w.watermark_id.clone()),
            output_path: Some(output_path),
            password_protected: password.is_some(),
            timestamp: now,
        };
        self.file.items.push(record.clone());
        self.persist()?;
        Ok((record, watermark_result, password))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::WatermarkPolicy;
    use tempfile::tempdir;

    fn request(policy: ExportPolicy, format: ExportFormat) -> ExportRequest {
        ExportRequest {
            document_id: "doc-1".to_string(),
            title: "Agreement".to_string(),
            recipient_name: "Alice".to_string(),
            recipient_email: "alice@example.com".to_string(),
            recipient_ip: None,
            export_policy: policy,
            watermark_policy: WatermarkPolicy::Forensic,
            format,
            content: "<p>document body</p>".to_string(),
        }
    }

    #[test]
    fn policy_table_matches_spec() {
        assert!(check_policy(ExportPolicy::None, ExportFormat::Html) == false);
        assert!(check_policy(ExportPolicy::ViewOnly, ExportFormat::Html));
        assert!(!check_policy(ExportPolicy::ViewOnly, ExportFormat::Pdf));
        assert!(check_policy(ExportPolicy::PdfOnly, ExportFormat::Pdf));
        assert!(!check_policy(ExportPolicy::PdfOnly, ExportFormat::Docx));
        assert!(check_policy(ExportPolicy::DocxRestricted, ExportFormat::Docx));
        assert!(!check_policy(ExportPolicy::DocxRestricted, ExportFormat::Json));
        assert!(check_policy(ExportPolicy::Full, ExportFormat::Json));
    }

    #[test]
    fn denied_export_writes_denial_record_with_no_hash() {
        let dir = tempdir().unwrap();
        let mut engine = ExportPolicyEngine::open(dir.path().join("sdc-export-log.json"));
        let (record, wm, pw) = engine.process_export(&request(ExportPolicy::None, ExportFormat::Html)).unwrap();
        assert!(!record.allowed);
        assert!(record.export_hash.is_none());
        assert!(wm.is_none());
        assert!(pw.is_none());
    }

    #[test]
    fn pdf_password_policy_generates_grouped_password() {
        let dir = tempdir().unwrap();
        let mut engine = ExportPolicyEngine::open(dir.path().join("sdc-export-log.json"));
        let (record, _, password) = engine
            .process_export(&request(ExportPolicy::PdfPassword, ExportFormat::Pdf))
            .unwrap();
        assert!(record.allowed);
        assert!(record.password_protected);
        let password = password.unwrap();
        assert_eq!(password.len(), 19);
        assert_eq!(password.matches('-').count(), 3);
    }

    #[test]
    fn allowed_export_embeds_watermark_and_logs() {
        let dir = tempdir().unwrap();
        let mut engine = ExportPolicyEngine::open(dir.path().join("sdc-export-log.json"));
        let (record, wm, _) = engine
            .process_export(&request(ExportPolicy::Full, ExportFormat::Html))
            .unwrap();
        assert!(record.allowed);
        assert!(wm.is_some());
        assert!(record.export_hash.is_some());
    }
}
