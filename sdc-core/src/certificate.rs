//! C10 — SignatureCertificate, SKU, and QR: binds a signature event to a
//! self-hashed, ESIGN-style certificate; derives a deterministic document
//! SKU; and renders a non-ISO visual fingerprint in place of a real QR
//! encoder (, out of scope by ).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::DocumentObject;

// ---------------------------------------------------------------- SKU ----

const TITLE_DOCTYPE_RULES: &[(&str, &str, &str)] = &[
    ("invoice", "FIN", "INVOICE"),
    ("contract", "LEGAL", "CONTRACT"),
    ("agreement", "LEGAL", "AGREEMENT"),
    ("prospectus", "ISSU", "PROSPECTUS"),
    ("offering memorandum", "ISSU", "OFFERING-MEMO"),
    ("certificate", "CUST", "CERTIFICATE"),
    ("compliance", "COMP", "AUDIT"),
    ("audit", "COMP", "AUDIT"),
    ("press release", "PUB", "PRESS-RELEASE"),
    ("board resolution", "GOV", "RESOLUTION"),
];

const TAG_DOCTYPE_RULES: &[(&str, &str, &str)] = &[
    ("invoice", "FIN", "INVOICE"),
    ("contract", "LEGAL", "CONTRACT"),
    ("signature", "LEGAL", "SIGNED-DOC"),
    ("custody", "CUST", "CUSTODY-RECORD"),
    ("compliance", "COMP", "AUDIT"),
];

const DEFAULT_DOCTYPE: &str = "DOC";
const DEFAULT_SUBTYPE: &str = "GENERAL";

/// Detect `(DOCTYPE, SUBTYPE)`: semantic tags first, then title keywords,
/// then the default.
pub fn detect_doctype(doc: &DocumentObject) -> (String, String) {
    for tag in &doc.semantic_tags {
        let tag_lower = tag.to_lowercase();
        if let Some((_, doctype, subtype)) = TAG_DOCTYPE_RULES.iter().find(|(kw, _, _)| tag_lower.contains(kw)) {
            return (doctype.to_string(), subtype.to_string());
        }
    }
    let title_lower = doc.metadata.title.to_lowercase();
    if let Some((_, doctype, subtype)) = TITLE_DOCTYPE_RULES.iter().find(|(kw, _, _)| title_lower.contains(kw)) {
        return (doctype.to_string(), subtype.to_string());
    }
    (DEFAULT_DOCTYPE.to_string(), DEFAULT_SUBTYPE.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuComponents {
    pub doctype: String,
    pub subtype: String,
    pub jurisdiction: String,
    pub year: u32,
    pub version: u32,
    pub hash4: String,
}

/// `{DOCTYPE}-{SUBTYPE}-{JURISDICTION}-{YEAR}-V{N}-{HASH4}` where HASH4 is
/// the first 4 uppercase hex chars of `SHA256(JSON(documentObject))`.
pub fn generate_sku(doc: &DocumentObject, jurisdiction: &str, year: u32, version: u32) -> String {
    let (doctype, subtype) = detect_doctype(doc);
    let doc_json = serde_json::to_vec(doc).expect("document serializes");
    let full_hash = crypto_primitives::sha256_hex(&doc_json);
    let hash4 = full_hash[..4].to_uppercase();
    format!("{doctype}-{subtype}-{jurisdiction}-{year}-V{version}-{hash4}")
}

/// Parse a SKU back into its components. The subtype may itself contain
/// hyphens, so jurisdiction/year/version/hash4 are peeled off the tail
/// and doctype off the head, with everything remaining joined back into
/// the subtype ( "parseable back via trailing-field extraction").
pub fn parse_sku(sku: &str) -> Option<SkuComponents> {
    let parts: Vec<&str> = sku.split('-').collect();
    if parts.len() < 6 {
        return None;
    }
    let hash4 = parts[parts.len() - 1].to_string();
    let version = parts[parts.len() - 2].strip_prefix('V')?.parse::<u32>().ok()?;
    let year = parts[parts.len() - 3].parse::<u32>().ok()?;
    let jurisdiction = parts[parts.len() - 4].to_string();
    let doctype = parts[0].to_string();
    let subtype = parts[1..parts.len() - 4].join("-");
    Some(SkuComponents {
        doctype,
        subtype,
        jurisdiction,
        year,
        version,
        hash4,
    })
}

// --------------------------------------------------- SignatureCertificate

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAttestation {
    pub fingerprint: String,
    pub platform: String,
    pub user_agent: String,
}

/// Everything the certificate's self-hash is computed over. Kept
/// separate from `SignatureCertificate` so the hash input is exactly the
/// body, never the certificate id or the hash field itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureCertificateBody {
    pub document_hash: String,
    pub merkle_root: String,
    pub signer_name: String,
    pub signer_email: String,
    pub signature_hash: String,
    pub previous_signature_hash: Option<String>,
    pub chain_position: u32,
    pub timestamp: DateTime<Utc>,
    pub consent: ConsentRecord,
    pub device: DeviceAttestation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureCertificate {
    pub certificate_id: String,
    pub body: SignatureCertificateBody,
    pub certificate_hash: String,
}

/// Self-hash the body (sorted-key canonical JSON, ) and wrap it in a
/// certificate with a fresh id.
pub fn issue_certificate(body: SignatureCertificateBody) -> SignatureCertificate {
    let certificate_id = format!("cert-{}", crypto_primitives::SecureRandom::hex(8));
    let certificate_hash = crate::canonical::canonical_generic_hash_hex(&body);
    SignatureCertificate {
        certificate_id,
        body,
        certificate_hash,
    }
}

/// Recompute the self-hash and confirm every field required for ESIGN
/// compliance is non-empty. Returns the list of problems found,
/// empty on success.
pub fn verify_certificate(cert: &SignatureCertificate) -> Vec<String> {
    let mut problems = Vec::new();
    let recomputed = crate::canonical::canonical_generic_hash_hex(&cert.body);
    if recomputed != cert.certificate_hash {
        problems.push("certificate hash does not match recomputed body hash".to_string());
    }
    let required = [
        ("document_hash", &cert.body.document_hash),
        ("merkle_root", &cert.body.merkle_root),
        ("signer_name", &cert.body.signer_name),
        ("signer_email", &cert.body.signer_email),
        ("signature_hash", &cert.body.signature_hash),
        ("consent.method", &cert.body.consent.method),
        ("device.fingerprint", &cert.body.device.fingerprint),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            problems.push(format!("required field '{field}' is empty"));
        }
    }
    problems
}

// ------------------------------------------------------------------ QR ----

#[derive(Debug, Clone, Default)]
pub struct QrPayloadFields {
    pub sku: String,
    pub sha256: String,
    pub merkle_root: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub encrypted_cid: Option<String>,
    pub signature: Option<String>,
    pub url: Option<String>,
}

/// Pipe-delimited payload `SKU:...|H:...|M:...|T:...[|CID:...][|SIG:...][|URL:...]`.
pub fn build_qr_payload(fields: &QrPayloadFields) -> String {
    let timestamp = fields.timestamp.unwrap_or_else(Utc::now);
    let mut parts = vec![
        format!("SKU:{}", fields.sku),
        format!("H:{}", fields.sha256),
        format!("M:{}", fields.merkle_root),
        format!("T:{}", timestamp.to_rfc3339()),
    ];
    if let Some(cid) = &fields.encrypted_cid {
        parts.push(format!("CID:{cid}"));
    }
    if let Some(sig) = &fields.signature {
        parts.push(format!("SIG:{sig}"));
    }
    if let Some(url) = &fields.url {
        parts.push(format!("URL:{url}"));
    }
    parts.join("|")
}

const QR_SIZE: usize = 33;

/// Deterministic 33x33 boolean matrix seeded from `SHA256(payload)`. This
/// is a visual fingerprint, not an ISO-18004 QR encoder ( non-goal, ).
pub fn qr_matrix(payload: &str) -> Vec<Vec<bool>> {
    let seed = crypto_primitives::sha256(payload.as_bytes());
    (0..QR_SIZE)
        .map(|row| {
            (0..QR_SIZE)
                .map(|col| {
                    let idx = (row * QR_SIZE + col) % seed.len();
                    let shift = (row + col) % 8;
                    (seed[idx] >> shift) & 1 == 1
                })
                .collect()
        })
        .collect()
}

/// Render the deterministic matrix as a minimal SVG, one `<rect>` per set
/// cell.
pub fn render_qr_svg(payload: &str) -> String {
    const CELL: usize = 4;
    let matrix = qr_matrix(payload);
    let size = QR_SIZE * CELL;
    let mut svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{size}\" height=\"{size}\" viewBox=\"0 0 {size} {size}\">"
    );
    svg.push_str("<rect width=\"100%\" height=\"100%\" fill=\"#ffffff\"/>");
    for (row, cells) in matrix.iter().enumerate() {
        for (col, &on) in cells.iter().enumerate() {
            if on {
                svg.push_str(&format!(
                    "<rect x=\"{}\" y=\"{}\" width=\"{CELL}\" height=\"{CELL}\" fill=\"#000000\"/>",
                    col * CELL,
                    row * CELL
                ));
            }
        }
    }
    svg.push_str("</svg>");
    svg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentMetadata, DocumentObject};

    fn doc(title: &str) -> DocumentObject {
        DocumentObject {
            metadata: DocumentMetadata {
                title: title.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn sku_round_trips_through_parse() {
        let d = doc("Invoice for Q4 services");
        let sku = generate_sku(&d, "US", 2026, 2);
        let parsed = parse_sku(&sku).unwrap();
        assert_eq!(parsed.doctype, "FIN");
        assert_eq!(parsed.subtype, "INVOICE");
        assert_eq!(parsed.jurisdiction, "US");
        assert_eq!(parsed.year, 2026);
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.hash4.len(), 4);
    }

    #[test]
    fn sku_parse_handles_hyphenated_subtype() {
        let d = doc("Offering Memorandum for Series A");
        let sku = generate_sku(&d, "US", 2026, 1);
        let parsed = parse_sku(&sku).unwrap();
        assert_eq!(parsed.subtype, "OFFERING-MEMO");
    }

    #[test]
    fn sku_is_deterministic_for_same_document() {
        let d = doc("Agreement between parties");
        assert_eq!(generate_sku(&d, "US", 2026, 1), generate_sku(&d, "US", 2026, 1));
    }

    #[test]
    fn detect_doctype_defaults_on_no_match() {
        let d = doc("Quarterly Newsletter");
        assert_eq!(detect_doctype(&d), (DEFAULT_DOCTYPE.to_string(), DEFAULT_SUBTYPE.to_string()));
    }

    fn sample_body() -> SignatureCertificateBody {
        SignatureCertificateBody {
            document_hash: "deadbeef".to_string(),
            merkle_root: "feedface".to_string(),
            signer_name: "Alice".to_string(),
            signer_email: "alice@example.com".to_string(),
            signature_hash: "abc123".to_string(),
            previous_signature_hash: None,
            chain_position: 1,
            timestamp: Utc::now(),
            consent: ConsentRecord {
                method: "click-to-sign".to_string(),
                timestamp: Utc::now(),
                ip: Some("1.2.3.4".to_string()),
            },
            device: DeviceAttestation {
                fingerprint: "fp-1".to_string(),
                platform: "macOS".to_string(),
                user_agent: "sdc-client/1.0".to_string(),
            },
        }
    }

    #[test]
    fn certificate_self_hash_verifies() {
        let cert = issue_certificate(sample_body());
        assert!(verify_certificate(&cert).is_empty());
    }

    #[test]
    fn tampered_certificate_fails_verification() {
        let mut cert = issue_certificate(sample_body());
        cert.body.signer_name = "Mallory".to_string();
        let problems = verify_certificate(&cert);
        assert!(problems.iter().any(|p| p.contains("hash does not match")));
    }

    #[test]
    fn missing_required_field_fails_verification() {
        let mut body = sample_body();
        body.device.fingerprint = String::new();
        let cert = issue_certificate(body);
        let problems = verify_certificate(&cert);
        assert!(problems.iter().any(|p| p.contains("device.fingerprint")));
    }

    #[test]
    fn qr_matrix_is_deterministic_and_fixed_size() {
        let payload = build_qr_payload(&QrPayloadFields {
            sku: "LEGAL-CONTRACT-US-2026-V1-ABCD".to_string(),
            sha256: "deadbeef".to_string(),
            merkle_root: "feedface".to_string(),
            timestamp: Some("2025-01-01T00:00:00Z".parse().unwrap()),
            ..Default::default()
        });
        let a = qr_matrix(&payload);
        let b = qr_matrix(&payload);
        assert_eq!(a, b);
        assert_eq!(a.len(), QR_SIZE);
        assert_eq!(a[0].len(), QR_SIZE);
    }

    #[test]
    fn qr_payload_includes_optional_fields_when_present() {
        let payload = build_qr_payload(&QrPayloadFields {
            sku: "LEGAL-CONTRACT-US-2026-V1-ABCD".to_string(),
            sha256: "deadbeef".to_string(),
            merkle_root: "feedface".to_string(),
            timestamp: Some("2025-01-01T00:00:00Z".parse().unwrap()),
            encrypted_cid: Some("Qm123".to_string()),
            signature: Some("sig-1".to_string()),
            url: None,
        });
        assert!(payload.contains("CID:Qm123"));
        assert!(payload.contains("SIG:sig-1"));
        assert!(!payload.contains("URL:"));
    }
}
