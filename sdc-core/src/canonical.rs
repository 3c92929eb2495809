//! C1 — Canonicalizer: deterministic serialization, canonical hashing, and
//! Merkle root computation for `DocumentObject`, plus a generic canonical
//! form used by other components (intake/certificate hashing) that need
//! the same volatile-stripping and key-sorting rules over arbitrary JSON.

use crypto_primitives::{hash_pair, sha256};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::document::{ComponentKind, DocumentObject, Section, SectionType};

/// Fields stripped everywhere because they are volatile.
const VOLATILE_FIELDS: &[&str] = &[
    "ingestedAt",
    "timestamp",
    "createdAt",
    "updatedAt",
    "lastAccessed",
    "signedAt",
    "anchoredAt",
    "pushedAt",
    "reviewedAt",
    "finalizedAt",
    "completedAt",
    "registeredAt",
    "deviceFingerprint",
    "ipAddress",
    "platform",
];

/// Fields stripped in the generic deep canonicalizer only.
const RANDOM_ID_FIELDS: &[&str] = &["signatureId", "sequence", "previousSignatureHash"];

/// Collapse runs of whitespace to a single space and trim.
pub fn normalize_string(s: &str) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim().to_string()
}

/// Round a non-integer to 4 decimal places; integers pass through
/// unchanged by virtue of never reaching this path.
pub fn normalize_number(n: f64) -> f64 {
    (n * 10_000.0).round() / 10_000.0
}

#[derive(Serialize)]
struct CanonicalMetadata {
    title: String,
    #[serde(rename = "type")]
    doc_type: crate::document::DocumentType,
    #[serde(rename = "pageCount")]
    page_count: u32,
    #[serde(rename = "sourceFile")]
    source_file: String,
    language: String,
    width: Option<f64>,
    height: Option<f64>,
}

#[derive(Serialize)]
struct CanonicalSection {
    id: String,
    #[serde(rename = "type")]
    section_type: SectionType,
    depth: u32,
    label: String,
    content: String,
    children: Vec<CanonicalSection>,
}

#[derive(Serialize)]
struct CanonicalComponent {
    name: String,
    #[serde(rename = "type")]
    kind: ComponentKind,
}

#[derive(Serialize)]
struct CanonicalDocument {
    metadata: CanonicalMetadata,
    sections: Vec<CanonicalSection>,
    styles: BTreeMap<String, Value>,
    components: Vec<CanonicalComponent>,
    #[serde(rename = "semanticTags")]
    semantic_tags: Vec<String>,
}

fn canonical_section(section: &Section) -> CanonicalSection {
    CanonicalSection {
        id: section.id.clone(),
        section_type: section.section_type,
        depth: section.depth,
        label: normalize_string(&section.label),
        content: normalize_string(&section.content),
        children: section.children.iter().map(canonical_section).collect(),
    }
}

fn canonical_style_value(bundle: &crate::document::StyleBundle) -> Value {
    let mut map = Map::new();
    if let Some(font) = &bundle.font {
        map.insert("font".into(), Value::String(normalize_string(font)));
    }
    if let Some(size) = bundle.size {
        map.insert(
            "size".into(),
            serde_json::to_value(normalize_number(size)).unwrap(),
        );
    }
    if let Some(color) = &bundle.color {
        map.insert("color".into(), Value::String(normalize_string(color)));
    }
    for (k, v) in &bundle.extra {
        map.insert(k.clone(), v.clone());
    }
    Value::Object(map)
}

fn build_canonical_document(doc: &DocumentObject) -> CanonicalDocument {
    let mut components: Vec<CanonicalComponent> = doc
        .components
        .iter()
        .map(|c| CanonicalComponent {
            name: normalize_string(&c.name),
            kind: c.kind,
        })
        .collect();
    components.sort_by(|a, b| (a.name.clone(), a.kind as u8).cmp(&(b.name.clone(), b.kind as u8)));

    let mut tags: Vec<String> = doc.semantic_tags.iter().map(|t| normalize_string(t)).collect();
    tags.sort();

    let styles = doc
        .styles
        .iter()
        .map(|(k, v)| (k.clone(), canonical_style_value(v)))
        .collect();

    CanonicalDocument {
        metadata: CanonicalMetadata {
            title: normalize_string(&doc.metadata.title),
            doc_type: doc.metadata.doc_type,
            page_count: doc.metadata.page_count,
            source_file: normalize_string(&doc.metadata.source_file),
            language: normalize_string(&doc.metadata.language),
            width: doc.metadata.width.map(normalize_number),
            height: doc.metadata.height.map(normalize_number),
        },
        sections: doc.sections.iter().map(canonical_section).collect(),
        styles,
        components,
        semantic_tags: tags,
    }
}

/// Minified, UTF-8, no trailing newline canonical serialization (
/// rule 7). `serde_json::Value`'s default map is a `BTreeMap`, so nested
/// object keys serialize in sorted order automatically —
/// that is why every canonical struct above is built fresh rather than
/// re-serializing the original, insertion-ordered `DocumentObject`.
pub fn canonicalize(doc: &DocumentObject) -> Vec<u8> {
    serde_json::to_vec(&build_canonical_document(doc)).expect("canonical document always encodes")
}

pub fn canonical_hash(doc: &DocumentObject) -> [u8; 32] {
    sha256(&canonicalize(doc))
}

pub fn canonical_hash_hex(doc: &DocumentObject) -> String {
    hex::encode(canonical_hash(doc))
}

fn leaf_hash(section: &Section) -> [u8; 32] {
    #[derive(Serialize)]
    struct Leaf<'a> {
        id: &'a str,
        #[serde(rename = "type")]
        section_type: SectionType,
        depth: u32,
        label: String,
        content: String,
    }
    let leaf = Leaf {
        id: &section.id,
        section_type: section.section_type,
        depth: section.depth,
        label: normalize_string(&section.label),
        content: normalize_string(&section.content),
    };
    sha256(&serde_json::to_vec(&leaf).unwrap())
}

/// Merkle root over the (sorted-by-id) flattened section tree. Odd counts
/// carry the last leaf forward unchanged at each fold.
pub fn canonical_merkle_root(doc: &DocumentObject) -> [u8; 32] {
    let mut sections = doc.flatten_sections();
    if sections.is_empty() {
        return sha256(b"empty-document");
    }
    sections.sort_by(|a, b| a.id.cmp(&b.id));

    let mut level: Vec<[u8; 32]> = sections.iter().map(|s| leaf_hash(s)).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut i = 0;
        while i < level.len() {
            if i + 1 < level.len() {
                let (a, b) = (level[i], level[i + 1]);
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                next.push(hash_pair(&lo, &hi));
                i += 2;
            } else {
                next.push(level[i]);
                i += 1;
            }
        }
        level = next;
    }
    level[0]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergencePoint {
    pub offset: usize,
    pub context_a: Vec<u8>,
    pub context_b: Vec<u8>,
}

/// Compare two documents' canonical forms; on mismatch, report the first
/// diverging byte offset with ±50-byte context on each side.
pub fn verify_replay(a: &DocumentObject, b: &DocumentObject) -> Option<DivergencePoint> {
    let ca = canonicalize(a);
    let cb = canonicalize(b);
    let min_len = ca.len().min(cb.len());
    let mut offset = None;
    for i in 0..min_len {
        if ca[i] != cb[i] {
            offset = Some(i);
            break;
        }
    }
    let offset = offset.or_else(|| {
        if ca.len() != cb.len() {
            Some(min_len)
        } else {
            None
        }
    })?;

    let ctx = |buf: &[u8], at: usize| -> Vec<u8> {
        let start = at.saturating_sub(50);
        let end = (at + 50).min(buf.len());
        buf[start..end].to_vec()
    };

    Some(DivergencePoint {
        offset,
        context_a: ctx(&ca, offset),
        context_b: ctx(&cb, offset),
    })
}

/// Hash the same document `rounds` times; a correct implementation never
/// diverges, so this returns `None`. If it ever returns `Some(round)`,
/// that round number is the first one whose hash differs from round 0.
pub fn run_hash_stability_test(doc: &DocumentObject, rounds: usize) -> Option<usize> {
    if rounds == 0 {
        return None;
    }
    let first = canonical_hash(doc);
    for round in 1..rounds {
        if canonical_hash(doc) != first {
            return Some(round);
        }
    }
    None
}

/// Generic canonical form for non-document payloads (intake records,
/// signature certificates): strips volatile + random-id fields, sorts
/// keys (free via `BTreeMap`-backed `Value::Object`), normalizes strings
/// and numbers, but preserves array order (the caller pre-sorts any array
/// whose order is not semantically significant).
pub fn canonicalize_generic(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if VOLATILE_FIELDS.contains(&k.as_str()) || RANDOM_ID_FIELDS.contains(&k.as_str()) {
                    continue;
                }
                out.insert(k.clone(), canonicalize_generic(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_generic).collect()),
        Value::String(s) => Value::String(normalize_string(s)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                serde_json::to_value(normalize_number(f)).unwrap_or(Value::Null)
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

/// Minified canonical bytes for an arbitrary serializable value, using the
/// same strip/normalize/sort rules as [`canonicalize_generic`].
pub fn canonicalize_value_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    let raw = serde_json::to_value(value).expect("value serializes");
    let canonical = canonicalize_generic(&raw);
    serde_json::to_vec(&canonical).expect("canonical value always encodes")
}

pub fn canonical_generic_hash_hex<T: Serialize>(value: &T) -> String {
    hex::encode(sha256(&canonicalize_value_bytes(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentMetadata, DocumentType, Section, SectionType, StyleBundle};

    fn sample_doc(ingested_at: &str, content: &str) -> DocumentObject {
        DocumentObject {
            metadata: DocumentMetadata {
                title: "Agreement".to_string(),
                doc_type: DocumentType::Pdf,
                page_count: 3,
                source_file: "agreement.pdf".to_string(),
                ingested_at: ingested_at.to_string(),
                language: "en".to_string(),
                width: None,
                height: None,
            },
            sections: vec![Section {
                id: "s1".to_string(),
                section_type: SectionType::Paragraph,
                depth: 0,
                label: String::new(),
                content: content.to_string(),
                children: vec![],
                style: StyleBundle::default(),
            }],
            styles: Default::default(),
            components: vec![],
            semantic_tags: vec![],
            raw_text: String::new(),
        }
    }

    #[test]
    fn s1_canonical_hash_is_stable_across_1000_rounds() {
        let doc = sample_doc("2025-01-01T00:00:00Z", "  hello  world  ");
        assert!(run_hash_stability_test(&doc, 1000).is_none());
    }

    #[test]
    fn s1_volatile_ingested_at_does_not_affect_hash() {
        let a = sample_doc("2025-01-01T00:00:00Z", "  hello  world  ");
        let b = sample_doc("2099-12-31T23:59:59Z", "  hello  world  ");
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn s1_whitespace_normalization_does_not_affect_hash() {
        let a = sample_doc("2025-01-01T00:00:00Z", "  hello  world  ");
        let b = sample_doc("2025-01-01T00:00:00Z", "hello world");
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn differing_content_changes_hash() {
        let a = sample_doc("2025-01-01T00:00:00Z", "hello world");
        let b = sample_doc("2025-01-01T00:00:00Z", "goodbye world");
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn verify_replay_reports_divergence() {
        let a = sample_doc("2025-01-01T00:00:00Z", "hello world");
        let b = sample_doc("2025-01-01T00:00:00Z", "goodbye world");
        let div = verify_replay(&a, &b).expect("documents diverge");
        assert!(!div.context_a.is_empty());
        assert!(!div.context_b.is_empty());
    }

    #[test]
    fn empty_document_merkle_root_is_fixed_constant() {
        let doc = DocumentObject::default();
        assert_eq!(canonical_merkle_root(&doc), sha256(b"empty-document"));
    }

    #[test]
    fn merkle_root_is_order_independent_of_section_declaration_order() {
        let mut a = sample_doc("2025-01-01T00:00:00Z", "x");
        a.sections.push(Section {
            id: "s0".to_string(),
            section_type: SectionType::Paragraph,
            depth: 0,
            label: String::new(),
            content: "y".to_string(),
            children: vec![],
            style: StyleBundle::default(),
        });
        let mut b = a.clone();
        b.sections.reverse();
        assert_eq!(canonical_merkle_root(&a), canonical_merkle_root(&b));
    }
}
