//! C9 — DocumentDiff: section-level structural diff plus a Merkle diff
//! proof between two `DocumentObject`s.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::canonical;
use crate::document::DocumentObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Removed,
    Modified,
    Unchanged,
    Added,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionDiff {
    pub section_id: String,
    pub kind: ChangeKind,
    pub depth_a: Option<u32>,
    pub depth_b: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataDiff {
    pub title_changed: bool,
    pub type_changed: bool,
    pub page_count_changed: bool,
    pub language_changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MerkleDiffProof {
    pub root_a: String,
    pub root_b: String,
    pub roots_match: bool,
    pub changed_leaves: Vec<String>,
    pub proof_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    pub identical: bool,
    pub sections: Vec<SectionDiff>,
    pub metadata: MetadataDiff,
    pub tags: TagDiff,
    pub merkle_proof: MerkleDiffProof,
    pub diff_hash: String,
}

fn section_hash_hex(content: &str) -> String {
    crypto_primitives::sha256_hex(content.as_bytes())
}

/// Sort order: removed first, then modified, unchanged, added.
fn sort_rank(kind: ChangeKind) -> u8 {
    match kind {
        ChangeKind::Removed => 0,
        ChangeKind::Modified => 1,
        ChangeKind::Unchanged => 2,
        ChangeKind::Added => 3,
    }
}

#[derive(Serialize)]
struct ProofSeed<'a> {
    root_a: &'a str,
    root_b: &'a str,
    changed_leaves: &'a [String],
}

/// Compare two documents and produce a section-level diff with Merkle
/// proof. The per-document Merkle root is `canonical_merkle_root`
/// (C1) directly — re-using the same function for both documents is what
/// makes `roots_match` exactly equal to "the two documents' canonical
/// Merkle roots agree" ( property 9b), rather than an independently
/// computed root that only happens to usually agree.
pub fn diff(a: &DocumentObject, b: &DocumentObject) -> DiffResult {
    let sections_a = a.flatten_sections();
    let sections_b = b.flatten_sections();

    let hashes_a: BTreeMap<&str, (String, u32)> = sections_a
        .iter()
        .map(|s| (s.id.as_str(), (section_hash_hex(&s.content), s.depth)))
        .collect();
    let hashes_b: BTreeMap<&str, (String, u32)> = sections_b
        .iter()
        .map(|s| (s.id.as_str(), (section_hash_hex(&s.content), s.depth)))
        .collect();

    let all_ids: BTreeSet<&str> = hashes_a.keys().chain(hashes_b.keys()).copied().collect();

    let mut sections = Vec::with_capacity(all_ids.len());
    let mut changed_leaves = Vec::new();

    for id in all_ids {
        let in_a = hashes_a.get(id);
        let in_b = hashes_b.get(id);
        let kind = match (in_a, in_b) {
            (Some((ha, _)), Some((hb, _))) if ha == hb => ChangeKind::Unchanged,
            (Some(_), Some(_)) => {
                changed_leaves.push(id.to_string());
                ChangeKind::Modified
            }
            (Some(_), None) => {
                changed_leaves.push(id.to_string());
                ChangeKind::Removed
            }
            (None, Some(_)) => {
                changed_leaves.push(id.to_string());
                ChangeKind::Added
            }
            (None, None) => unreachable!("id came from one of the two maps"),
        };
        sections.push(SectionDiff {
            section_id: id.to_string(),
            kind,
            depth_a: in_a.map(|(_, d)| *d),
            depth_b: in_b.map(|(_, d)| *d),
        });
    }
    sections.sort_by(|x, y| sort_rank(x.kind).cmp(&sort_rank(y.kind)).then(x.section_id.cmp(&y.section_id)));
    changed_leaves.sort();

    let root_a = hex::encode(canonical::canonical_merkle_root(a));
    let root_b = hex::encode(canonical::canonical_merkle_root(b));
    let roots_match = root_a == root_b;
    let proof_hash = crypto_primitives::sha256_hex(
        &serde_json::to_vec(&ProofSeed {
            root_a: &root_a,
            root_b: &root_b,
            changed_leaves: &changed_leaves,
        })
        .expect("proof seed serializes"),
    );

    let metadata = MetadataDiff {
        title_changed: a.metadata.title != b.metadata.title,
        type_changed: a.metadata.doc_type as u8 != b.metadata.doc_type as u8,
        page_count_changed: a.metadata.page_count != b.metadata.page_count,
        language_changed: a.metadata.language != b.metadata.language,
    };

    let tags_a: BTreeSet<&String> = a.semantic_tags.iter().collect();
    let tags_b: BTreeSet<&String> = b.semantic_tags.iter().collect();
    let tags = TagDiff {
        added: tags_b.difference(&tags_a).map(|s| s.to_string()).collect(),
        removed: tags_a.difference(&tags_b).map(|s| s.to_string()).collect(),
    };

    let identical = changed_leaves.is_empty()
        && !metadata.title_changed
        && !metadata.type_changed
        && !metadata.page_count_changed
        && !metadata.language_changed
        && tags.added.is_empty()
        && tags.removed.is_empty();

    let merkle_proof = MerkleDiffProof {
        root_a,
        root_b,
        roots_match,
        changed_leaves,
        proof_hash,
    };

    #[derive(Serialize)]
    struct SealSeed<'a> {
        sections: &'a [SectionDiff],
        metadata: &'a MetadataDiff,
        tags: &'a TagDiff,
        merkle_proof: &'a MerkleDiffProof,
    }
    let diff_hash = crypto_primitives::sha256_hex(
        &serde_json::to_vec(&SealSeed {
            sections: &sections,
            metadata: &metadata,
            tags: &tags,
            merkle_proof: &merkle_proof,
        })
        .expect("seal seed serializes"),
    );

    DiffResult {
        identical,
        sections,
        metadata,
        tags,
        merkle_proof,
        diff_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentMetadata, Section, SectionType, StyleBundle};

    fn doc(sections: Vec<(&str, &str)>) -> DocumentObject {
        DocumentObject {
            metadata: DocumentMetadata {
                title: "Agreement".to_string(),
                ..Default::default()
            },
            sections: sections
                .into_iter()
                .map(|(id, content)| Section {
                    id: id.to_string(),
                    section_type: SectionType::Paragraph,
                    depth: 0,
                    label: String::new(),
                    content: content.to_string(),
                    children: vec![],
                    style: StyleBundle::default(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn property9a_diff_of_document_with_itself_is_identical() {
        let a = doc(vec![("s1", "hello"), ("s2", "world")]);
        let result = diff(&a, &a);
        assert!(result.identical);
        assert!(result.merkle_proof.roots_match);
    }

    #[test]
    fn property9b_roots_match_reflects_canonical_merkle_equality() {
        let a = doc(vec![("s1", "hello")]);
        let b = doc(vec![("s1", "hello world")]);
        let result = diff(&a, &b);
        let expected = canonical::canonical_merkle_root(&a) == canonical::canonical_merkle_root(&b);
        assert_eq!(result.merkle_proof.roots_match, expected);
        assert!(!result.merkle_proof.roots_match);
    }

    #[test]
    fn detects_added_removed_and_modified_sections() {
        let a = doc(vec![("s1", "hello"), ("s2", "stays the same"), ("s3", "will be removed")]);
        let b = doc(vec![("s1", "hello changed"), ("s2", "stays the same"), ("s4", "new section")]);
        let result = diff(&a, &b);

        let kind_of = |id: &str| result.sections.iter().find(|s| s.section_id == id).unwrap().kind;
        assert_eq!(kind_of("s1"), ChangeKind::Modified);
        assert_eq!(kind_of("s2"), ChangeKind::Unchanged);
        assert_eq!(kind_of("s3"), ChangeKind::Removed);
        assert_eq!(kind_of("s4"), ChangeKind::Added);

        assert_eq!(result.merkle_proof.changed_leaves, vec!["s1", "s3", "s4"]);
        assert!(!result.identical);
    }

    #[test]
    fn sections_are_sorted_removed_modified_unchanged_added() {
        let a = doc(vec![("s1", "a"), ("s2", "b"), ("s3", "c")]);
        let b = doc(vec![("s1", "a changed"), ("s2", "b"), ("s4", "d")]);
        let result = diff(&a, &b);
        let kinds: Vec<ChangeKind> = result.sections.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Removed, ChangeKind::Modified, ChangeKind::Unchanged, ChangeKind::Added]);
    }

    #[test]
    fn tag_diff_is_field_by_field() {
        let mut a = doc(vec![("s1", "x")]);
        a.semantic_tags = vec!["legal".to_string(), "draft".to_string()];
        let mut b = doc(vec![("s1", "x")]);
        b.semantic_tags = vec!["legal".to_string(), "final".to_string()];
        let result = diff(&a, &b);
        assert_eq!(result.tags.added, vec!["final".to_string()]);
        assert_eq!(result.tags.removed, vec!["draft".to_string()]);
    }
}
