//! DocumentObject: the common currency consumed by the core and produced
//! by external parsers (PDF/DOCX/image OCR/HTML — out of scope, ).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Docx,
    Png,
    Jpg,
    Html,
    Txt,
    Md,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectionType {
    Header,
    Subheader,
    Paragraph,
    NumberedItem,
    BulletedItem,
    Table,
    SignatureBlock,
    Divider,
    Footer,
    Label,
    Field,
    Checkbox,
    DecorativeBox,
    ImagePlaceholder,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleBundle {
    pub font: Option<String>,
    pub size: Option<f64>,
    pub color: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A node in the document's section tree. Ids are unique across the whole
/// tree; `children[i].depth > parent.depth`; the tree is finite (
/// invariant). `content` may be empty in template mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    #[serde(rename = "type")]
    pub section_type: SectionType,
    pub depth: u32,
    pub label: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub children: Vec<Section>,
    #[serde(default)]
    pub style: StyleBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    Table,
    List,
    FormField,
    Signature,
    CheckboxGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedComponent {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub page_count: u32,
    pub source_file: String,
    /// Volatile field, stripped by the canonicalizer.
    pub ingested_at: String,
    pub language: String,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentObject {
    pub metadata: DocumentMetadata,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub styles: BTreeMap<String, StyleBundle>,
    #[serde(default)]
    pub components: Vec<DetectedComponent>,
    #[serde(default)]
    pub semantic_tags: Vec<String>,
    /// Raw text concatenation used by classification; typically
    /// produced by the external parser alongside the section tree.
    #[serde(default)]
    pub raw_text: String,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            title: String::new(),
            doc_type: DocumentType::Txt,
            page_count: 0,
            source_file: String::new(),
            ingested_at: String::new(),
            language: "en".to_string(),
            width: None,
            height: None,
        }
    }
}

impl DocumentObject {
    /// Pre-order flattening of the section tree, tagged with depth. Uses an
    /// explicit stack (: recursive tree walks must not stack-overflow on
    /// pathological input) even though real-world trees are shallow.
    pub fn flatten_sections(&self) -> Vec<&Section> {
        let mut out = Vec::new();
        let mut stack: Vec<&Section> = self.sections.iter().rev().collect();
        while let Some(section) = stack.pop() {
            out.push(section);
            for child in section.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

impl Section {
    pub fn flatten(&self) -> Vec<&Section> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(section) = stack.pop() {
            out.push(section);
            for child in section.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}
