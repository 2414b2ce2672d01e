use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rough token estimate used for chunk budgets and batch ceilings (~4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        (text.chars().count() / 4).max(1)
    }
}

/// BLAKE3 hex digest of a chunk's content.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Stable chunk id from location and content; unchanged code keeps its id across runs.
pub fn chunk_id(file_path: &str, start_line: usize, content_hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(start_line.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(content_hash.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex[..32].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Class,
    Method,
    Field,
    Template,
    Doc,
    GenericBlock,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Class => "class",
            ChunkType::Method => "method",
            ChunkType::Field => "field",
            ChunkType::Template => "template",
            ChunkType::Doc => "doc",
            ChunkType::GenericBlock => "generic_block",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "class" => Ok(ChunkType::Class),
            "method" => Ok(ChunkType::Method),
            "field" => Ok(ChunkType::Field),
            "template" => Ok(ChunkType::Template),
            "doc" => Ok(ChunkType::Doc),
            "generic_block" => Ok(ChunkType::GenericBlock),
            other => Err(format!("unknown chunk type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Import,
    Extends,
    Implements,
    FieldType,
    ParamType,
    ReturnType,
    TemplateRef,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Import => "import",
            ReferenceKind::Extends => "extends",
            ReferenceKind::Implements => "implements",
            ReferenceKind::FieldType => "field_type",
            ReferenceKind::ParamType => "param_type",
            ReferenceKind::ReturnType => "return_type",
            ReferenceKind::TemplateRef => "template_ref",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(ReferenceKind::Import),
            "extends" => Ok(ReferenceKind::Extends),
            "implements" => Ok(ReferenceKind::Implements),
            "field_type" => Ok(ReferenceKind::FieldType),
            "param_type" => Ok(ReferenceKind::ParamType),
            "return_type" => Ok(ReferenceKind::ReturnType),
            "template_ref" => Ok(ReferenceKind::TemplateRef),
            other => Err(format!("unknown reference kind: {other}")),
        }
    }
}

/// Structural facts gathered by the parsers; persisted as JSON next to the chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implements: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub return_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_keys: Vec<String>,
    /// Values of designated reference keys in a template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_refs: Vec<String>,
    /// Capitalized identifiers mentioned anywhere in a template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub language: String,
    pub chunk_type: ChunkType,
    pub class_name: Option<String>,
    pub method_name: Option<String>,
    pub docstring: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub metadata: ChunkMetadata,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn new(
        file_path: &str,
        language: &str,
        chunk_type: ChunkType,
        start_line: usize,
        end_line: usize,
        content: &str,
    ) -> Self {
        let hash = content_hash(content);
        Self {
            id: chunk_id(file_path, start_line, &hash),
            file_path: file_path.to_string(),
            start_line,
            end_line,
            language: language.to_string(),
            chunk_type,
            class_name: None,
            method_name: None,
            docstring: None,
            content: content.to_string(),
            content_hash: hash,
            metadata: ChunkMetadata::default(),
            embedding: None,
        }
    }

    /// Key under which this chunk participates in the reference graph.
    pub fn graph_key(&self) -> Option<&str> {
        match self.chunk_type {
            ChunkType::Template => Some(self.file_path.as_str()),
            _ => self.class_name.as_deref(),
        }
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }

    /// Text handed to the embedder: structural context and documentation
    /// ahead of the code, so doc-only wording is searchable by vector.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![
            format!("Language: {}", self.language),
            format!("Type: {}", self.chunk_type),
        ];
        if let Some(class) = &self.class_name {
            parts.push(format!("Class: {class}"));
        }
        if let Some(method) = &self.method_name {
            parts.push(format!("Method: {method}"));
        }
        if self.chunk_type == ChunkType::Template {
            parts.push(format!("Template: {}", self.file_path));
            if !self.metadata.template_refs.is_empty() {
                parts.push(format!("References classes: {}", self.metadata.template_refs.join(", ")));
            }
        }
        if let Some(doc) = &self.docstring {
            parts.push(format!("Documentation: {doc}"));
        }
        parts.push(format!("Code:\n{}", self.content));
        parts.join("\n")
    }

    /// Embedding cache key: the hash of [`Chunk::embedding_text`].
    pub fn embedding_key(&self) -> String {
        content_hash(&self.embedding_text())
    }
}

/// Directed, name-keyed relationship between two classes or documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceEdge {
    pub source_class: String,
    pub target_class: String,
    pub reference_kind: ReferenceKind,
}

impl ReferenceEdge {
    pub fn new(source: &str, target: &str, kind: ReferenceKind) -> Self {
        Self {
            source_class: source.to_string(),
            target_class: target.to_string(),
            reference_kind: kind,
        }
    }
}

/// Per-file bookkeeping used to skip unchanged files and retire stale chunk ids.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexState {
    pub file_path: String,
    pub file_hash: String,
    pub language: String,
    pub chunk_ids: Vec<String>,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub chunks: usize,
    pub files: usize,
    pub edges: usize,
    pub cached_embeddings: usize,
    pub by_language: Vec<(String, usize)>,
    pub by_chunk_type: Vec<(String, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_identity_is_stable() {
        let a = Chunk::new("src/A.java", "java", ChunkType::Class, 3, 10, "class A {}");
        let b = Chunk::new("src/A.java", "java", ChunkType::Class, 3, 10, "class A {}");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 32);

        let moved = Chunk::new("src/A.java", "java", ChunkType::Class, 4, 11, "class A {}");
        assert_ne!(a.id, moved.id);

        let edited = Chunk::new("src/A.java", "java", ChunkType::Class, 3, 10, "class A { }");
        assert_ne!(a.id, edited.id);
        assert_ne!(a.content_hash, edited.content_hash);
    }

    #[test]
    fn test_graph_key() {
        let mut class = Chunk::new("A.java", "java", ChunkType::Method, 1, 2, "void run() {}");
        class.class_name = Some("A".to_string());
        assert_eq!(class.graph_key(), Some("A"));

        let template = Chunk::new("forms/order.json", "json", ChunkType::Template, 1, 1, "{}");
        assert_eq!(template.graph_key(), Some("forms/order.json"));
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [
            ReferenceKind::Import,
            ReferenceKind::FieldType,
            ReferenceKind::TemplateRef,
        ] {
            assert_eq!(kind.as_str().parse::<ReferenceKind>().unwrap(), kind);
        }
        assert_eq!(
            "generic_block".parse::<ChunkType>().unwrap(),
            ChunkType::GenericBlock
        );
        assert!("widget".parse::<ChunkType>().is_err());
    }

    #[test]
    fn test_metadata_omits_empty_lists() {
        let meta = ChunkMetadata {
            imports: vec!["OrderRepository".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"imports":["OrderRepository"]}"#);
    }

    #[test]
    fn test_embedding_text_carries_context() {
        let mut chunk = Chunk::new("src/Invoice.java", "java", ChunkType::Method, 4, 8, "Money tax() {}");
        chunk.class_name = Some("Invoice".to_string());
        chunk.method_name = Some("tax".to_string());
        chunk.docstring = Some("/** Applies the regional levy. */".to_string());

        let text = chunk.embedding_text();
        assert_eq!(
            text,
            "Language: java\nType: method\nClass: Invoice\nMethod: tax\n\
             Documentation: /** Applies the regional levy. */\nCode:\nMoney tax() {}"
        );

        // Same code, different docs: different cache key, same chunk identity.
        let mut redocumented = chunk.clone();
        redocumented.docstring = Some("/** Computes VAT. */".to_string());
        assert_eq!(chunk.content_hash, redocumented.content_hash);
        assert_ne!(chunk.embedding_key(), redocumented.embedding_key());

        let mut template = Chunk::new("forms/order.json", "json", ChunkType::Template, 1, 3, "{}");
        template.metadata.template_refs = vec!["OrderService".to_string()];
        assert!(template
            .embedding_text()
            .contains("Template: forms/order.json\nReferences classes: OrderService\n"));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
