//! Source parsing seam: one `SourceParser` per language or document kind,
//! selected by file extension through the `ParserRegistry`.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tree_sitter::Node;

use super::code_parser::SymbolParser;
use super::java::JavaParser;
use super::languages;
use super::markdown::MarkdownParser;
use super::template::{TemplateFormat, TemplateParser};
use crate::config::IndexerConfig;
use crate::db::models::ChunkMetadata;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("syntax error near line {line}")]
    Syntax { line: usize },

    #[error("malformed {format} document: {message}")]
    Malformed {
        format: &'static str,
        message: String,
    },

    #[error("file is not valid UTF-8")]
    NotUtf8,

    #[error("file is {bytes} bytes, above the {limit} byte limit")]
    TooLarge { bytes: u64, limit: u64 },

    #[error("grammar setup failed: {0}")]
    Grammar(String),

    #[error("parser produced no syntax tree")]
    NoTree,
}

/// What a parsed element represents. `Block` elements are split
/// boundaries only and never become chunks of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Type,
    Method,
    Field,
    Template,
    Section,
    Block,
    Raw,
}

#[derive(Debug, Clone)]
pub struct SourceElement {
    pub kind: ElementKind,
    pub name: Option<String>,
    /// Enclosing type name for members.
    pub owner: Option<String>,
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub docstring: Option<String>,
    pub metadata: ChunkMetadata,
    /// Members of a type, statements of a method, paragraphs of a section.
    pub children: Vec<SourceElement>,
}

impl SourceElement {
    pub fn new(kind: ElementKind, start_byte: usize, end_byte: usize, start_line: usize, end_line: usize) -> Self {
        Self {
            kind,
            name: None,
            owner: None,
            start_byte,
            end_byte,
            start_line,
            end_line,
            docstring: None,
            metadata: ChunkMetadata::default(),
            children: Vec::new(),
        }
    }

    pub fn from_node(kind: ElementKind, node: &Node<'_>) -> Self {
        Self::new(
            kind,
            node.start_byte(),
            node.end_byte(),
            node.start_position().row + 1,
            node.end_position().row + 1,
        )
    }

    /// Element covering the whole text.
    pub fn whole(kind: ElementKind, text: &str) -> Self {
        Self::new(kind, 0, text.len(), 1, text.lines().count().max(1))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Byte offsets of line starts, for converting between bytes and 1-based lines.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        // A trailing newline does not open another line.
        if starts.len() > 1 && starts.last() == Some(&text.len()) {
            starts.pop();
        }
        Self {
            starts,
            len: text.strip_suffix('\n').unwrap_or(text).len(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// 1-based line containing `byte`.
    pub fn line_of(&self, byte: usize) -> usize {
        match self.starts.binary_search(&byte) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Byte range of lines `first..=last`, excluding the final newline.
    pub fn span(&self, first: usize, last: usize) -> (usize, usize) {
        let first = first.clamp(1, self.line_count());
        let last = last.clamp(first, self.line_count());
        let start = self.starts[first - 1];
        let end = if last < self.line_count() {
            self.starts[last] - 1
        } else {
            self.len
        };
        (start, end.max(start))
    }
}

/// Parser output borrowed from the file text it describes.
#[derive(Debug)]
pub struct ParsedSource<'a> {
    pub text: &'a str,
    pub elements: Vec<SourceElement>,
}

pub trait SourceParser: Send + Sync {
    /// Language label recorded on every chunk this parser produces.
    fn language(&self) -> &str;

    /// Lowercase file extensions (without the dot) this parser accepts.
    fn extensions(&self) -> Vec<String>;

    fn parse<'a>(&self, text: &'a str) -> Result<ParsedSource<'a>, ParseError>;
}

/// Fallback for plain-text kinds: the whole file is one raw span that the
/// chunker cuts into overlapping line windows.
pub struct LineWindowParser {
    extension: String,
}

impl LineWindowParser {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.to_lowercase(),
        }
    }
}

impl SourceParser for LineWindowParser {
    fn language(&self) -> &str {
        &self.extension
    }

    fn extensions(&self) -> Vec<String> {
        vec![self.extension.clone()]
    }

    fn parse<'a>(&self, text: &'a str) -> Result<ParsedSource<'a>, ParseError> {
        let elements = if text.trim().is_empty() {
            Vec::new()
        } else {
            vec![SourceElement::whole(ElementKind::Raw, text)]
        };
        Ok(ParsedSource { text, elements })
    }
}

pub struct ParserRegistry {
    by_extension: HashMap<String, Arc<dyn SourceParser>>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
        }
    }

    /// Built-in parsers plus line-window fallbacks for the configured extensions.
    pub fn new(config: &IndexerConfig) -> Result<Self, ParseError> {
        let mut registry = Self::empty();

        registry.register(Arc::new(JavaParser::new()));
        for language in languages::bundled() {
            registry.register(Arc::new(SymbolParser::new(language)?));
        }
        registry.register(Arc::new(TemplateParser::new(
            TemplateFormat::Json,
            &config.template_reference_keys,
        )));
        registry.register(Arc::new(TemplateParser::new(
            TemplateFormat::Yaml,
            &config.template_reference_keys,
        )));
        registry.register(Arc::new(MarkdownParser));

        for ext in &config.fallback_extensions {
            let ext = ext.trim_start_matches('.').to_lowercase();
            if !registry.by_extension.contains_key(&ext) {
                registry.register(Arc::new(LineWindowParser::new(&ext)));
            }
        }

        Ok(registry)
    }

    /// Later registrations win for shared extensions.
    pub fn register(&mut self, parser: Arc<dyn SourceParser>) {
        for ext in parser.extensions() {
            self.by_extension.insert(ext, Arc::clone(&parser));
        }
    }

    pub fn parser_for(&self, path: &Path) -> Option<&Arc<dyn SourceParser>> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.by_extension.get(&ext)
    }

    /// Language labels of all registered parsers, sorted and deduplicated.
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self
            .by_extension
            .values()
            .map(|p| p.language().to_string())
            .collect();
        languages.sort();
        languages.dedup();
        languages
    }
}
