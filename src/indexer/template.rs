//! Declarative templates (JSON and YAML). A template file becomes a single
//! element whose metadata lists its top-level keys, the values of designated
//! reference keys and every class-like identifier it mentions. Its top-level
//! entries are split boundaries for templates over the chunk budget.
use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::parser::{ElementKind, LineIndex, ParseError, ParsedSource, SourceElement, SourceParser};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9_]*\b").expect("valid identifier regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Json,
    Yaml,
}

impl TemplateFormat {
    fn label(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

pub struct TemplateParser {
    format: TemplateFormat,
    reference_keys: Vec<String>,
}

impl TemplateParser {
    pub fn new(format: TemplateFormat, reference_keys: &[String]) -> Self {
        Self {
            format,
            reference_keys: reference_keys.to_vec(),
        }
    }

    fn decode(&self, text: &str) -> Result<Value, ParseError> {
        let malformed = |message: String| ParseError::Malformed {
            format: self.format.label(),
            message,
        };
        match self.format {
            TemplateFormat::Json => serde_json::from_str(text).map_err(|e| malformed(e.to_string())),
            TemplateFormat::Yaml => serde_yaml::from_str(text).map_err(|e| malformed(e.to_string())),
        }
    }

    fn collect_refs(&self, value: &Value, out: &mut BTreeSet<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if self.reference_keys.iter().any(|k| k == key) {
                        if let Value::String(s) = child {
                            let s = s.trim();
                            if !s.is_empty() {
                                out.insert(s.to_string());
                            }
                        }
                    }
                    self.collect_refs(child, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.collect_refs(item, out);
                }
            }
            _ => {}
        }
    }
}

impl SourceParser for TemplateParser {
    fn language(&self) -> &str {
        self.format.label()
    }

    fn extensions(&self) -> Vec<String> {
        match self.format {
            TemplateFormat::Json => vec!["json".to_string()],
            TemplateFormat::Yaml => vec!["yaml".to_string(), "yml".to_string()],
        }
    }

    fn parse<'a>(&self, text: &'a str) -> Result<ParsedSource<'a>, ParseError> {
        if text.trim().is_empty() {
            return Ok(ParsedSource {
                text,
                elements: Vec::new(),
            });
        }

        let value = self.decode(text)?;

        let mut element = SourceElement::whole(ElementKind::Template, text);
        if let Value::Object(map) = &value {
            element.metadata.template_keys = map.keys().cloned().collect();
            let starts = match self.format {
                TemplateFormat::Json => json_key_starts(text),
                TemplateFormat::Yaml => yaml_key_starts(text),
            };
            element.children = sections(text, &starts, element.end_line);
        }

        let mut refs = BTreeSet::new();
        self.collect_refs(&value, &mut refs);
        element.metadata.template_refs = refs.into_iter().collect();

        let identifiers: BTreeSet<String> = IDENTIFIER
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|s| s.len() >= 2)
            .map(str::to_string)
            .collect();
        element.metadata.identifiers = identifiers.into_iter().collect();

        Ok(ParsedSource {
            text,
            elements: vec![element],
        })
    }
}

/// Byte offset and name of every key of the root JSON object.
fn json_key_starts(text: &str) -> Vec<(usize, String)> {
    let bytes = text.as_bytes();
    let mut starts = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let open = i;
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                let is_key = text
                    .get(i + 1..)
                    .is_some_and(|rest| rest.trim_start().starts_with(':'));
                if depth == 1 && is_key {
                    if let Some(name) = text.get(open + 1..i) {
                        starts.push((open, name.to_string()));
                    }
                }
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    starts
}

/// Byte offset and name of every unindented `key:` line.
fn yaml_key_starts(text: &str) -> Vec<(usize, String)> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let top_level = line
            .chars()
            .next()
            .is_some_and(|c| !c.is_whitespace() && c != '#' && c != '-');
        if top_level {
            if let Some((key, _)) = line.split_once(':') {
                let key = key.trim().trim_matches(['"', '\'']);
                starts.push((offset, key.to_string()));
            }
        }
        offset += line.len();
    }
    starts
}

/// One `Block` boundary per top-level entry, running to the next entry.
fn sections(text: &str, starts: &[(usize, String)], last_line: usize) -> Vec<SourceElement> {
    let lines = LineIndex::new(text);
    starts
        .iter()
        .enumerate()
        .map(|(i, (start, key))| {
            let end = starts.get(i + 1).map_or(text.len(), |next| next.0);
            let start_line = lines.line_of(*start);
            let end_line = match starts.get(i + 1) {
                Some(next) => lines.line_of(next.0).saturating_sub(1).max(start_line),
                None => last_line,
            };
            SourceElement::new(ElementKind::Block, *start, end, start_line, end_line).named(key.clone())
        })
        .collect()
}
