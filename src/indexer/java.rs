//! Java structure extraction on top of tree-sitter-java.
//!
//! Produces one `Type` element per class/interface/enum/record (nested types
//! included as children) with methods, constructors and fields as members.
//! Reference metadata (imports, supertypes, field/param/return types) is
//! collected here so the graph builder works on plain chunk data.
use tree_sitter::{Language, Node, Parser};

use super::parser::{ElementKind, ParseError, ParsedSource, SourceElement, SourceParser};
use crate::db::models::ChunkMetadata;

const TYPE_DECLARATIONS: &[&str] = &[
    "class_declaration",
    "interface_declaration",
    "enum_declaration",
    "record_declaration",
    "annotation_type_declaration",
];

struct FileContext {
    package: Option<String>,
    imports: Vec<String>,
}

pub struct JavaParser {
    language: Language,
}

impl JavaParser {
    pub fn new() -> Self {
        Self {
            language: tree_sitter_java::LANGUAGE.into(),
        }
    }

    fn type_element(
        &self,
        node: Node<'_>,
        text: &str,
        file: &FileContext,
        owner: Option<&str>,
    ) -> SourceElement {
        let name = field_text(node, "name", text).unwrap_or_default();
        let mut element = SourceElement::from_node(ElementKind::Type, &node).named(name.clone());
        element.owner = owner.map(str::to_string);
        element.docstring = doc_comment(node, text);

        let mut metadata = ChunkMetadata {
            kind: Some(type_kind(node.kind()).to_string()),
            package: file.package.clone(),
            imports: file.imports.clone(),
            ..Default::default()
        };
        if let Some(superclass) = node.child_by_field_name("superclass") {
            metadata.extends = type_names(superclass, text);
        }
        if let Some(interfaces) = node.child_by_field_name("interfaces") {
            metadata.implements = type_names(interfaces, text);
        }
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if child.kind() == "extends_interfaces" {
                push_unique(&mut metadata.extends, type_names(child, text));
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.collect_members(body, text, file, &name, &mut element.children, &mut metadata);
        }

        element.metadata = metadata;
        element
    }

    fn collect_members(
        &self,
        body: Node<'_>,
        text: &str,
        file: &FileContext,
        class_name: &str,
        members: &mut Vec<SourceElement>,
        class_metadata: &mut ChunkMetadata,
    ) {
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            match member.kind() {
                "field_declaration" | "constant_declaration" => {
                    let field = field_element(member, text, class_name);
                    push_unique(&mut class_metadata.field_types, field.metadata.field_types.clone());
                    members.push(field);
                }
                "method_declaration" | "constructor_declaration" | "compact_constructor_declaration" => {
                    members.push(method_element(member, text, class_name));
                }
                "enum_body_declarations" => {
                    self.collect_members(member, text, file, class_name, members, class_metadata);
                }
                "static_initializer" | "block" => {
                    members.push(SourceElement::from_node(ElementKind::Block, &member));
                }
                kind if TYPE_DECLARATIONS.contains(&kind) => {
                    members.push(self.type_element(member, text, file, Some(class_name)));
                }
                _ => {}
            }
        }
    }
}

impl Default for JavaParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceParser for JavaParser {
    fn language(&self) -> &str {
        "java"
    }

    fn extensions(&self) -> Vec<String> {
        vec!["java".to_string()]
    }

    fn parse<'a>(&self, text: &'a str) -> Result<ParsedSource<'a>, ParseError> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.language)
            .map_err(|e| ParseError::Grammar(e.to_string()))?;
        let tree = parser.parse(text, None).ok_or(ParseError::NoTree)?;
        let root = tree.root_node();

        if root.has_error() {
            return Err(ParseError::Syntax {
                line: first_error_line(root),
            });
        }

        let mut file = FileContext {
            package: None,
            imports: Vec::new(),
        };
        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            match child.kind() {
                "package_declaration" => {
                    file.package = Some(
                        node_text(child, text)
                            .trim_start_matches("package")
                            .trim_end_matches(';')
                            .trim()
                            .to_string(),
                    );
                }
                "import_declaration" => {
                    if let Some(import) = import_target(node_text(child, text)) {
                        if !file.imports.contains(&import) {
                            file.imports.push(import);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut elements = Vec::new();
        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            if TYPE_DECLARATIONS.contains(&child.kind()) {
                elements.push(self.type_element(child, text, &file, None));
            }
        }

        Ok(ParsedSource { text, elements })
    }
}

fn field_element(node: Node<'_>, text: &str, class_name: &str) -> SourceElement {
    let mut names = Vec::new();
    let mut cursor = node.walk();
    for declarator in node.children_by_field_name("declarator", &mut cursor) {
        if let Some(name) = field_text(declarator, "name", text) {
            names.push(name);
        }
    }

    let mut element = SourceElement::from_node(ElementKind::Field, &node);
    element.name = (!names.is_empty()).then(|| names.join(", "));
    element.owner = Some(class_name.to_string());
    element.docstring = doc_comment(node, text);
    if let Some(ty) = node.child_by_field_name("type") {
        element.metadata.field_types = type_names(ty, text);
    }
    element
}

fn method_element(node: Node<'_>, text: &str, class_name: &str) -> SourceElement {
    let name = field_text(node, "name", text).unwrap_or_else(|| class_name.to_string());
    let mut element = SourceElement::from_node(ElementKind::Method, &node).named(name);
    element.owner = Some(class_name.to_string());
    element.docstring = doc_comment(node, text);

    let body = node.child_by_field_name("body");
    let header_end = body.map_or(node.end_byte(), |b| b.start_byte());
    element.metadata.signature = Some(collapse_whitespace(&text[node.start_byte()..header_end]));

    if let Some(params) = node.child_by_field_name("parameters") {
        element.metadata.param_types = type_names(params, text);
    }
    if let Some(ret) = node.child_by_field_name("type") {
        element.metadata.return_types = type_names(ret, text);
    }

    if let Some(body) = body {
        let mut cursor = body.walk();
        for statement in body.named_children(&mut cursor) {
            if !statement.kind().contains("comment") {
                element
                    .children
                    .push(SourceElement::from_node(ElementKind::Block, &statement));
            }
        }
    }
    element
}

fn type_kind(node_kind: &str) -> &'static str {
    match node_kind {
        "interface_declaration" => "interface",
        "enum_declaration" => "enum",
        "record_declaration" => "record",
        "annotation_type_declaration" => "annotation",
        _ => "class",
    }
}

fn node_text<'a>(node: Node<'_>, text: &'a str) -> &'a str {
    &text[node.byte_range()]
}

fn field_text(node: Node<'_>, field: &str, text: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| node_text(n, text).to_string())
}

/// `/** ... */` comment directly above `node` with no blank line in between.
fn doc_comment(node: Node<'_>, text: &str) -> Option<String> {
    let prev = node.prev_sibling()?;
    if prev.kind() != "block_comment" {
        return None;
    }
    let comment = node_text(prev, text);
    if !comment.starts_with("/**") {
        return None;
    }
    if node.start_position().row > prev.end_position().row + 1 {
        return None;
    }
    Some(comment.to_string())
}

/// Every `type_identifier` under `node`, deduplicated in source order.
fn type_names(node: Node<'_>, text: &str) -> Vec<String> {
    let mut names = Vec::new();
    collect_type_identifiers(node, text, &mut names);
    names
}

fn collect_type_identifiers(node: Node<'_>, text: &str, names: &mut Vec<String>) {
    if node.kind() == "type_identifier" {
        let name = node_text(node, text).to_string();
        if !names.contains(&name) {
            names.push(name);
        }
        return;
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_type_identifiers(child, text, names);
    }
}

/// Imported type name: last segment of the path; for static imports the
/// owning type. Plain wildcard imports name no type and are skipped.
fn import_target(statement: &str) -> Option<String> {
    let body = statement
        .trim()
        .trim_start_matches("import")
        .trim_end_matches(';')
        .trim();
    let (is_static, path) = match body.strip_prefix("static") {
        Some(rest) => (true, rest.trim()),
        None => (false, body),
    };

    if is_static {
        let path = path.trim_end_matches(".*");
        return path
            .rsplit('.')
            .find(|seg| seg.chars().next().is_some_and(char::is_uppercase))
            .map(str::to_string);
    }

    if path.ends_with('*') {
        return None;
    }
    path.rsplit('.').next().filter(|s| !s.is_empty()).map(str::to_string)
}

fn first_error_line(node: Node<'_>) -> usize {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.is_error() || child.is_missing() {
            return child.start_position().row + 1;
        }
        if child.has_error() {
            return first_error_line(child);
        }
    }
    node.start_position().row + 1
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn push_unique(into: &mut Vec<String>, values: Vec<String>) {
    for value in values {
        if !into.contains(&value) {
            into.push(value);
        }
    }
}
