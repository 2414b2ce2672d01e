use super::languages::{self, SymbolGrammar};
use super::parser::{ElementKind, ParseError, ParsedSource, SourceElement, SourceParser};
use std::collections::{HashMap, HashSet};
use tree_sitter::{Node, Parser, Query, QueryCursor, StreamingIterator};

/// Query-driven symbol extraction for languages without a dedicated parser.
///
/// Type-like captures become `Type` elements, functions become `Method`
/// elements nested under the type whose span contains them.
pub struct SymbolParser {
    grammar: SymbolGrammar,
    query: Query,
    import_query: Option<Query>,
    inherit_query: Option<Query>,
}

struct Symbol<'t> {
    node: Node<'t>,
    name: String,
    capture: String,
}

impl SymbolParser {
    pub fn new(grammar: SymbolGrammar) -> Result<Self, ParseError> {
        let compile = |source: &str| -> Result<Option<Query>, ParseError> {
            if source.trim().is_empty() {
                return Ok(None);
            }
            Query::new(&grammar.language, source)
                .map(Some)
                .map_err(|e| ParseError::Grammar(format!("{}: {e}", grammar.name)))
        };

        let query = compile(grammar.symbols)?.ok_or_else(|| {
            ParseError::Grammar(format!("{}: empty symbol query", grammar.name))
        })?;
        let import_query = compile(grammar.imports)?;
        let inherit_query = compile(grammar.supertypes)?;

        Ok(Self {
            grammar,
            query,
            import_query,
            inherit_query,
        })
    }

    fn extract_symbols<'t>(&self, root: Node<'t>, source: &[u8]) -> Vec<Symbol<'t>> {
        let mut cursor = QueryCursor::new();
        let mut symbols = Vec::new();
        let mut seen = HashSet::new();

        let mut matches = cursor.matches(&self.query, root, source);
        while let Some(m) = matches.next() {
            let mut main_node = None;
            let mut symbol_type = String::new();
            let mut symbol_name = String::new();

            for cap in m.captures {
                let capture_name = self.query.capture_names()[cap.index as usize];
                if capture_name == "name" {
                    if let Ok(name) = cap.node.utf8_text(source) {
                        symbol_name = name.to_string();
                    }
                } else if matches!(
                    capture_name,
                    "function" | "class" | "method" | "struct" | "interface"
                ) {
                    main_node = Some(cap.node);
                    symbol_type = capture_name.to_string();
                }
            }

            if let Some(node) = main_node {
                let key = format!("{}-{}-{}", node.start_byte(), node.end_byte(), symbol_type);
                if seen.insert(key) {
                    symbols.push(Symbol {
                        node,
                        name: symbol_name,
                        capture: symbol_type,
                    });
                }
            }
        }

        symbols
    }

    fn capture_texts(&self, query: Option<&Query>, root: Node<'_>, source: &[u8]) -> Vec<(String, Option<String>)> {
        let Some(query) = query else {
            return Vec::new();
        };
        let mut cursor = QueryCursor::new();
        let mut out = Vec::new();
        let mut matches = cursor.matches(query, root, source);
        while let Some(m) = matches.next() {
            for cap in m.captures {
                if let Ok(text) = cap.node.utf8_text(source) {
                    let owner = find_parent_symbol(cap.node, source, self.grammar.name);
                    out.push((text.to_string(), owner));
                }
            }
        }
        out
    }
}

impl SourceParser for SymbolParser {
    fn language(&self) -> &str {
        self.grammar.name
    }

    fn extensions(&self) -> Vec<String> {
        self.grammar
            .extensions
            .iter()
            .map(|e| (*e).to_string())
            .collect()
    }

    fn parse<'a>(&self, text: &'a str) -> Result<ParsedSource<'a>, ParseError> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.grammar.language)
            .map_err(|e| ParseError::Grammar(e.to_string()))?;
        let tree = parser.parse(text, None).ok_or(ParseError::NoTree)?;
        let root = tree.root_node();
        let source = text.as_bytes();
        let lang = self.grammar.name;

        let mut imports = Vec::new();
        for (path, _) in self.capture_texts(self.import_query.as_ref(), root, source) {
            let name = import_name(&path);
            if !name.is_empty() && !imports.contains(&name) {
                imports.push(name);
            }
        }

        let mut supertypes: HashMap<String, Vec<String>> = HashMap::new();
        for (name, owner) in self.capture_texts(self.inherit_query.as_ref(), root, source) {
            if let Some(owner) = owner {
                let list = supertypes.entry(owner).or_default();
                if !list.contains(&name) {
                    list.push(name);
                }
            }
        }

        let symbols = self.extract_symbols(root, source);

        let mut types: Vec<SourceElement> = Vec::new();
        let mut functions: Vec<SourceElement> = Vec::new();
        for symbol in symbols {
            let mut element = SourceElement::from_node(
                if is_type_capture(&symbol.capture) {
                    ElementKind::Type
                } else {
                    ElementKind::Method
                },
                &symbol.node,
            )
            .named(symbol.name.clone());
            element.docstring = doc_comment(symbol.node, text);

            if element.kind == ElementKind::Type {
                element.metadata.kind = Some(symbol.capture.clone());
                element.metadata.imports = imports.clone();
                if let Some(parents) = supertypes.get(&symbol.name) {
                    element.metadata.extends = parents.clone();
                }
                types.push(element);
            } else {
                let content = &text[symbol.node.byte_range()];
                element.metadata.signature = Some(extract_signature(content, lang));
                element.owner = find_parent_symbol(symbol.node, source, lang);
                element.children = body_blocks(symbol.node);
                functions.push(element);
            }
        }

        // Nest functions under the innermost type whose span contains them.
        let mut top_level = Vec::new();
        for function in functions {
            let container = types
                .iter_mut()
                .filter(|t| t.start_byte <= function.start_byte && function.end_byte <= t.end_byte)
                .min_by_key(|t| t.end_byte - t.start_byte);
            match container {
                Some(owner_type) => {
                    let mut function = function;
                    if function.owner.is_none() {
                        function.owner = owner_type.name.clone();
                    }
                    owner_type.children.push(function);
                }
                None => top_level.push(function),
            }
        }

        let mut elements = types;
        elements.extend(top_level);
        elements.sort_by_key(|e| (e.start_byte, std::cmp::Reverse(e.end_byte)));

        Ok(ParsedSource { text, elements })
    }
}

fn is_type_capture(capture: &str) -> bool {
    matches!(capture, "class" | "struct" | "interface")
}

/// Last path segment of an import target, quotes stripped.
fn import_name(path: &str) -> String {
    let trimmed = path.trim_matches(|c| c == '"' || c == '\'' || c == '`');
    trimmed
        .rsplit(['/', '.', ':'])
        .find(|seg| !seg.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}

/// Statements of a function body, used as split points for oversized functions.
fn body_blocks(node: Node<'_>) -> Vec<SourceElement> {
    let Some(body) = node.child_by_field_name("body") else {
        return Vec::new();
    };
    let mut cursor = body.walk();
    body.named_children(&mut cursor)
        .filter(|child| !child.kind().contains("comment"))
        .map(|child| SourceElement::from_node(ElementKind::Block, &child))
        .collect()
}

/// A comment immediately above the symbol, with no blank line in between.
fn doc_comment(node: Node<'_>, text: &str) -> Option<String> {
    let prev = node.prev_named_sibling()?;
    if !prev.kind().contains("comment") {
        return None;
    }
    if node.start_position().row > prev.end_position().row + 1 {
        return None;
    }
    Some(text[prev.byte_range()].trim_end().to_string())
}

fn extract_signature(content: &str, lang: &str) -> String {
    let content = content.trim();
    let collapse = |sig: &str| sig.split_whitespace().collect::<Vec<_>>().join(" ");
    let first_line = || content.lines().next().unwrap_or("").trim().to_string();

    match lang {
        "python" => {
            let line = first_line();
            if let Some(stripped) = line.strip_suffix(':') {
                return stripped.to_string();
            }
            match content.find("):") {
                Some(idx) => collapse(&content[..idx + 1]),
                None => line,
            }
        }
        "typescript" | "javascript" => {
            if let Some(idx) = content.find("=>") {
                collapse(&content[..idx + 2])
            } else if let Some(idx) = content.find('{') {
                collapse(&content[..idx])
            } else {
                first_line()
            }
        }
        _ => match content.find('{') {
            Some(idx) => collapse(&content[..idx]),
            None => first_line(),
        },
    }
}

fn find_parent_symbol(node: Node, source: &[u8], lang: &str) -> Option<String> {
    let mut parent = node.parent();
    while let Some(p) = parent {
        let kind = p.kind();
        let is_class_like = match lang {
            "go" => kind == "type_declaration",
            "python" => kind == "class_definition",
            "typescript" | "javascript" => kind == "class_declaration",
            "rust" => kind == "impl_item" || kind == "struct_item" || kind == "trait_item",
            _ => false,
        };

        if is_class_like {
            if lang == "rust" && kind == "impl_item" {
                if let Some(type_node) = p.child_by_field_name("type") {
                    if let Ok(name) = type_node.utf8_text(source) {
                        return Some(name.to_string());
                    }
                }
            } else {
                let mut cursor = p.walk();
                for child in p.children(&mut cursor) {
                    let child_kind = child.kind();
                    if child_kind.contains("identifier")
                        || child_kind == "type_identifier"
                        || child_kind == "name"
                    {
                        if let Ok(name) = child.utf8_text(source) {
                            return Some(name.to_string());
                        }
                    }
                }
            }
        }
        parent = p.parent();
    }
    None
}
