//! Reference graph extraction over the full chunk set of an index run.
//!
//! Names are matched exactly against the project's own class names, so
//! library types and unresolved mentions never become edges.
use std::collections::{HashMap, HashSet};

use crate::db::models::{Chunk, ChunkType, ReferenceEdge, ReferenceKind};

pub struct ReferenceGraphBuilder;

/// Edges plus adjacency indexes for both directions.
#[derive(Debug, Default)]
pub struct ReferenceGraph {
    pub edges: Vec<ReferenceEdge>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

impl ReferenceGraph {
    fn from_edges(edges: Vec<ReferenceEdge>) -> Self {
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.source_class.clone()).or_default().push(i);
            incoming.entry(edge.target_class.clone()).or_default().push(i);
        }
        Self {
            edges,
            outgoing,
            incoming,
        }
    }

    /// Classes referenced by `key`.
    pub fn references_from(&self, key: &str) -> Vec<&ReferenceEdge> {
        self.lookup(&self.outgoing, key)
    }

    /// Classes and templates referencing `key`.
    pub fn referenced_by(&self, key: &str) -> Vec<&ReferenceEdge> {
        self.lookup(&self.incoming, key)
    }

    fn lookup<'g>(&'g self, index: &HashMap<String, Vec<usize>>, key: &str) -> Vec<&'g ReferenceEdge> {
        index
            .get(key)
            .map(|ids| ids.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl ReferenceGraphBuilder {
    pub fn build(&self, chunks: &[Chunk]) -> ReferenceGraph {
        let known: HashSet<&str> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Class)
            .filter_map(|c| c.class_name.as_deref())
            .collect();

        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        let mut add = |source: &str, target: &str, kind: ReferenceKind| {
            let target = last_segment(target);
            if source == target || !known.contains(target) {
                return;
            }
            let edge = ReferenceEdge::new(source, target, kind);
            if seen.insert(edge.clone()) {
                edges.push(edge);
            }
        };

        for chunk in chunks {
            let Some(source) = chunk.graph_key() else {
                continue;
            };
            let meta = &chunk.metadata;
            match chunk.chunk_type {
                ChunkType::Class => {
                    for (names, kind) in [
                        (&meta.imports, ReferenceKind::Import),
                        (&meta.extends, ReferenceKind::Extends),
                        (&meta.implements, ReferenceKind::Implements),
                        (&meta.field_types, ReferenceKind::FieldType),
                    ] {
                        for name in names {
                            add(source, name, kind);
                        }
                    }
                }
                ChunkType::Method => {
                    for name in &meta.param_types {
                        add(source, name, ReferenceKind::ParamType);
                    }
                    for name in &meta.return_types {
                        add(source, name, ReferenceKind::ReturnType);
                    }
                }
                ChunkType::Field => {
                    for name in &meta.field_types {
                        add(source, name, ReferenceKind::FieldType);
                    }
                }
                ChunkType::Template => {
                    for name in meta.template_refs.iter().chain(&meta.identifiers) {
                        add(source, name, ReferenceKind::TemplateRef);
                    }
                }
                ChunkType::Doc | ChunkType::GenericBlock => {}
            }
        }

        ReferenceGraph::from_edges(edges)
    }
}

/// `com.shop.OrderService` → `OrderService`.
fn last_segment(name: &str) -> &str {
    let name = name.trim();
    name.rsplit(['.', ':', '/', '\\']).next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ChunkMetadata;

    fn class(name: &str, metadata: ChunkMetadata) -> Chunk {
        let mut chunk = Chunk::new(
            &format!("src/{name}.java"),
            "java",
            ChunkType::Class,
            1,
            3,
            &format!("class {name} {{}}"),
        );
        chunk.class_name = Some(name.to_string());
        chunk.metadata = metadata;
        chunk
    }

    fn method(owner: &str, name: &str, metadata: ChunkMetadata) -> Chunk {
        let mut chunk = Chunk::new(
            &format!("src/{owner}.java"),
            "java",
            ChunkType::Method,
            2,
            2,
            &format!("void {name}() {{}}"),
        );
        chunk.class_name = Some(owner.to_string());
        chunk.method_name = Some(name.to_string());
        chunk.metadata = metadata;
        chunk
    }

    #[test]
    fn test_import_edge_restricted_to_known_classes() {
        let chunks = vec![
            class(
                "OrderService",
                ChunkMetadata {
                    imports: vec!["OrderRepository".into(), "List".into()],
                    ..Default::default()
                },
            ),
            class("OrderRepository", ChunkMetadata::default()),
        ];
        let graph = ReferenceGraphBuilder.build(&chunks);
        assert_eq!(
            graph.edges,
            vec![ReferenceEdge::new("OrderService", "OrderRepository", ReferenceKind::Import)]
        );
    }

    #[test]
    fn test_member_and_supertype_edges() {
        let chunks = vec![
            class(
                "OrderService",
                ChunkMetadata {
                    extends: vec!["BaseService".into()],
                    implements: vec!["Auditable".into()],
                    field_types: vec!["OrderRepository".into()],
                    ..Default::default()
                },
            ),
            method(
                "OrderService",
                "placeOrder",
                ChunkMetadata {
                    param_types: vec!["Order".into(), "String".into()],
                    return_types: vec!["Receipt".into()],
                    ..Default::default()
                },
            ),
            class("BaseService", ChunkMetadata::default()),
            class("Auditable", ChunkMetadata::default()),
            class("OrderRepository", ChunkMetadata::default()),
            class("Order", ChunkMetadata::default()),
            class("Receipt", ChunkMetadata::default()),
        ];
        let graph = ReferenceGraphBuilder.build(&chunks);

        let mut kinds: Vec<(String, ReferenceKind)> = graph
            .references_from("OrderService")
            .into_iter()
            .map(|e| (e.target_class.clone(), e.reference_kind))
            .collect();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ("Auditable".to_string(), ReferenceKind::Implements),
                ("BaseService".to_string(), ReferenceKind::Extends),
                ("Order".to_string(), ReferenceKind::ParamType),
                ("OrderRepository".to_string(), ReferenceKind::FieldType),
                ("Receipt".to_string(), ReferenceKind::ReturnType),
            ]
        );
    }

    #[test]
    fn test_template_refs_and_identifiers() {
        let mut template = Chunk::new("forms/order.json", "json", ChunkType::Template, 1, 4, "{}");
        template.metadata = ChunkMetadata {
            template_refs: vec!["com.shop.OrderService".into()],
            identifiers: vec!["OrderService".into(), "Money".into(), "Total".into()],
            ..Default::default()
        };
        let chunks = vec![
            template,
            class("OrderService", ChunkMetadata::default()),
            class("Money", ChunkMetadata::default()),
        ];
        let graph = ReferenceGraphBuilder.build(&chunks);

        let targets: Vec<&str> = graph
            .references_from("forms/order.json")
            .iter()
            .map(|e| e.target_class.as_str())
            .collect();
        assert_eq!(targets, vec!["OrderService", "Money"]);
        assert!(
            graph
                .edges
                .iter()
                .all(|e| e.reference_kind == ReferenceKind::TemplateRef)
        );
    }

    #[test]
    fn test_reverse_lookup_is_symmetric() {
        let chunks = vec![
            class(
                "A",
                ChunkMetadata {
                    imports: vec!["B".into()],
                    ..Default::default()
                },
            ),
            class(
                "B",
                ChunkMetadata {
                    field_types: vec!["A".into(), "B".into()],
                    ..Default::default()
                },
            ),
        ];
        let graph = ReferenceGraphBuilder.build(&chunks);

        // The cycle is two plain edges; self references are dropped.
        assert_eq!(graph.len(), 2);
        for edge in &graph.edges {
            assert!(
                graph
                    .referenced_by(&edge.target_class)
                    .iter()
                    .any(|e| e.source_class == edge.source_class)
            );
        }
        assert!(graph.referenced_by("Missing").is_empty());
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("com.shop.OrderService"), "OrderService");
        assert_eq!(last_segment("crate::db::Db"), "Db");
        assert_eq!(last_segment("Plain"), "Plain");
    }
}
