//! Heuristic question classification.
//!
//! Rules are ordered phrase lists matched on word boundaries; the first
//! matching rule decides the intent and anything unmatched is a plain search.
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::db::models::ChunkType;

static CLASS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9_]*\b").expect("valid class name regex"));
static METHOD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-z][a-z0-9]*[A-Z][A-Za-z0-9]*\b").expect("valid method name regex"));
static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9_']+").expect("valid word regex"));
static TERM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[a-z][a-z0-9_]*\b").expect("valid term regex"));

const MAX_PRIMARY_TERMS: usize = 10;
const MAX_EXPANDED_TERMS: usize = 15;

const LIST_PHRASES: &[&str] = &[
    "list all", "list the", "show all", "what are all", "what are the", "which classes",
    "which methods", "which files", "which ones", "which all", "how many", "count",
    "enumerate", "all the", "all indexed", "all classes", "all methods",
];
const SCHEMA_PHRASES: &[&str] = &[
    "schema", "table", "tables", "ddl", "entity", "entities", "orm", "jpa", "hibernate",
    "model", "fields",
];
const USAGE_PHRASES: &[&str] = &[
    "where is", "who uses", "what uses", "who calls", "what calls", "called by", "used by",
    "references to", "usages of", "find usages", "depends on",
];
const COMPARISON_PHRASES: &[&str] = &[
    "compare", "difference between", "vs", "versus", "differ", "similar to", "different from",
];
const DEFINITION_PHRASES: &[&str] = &[
    "what is", "what's", "define", "describe", "tell me about", "show me", "get me",
];
const EXPLANATION_PHRASES: &[&str] = &[
    "how does", "how do", "explain", "why does", "why do", "how is", "how are",
    "what happens when", "walk through", "which class will", "which method will",
    "which should", "which would", "which can",
];

/// Capitalized words that are English, not class names.
const COMMON_WORDS: &[&str] = &[
    "I", "A", "An", "The", "How", "What", "When", "Where", "Why", "Which", "Who", "This",
    "That", "These", "Those", "It", "Is", "Are", "Was", "Were", "Has", "Have", "Had", "Do",
    "Does", "Did", "Will", "Would", "Should", "Can", "Could", "May", "Might", "Must", "Shall",
    "To", "From", "For", "With", "Without", "By", "In", "On", "At", "Of", "And", "Or", "But",
    "Explain", "Describe", "Define", "List", "Show", "Tell", "Find", "Search", "Compare",
    "Count", "Enumerate", "Get", "Give", "Walk", "Please",
];

/// Related vocabulary fed to the lexical half of hybrid search.
const TERM_EXPANSIONS: &[(&str, &[&str])] = &[
    ("auth", &["authentication", "authorize", "login", "credential", "token", "session", "security"]),
    ("authentication", &["auth", "login", "credential", "token", "session", "security"]),
    ("login", &["auth", "authentication", "signin", "credential", "session"]),
    ("security", &["auth", "authentication", "permission", "role", "access", "token"]),
    ("save", &["persist", "store", "write", "insert", "create", "update"]),
    ("load", &["read", "fetch", "get", "retrieve", "query"]),
    ("delete", &["remove", "destroy", "drop", "clear"]),
    ("update", &["modify", "change", "edit", "patch", "save"]),
    ("api", &["endpoint", "rest", "controller", "route", "handler"]),
    ("request", &["http", "call", "invoke", "fetch"]),
    ("response", &["result", "return", "output"]),
    ("database", &["db", "repository", "dao", "store", "persistence"]),
    ("query", &["select", "find", "search", "filter"]),
    ("table", &["entity", "model", "schema", "record"]),
    ("error", &["exception", "failure", "fault", "issue"]),
    ("exception", &["error", "throw", "catch", "handle"]),
    ("validation", &["validate", "check", "verify", "sanitize"]),
    ("config", &["configuration", "settings", "properties", "options"]),
    ("util", &["utility", "helper", "common", "shared"]),
    ("service", &["manager", "handler", "processor", "provider"]),
    ("factory", &["builder", "creator", "generator"]),
    ("payment", &["pay", "transaction", "checkout", "billing", "charge", "invoice"]),
    ("transaction", &["payment", "transfer", "operation"]),
    ("user", &["account", "profile", "member", "customer"]),
    ("account", &["user", "profile", "credential"]),
];

/// Words that may accompany a bare identifier without turning it into a sentence.
const BARE_FILLERS: &[&str] = &["the", "a", "an", "class", "interface", "enum", "record", "type"];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "need", "used", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as",
    "into", "through", "during", "before", "after", "above", "below", "between", "under",
    "again", "further", "then", "once", "what", "which", "who", "whom", "this", "that",
    "these", "those", "am", "it", "its", "and", "but", "if", "or", "because", "until",
    "while", "how", "where", "when", "why", "all", "each", "every", "both", "few", "more",
    "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
    "too", "very", "just", "also", "now", "here", "there", "me", "my", "you", "your", "we",
    "our", "they", "their", "show", "tell", "get", "find", "search", "look", "describe",
    "explain", "list", "uses", "use", "calls", "many",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Definition,
    Explanation,
    ListCount,
    Usage,
    Search,
    Comparison,
    Schema,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Definition => "definition",
            Intent::Explanation => "explanation",
            Intent::ListCount => "list_count",
            Intent::Usage => "usage",
            Intent::Search => "search",
            Intent::Comparison => "comparison",
            Intent::Schema => "schema",
        }
    }

    /// Retrieval knobs for this intent.
    pub fn profile(&self, config: &RetrievalConfig) -> IntentProfile {
        let base = IntentProfile {
            top_k: config.search_top_k,
            min_similarity: config.min_similarity,
            expand_dependencies: false,
            graph_first: false,
            chunk_type: None,
        };
        match self {
            Intent::Definition => IntentProfile {
                top_k: config.definition_top_k,
                graph_first: true,
                chunk_type: Some(ChunkType::Class),
                ..base
            },
            Intent::Usage => IntentProfile {
                graph_first: true,
                ..base
            },
            Intent::ListCount => IntentProfile {
                top_k: config.list_top_k,
                min_similarity: config.list_min_similarity,
                chunk_type: Some(ChunkType::Class),
                ..base
            },
            Intent::Schema => IntentProfile {
                expand_dependencies: true,
                chunk_type: Some(ChunkType::Class),
                ..base
            },
            Intent::Explanation => IntentProfile {
                expand_dependencies: true,
                ..base
            },
            Intent::Search | Intent::Comparison => base,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentProfile {
    pub top_k: usize,
    pub min_similarity: f64,
    pub expand_dependencies: bool,
    /// Try exact structural matches through the reference graph before vector rank.
    pub graph_first: bool,
    /// Restrict ranked search to one chunk type.
    pub chunk_type: Option<ChunkType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub intent: Intent,
    pub class_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub method_names: Vec<String>,
    pub primary_terms: Vec<String>,
    /// Related vocabulary for keyword search; never includes a primary term.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expanded_terms: Vec<String>,
}

impl QueryAnalysis {
    /// Analysis for the fixed-intent lookup modes.
    pub fn for_lookup(intent: Intent, name: &str) -> Self {
        Self {
            intent,
            class_names: vec![name.to_string()],
            method_names: Vec::new(),
            primary_terms: vec![name.to_string()],
            expanded_terms: Vec::new(),
        }
    }

    /// The intent's profile; a definition question without a class name
    /// is not narrowed to class chunks.
    pub fn profile(&self, config: &RetrievalConfig) -> IntentProfile {
        let mut profile = self.intent.profile(config);
        if self.intent == Intent::Definition && self.class_names.is_empty() {
            profile.chunk_type = None;
        }
        profile
    }

    /// Primary terms followed by expanded terms.
    pub fn keywords(&self) -> Vec<String> {
        self.primary_terms
            .iter()
            .chain(&self.expanded_terms)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    pub fn analyze(&self, question: &str) -> QueryAnalysis {
        let class_names = class_candidates(question);
        let method_names = unique_matches(&METHOD_NAME, question, |_| true);
        let lower = question.trim().to_lowercase();

        let words: Vec<&str> = WORD.find_iter(&lower).map(|m| m.as_str()).collect();
        let intent = detect_intent(&words, &class_names);
        let primary_terms = primary_terms(&lower, &class_names, &method_names);
        let expanded_terms = expand_terms(&primary_terms);

        QueryAnalysis {
            intent,
            class_names,
            method_names,
            primary_terms,
            expanded_terms,
        }
    }
}

fn detect_intent(words: &[&str], class_names: &[String]) -> Intent {
    let normalized = format!(" {} ", words.join(" "));
    let matches = |phrases: &[&str]| phrases.iter().any(|p| normalized.contains(&format!(" {p} ")));

    if matches(LIST_PHRASES) {
        return Intent::ListCount;
    }
    if matches(SCHEMA_PHRASES) {
        return Intent::Schema;
    }
    if matches(USAGE_PHRASES) {
        return Intent::Usage;
    }
    if matches(COMPARISON_PHRASES) {
        return Intent::Comparison;
    }
    if matches(DEFINITION_PHRASES) {
        return Intent::Definition;
    }
    if matches(EXPLANATION_PHRASES) {
        return Intent::Explanation;
    }

    let class_words: HashSet<String> = class_names.iter().map(|c| c.to_lowercase()).collect();
    let bare = !class_names.is_empty()
        && words
            .iter()
            .all(|w| class_words.contains(*w) || BARE_FILLERS.contains(w));
    if bare {
        return Intent::Definition;
    }

    Intent::Search
}

fn class_candidates(question: &str) -> Vec<String> {
    unique_matches(&CLASS_NAME, question, |name| {
        name.len() >= 2 && !COMMON_WORDS.contains(&name)
    })
}

/// Regex matches passing `keep`, deduplicated in order of first appearance.
fn unique_matches(re: &Regex, text: &str, keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str())
        .filter(|s| keep(s) && seen.insert(*s))
        .map(str::to_string)
        .collect()
}

fn primary_terms(lower: &str, class_names: &[String], method_names: &[String]) -> Vec<String> {
    let mut terms: Vec<String> = class_names.iter().chain(method_names).cloned().collect();
    let mut seen: HashSet<String> = terms.iter().map(|t| t.to_lowercase()).collect();

    for word in TERM.find_iter(lower).map(|m| m.as_str()) {
        if word.len() > 2 && !STOP_WORDS.contains(&word) && seen.insert(word.to_string()) {
            terms.push(word.to_string());
        }
    }
    terms.truncate(MAX_PRIMARY_TERMS);
    terms
}

/// Direct expansions of each term, then every group that lists the term.
fn expand_terms(primary_terms: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = primary_terms.iter().map(|t| t.to_lowercase()).collect();
    let mut expanded = Vec::new();
    let mut add = |word: &str| {
        if seen.insert(word.to_string()) {
            expanded.push(word.to_string());
        }
    };

    for term in primary_terms {
        let term = term.to_lowercase();
        for (key, related) in TERM_EXPANSIONS {
            if *key == term {
                related.iter().for_each(|w| add(*w));
            }
        }
        for (key, related) in TERM_EXPANSIONS {
            if related.contains(&term.as_str()) {
                add(*key);
                related.iter().for_each(|w| add(*w));
            }
        }
    }
    expanded.truncate(MAX_EXPANDED_TERMS);
    expanded
}
