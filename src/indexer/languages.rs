//! Tree-sitter grammars and symbol queries for the best-effort languages.
//!
//! `symbols` captures `@name` plus one of `@class`, `@struct`, `@interface`
//! (type-like) or `@function`, `@method`. `imports` captures imported module
//! paths, `supertypes` captures `@inherit` inside a type. An empty query is
//! skipped. Patterns capture nothing else; glob imports have no name to
//! record and are not matched.
use tree_sitter::Language;

pub struct SymbolGrammar {
    pub name: &'static str,
    pub language: Language,
    pub extensions: &'static [&'static str],
    pub symbols: &'static str,
    pub imports: &'static str,
    pub supertypes: &'static str,
}

/// Every grammar compiled into the binary.
pub fn bundled() -> Vec<SymbolGrammar> {
    vec![go(), python(), typescript(), javascript(), rust()]
}

fn go() -> SymbolGrammar {
    SymbolGrammar {
        name: "go",
        language: tree_sitter_go::LANGUAGE.into(),
        extensions: &["go"],
        symbols: r#"
(function_declaration
  name: (identifier) @name) @function

(method_declaration
  name: (field_identifier) @name) @method

(type_declaration
  (type_spec
    name: (type_identifier) @name
    type: (struct_type))) @struct

(type_declaration
  (type_spec
    name: (type_identifier) @name
    type: (interface_type))) @interface
"#,
        imports: r#"
(import_spec
  path: (interpreted_string_literal) @import)
"#,
        supertypes: "",
    }
}

fn python() -> SymbolGrammar {
    SymbolGrammar {
        name: "python",
        language: tree_sitter_python::LANGUAGE.into(),
        extensions: &["py"],
        symbols: r#"
(function_definition
  name: (identifier) @name) @function

(class_definition
  name: (identifier) @name) @class
"#,
        imports: r#"
(import_statement
  name: (dotted_name) @import)
(import_from_statement
  module_name: (dotted_name) @import)
"#,
        supertypes: r#"
(class_definition
  superclasses: (argument_list
    (identifier) @inherit))
"#,
    }
}

fn typescript() -> SymbolGrammar {
    SymbolGrammar {
        name: "typescript",
        language: tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        extensions: &["ts", "tsx"],
        symbols: r#"
(function_declaration
  name: (identifier) @name) @function

(lexical_declaration
  (variable_declarator
    name: (identifier) @name
    value: (arrow_function))) @function

(class_declaration
  name: (type_identifier) @name) @class

(interface_declaration
  name: (type_identifier) @name) @interface

(method_definition
  name: (property_identifier) @name) @method
"#,
        imports: r#"
(import_statement
  source: (string) @import)
"#,
        supertypes: r#"
(class_declaration
  (class_heritage
    (extends_clause
      value: (identifier) @inherit)))
(class_declaration
  (class_heritage
    (implements_clause
      (type_identifier) @inherit)))
"#,
    }
}

fn javascript() -> SymbolGrammar {
    SymbolGrammar {
        name: "javascript",
        language: tree_sitter_javascript::LANGUAGE.into(),
        extensions: &["js", "jsx"],
        symbols: r#"
(function_declaration
  name: (identifier) @name) @function

(lexical_declaration
  (variable_declarator
    name: (identifier) @name
    value: (arrow_function))) @function

(class_declaration
  name: (identifier) @name) @class

(method_definition
  name: (property_identifier) @name) @method
"#,
        imports: r#"
(import_statement
  source: (string) @import)
"#,
        supertypes: r#"
(class_declaration
  (class_heritage
    (identifier) @inherit))
"#,
    }
}

fn rust() -> SymbolGrammar {
    SymbolGrammar {
        name: "rust",
        language: tree_sitter_rust::LANGUAGE.into(),
        extensions: &["rs"],
        symbols: r#"
(function_item
  name: (identifier) @name) @function

(impl_item
  type: (type_identifier) @name) @struct

(struct_item
  name: (type_identifier) @name) @struct

(enum_item
  name: (type_identifier) @name) @struct

(trait_item
  name: (type_identifier) @name) @interface
"#,
        imports: r#"
(use_declaration
  argument: (scoped_identifier) @import)
(use_declaration
  argument: (identifier) @import)
"#,
        supertypes: r#"
(impl_item
  trait: (type_identifier) @inherit)
"#,
    }
}
