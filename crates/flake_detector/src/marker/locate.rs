//! Finds test-definition calls in JS/TS sources using tree-sitter.

use super::MarkerError;
use std::path::Path;
use tree_sitter::{Parser, Query, QueryCursor, StreamingIterator};

/// `it(...)`, `test(...)`, `specify(...)` and member forms such as
/// `it.only(...)`, whose first argument is a string literal.
const TEST_CALL_QUERY: &str = r#"
    (expression_statement
        (call_expression
            function: [
                (identifier) @name
                (member_expression object: (identifier) @name)
            ]
            arguments: (arguments . [(string) (template_string)] @title))
        (#match? @name "^(it|test|specify)$")) @statement
"#;

/// A test definition statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDefinition {
    pub title: String,
    /// 0-based row of the statement's first line.
    pub row: usize,
    /// Leading whitespace of that line.
    pub indent: String,
}

/// Locate every test definition in `content`.
///
/// Files with syntax errors are rejected rather than guessed at.
pub fn find_test_definitions(
    content: &str,
    path: &Path,
) -> Result<Vec<TestDefinition>, MarkerError> {
    let language = language_for_path(path);
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| MarkerError::Language(e.to_string()))?;

    let tree = parser
        .parse(content, None)
        .ok_or_else(|| MarkerError::Syntax(path.to_path_buf()))?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(MarkerError::Syntax(path.to_path_buf()));
    }

    let query =
        Query::new(&language, TEST_CALL_QUERY).map_err(|e| MarkerError::Query(e.to_string()))?;
    let (Some(title_idx), Some(statement_idx)) = (
        query.capture_index_for_name("title"),
        query.capture_index_for_name("statement"),
    ) else {
        return Err(MarkerError::Query("missing capture".to_string()));
    };

    let lines: Vec<&str> = content.lines().collect();
    let mut found = Vec::new();
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(&query, root, content.as_bytes());

    while let Some(m) = matches.next() {
        let title_node = m.captures.iter().find(|c| c.index == title_idx);
        let statement_node = m.captures.iter().find(|c| c.index == statement_idx);
        let (Some(title_node), Some(statement_node)) = (title_node, statement_node) else {
            continue;
        };
        let Some(title) = literal_text(content, &title_node.node) else {
            continue;
        };

        let row = statement_node.node.start_position().row;
        let indent = lines
            .get(row)
            .map(|line| {
                line.chars()
                    .take_while(|c| *c == ' ' || *c == '\t')
                    .collect::<String>()
            })
            .unwrap_or_default();

        found.push(TestDefinition { title, row, indent });
    }

    Ok(found)
}

fn language_for_path(path: &Path) -> tree_sitter::Language {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "ts" | "mts" | "cts" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        _ => tree_sitter_typescript::LANGUAGE_TSX.into(),
    }
}

/// Value of a string or substitution-free template literal.
fn literal_text(content: &str, node: &tree_sitter::Node) -> Option<String> {
    if node.kind() == "template_string" {
        let mut walker = node.walk();
        if node
            .named_children(&mut walker)
            .any(|c| c.kind() == "template_substitution")
        {
            return None;
        }
    }

    let text = node.utf8_text(content.as_bytes()).ok()?;
    let mut chars = text.chars();
    let quote = chars.next()?;
    let inner = chars.as_str().strip_suffix(quote)?;
    Some(unescape(inner))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            // line continuation
            Some('\n') | None => {}
            Some(other) => out.push(other),
        }
    }
    out
}
