//! UI element tree produced by hooks.
//!
//! The isolate normalises whatever a hook returns into plain JSON before it
//! crosses into Rust: `null` for nothing, strings for text, arrays for
//! fragments and `{type, props, children}` objects for nodes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write;

/// Host component tag hooks use to render a repository file.
pub const FILE_RENDERER: &str = "FileRenderer";

/// Deepest element tree the outline renderer accepts. Kept well under the
/// depth the sandbox lets through, so deep trees fail at render time.
pub const MAX_RENDER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Element {
    Empty,
    Text(String),
    List(Vec<Element>),
    Node(Node),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("element tree deeper than {0} levels")]
    TooDeep(usize),

    #[error("element with an empty type")]
    EmptyType,
}

impl Element {
    pub fn text(text: impl Into<String>) -> Self {
        Element::Text(text.into())
    }

    pub fn node(kind: impl Into<String>, children: Vec<Element>) -> Self {
        Element::Node(Node {
            kind: kind.into(),
            props: Map::new(),
            children,
        })
    }

    /// Concatenated text content of the tree.
    pub fn text_content(&self) -> String {
        match self {
            Element::Empty => String::new(),
            Element::Text(text) => text.clone(),
            Element::List(items) => items.iter().map(Element::text_content).collect(),
            Element::Node(node) => node.children.iter().map(Element::text_content).collect(),
        }
    }

    /// Render an indented outline of the tree.
    ///
    /// This is the last step before an element reaches the screen, so its
    /// errors are render-phase failures.
    pub fn render_outline(&self, max_depth: usize) -> Result<String, RenderError> {
        let mut out = String::new();
        self.outline_into(&mut out, 0, max_depth)?;
        Ok(out)
    }

    fn outline_into(&self, out: &mut String, depth: usize, max_depth: usize) -> Result<(), RenderError> {
        if depth > max_depth {
            return Err(RenderError::TooDeep(max_depth));
        }
        let indent = "  ".repeat(depth);
        match self {
            Element::Empty => {}
            Element::Text(text) => {
                let _ = writeln!(out, "{indent}{text:?}");
            }
            Element::List(items) => {
                for item in items {
                    item.outline_into(out, depth, max_depth)?;
                }
            }
            Element::Node(node) => {
                if node.kind.is_empty() {
                    return Err(RenderError::EmptyType);
                }
                let props = if node.props.is_empty() {
                    String::new()
                } else {
                    format!(" {}", Value::Object(node.props.clone()))
                };
                let _ = writeln!(out, "{indent}<{}>{props}", node.kind);
                for child in &node.children {
                    child.outline_into(out, depth + 1, max_depth)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserializes_normalised_tree() {
        let element: Element = serde_json::from_value(json!({
            "type": "div",
            "props": {"className": "peers"},
            "children": ["Peers: ", "3", null, [{"type": "FileRenderer", "props": {"path": "README.md"}, "children": []}]]
        }))
        .unwrap();

        let Element::Node(node) = &element else {
            panic!("expected a node");
        };
        assert_eq!(node.kind, "div");
        assert_eq!(node.children[2], Element::Empty);
        assert!(matches!(node.children[3], Element::List(_)));
        assert_eq!(element.text_content(), "Peers: 3");
    }

    #[test]
    fn test_plain_string_result() {
        let element: Element = serde_json::from_value(json!("ok")).unwrap();
        assert_eq!(element, Element::text("ok"));
    }

    #[test]
    fn test_render_outline() {
        let element = Element::node("section", vec![Element::text("hi"), Element::node("p", vec![])]);
        let outline = element.render_outline(8).unwrap();
        assert_eq!(outline, "<section>\n  \"hi\"\n  <p>\n");
    }

    #[test]
    fn test_render_outline_rejects_deep_trees() {
        let mut element = Element::text("leaf");
        for _ in 0..10 {
            element = Element::node("div", vec![element]);
        }
        assert_eq!(element.render_outline(4), Err(RenderError::TooDeep(4)));
    }

    #[test]
    fn test_render_outline_rejects_empty_type() {
        let element = Element::node("", vec![]);
        assert_eq!(element.render_outline(4), Err(RenderError::EmptyType));
    }
}
