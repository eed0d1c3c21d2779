//! Document tree model.
//!
//! Pages arrive as serialized JSON trees produced by the editor. Every node is
//! an object of the form
//!
//! ```json
//! { "type": "paragraph", "id": "b1", "attrs": {}, "content": [ ... ] }
//! ```
//!
//! Text leaves use `"type": "text"` with a `"text"` field. Inline references
//! are `pageRef` nodes (`attrs.pageId`, optional `attrs.label`) and `blockRef`
//! nodes (`attrs.pageId`, `attrs.blockId`, optional `attrs.snippet`). The
//! root may be a single node or an array of top-level nodes.
//!
//! Parsing produces a tagged-union [`Node`] tree that the extractors walk
//! without having to re-inspect raw JSON.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Node type of inline text leaves.
pub const TEXT_TYPE: &str = "text";

/// Node type of whole-page references.
pub const PAGE_REF_TYPE: &str = "pageRef";

/// Node type of block (unit) references.
pub const BLOCK_REF_TYPE: &str = "blockRef";

/// Errors that can occur while parsing a serialized document.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Invalid document JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Node at {path} has no type")]
    MissingType { path: String },

    #[error("{kind} node at {path} is missing attribute '{attr}'")]
    MissingAttribute {
        kind: String,
        path: String,
        attr: &'static str,
    },
}

/// A parsed document node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Any node that holds ordered children (paragraphs, lists, tables...).
    Container {
        kind: String,
        id: Option<String>,
        children: Vec<Node>,
    },
    /// Inline text.
    Text(String),
    /// Reference to a whole page.
    PageRef {
        page_id: String,
        label: Option<String>,
    },
    /// Reference to a single block of a page.
    BlockRef {
        page_id: String,
        block_id: String,
        snippet: Option<String>,
    },
}

impl Node {
    /// Type name of this node as it appears in the serialized tree.
    pub fn kind(&self) -> &str {
        match self {
            Node::Container { kind, .. } => kind,
            Node::Text(_) => TEXT_TYPE,
            Node::PageRef { .. } => PAGE_REF_TYPE,
            Node::BlockRef { .. } => BLOCK_REF_TYPE,
        }
    }

    /// Children of a container node, empty for leaves.
    pub fn children(&self) -> &[Node] {
        match self {
            Node::Container { children, .. } => children,
            _ => &[],
        }
    }

    /// Convenience constructor for containers.
    pub fn container(kind: impl Into<String>, id: Option<&str>, children: Vec<Node>) -> Self {
        Node::Container {
            kind: kind.into(),
            id: id.map(str::to_string),
            children,
        }
    }

    /// Convenience constructor for text leaves.
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }
}

/// A parsed page tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    /// Top-level nodes in document order.
    pub roots: Vec<Node>,
}

impl Document {
    /// Build a document from already-constructed nodes.
    pub fn new(roots: Vec<Node>) -> Self {
        Self { roots }
    }

    /// Parse a serialized tree.
    pub fn parse(json: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Build a document from a JSON value.
    ///
    /// Nesting depth is bounded by serde_json's recursion limit, so the
    /// conversion below cannot overflow the stack on hostile input.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let raw: Vec<RawNode> = match value {
            Value::Array(_) => serde_json::from_value(value)?,
            other => vec![serde_json::from_value(other)?],
        };

        let roots = raw
            .into_iter()
            .enumerate()
            .map(|(i, node)| node.into_node(format!("/{}", i)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { roots })
    }
}

/// Wire form of a node before validation.
#[derive(Deserialize)]
struct RawNode {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
    text: Option<String>,
    attrs: Option<Map<String, Value>>,
    #[serde(default)]
    content: Option<Vec<RawNode>>,
}

impl RawNode {
    fn into_node(self, path: String) -> Result<Node, DocumentError> {
        let kind = self
            .kind
            .filter(|k| !k.is_empty())
            .ok_or_else(|| DocumentError::MissingType { path: path.clone() })?;
        let attrs = self.attrs.unwrap_or_default();

        match kind.as_str() {
            TEXT_TYPE => Ok(Node::Text(self.text.unwrap_or_default())),
            PAGE_REF_TYPE => Ok(Node::PageRef {
                page_id: required_attr(&attrs, "pageId", &kind, &path)?,
                label: string_attr(&attrs, "label"),
            }),
            BLOCK_REF_TYPE => Ok(Node::BlockRef {
                page_id: required_attr(&attrs, "pageId", &kind, &path)?,
                block_id: required_attr(&attrs, "blockId", &kind, &path)?,
                snippet: string_attr(&attrs, "snippet"),
            }),
            _ => {
                let id = self
                    .id
                    .filter(|id| !id.is_empty())
                    .or_else(|| string_attr(&attrs, "id"));
                let children = self
                    .content
                    .unwrap_or_default()
                    .into_iter()
                    .enumerate()
                    .map(|(i, child)| child.into_node(format!("{}/{}", path, i)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::Container { kind, id, children })
            }
        }
    }
}

fn string_attr(attrs: &Map<String, Value>, name: &str) -> Option<String> {
    attrs
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_attr(
    attrs: &Map<String, Value>,
    name: &'static str,
    kind: &str,
    path: &str,
) -> Result<String, DocumentError> {
    string_attr(attrs, name).ok_or_else(|| DocumentError::MissingAttribute {
        kind: kind.to_string(),
        path: path.to_string(),
        attr: name,
    })
}
