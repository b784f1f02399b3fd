//! Rich-text content tree for documents.
//!
//! A document body is an ordered list of blocks. Each node is either:
//! - an element: `{"type": "p", "children": [...], ...attrs}`
//! - a text leaf: `{"text": "hello", ...marks}`
//!
//! Extra keys (attributes on elements, formatting marks on leaves) are kept
//! verbatim so the content round-trips through this crate unchanged. Beyond
//! structure, the content is opaque here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Content failed structural validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid content at {path}: {reason}")]
pub struct ValidationError {
    /// Location of the offending node, e.g. `/0/children/1`.
    pub path: String,
    pub reason: String,
}

impl ValidationError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// A single node in the content tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Element(Element),
    Text(TextLeaf),
}

/// Block or inline element with nested children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    pub children: Vec<Node>,
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

/// Leaf of text plus its formatting marks (`bold`, `italic`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLeaf {
    pub text: String,
    #[serde(flatten)]
    pub marks: Map<String, Value>,
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextLeaf {
            text: text.into(),
            marks: Map::new(),
        })
    }

    /// Text leaf with a single boolean mark set, e.g. `("bold", "hi")`.
    pub fn marked(mark: &str, text: impl Into<String>) -> Self {
        let mut marks = Map::new();
        marks.insert(mark.to_string(), Value::Bool(true));
        Node::Text(TextLeaf {
            text: text.into(),
            marks,
        })
    }

    pub fn element(kind: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element(Element {
            kind: kind.into(),
            children,
            attrs: Map::new(),
        })
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            Node::Text(leaf) => out.push_str(&leaf.text),
            Node::Element(el) => {
                for child in &el.children {
                    child.collect_text(out);
                }
            }
        }
    }

    fn validate_at(&self, path: &str) -> Result<()> {
        match self {
            Node::Element(el) => {
                if el.kind.is_empty() {
                    return Err(ValidationError::new(path, "element type must not be empty"));
                }
                if el.children.is_empty() {
                    return Err(ValidationError::new(path, "element must have at least one child"));
                }
                for (i, child) in el.children.iter().enumerate() {
                    child.validate_at(&format!("{}/children/{}", path, i))?;
                }
                Ok(())
            }
            Node::Text(leaf) => {
                for reserved in ["type", "children"] {
                    if leaf.marks.contains_key(reserved) {
                        return Err(ValidationError::new(
                            path,
                            format!("text leaf must not carry `{}`", reserved),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Ordered sequence of top-level blocks.
///
/// Equality is equality of the serialized JSON form, which is what the sync
/// controller uses to decide whether a flush would be a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Content(Vec<Node>);

impl Content {
    /// Wrap blocks without validating them. Use [`Content::validate`] or
    /// [`Content::from_value`] when the blocks come from outside.
    pub fn new(blocks: Vec<Node>) -> Self {
        Self(blocks)
    }

    /// Single paragraph holding `text`.
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self(vec![Node::element("p", vec![Node::text(text)])])
    }

    /// Parse and validate raw JSON.
    pub fn from_value(value: Value) -> Result<Self> {
        validate_value(&value)?;
        let content: Content = serde_json::from_value(value)
            .map_err(|e| ValidationError::new("", e.to_string()))?;
        content.validate()?;
        Ok(content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| ValidationError::new("", e.to_string()))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn blocks(&self) -> &[Node] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check the structural invariants: at least one block, every top-level
    /// node is an element, elements have a type and children, leaves are leaves.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(ValidationError::new("", "content must contain at least one block"));
        }
        for (i, block) in self.0.iter().enumerate() {
            let path = format!("/{}", i);
            if matches!(block, Node::Text(_)) {
                return Err(ValidationError::new(&path, "top-level nodes must be elements"));
            }
            block.validate_at(&path)?;
        }
        Ok(())
    }

    /// Concatenated text of all leaves, one line per block.
    pub fn plain_text(&self) -> String {
        let mut lines = Vec::with_capacity(self.0.len());
        for block in &self.0 {
            let mut line = String::new();
            block.collect_text(&mut line);
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Walk raw JSON so malformed input gets a precise path instead of the
/// generic "did not match any variant" from untagged deserialization.
fn validate_value(value: &Value) -> Result<()> {
    let Value::Array(blocks) = value else {
        return Err(ValidationError::new("", "content must be an array of blocks"));
    };
    for (i, block) in blocks.iter().enumerate() {
        validate_node_value(block, &format!("/{}", i))?;
    }
    Ok(())
}

fn validate_node_value(value: &Value, path: &str) -> Result<()> {
    let Value::Object(obj) = value else {
        return Err(ValidationError::new(path, "node must be an object"));
    };

    if let Some(children) = obj.get("children") {
        match obj.get("type") {
            Some(Value::String(_)) => {}
            Some(_) => return Err(ValidationError::new(path, "`type` must be a string")),
            None => return Err(ValidationError::new(path, "element is missing `type`")),
        }
        let Value::Array(children) = children else {
            return Err(ValidationError::new(path, "`children` must be an array"));
        };
        for (i, child) in children.iter().enumerate() {
            validate_node_value(child, &format!("{}/children/{}", path, i))?;
        }
        return Ok(());
    }

    match obj.get("text") {
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ValidationError::new(path, "`text` must be a string")),
        None if obj.contains_key("type") => {
            Err(ValidationError::new(path, "element is missing `children`"))
        }
        None => Err(ValidationError::new(path, "node is neither an element nor a text leaf")),
    }
}
