use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single node in the document tree. On the wire a node is a text node
/// iff it has no `children` key, so the element variant must be tried first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentNode {
    Element(ElementNode),
    Text(TextNode),
}

/// Container node: a type tag, arbitrary extra properties, ordered children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub children: Vec<DocumentNode>,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

/// Leaf node: text content plus formatting marks (bold, italic, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(flatten)]
    pub marks: Map<String, Value>,
}

impl ElementNode {
    pub fn new(kind: impl Into<String>, children: Vec<DocumentNode>) -> Self {
        Self {
            kind: kind.into(),
            children,
            props: Map::new(),
        }
    }
}

impl TextNode {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            marks: Map::new(),
        }
    }

    /// Text length in Unicode scalar values. Offsets in text operations
    /// count scalars, not bytes.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Byte index of the given scalar offset, `None` past the end.
    /// `offset == char_len` maps to the end of the string.
    pub fn byte_index(&self, offset: usize) -> Option<usize> {
        if offset == 0 {
            return Some(0);
        }
        let mut seen = 0;
        for (byte, _) in self.text.char_indices() {
            if seen == offset {
                return Some(byte);
            }
            seen += 1;
        }
        (seen == offset).then_some(self.text.len())
    }
}

impl DocumentNode {
    pub fn element(kind: impl Into<String>, children: Vec<DocumentNode>) -> Self {
        Self::Element(ElementNode::new(kind, children))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextNode::new(text))
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn children(&self) -> Option<&Vec<DocumentNode>> {
        match self {
            Self::Element(el) => Some(&el.children),
            Self::Text(_) => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<DocumentNode>> {
        match self {
            Self::Element(el) => Some(&mut el.children),
            Self::Text(_) => None,
        }
    }

    /// All comparable properties of the node: for elements the type tag plus
    /// extra props (children excluded), for text nodes the marks (text
    /// content excluded). This is the map set-node operations carry.
    pub fn properties(&self) -> Map<String, Value> {
        match self {
            Self::Element(el) => {
                let mut props = el.props.clone();
                props.insert("type".into(), Value::String(el.kind.clone()));
                props
            }
            Self::Text(text) => text.marks.clone(),
        }
    }

    /// Replaces the node's properties wholesale, keeping children and text
    /// content. `children` and `text` keys are stripped, never applied.
    pub fn set_properties(&mut self, props: &Map<String, Value>) {
        let mut props = props.clone();
        props.remove("children");
        match self {
            Self::Element(el) => {
                if let Some(Value::String(kind)) = props.remove("type") {
                    el.kind = kind;
                }
                el.props = props;
            }
            Self::Text(text) => {
                props.remove("text");
                text.marks = props;
            }
        }
    }
}
