/// Edit-script operations replicated between collaborators
/// Produced by the differ, coalesced by the batcher, applied to documents
use document::{Document, DocumentError, DocumentNode, Path};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// A single atomic edit at a path. Operations are order-sensitive: applying
/// them out of the order they were emitted in is undefined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "insert_node")]
    InsertNode { path: Path, node: DocumentNode },

    #[serde(rename = "remove_node")]
    RemoveNode { path: Path, node: DocumentNode },

    #[serde(rename = "set_node", rename_all = "camelCase")]
    SetNode {
        path: Path,
        properties: Map<String, Value>,
        new_properties: Map<String, Value>,
    },

    #[serde(rename = "insert_text")]
    InsertText {
        path: Path,
        offset: usize,
        text: String,
    },

    #[serde(rename = "remove_text")]
    RemoveText {
        path: Path,
        offset: usize,
        text: String,
    },
}

impl Operation {
    pub fn path(&self) -> &Path {
        match self {
            Operation::InsertNode { path, .. }
            | Operation::RemoveNode { path, .. }
            | Operation::SetNode { path, .. }
            | Operation::InsertText { path, .. }
            | Operation::RemoveText { path, .. } => path,
        }
    }

    pub fn is_text_op(&self) -> bool {
        matches!(
            self,
            Operation::InsertText { .. } | Operation::RemoveText { .. }
        )
    }

    /// Apply this operation to a document. Text offsets count Unicode
    /// scalar values.
    pub fn apply(&self, doc: &mut Document) -> document::Result<()> {
        match self {
            Operation::InsertNode { path, node } => doc.insert_node(path, node.clone()),

            Operation::RemoveNode { path, .. } => {
                doc.remove_node(path)?;
                Ok(())
            }

            Operation::SetNode {
                path,
                new_properties,
                ..
            } => {
                doc.node_at_mut(path)?.set_properties(new_properties);
                Ok(())
            }

            Operation::InsertText { path, offset, text } => {
                match doc.node_at_mut(path)? {
                    DocumentNode::Text(target) => {
                        let at = target.byte_index(*offset).ok_or_else(|| {
                            DocumentError::OffsetOutOfRange {
                                path: path.clone(),
                                offset: *offset,
                                len: target.char_len(),
                            }
                        })?;
                        target.text.insert_str(at, text);
                        Ok(())
                    }
                    DocumentNode::Element(_) => Err(DocumentError::NotAText(path.clone())),
                }
            }

            Operation::RemoveText { path, offset, text } => {
                match doc.node_at_mut(path)? {
                    DocumentNode::Text(target) => {
                        let end_offset = offset + text.chars().count();
                        let start = target.byte_index(*offset).ok_or_else(|| {
                            DocumentError::OffsetOutOfRange {
                                path: path.clone(),
                                offset: *offset,
                                len: target.char_len(),
                            }
                        })?;
                        let end = target.byte_index(end_offset).ok_or_else(|| {
                            DocumentError::OffsetOutOfRange {
                                path: path.clone(),
                                offset: end_offset,
                                len: target.char_len(),
                            }
                        })?;
                        target.text.replace_range(start..end, "");
                        Ok(())
                    }
                    DocumentNode::Element(_) => Err(DocumentError::NotAText(path.clone())),
                }
            }
        }
    }
}

/// Applies a whole edit script best-effort: a failing operation (stale path,
/// bad offset) is logged and skipped while the rest still apply. Already
/// applied operations are never rolled back. Returns the failure count.
pub fn apply_all(doc: &mut Document, ops: &[Operation]) -> usize {
    let mut failures = 0;
    for op in ops {
        if let Err(e) = op.apply(doc) {
            warn!("skipping operation at {}: {}", op.path(), e);
            failures += 1;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document(vec![DocumentNode::element(
            "p",
            vec![DocumentNode::text("hello")],
        )])
    }

    #[test]
    fn insert_and_remove_text() {
        let mut doc = doc();
        Operation::InsertText {
            path: Path::new(vec![0, 0]),
            offset: 5,
            text: " world".into(),
        }
        .apply(&mut doc)
        .unwrap();
        Operation::RemoveText {
            path: Path::new(vec![0, 0]),
            offset: 0,
            text: "hello ".into(),
        }
        .apply(&mut doc)
        .unwrap();
        match doc.node_at(&Path::new(vec![0, 0])).unwrap() {
            DocumentNode::Text(t) => assert_eq!(t.text, "world"),
            DocumentNode::Element(_) => panic!("expected text node"),
        }
    }

    #[test]
    fn text_offsets_count_scalars() {
        let mut doc = Document(vec![DocumentNode::text("héllo")]);
        Operation::InsertText {
            path: Path::new(vec![0]),
            offset: 2,
            text: "x".into(),
        }
        .apply(&mut doc)
        .unwrap();
        match doc.node_at(&Path::new(vec![0])).unwrap() {
            DocumentNode::Text(t) => assert_eq!(t.text, "héxllo"),
            DocumentNode::Element(_) => panic!("expected text node"),
        }
    }

    #[test]
    fn remove_text_out_of_range_fails() {
        let mut doc = doc();
        let err = Operation::RemoveText {
            path: Path::new(vec![0, 0]),
            offset: 3,
            text: "lots more than remains".into(),
        }
        .apply(&mut doc);
        assert!(err.is_err());
    }

    #[test]
    fn apply_all_skips_failures_and_continues() {
        let mut target = doc();
        let ops = vec![
            Operation::InsertText {
                path: Path::new(vec![9, 9]),
                offset: 0,
                text: "nope".into(),
            },
            Operation::InsertText {
                path: Path::new(vec![0, 0]),
                offset: 5,
                text: "!".into(),
            },
        ];
        let failures = apply_all(&mut target, &ops);
        assert_eq!(failures, 1);
        match target.node_at(&Path::new(vec![0, 0])).unwrap() {
            DocumentNode::Text(t) => assert_eq!(t.text, "hello!"),
            DocumentNode::Element(_) => panic!("expected text node"),
        }
    }

    #[test]
    fn operation_wire_shape() {
        let op = Operation::InsertText {
            path: Path::new(vec![0]),
            offset: 0,
            text: "a".into(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"type":"insert_text","path":[0],"offset":0,"text":"a"}"#);

        let op = Operation::SetNode {
            path: Path::new(vec![1]),
            properties: Map::new(),
            new_properties: Map::new(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains(r#""type":"set_node""#));
        assert!(json.contains(r#""newProperties""#));

        let back: Operation = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Operation::SetNode { .. }));
    }
}
