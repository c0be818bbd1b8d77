use crate::{DocumentError, DocumentNode, Path, Result};
use serde::{Deserialize, Serialize};

/// An ordered sequence of top-level nodes. Serializes as a plain JSON array
/// so it doubles as the snapshot payload on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Vec<DocumentNode>);

impl Document {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn nodes(&self) -> &[DocumentNode] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn node_at(&self, path: &Path) -> Result<&DocumentNode> {
        let (first, rest) = path
            .0
            .split_first()
            .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        let mut node = self
            .0
            .get(*first)
            .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        for index in rest {
            let children = node
                .children()
                .ok_or_else(|| DocumentError::NoChildren(path.clone()))?;
            node = children
                .get(*index)
                .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        }
        Ok(node)
    }

    pub fn node_at_mut(&mut self, path: &Path) -> Result<&mut DocumentNode> {
        let (first, rest) = path
            .0
            .split_first()
            .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        let mut node = self
            .0
            .get_mut(*first)
            .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        for index in rest {
            let children = node
                .children_mut()
                .ok_or_else(|| DocumentError::NoChildren(path.clone()))?;
            node = children
                .get_mut(*index)
                .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        }
        Ok(node)
    }

    /// Mutable child sequence under `parent`: the root sequence for the
    /// empty path, a node's children otherwise.
    pub fn children_at_mut(&mut self, parent: &Path) -> Result<&mut Vec<DocumentNode>> {
        if parent.is_root() {
            return Ok(&mut self.0);
        }
        self.node_at_mut(parent)?
            .children_mut()
            .ok_or_else(|| DocumentError::NoChildren(parent.clone()))
    }

    /// Inserts a node at `path`; the index may equal the sibling count
    /// (append). Paths are never empty here.
    pub fn insert_node(&mut self, path: &Path, node: DocumentNode) -> Result<()> {
        let (parent, index) = path
            .split_last()
            .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        let children = self.children_at_mut(&parent)?;
        if index > children.len() {
            return Err(DocumentError::InvalidPath(path.clone()));
        }
        children.insert(index, node);
        Ok(())
    }

    pub fn remove_node(&mut self, path: &Path) -> Result<DocumentNode> {
        let (parent, index) = path
            .split_last()
            .ok_or_else(|| DocumentError::InvalidPath(path.clone()))?;
        let children = self.children_at_mut(&parent)?;
        if index >= children.len() {
            return Err(DocumentError::InvalidPath(path.clone()));
        }
        Ok(children.remove(index))
    }
}

impl From<Vec<DocumentNode>> for Document {
    fn from(nodes: Vec<DocumentNode>) -> Self {
        Self(nodes)
    }
}
