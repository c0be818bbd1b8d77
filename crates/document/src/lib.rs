/// Tree-structured document model shared by the editor and the sync engine.
/// A document is an ordered sequence of nodes; nodes are addressed by paths.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod node;
pub use node::*;

mod document;
pub use document::*;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid path: {0}")]
    InvalidPath(Path),

    #[error("no children at: {0}")]
    NoChildren(Path),

    #[error("not a text node: {0}")]
    NotAText(Path),

    #[error("offset {offset} out of range (len {len}) at {path}")]
    OffsetOutOfRange {
        path: Path,
        offset: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Positional address of a node: each element indexes into the children
/// sequence at that depth, the root sequence first. Empty means the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<usize>);

impl Path {
    pub fn new(indices: Vec<usize>) -> Self {
        Self(indices)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Splits off the last index: `(parent, index)`. `None` for the root.
    pub fn split_last(&self) -> Option<(Path, usize)> {
        let (last, parent) = self.0.split_last()?;
        Some((Path(parent.to_vec()), *last))
    }

    pub fn child(&self, index: usize) -> Path {
        let mut indices = self.0.clone();
        indices.push(index);
        Path(indices)
    }
}

impl From<Vec<usize>> for Path {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, idx) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", idx)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_split_last() {
        let path = Path::new(vec![0, 2, 1]);
        let (parent, index) = path.split_last().unwrap();
        assert_eq!(parent, Path::new(vec![0, 2]));
        assert_eq!(index, 1);
        assert!(Path::default().split_last().is_none());
    }

    #[test]
    fn path_display_and_serde() {
        let path = Path::new(vec![1, 0, 3]);
        assert_eq!(path.to_string(), "[1.0.3]");
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "[1,0,3]");
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
