//! Branch paths: where in the work-unit tree an event or context lives.
//!
//! Every context derives from its parent by appending one segment, so a path
//! like `pipeline[0]/review[1]/critic[0]` pins down both the unit (`critic`)
//! and its position among its siblings (declaration index 0, under the second
//! child of the root). Paths order events for audit, scope `temp:` state keys
//! to the branch that wrote them, and address the suspended branch on resume.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step in a [`BranchPath`]: a unit name plus its index among siblings.
///
/// For `Loop` bodies the index is the iteration number, so each pass through
/// the loop gets a distinct branch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchSegment {
    pub name: String,
    pub index: usize,
}

impl BranchSegment {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

impl fmt::Display for BranchSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.index)
    }
}

/// Ordered path of `(name, index)` segments from the invocation root down.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchPath(Vec<BranchSegment>);

impl BranchPath {
    /// Path of the invocation root unit.
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![BranchSegment::new(name, 0)])
    }

    /// Derive a child path by appending one segment.
    #[must_use]
    pub fn child(&self, name: impl Into<String>, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(BranchSegment::new(name, index));
        Self(segments)
    }

    pub fn segments(&self) -> &[BranchSegment] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn segment_at(&self, depth: usize) -> Option<&BranchSegment> {
        self.0.get(depth)
    }

    /// Name of the deepest unit on the path, if any.
    pub fn leaf_name(&self) -> Option<&str> {
        self.0.last().map(|segment| segment.name.as_str())
    }

    /// True when `prefix` is an ancestor of (or equal to) this path.
    pub fn starts_with(&self, prefix: &BranchPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_extends_path() {
        let root = BranchPath::root("pipeline");
        let child = root.child("review", 1);
        assert_eq!(child.depth(), 2);
        assert_eq!(child.to_string(), "pipeline[0]/review[1]");
        assert_eq!(child.leaf_name(), Some("review"));
    }

    #[test]
    fn starts_with_is_prefix_wise() {
        let root = BranchPath::root("pipeline");
        let child = root.child("review", 1);
        let grandchild = child.child("critic", 0);

        assert!(grandchild.starts_with(&root));
        assert!(grandchild.starts_with(&child));
        assert!(grandchild.starts_with(&grandchild));
        assert!(!child.starts_with(&grandchild));
        assert!(!grandchild.starts_with(&root.child("review", 2)));
    }

    #[test]
    fn segment_at_indexes_from_root() {
        let path = BranchPath::root("pipeline").child("fanout", 2);
        assert_eq!(path.segment_at(0).map(|s| s.name.as_str()), Some("pipeline"));
        assert_eq!(path.segment_at(1).map(|s| s.index), Some(2));
        assert!(path.segment_at(2).is_none());
    }
}
