//! The externally supplied merge plan.
//!
//! A plan describes how level-0 leaves are paired into the elimination
//! forest: plan level `k` builds forest level `k + 1`, each step naming the
//! two already-built nodes it merges. The plan is produced by an external
//! topology reader and is never inferred here.

use crate::error::{Error, Result};

/// Address of a node in the elimination forest: (level, index within level).
/// Level 0 holds the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub level: usize,
    pub index: usize,
}

impl NodeRef {
    pub fn new(level: usize, index: usize) -> Self {
        Self { level, index }
    }
}

/// One merge: combines exactly two previously built nodes into a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStep {
    pub left: NodeRef,
    pub right: NodeRef,
}

impl MergeStep {
    pub fn new(left: NodeRef, right: NodeRef) -> Self {
        Self { left, right }
    }
}

/// An ordered sequence of merge levels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub levels: Vec<Vec<MergeStep>>,
}

impl MergePlan {
    pub fn new(levels: Vec<Vec<MergeStep>>) -> Self {
        Self { levels }
    }

    /// Number of forest levels this plan produces, counting the leaf level.
    pub fn num_forest_levels(&self) -> usize {
        self.levels.len() + 1
    }

    /// Check the plan against a leaf count.
    ///
    /// Verifies that every child reference points at a strictly earlier,
    /// already-built node and that no node is consumed twice. Returns the
    /// first violation found.
    pub fn validate(&self, leaf_count: usize) -> Result<()> {
        // consumed[level][index]
        let mut consumed: Vec<Vec<bool>> = Vec::with_capacity(self.levels.len() + 1);
        consumed.push(vec![false; leaf_count]);

        for (li, steps) in self.levels.iter().enumerate() {
            let target_level = li + 1;
            for step in steps {
                for child in [step.left, step.right] {
                    if child.level >= target_level || child.index >= consumed[child.level].len() {
                        return Err(Error::PlanChildOutOfRange {
                            level: child.level,
                            index: child.index,
                        });
                    }
                    if consumed[child.level][child.index] {
                        return Err(Error::PlanChildReused {
                            level: child.level,
                            index: child.index,
                        });
                    }
                    consumed[child.level][child.index] = true;
                }
            }
            consumed.push(vec![false; steps.len()]);
        }

        Ok(())
    }
}
