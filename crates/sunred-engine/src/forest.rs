//! The SUNRED elimination forest.
//!
//! Level 0 holds one leaf per contained component; every higher level is
//! built from the externally supplied merge plan. The forward pass visits
//! levels bottom-up and the backward pass top-down — the strict barrier
//! between levels mirrors forward/back substitution in Gaussian
//! elimination. Nodes within one level have no mutual dependencies and run
//! in parallel.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use sunred_core::{DomainScalar, Error, MergePlan, NodeRef, NodeVariable, Result, Stamp};

use crate::node::TreeNode;

/// One level-0 component: resolved global unknown per terminal (`None` for
/// ground) and an enabled flag. Disabled components contribute nothing.
#[derive(Debug, Clone)]
pub struct LeafSpec {
    pub connections: Vec<Option<usize>>,
    pub enabled: bool,
}

impl LeafSpec {
    pub fn new(connections: Vec<Option<usize>>) -> Self {
        Self {
            connections,
            enabled: true,
        }
    }
}

/// Tree-structured successive network reduction over a group of components.
#[derive(Debug)]
pub struct SunredForest<T: DomainScalar> {
    levels: Vec<Vec<TreeNode<T>>>,
    roots: Vec<NodeRef>,
}

impl<T: DomainScalar> SunredForest<T> {
    /// Build the forest for a fixed component list and merge plan.
    ///
    /// `num_vars` is the size of the group's unknown arena; `external[g]`
    /// marks the unknowns exported out of the forest, which are never
    /// eliminated. Fails when the plan is inconsistent with the live
    /// topology or leaves an enclosed unknown un-eliminated.
    pub fn build(
        leaves: &[LeafSpec],
        plan: &MergePlan,
        num_vars: usize,
        external: &[bool],
    ) -> Result<Self> {
        if external.len() != num_vars {
            return Err(Error::InvalidGroup(format!(
                "external flags cover {} unknowns but the group has {num_vars}",
                external.len()
            )));
        }
        plan.validate(leaves.len())?;

        // Forest-wide occurrence totals decide when an index is fully
        // enclosed by a subtree.
        let mut totals = vec![0u32; num_vars];
        for leaf in leaves.iter().filter(|l| l.enabled) {
            for &g in leaf.connections.iter().flatten() {
                if g >= num_vars {
                    return Err(Error::UnknownOutOfRange {
                        index: g,
                        count: num_vars,
                    });
                }
                totals[g] += 1;
            }
        }

        let mut levels: Vec<Vec<TreeNode<T>>> = vec![leaves
            .iter()
            .enumerate()
            .map(|(i, spec)| TreeNode::leaf(i, &spec.connections, spec.enabled))
            .collect()];
        let mut consumed: Vec<Vec<bool>> = vec![vec![false; leaves.len()]];

        for steps in &plan.levels {
            let mut level = Vec::with_capacity(steps.len());
            for step in steps {
                for child in [step.left, step.right] {
                    consumed[child.level][child.index] = true;
                }
                let left = &levels[step.left.level][step.left.index];
                let right = &levels[step.right.level][step.right.index];
                level.push(TreeNode::merge(
                    step.left, step.right, left, right, &totals, external,
                )?);
            }
            consumed.push(vec![false; level.len()]);
            levels.push(level);
        }

        let mut roots = Vec::new();
        for (li, level) in consumed.iter().enumerate() {
            for (ni, &used) in level.iter().enumerate() {
                if !used {
                    roots.push(NodeRef::new(li, ni));
                }
            }
        }

        // Every enclosed unknown must be eliminated somewhere: a root A-set
        // may only carry exported indices.
        for &r in &roots {
            for &g in &levels[r.level][r.index].a_indices {
                if !external[g] {
                    return Err(Error::IndexNotEliminated { index: g });
                }
            }
        }

        Ok(Self { levels, roots })
    }

    /// Reduce: visit every node, level 0 to level n, nodes within a level
    /// in parallel.
    pub fn forward(&mut self, stamps: &[&dyn Stamp<T>], vars: &[NodeVariable]) -> Result<()> {
        for k in 0..self.levels.len() {
            let (lower, rest) = self.levels.split_at_mut(k);
            let lower = &*lower;
            if let Some(level) = rest.first_mut() {
                level
                    .par_iter_mut()
                    .try_for_each(|node| node.forward(lower, stamps, vars))?;
            }
        }
        Ok(())
    }

    /// Substitute: visit every node, level n down to level 0 — the exact
    /// reverse of the forward order. The caller must have written the root
    /// A-set values to the unknowns beforehand.
    pub fn backward(&self, vars: &[NodeVariable]) -> Result<()> {
        for level in self.levels.iter().rev() {
            level.par_iter().try_for_each(|node| node.backward(vars))?;
        }
        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_roots(&self) -> usize {
        self.roots.len()
    }

    fn single_root(&self) -> Result<&TreeNode<T>> {
        if self.roots.len() != 1 {
            return Err(Error::InvalidGroup(format!(
                "expected a single root, forest has {}",
                self.roots.len()
            )));
        }
        let r = self.roots[0];
        self.levels
            .get(r.level)
            .and_then(|l| l.get(r.index))
            .ok_or(Error::PlanChildOutOfRange {
                level: r.level,
                index: r.index,
            })
    }

    /// Sorted global indices surviving at the single root.
    pub fn a_indices(&self) -> Result<&[usize]> {
        Ok(&self.single_root()?.a_indices)
    }

    /// Reduced admittance block over the single root's A-set.
    pub fn reduced_y(&self) -> Result<&DMatrix<T>> {
        Ok(&self.single_root()?.yred)
    }

    /// Reduced defect vector over the single root's A-set.
    pub fn reduced_j(&self) -> Result<&DVector<T>> {
        Ok(&self.single_root()?.jred)
    }

    pub fn is_symmetric(&self) -> Result<bool> {
        Ok(self.single_root()?.symmetric)
    }

    /// Whether the previous forward pass re-factored anything. Leaf changes
    /// cascade upward, so the root flag covers the whole tree.
    pub fn last_changed(&self) -> Result<bool> {
        Ok(self.single_root()?.changed)
    }

    /// Reduced admittance entry addressed by global unknown indices,
    /// accumulated over every root; zero when no root's A-set carries the
    /// pair. An exported index may survive in several roots (two disjoint
    /// subtrees sharing an exported unknown), so the contributions sum.
    pub fn reduced_entry(&self, row: usize, col: usize) -> T {
        let mut acc = T::zero();
        for &r in &self.roots {
            let root = &self.levels[r.level][r.index];
            if let (Ok(i), Ok(j)) = (
                root.a_indices.binary_search(&row),
                root.a_indices.binary_search(&col),
            ) {
                acc += root.yred[(i, j)];
            }
        }
        acc
    }

    /// Reduced defect entry addressed by a global unknown index,
    /// accumulated over every root.
    pub fn reduced_defect_entry(&self, row: usize) -> T {
        let mut acc = T::zero();
        for &r in &self.roots {
            let root = &self.levels[r.level][r.index];
            if let Ok(i) = root.a_indices.binary_search(&row) {
                acc += root.jred[i];
            }
        }
        acc
    }

    /// Whether every root's reduced block is symmetric.
    pub fn roots_symmetric(&self) -> bool {
        self.roots
            .iter()
            .all(|&r| self.levels[r.level][r.index].symmetric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunred_core::{DenseStamp, MergeStep};

    fn make_vars(n: usize) -> Vec<NodeVariable> {
        (0..n).map(|_| NodeVariable::new(0.0, false)).collect()
    }

    fn pair_plan() -> MergePlan {
        MergePlan::new(vec![vec![MergeStep::new(
            NodeRef::new(0, 0),
            NodeRef::new(0, 1),
        )]])
    }

    /// The series-resistor scenario through the tree reducer: u1 is
    /// promoted to the B-set at the only merge.
    #[test]
    fn test_series_resistors_through_tree() {
        let (g1, g2) = (2.0, 3.0);
        let mut s1 = DenseStamp::conductance(g1);
        let s2 = DenseStamp::conductance(g2);
        s1.j[0] = -1.0;

        let leaves = vec![
            LeafSpec::new(vec![Some(0), Some(1)]),
            LeafSpec::new(vec![Some(1), None]),
        ];
        let mut forest =
            SunredForest::<f64>::build(&leaves, &pair_plan(), 2, &[true, false]).unwrap();

        let vars = make_vars(2);
        let stamps: Vec<&dyn Stamp<f64>> = vec![&s1, &s2];
        forest.forward(&stamps, &vars).unwrap();

        assert_eq!(forest.a_indices().unwrap(), &[0]);
        let g_series = g1 * g2 / (g1 + g2);
        assert!((forest.reduced_y().unwrap()[(0, 0)] - g_series).abs() < 1e-14);

        let u0 = -forest.reduced_j().unwrap()[0] / forest.reduced_y().unwrap()[(0, 0)];
        vars[0].set_value_dc(u0);
        forest.backward(&vars).unwrap();
        assert!((vars[1].value_dc() - g1 * u0 / (g1 + g2)).abs() < 1e-12);
    }

    #[test]
    fn test_unconsumed_internal_index_is_fatal() {
        // Unknown 1 is enclosed (not external) but the empty plan never
        // eliminates it.
        let leaves = vec![
            LeafSpec::new(vec![Some(0), Some(1)]),
            LeafSpec::new(vec![Some(1), None]),
        ];
        let plan = MergePlan::default();
        assert!(matches!(
            SunredForest::<f64>::build(&leaves, &plan, 2, &[true, false]),
            Err(Error::IndexNotEliminated { index: 1 })
        ));
    }

    #[test]
    fn test_change_detection_cascades() {
        let mut s1 = DenseStamp::<f64>::conductance(2.0);
        let s2 = DenseStamp::<f64>::conductance(3.0);
        let leaves = vec![
            LeafSpec::new(vec![Some(0), Some(1)]),
            LeafSpec::new(vec![Some(1), None]),
        ];
        let mut forest =
            SunredForest::<f64>::build(&leaves, &pair_plan(), 2, &[true, false]).unwrap();
        let vars = make_vars(2);

        {
            let stamps: Vec<&dyn Stamp<f64>> = vec![&s1, &s2];
            forest.forward(&stamps, &vars).unwrap();
            assert!(forest.last_changed().unwrap());
            let first = forest.reduced_y().unwrap().clone();

            forest.forward(&stamps, &vars).unwrap();
            assert!(!forest.last_changed().unwrap());
            assert_eq!(forest.reduced_y().unwrap(), &first);
        }

        s1.y[(1, 1)] += 0.25;
        let stamps: Vec<&dyn Stamp<f64>> = vec![&s1, &s2];
        forest.forward(&stamps, &vars).unwrap();
        assert!(forest.last_changed().unwrap());
    }

    #[test]
    fn test_multi_root_entries_accumulate() {
        // Two shunts to ground with nothing to eliminate: two roots, each
        // carrying one exported unknown. A third shunt shares unknown 0,
        // so its root contribution must sum with the first.
        let leaves = vec![
            LeafSpec::new(vec![Some(0), None]),
            LeafSpec::new(vec![Some(1), None]),
            LeafSpec::new(vec![Some(0), None]),
        ];
        let plan = MergePlan::default();
        let mut forest = SunredForest::<f64>::build(&leaves, &plan, 2, &[true, true]).unwrap();
        assert_eq!(forest.num_roots(), 3);

        let s1 = DenseStamp::conductance(2.0);
        let s2 = DenseStamp::conductance(3.0);
        let s3 = DenseStamp::conductance(5.0);
        let vars = make_vars(2);
        let stamps: Vec<&dyn Stamp<f64>> = vec![&s1, &s2, &s3];
        forest.forward(&stamps, &vars).unwrap();

        assert_eq!(forest.reduced_entry(0, 0), 7.0);
        assert_eq!(forest.reduced_entry(1, 1), 3.0);
        assert_eq!(forest.reduced_entry(0, 1), 0.0);
        assert!(forest.roots_symmetric());
    }

    #[test]
    fn test_disabled_leaf_forms_extra_root() {
        // A disabled component left out of the plan is an empty root and
        // breaks the single-root accessors but not the build.
        let leaves = vec![
            LeafSpec::new(vec![Some(0), None]),
            LeafSpec {
                connections: vec![Some(0), None],
                enabled: false,
            },
        ];
        let plan = MergePlan::default();
        let forest = SunredForest::<f64>::build(&leaves, &plan, 1, &[true]).unwrap();
        assert_eq!(forest.num_roots(), 2);
        assert!(forest.reduced_y().is_err());
    }
}
