//! One node of the SUNRED elimination forest.
//!
//! A leaf wraps a single component stamp; an internal node merges exactly
//! two already-reduced children. Each node exposes a reduced admittance
//! block and defect vector over its A-set — the sorted global indices still
//! referenced outside its subtree — while the B-set, the indices fully
//! enclosed here, is eliminated by a Schur-complement step.

use nalgebra::{DMatrix, DVector};
use sunred_core::{DomainScalar, Error, NodeRef, NodeVariable, Result, Stamp};

use crate::schur::{Quadrants, SchurCore, Slot};

#[derive(Debug)]
enum NodeKind {
    Leaf {
        component: usize,
        /// Terminal index → position in the leaf's A-set. Terminals that
        /// revisit the same global index share a position, which folds the
        /// repeated contributions together during the gather.
        slots: Vec<Option<usize>>,
        enabled: bool,
    },
    Internal {
        left: NodeRef,
        right: NodeRef,
        /// Left child A-set position → slot in this node's partition.
        left_map: Vec<Slot>,
        right_map: Vec<Slot>,
    },
}

/// One elimination-tree node.
#[derive(Debug)]
pub(crate) struct TreeNode<T: DomainScalar> {
    kind: NodeKind,
    pub(crate) a_indices: Vec<usize>,
    /// Occurrence count of each A-set index within this subtree.
    a_counts: Vec<u32>,
    pub(crate) b_indices: Vec<usize>,
    pub(crate) symmetric: bool,
    pub(crate) changed: bool,
    primed: bool,
    pub(crate) yred: DMatrix<T>,
    pub(crate) jred: DVector<T>,
    q: Quadrants<T>,
    core: SchurCore<T>,
    ywork: DMatrix<T>,
}

impl<T: DomainScalar> TreeNode<T> {
    /// Build a leaf over one component's resolved terminal connections.
    /// Disabled components produce an empty leaf that contributes nothing.
    pub fn leaf(component: usize, connections: &[Option<usize>], enabled: bool) -> Self {
        let mut occurrences: Vec<usize> = if enabled {
            connections.iter().flatten().copied().collect()
        } else {
            Vec::new()
        };
        occurrences.sort_unstable();

        let mut a_indices: Vec<usize> = Vec::new();
        let mut a_counts: Vec<u32> = Vec::new();
        for g in occurrences {
            if a_indices.last() == Some(&g) {
                if let Some(c) = a_counts.last_mut() {
                    *c += 1;
                }
            } else {
                a_indices.push(g);
                a_counts.push(1);
            }
        }

        let slots = connections
            .iter()
            .map(|c| {
                if enabled {
                    c.and_then(|g| a_indices.binary_search(&g).ok())
                } else {
                    None
                }
            })
            .collect();

        let n_a = a_indices.len();
        Self {
            kind: NodeKind::Leaf {
                component,
                slots,
                enabled,
            },
            a_indices,
            a_counts,
            b_indices: Vec::new(),
            symmetric: true,
            changed: false,
            primed: false,
            yred: DMatrix::zeros(n_a, n_a),
            jred: DVector::zeros(n_a),
            q: Quadrants::zeros(0, 0),
            core: SchurCore::zeros(0, 0),
            ywork: DMatrix::zeros(n_a, n_a),
        }
    }

    /// Build an internal node by classifying the union of both children's
    /// A-sets with a linear merge over the two sorted index lists.
    ///
    /// An index moves to the B-set when the combined subtree occurrence
    /// count reaches the forest-wide total and the index is not exported
    /// out of the forest; it stays in the A-set otherwise.
    pub fn merge(
        left_ref: NodeRef,
        right_ref: NodeRef,
        left: &TreeNode<T>,
        right: &TreeNode<T>,
        totals: &[u32],
        external: &[bool],
    ) -> Result<Self> {
        let la = &left.a_indices;
        let ra = &right.a_indices;

        let mut a_indices = Vec::with_capacity(la.len() + ra.len());
        let mut a_counts = Vec::with_capacity(la.len() + ra.len());
        let mut b_indices = Vec::new();
        let mut left_map = Vec::with_capacity(la.len());
        let mut right_map = Vec::with_capacity(ra.len());

        let (mut i, mut j) = (0, 0);
        while i < la.len() || j < ra.len() {
            // Pick the next smallest index and the subtree count it reaches
            // here; note which children carry it.
            let (g, count, in_left, in_right) = if j >= ra.len() || (i < la.len() && la[i] < ra[j])
            {
                (la[i], left.a_counts[i], true, false)
            } else if i >= la.len() || ra[j] < la[i] {
                (ra[j], right.a_counts[j], false, true)
            } else {
                (la[i], left.a_counts[i] + right.a_counts[j], true, true)
            };

            if g >= totals.len() || g >= external.len() {
                return Err(Error::UnknownOutOfRange {
                    index: g,
                    count: totals.len(),
                });
            }
            if count > totals[g] {
                return Err(Error::InvalidGroup(format!(
                    "occurrence count for unknown {g} exceeds the forest total"
                )));
            }

            let slot = if !external[g] && count == totals[g] {
                let s = Slot::b(b_indices.len());
                b_indices.push(g);
                s
            } else {
                let s = Slot::a(a_indices.len());
                a_indices.push(g);
                a_counts.push(count);
                s
            };
            if in_left {
                left_map.push(slot);
                i += 1;
            }
            if in_right {
                right_map.push(slot);
                j += 1;
            }
        }

        let (n_a, n_b) = (a_indices.len(), b_indices.len());
        Ok(Self {
            kind: NodeKind::Internal {
                left: left_ref,
                right: right_ref,
                left_map,
                right_map,
            },
            a_indices,
            a_counts,
            b_indices,
            symmetric: true,
            changed: false,
            primed: false,
            yred: DMatrix::zeros(n_a, n_a),
            jred: DVector::zeros(n_a),
            q: Quadrants::zeros(n_a, n_b),
            core: SchurCore::zeros(n_a, n_b),
            ywork: DMatrix::zeros(0, 0),
        })
    }

    /// Reduce this node. Leaves gather from their stamp with a per-entry
    /// refresh comparison; internal nodes merge their children and skip
    /// re-factorization when neither child changed (defects are still
    /// re-merged every pass).
    pub fn forward(
        &mut self,
        lower: &[Vec<TreeNode<T>>],
        stamps: &[&dyn Stamp<T>],
        vars: &[NodeVariable],
    ) -> Result<()> {
        match &self.kind {
            NodeKind::Leaf {
                component,
                slots,
                enabled,
            } => {
                self.jred.fill(T::zero());
                if !*enabled {
                    self.changed = !self.primed;
                    self.primed = true;
                    return Ok(());
                }
                let stamp = *stamps.get(*component).ok_or_else(|| {
                    Error::InvalidGroup(format!("leaf references missing component {component}"))
                })?;
                if stamp.num_terminals() != slots.len() {
                    return Err(Error::TerminalCountMismatch {
                        name: format!("component {component}"),
                        declared: stamp.num_terminals(),
                        actual: slots.len(),
                    });
                }

                self.ywork.fill(T::zero());
                let sym = stamp.is_symmetric();
                for (r, slot_r) in slots.iter().enumerate() {
                    let Some(pr) = slot_r else { continue };
                    self.jred[*pr] += stamp.j_reduced(r);
                    if sym {
                        for (c, slot_c) in slots.iter().enumerate().skip(r) {
                            let Some(pc) = slot_c else { continue };
                            let v = stamp.y(r, c);
                            self.ywork[(*pr, *pc)] += v;
                            if c != r {
                                self.ywork[(*pc, *pr)] += v;
                            }
                        }
                    } else {
                        for (c, slot_c) in slots.iter().enumerate() {
                            let Some(pc) = slot_c else { continue };
                            self.ywork[(*pr, *pc)] += stamp.y(r, c);
                        }
                    }
                }

                let changed = !self.primed || sym != self.symmetric || self.ywork != self.yred;
                if changed {
                    self.yred.copy_from(&self.ywork);
                    self.symmetric = sym;
                }
                self.changed = changed;
                self.primed = true;
                Ok(())
            }
            NodeKind::Internal {
                left,
                right,
                left_map,
                right_map,
            } => {
                let lnode = node_at(lower, *left)?;
                let rnode = node_at(lower, *right)?;

                let sym = lnode.symmetric && rnode.symmetric;
                let changed =
                    !self.primed || lnode.changed || rnode.changed || sym != self.symmetric;

                // Defects change every pass even when admittances are
                // stable: re-merge the children's reduced defects and add
                // the true residual of the newly enclosed unknowns.
                self.q.clear_j();
                scatter_child_defect(&mut self.q, &lnode.jred, left_map);
                scatter_child_defect(&mut self.q, &rnode.jred, right_map);
                for (bi, &g) in self.b_indices.iter().enumerate() {
                    let var = vars.get(g).ok_or(Error::UnknownOutOfRange {
                        index: g,
                        count: vars.len(),
                    })?;
                    self.q.j_b[bi] += T::read_defect(var);
                }

                if changed {
                    self.q.clear_y();
                    scatter_child_y(&mut self.q, &lnode.yred, left_map, lnode.symmetric);
                    scatter_child_y(&mut self.q, &rnode.yred, right_map, rnode.symmetric);
                    self.core.refactor(&self.q, &mut self.yred);
                    self.symmetric = sym;
                }
                self.core.reduce_defect(&self.q, &mut self.jred);

                self.changed = changed;
                self.primed = true;
                Ok(())
            }
        }
    }

    /// Substitute: with this node's A-set values already resolved (by its
    /// parent, or externally at a root), recover the B-set values and write
    /// them to the global unknowns. Leaves own no eliminated unknowns and
    /// do nothing.
    pub fn backward(&self, vars: &[NodeVariable]) -> Result<()> {
        if matches!(self.kind, NodeKind::Leaf { .. }) || self.b_indices.is_empty() {
            return Ok(());
        }
        if !self.primed {
            return Err(Error::InvalidGroup(
                "backward called before any forward pass".into(),
            ));
        }

        for &g in self.a_indices.iter().chain(self.b_indices.iter()) {
            if g >= vars.len() {
                return Err(Error::UnknownOutOfRange {
                    index: g,
                    count: vars.len(),
                });
            }
        }

        let ua = DVector::from_iterator(
            self.a_indices.len(),
            self.a_indices.iter().map(|&g| T::read_value(&vars[g])),
        );
        let ub = self.core.back_substitute(&ua, &self.q.j_b);
        for (bi, &g) in self.b_indices.iter().enumerate() {
            T::write_value(&vars[g], ub[bi]);
        }
        Ok(())
    }
}

fn node_at<T: DomainScalar>(lower: &[Vec<TreeNode<T>>], r: NodeRef) -> Result<&TreeNode<T>> {
    lower
        .get(r.level)
        .and_then(|level| level.get(r.index))
        .ok_or(Error::PlanChildOutOfRange {
            level: r.level,
            index: r.index,
        })
}

/// Scatter one child's reduced admittance block into the parent quadrants.
/// Symmetric children are read once per unordered pair and mirrored.
fn scatter_child_y<T: DomainScalar>(
    quad: &mut Quadrants<T>,
    child_y: &DMatrix<T>,
    map: &[Slot],
    child_symmetric: bool,
) {
    let n = map.len();
    if child_symmetric {
        for p in 0..n {
            for r in p..n {
                let v = child_y[(p, r)];
                quad.add_y(map[p], map[r], v);
                if r != p {
                    quad.add_y(map[r], map[p], v);
                }
            }
        }
    } else {
        for p in 0..n {
            for r in 0..n {
                quad.add_y(map[p], map[r], child_y[(p, r)]);
            }
        }
    }
}

fn scatter_child_defect<T: DomainScalar>(
    quad: &mut Quadrants<T>,
    child_j: &DVector<T>,
    map: &[Slot],
) {
    for (p, &slot) in map.iter().enumerate() {
        quad.add_j(slot, child_j[p]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunred_core::DenseStamp;

    #[test]
    fn test_leaf_folds_repeated_indices() {
        // Both terminals land on the same unknown: the 2x2 stamp collapses
        // to a single A-set entry holding the sum of all four entries.
        let stamp = DenseStamp::<f64>::conductance(2.0);
        let mut leaf = TreeNode::leaf(0, &[Some(3), Some(3)], true);
        assert_eq!(leaf.a_indices, vec![3]);

        let stamps: Vec<&dyn Stamp<f64>> = vec![&stamp];
        leaf.forward(&[], &stamps, &[]).unwrap();
        // 2 - 2 - 2 + 2 = 0 for a floating conductance
        assert!(leaf.yred[(0, 0)].abs() < 1e-14);
    }

    #[test]
    fn test_leaf_skips_ground() {
        let stamp = DenseStamp::<f64>::conductance(5.0);
        let mut leaf = TreeNode::leaf(0, &[Some(1), None], true);
        assert_eq!(leaf.a_indices, vec![1]);

        let stamps: Vec<&dyn Stamp<f64>> = vec![&stamp];
        leaf.forward(&[], &stamps, &[]).unwrap();
        assert_eq!(leaf.yred[(0, 0)], 5.0);
    }

    #[test]
    fn test_merge_promotes_consumed_index() {
        // Leaves over {0,1} and {1,2}; unknown 1 occurs twice in total, so
        // the merge encloses it. Unknowns 0 and 2 stay exported.
        let l0 = TreeNode::<f64>::leaf(0, &[Some(0), Some(1)], true);
        let l1 = TreeNode::<f64>::leaf(1, &[Some(1), Some(2)], true);
        let totals = vec![1, 2, 1];
        let external = vec![true, false, true];

        let node = TreeNode::merge(
            NodeRef::new(0, 0),
            NodeRef::new(0, 1),
            &l0,
            &l1,
            &totals,
            &external,
        )
        .unwrap();
        assert_eq!(node.a_indices, vec![0, 2]);
        assert_eq!(node.b_indices, vec![1]);
    }

    #[test]
    fn test_merge_keeps_partially_consumed_index() {
        // Unknown 1 occurs three times forest-wide; two occurrences inside
        // this subtree are not enough to enclose it.
        let l0 = TreeNode::<f64>::leaf(0, &[Some(0), Some(1)], true);
        let l1 = TreeNode::<f64>::leaf(1, &[Some(1), Some(2)], true);
        let totals = vec![1, 3, 1];
        let external = vec![true, false, true];

        let node = TreeNode::merge(
            NodeRef::new(0, 0),
            NodeRef::new(0, 1),
            &l0,
            &l1,
            &totals,
            &external,
        )
        .unwrap();
        assert_eq!(node.a_indices, vec![0, 1, 2]);
        assert!(node.b_indices.is_empty());
    }

    #[test]
    fn test_disabled_leaf_is_empty() {
        let leaf = TreeNode::<f64>::leaf(0, &[Some(0), Some(1)], false);
        assert!(leaf.a_indices.is_empty());
    }
}
