//! Flat one-pass Schur-complement reducer.
//!
//! A [`FullMatrixReductor`] owns a fixed A-set / B-set partition over the
//! unknowns of one group and assembles every contained component in a
//! single pass: each admittance entry is scattered straight into the
//! quadrant selected by its two terminals. It produces the same logical
//! output as the root of an elimination forest over the same components —
//! a reduced admittance block and defect vector over the A-set only.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use sunred_core::{DomainScalar, Error, NodeVariable, Result, Stamp};

use crate::schur::{Quadrants, SchurCore, Slot};

/// One component of a reduction group: resolved global unknown per terminal
/// (`None` for ground or skipped terminals) plus an enabled flag.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub connections: Vec<Option<usize>>,
    pub enabled: bool,
}

impl GroupMember {
    pub fn new(connections: Vec<Option<usize>>) -> Self {
        Self {
            connections,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
struct MemberSlots {
    slots: Vec<Option<Slot>>,
    enabled: bool,
}

/// Flat Schur-complement reducer for a group of components.
#[derive(Debug)]
pub struct FullMatrixReductor<T: DomainScalar> {
    a_indices: Vec<usize>,
    b_indices: Vec<usize>,
    members: Vec<MemberSlots>,
    q: Quadrants<T>,
    q_prev: Quadrants<T>,
    core: SchurCore<T>,
    yred: DMatrix<T>,
    jred: DVector<T>,
    symmetric: bool,
    changed: bool,
    primed: bool,
}

impl<T: DomainScalar> FullMatrixReductor<T> {
    /// Create a reducer over the given partition.
    ///
    /// `a_indices` are the unknowns still shared with the outside world,
    /// `b_indices` the unknowns eliminated by this group. Every member
    /// terminal must resolve into one of the two sets.
    pub fn new(
        a_indices: Vec<usize>,
        b_indices: Vec<usize>,
        members: &[GroupMember],
    ) -> Result<Self> {
        let mut positions: HashMap<usize, Slot> = HashMap::new();
        for (pos, &g) in a_indices.iter().enumerate() {
            if positions.insert(g, Slot::a(pos)).is_some() {
                return Err(Error::InvalidGroup(format!(
                    "unknown {g} listed more than once in the group partition"
                )));
            }
        }
        for (pos, &g) in b_indices.iter().enumerate() {
            if positions.insert(g, Slot::b(pos)).is_some() {
                return Err(Error::InvalidGroup(format!(
                    "unknown {g} listed more than once in the group partition"
                )));
            }
        }

        let mut resolved = Vec::with_capacity(members.len());
        for member in members {
            let mut slots = Vec::with_capacity(member.connections.len());
            for conn in &member.connections {
                match conn {
                    None => slots.push(None),
                    Some(g) => match positions.get(g) {
                        Some(&slot) => slots.push(Some(slot)),
                        None => return Err(Error::IndexNotFound { index: *g }),
                    },
                }
            }
            resolved.push(MemberSlots {
                slots,
                enabled: member.enabled,
            });
        }

        let (n_a, n_b) = (a_indices.len(), b_indices.len());
        Ok(Self {
            a_indices,
            b_indices,
            members: resolved,
            q: Quadrants::zeros(n_a, n_b),
            q_prev: Quadrants::zeros(n_a, n_b),
            core: SchurCore::zeros(n_a, n_b),
            yred: DMatrix::zeros(n_a, n_a),
            jred: DVector::zeros(n_a),
            symmetric: true,
            changed: false,
            primed: false,
        })
    }

    /// Reduce: assemble every enabled member, re-factor the eliminated
    /// block if anything changed since the previous pass, and recompute the
    /// reduced defect unconditionally.
    ///
    /// `stamps` runs parallel to the member list given at construction;
    /// `vars` is the group's unknown storage (B defects are seeded from the
    /// true accumulated residual of the enclosed unknowns).
    pub fn forward(&mut self, stamps: &[&dyn Stamp<T>], vars: &[NodeVariable]) -> Result<()> {
        if stamps.len() != self.members.len() {
            return Err(Error::InvalidGroup(format!(
                "group has {} members but {} stamps were supplied",
                self.members.len(),
                stamps.len()
            )));
        }
        self.check_vars(vars)?;

        self.q.clear();

        // True residual already accumulated on the enclosed unknowns.
        for (bi, &g) in self.b_indices.iter().enumerate() {
            self.q.j_b[bi] += T::read_defect(&vars[g]);
        }

        let mut symmetric = true;
        for (mi, member) in self.members.iter().enumerate() {
            if !member.enabled {
                continue;
            }
            let stamp = stamps[mi];
            if stamp.num_terminals() != member.slots.len() {
                return Err(Error::TerminalCountMismatch {
                    name: format!("component {mi}"),
                    declared: stamp.num_terminals(),
                    actual: member.slots.len(),
                });
            }
            symmetric &= stamp.is_symmetric();
            scatter_stamp(&mut self.q, stamp, &member.slots);
        }

        let changed =
            !self.primed || symmetric != self.symmetric || !self.q.same_y(&self.q_prev);
        if changed {
            self.core.refactor(&self.q, &mut self.yred);
            self.q_prev.y_aa.copy_from(&self.q.y_aa);
            self.q_prev.y_ab.copy_from(&self.q.y_ab);
            self.q_prev.y_ba.copy_from(&self.q.y_ba);
            self.q_prev.y_bb.copy_from(&self.q.y_bb);
        }
        self.core.reduce_defect(&self.q, &mut self.jred);

        self.symmetric = symmetric;
        self.changed = changed;
        self.primed = true;
        Ok(())
    }

    /// Substitute: with the A-set values already written to the unknowns,
    /// recover the enclosed B-set values and write them back.
    pub fn backward(&self, vars: &[NodeVariable]) -> Result<()> {
        if !self.primed {
            return Err(Error::InvalidGroup(
                "backward called before any forward pass".into(),
            ));
        }
        self.check_vars(vars)?;

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

    fn check_vars(&self, vars: &[NodeVariable]) -> Result<()> {
        for &g in self.a_indices.iter().chain(self.b_indices.iter()) {
            if g >= vars.len() {
                return Err(Error::UnknownOutOfRange {
                    index: g,
                    count: vars.len(),
                });
            }
        }
        Ok(())
    }

    /// Reduced admittance block over the A-set.
    pub fn reduced_y(&self) -> &DMatrix<T> {
        &self.yred
    }

    /// Reduced defect vector over the A-set.
    pub fn reduced_j(&self) -> &DVector<T> {
        &self.jred
    }

    pub fn a_indices(&self) -> &[usize] {
        &self.a_indices
    }

    pub fn b_indices(&self) -> &[usize] {
        &self.b_indices
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    /// Whether the previous forward pass re-factored the eliminated block.
    pub fn last_changed(&self) -> bool {
        self.changed
    }
}

/// Scatter one stamp into the quadrants. Symmetric stamps are read once per
/// unordered terminal pair and mirrored; non-symmetric stamps are read in
/// full. Skipped (ground/unconnected) terminals contribute nothing.
fn scatter_stamp<T: DomainScalar>(
    q: &mut Quadrants<T>,
    stamp: &dyn Stamp<T>,
    slots: &[Option<Slot>],
) {
    for (r, slot_r) in slots.iter().enumerate() {
        let Some(sr) = slot_r else { continue };
        q.add_j(*sr, stamp.j_reduced(r));
        if stamp.is_symmetric() {
            for (c, slot_c) in slots.iter().enumerate().skip(r) {
                let Some(sc) = slot_c else { continue };
                let v = stamp.y(r, c);
                q.add_y(*sr, *sc, v);
                if c != r {
                    q.add_y(*sc, *sr, v);
                }
            }
        } else {
            for (c, slot_c) in slots.iter().enumerate() {
                let Some(sc) = slot_c else { continue };
                q.add_y(*sr, *sc, stamp.y(r, c));
            }
        }
    }
}
