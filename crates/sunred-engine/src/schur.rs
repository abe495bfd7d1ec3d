//! Shared Schur-complement bookkeeping.
//!
//! Both reducers assemble the same four quadrants — YA (kept x kept),
//! XB (kept x eliminated), XA (eliminated x kept), YB (eliminated x
//! eliminated) — and reuse the same factorization products across the
//! forward and backward passes.

use nalgebra::{DMatrix, DVector};
use sunred_core::DomainScalar;

use crate::invert::neg_invert_in_place;

/// Position of one global unknown inside a node's partitioned system:
/// either in the kept (A) block or the eliminated (B) block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub is_b: bool,
    pub pos: usize,
}

impl Slot {
    pub fn a(pos: usize) -> Self {
        Self { is_b: false, pos }
    }

    pub fn b(pos: usize) -> Self {
        Self { is_b: true, pos }
    }
}

/// The four working quadrants of one partitioned admittance system plus the
/// split defect vector.
#[derive(Debug, Clone)]
pub(crate) struct Quadrants<T: DomainScalar> {
    pub y_aa: DMatrix<T>,
    pub y_ab: DMatrix<T>,
    pub y_ba: DMatrix<T>,
    pub y_bb: DMatrix<T>,
    pub j_a: DVector<T>,
    pub j_b: DVector<T>,
}

impl<T: DomainScalar> Quadrants<T> {
    pub fn zeros(n_a: usize, n_b: usize) -> Self {
        Self {
            y_aa: DMatrix::zeros(n_a, n_a),
            y_ab: DMatrix::zeros(n_a, n_b),
            y_ba: DMatrix::zeros(n_b, n_a),
            y_bb: DMatrix::zeros(n_b, n_b),
            j_a: DVector::zeros(n_a),
            j_b: DVector::zeros(n_b),
        }
    }

    pub fn clear(&mut self) {
        self.clear_y();
        self.clear_j();
    }

    pub fn clear_y(&mut self) {
        self.y_aa.fill(T::zero());
        self.y_ab.fill(T::zero());
        self.y_ba.fill(T::zero());
        self.y_bb.fill(T::zero());
    }

    pub fn clear_j(&mut self) {
        self.j_a.fill(T::zero());
        self.j_b.fill(T::zero());
    }

    /// Accumulate one admittance entry into the quadrant selected by the
    /// row/column slots.
    pub fn add_y(&mut self, row: Slot, col: Slot, v: T) {
        match (row.is_b, col.is_b) {
            (false, false) => self.y_aa[(row.pos, col.pos)] += v,
            (false, true) => self.y_ab[(row.pos, col.pos)] += v,
            (true, false) => self.y_ba[(row.pos, col.pos)] += v,
            (true, true) => self.y_bb[(row.pos, col.pos)] += v,
        }
    }

    /// Accumulate one defect entry.
    pub fn add_j(&mut self, row: Slot, v: T) {
        if row.is_b {
            self.j_b[row.pos] += v;
        } else {
            self.j_a[row.pos] += v;
        }
    }

    pub fn same_y(&self, other: &Quadrants<T>) -> bool {
        self.y_aa == other.y_aa
            && self.y_ab == other.y_ab
            && self.y_ba == other.y_ba
            && self.y_bb == other.y_bb
    }
}

/// Cached factorization products of one elimination step.
///
/// `neg_inv` is `-YB⁻¹`, `x` is `XB · (-YB⁻¹)` and `w` is `(-YB⁻¹) · XA`.
/// They stay valid until the admittance quadrants change.
#[derive(Debug, Clone)]
pub(crate) struct SchurCore<T: DomainScalar> {
    pub neg_inv: DMatrix<T>,
    pub x: DMatrix<T>,
    pub w: DMatrix<T>,
}

impl<T: DomainScalar> SchurCore<T> {
    pub fn zeros(n_a: usize, n_b: usize) -> Self {
        Self {
            neg_inv: DMatrix::zeros(n_b, n_b),
            x: DMatrix::zeros(n_a, n_b),
            w: DMatrix::zeros(n_b, n_a),
        }
    }

    /// Re-invert the eliminated block and recompute the reduced admittance
    /// `YRED = YA + XB·(-YB⁻¹)·XA`.
    pub fn refactor(&mut self, q: &Quadrants<T>, yred: &mut DMatrix<T>) {
        self.neg_inv.copy_from(&q.y_bb);
        neg_invert_in_place(&mut self.neg_inv);
        self.x = &q.y_ab * &self.neg_inv;
        self.w = &self.neg_inv * &q.y_ba;
        *yred = &q.y_aa + &self.x * &q.y_ba;
    }

    /// Recompute the reduced defect `JRED = JA + XB·(-YB⁻¹)·JB` using the
    /// cached factorization.
    pub fn reduce_defect(&self, q: &Quadrants<T>, jred: &mut DVector<T>) {
        *jred = &q.j_a + &self.x * &q.j_b;
    }

    /// Recover the eliminated values `UB = (-YB⁻¹·XA)·UA + (-YB⁻¹)·JB`.
    pub fn back_substitute(&self, ua: &DVector<T>, j_b: &DVector<T>) -> DVector<T> {
        &self.w * ua + &self.neg_inv * j_b
    }
}
