//! The read-only stamp capability exposed by every component.
//!
//! A stamp is a component's contribution of admittance and defect values to
//! the enclosing system, indexed by its local terminals. The reduction
//! engine consumes stamps through this interface only and never needs to
//! know the concrete element behind one.

use nalgebra::{DMatrix, DVector};

use crate::domain::DomainScalar;
use crate::error::{Error, Result};

/// Classification of one component terminal within its enclosing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Connected to the scope's `i`-th exported unknown.
    External(usize),
    /// Connected to the scope's `i`-th enclosed unknown.
    Internal(usize),
    /// Connected to ground; never enters the reduction.
    Ground,
    /// Left open; the scope assigns private backing storage at build time.
    Unconnected,
}

impl Terminal {
    pub fn is_ground(self) -> bool {
        matches!(self, Terminal::Ground)
    }

    pub fn is_unconnected(self) -> bool {
        matches!(self, Terminal::Unconnected)
    }
}

/// Read-only admittance/defect accessor for one component instance.
///
/// `row`/`col` are local terminal indices in `0..num_terminals()`. When
/// `is_symmetric()` returns true, `y(row, col)` for `row <= col` is
/// sufficient and the lower triangle is inferred by the consumer.
pub trait Stamp<T: DomainScalar>: Send + Sync {
    /// Declared terminal count of this stamp.
    fn num_terminals(&self) -> usize;

    /// Admittance entry for a terminal pair.
    fn y(&self, row: usize, col: usize) -> T;

    /// Reduced defect (residual current) contribution at a terminal.
    fn j_reduced(&self, row: usize) -> T;

    /// Whether the admittance block is symmetric in this domain.
    fn is_symmetric(&self) -> bool;
}

/// A value-carrying stamp: a dense admittance block plus a defect vector.
///
/// Bridges externally computed blocks into the reduction engine and serves
/// as the element stand-in in tests.
#[derive(Debug, Clone)]
pub struct DenseStamp<T: DomainScalar> {
    pub y: DMatrix<T>,
    pub j: DVector<T>,
    pub symmetric: bool,
}

impl<T: DomainScalar> DenseStamp<T> {
    /// Create a stamp from a square admittance block and matching defect
    /// vector.
    pub fn new(y: DMatrix<T>, j: DVector<T>, symmetric: bool) -> Result<Self> {
        if y.nrows() != y.ncols() || y.nrows() != j.len() {
            return Err(Error::InvalidGroup(format!(
                "dense stamp dimensions disagree: y is {}x{}, j has {} entries",
                y.nrows(),
                y.ncols(),
                j.len()
            )));
        }
        Ok(Self { y, j, symmetric })
    }

    /// Two-terminal conductance block `[[g, -g], [-g, g]]` with zero defect.
    pub fn conductance(g: T) -> Self {
        let y = DMatrix::from_row_slice(2, 2, &[g, -g, -g, g]);
        Self {
            y,
            j: DVector::zeros(2),
            symmetric: true,
        }
    }
}

impl<T: DomainScalar> Stamp<T> for DenseStamp<T> {
    fn num_terminals(&self) -> usize {
        self.y.nrows()
    }

    fn y(&self, row: usize, col: usize) -> T {
        self.y[(row, col)]
    }

    fn j_reduced(&self, row: usize) -> T {
        self.j[row]
    }

    fn is_symmetric(&self) -> bool {
        self.symmetric
    }
}
