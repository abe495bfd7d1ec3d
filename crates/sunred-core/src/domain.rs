//! Scalar bridge between the DC and AC analysis domains.
//!
//! The reduction engine is written once over a generic scalar; the DC
//! domain instantiates it with `f64` and the AC small-signal domain with
//! `Complex<f64>`. This trait routes the domain-specific reads and writes
//! on a [`NodeVariable`] to the matching storage.

use nalgebra::ComplexField;
use num_complex::Complex;
use num_traits::{One, Zero};
use std::fmt;

use crate::variable::NodeVariable;

/// Scalar type of one analysis domain.
pub trait DomainScalar:
    ComplexField<RealField = f64>
    + Copy
    + PartialEq
    + fmt::Debug
    + Zero
    + One
    + Send
    + Sync
    + 'static
{
    /// Read the unknown's current value in this domain.
    fn read_value(var: &NodeVariable) -> Self;

    /// Write the unknown's current value in this domain.
    fn write_value(var: &NodeVariable, v: Self);

    /// Read the accumulated defect (residual current) in this domain.
    fn read_defect(var: &NodeVariable) -> Self;

    /// Accumulate into the defect, honoring the unknown's concurrency mode.
    fn add_defect(var: &NodeVariable, v: Self);

    /// Accumulate into the self-admittance diagonal term.
    fn add_y_self(var: &NodeVariable, v: Self);
}

impl DomainScalar for f64 {
    fn read_value(var: &NodeVariable) -> Self {
        var.value_dc()
    }

    fn write_value(var: &NodeVariable, v: Self) {
        var.set_value_dc(v);
    }

    fn read_defect(var: &NodeVariable) -> Self {
        var.defect_dc()
    }

    fn add_defect(var: &NodeVariable, v: Self) {
        var.add_defect_dc(v);
    }

    fn add_y_self(var: &NodeVariable, v: Self) {
        var.add_y_self_dc(v);
    }
}

impl DomainScalar for Complex<f64> {
    fn read_value(var: &NodeVariable) -> Self {
        var.value_ac()
    }

    fn write_value(var: &NodeVariable, v: Self) {
        var.set_value_ac(v);
    }

    fn read_defect(var: &NodeVariable) -> Self {
        var.defect_ac()
    }

    fn add_defect(var: &NodeVariable, v: Self) {
        var.add_defect_ac(v);
    }

    fn add_y_self(var: &NodeVariable, v: Self) {
        var.add_y_self_ac(v);
    }
}
