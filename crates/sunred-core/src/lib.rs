//! Core data model for the SUNRED hierarchical network reduction engine.
//!
//! This crate provides the building blocks shared by every reducer:
//! the dual-domain circuit unknown ([`NodeVariable`]), the read-only
//! per-component stamp capability ([`Stamp`], [`Terminal`]), the scalar
//! bridge between the DC and AC domains ([`DomainScalar`]), and the
//! externally supplied merge plan describing the elimination order
//! ([`MergePlan`]).

pub mod domain;
pub mod error;
pub mod plan;
pub mod stamp;
pub mod variable;

pub use domain::DomainScalar;
pub use error::{Error, Result};
pub use plan::{MergePlan, MergeStep, NodeRef};
pub use stamp::{DenseStamp, Stamp, Terminal};
pub use variable::NodeVariable;
