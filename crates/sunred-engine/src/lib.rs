//! Successive network reduction engine.
//!
//! This crate provides:
//! - Flat full-matrix Schur-complement reduction of a component group
//! - Tree-structured (SUNRED) reduction driven by an external merge plan
//! - Forward/backward passes with change detection and re-factorization
//!   skipping
//! - Subcircuit composites that expose their reduced block as a stamp one
//!   level up

pub mod forest;
pub mod full;
pub mod invert;
mod node;
mod schur;
pub mod subcircuit;

pub use forest::{LeafSpec, SunredForest};
pub use full::{FullMatrixReductor, GroupMember};
pub use invert::neg_invert_in_place;
pub use subcircuit::{
    ComponentDef, ModelContext, ReducerKind, SubCircuitInstance, SubCircuitModel,
};
