//! Error types for sunred-core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("component {name}: stamp declares {declared} terminals but {actual} are connected")]
    TerminalCountMismatch {
        name: String,
        declared: usize,
        actual: usize,
    },

    #[error("merge plan child ({level}, {index}) is out of range")]
    PlanChildOutOfRange { level: usize, index: usize },

    #[error("merge plan consumes child ({level}, {index}) more than once")]
    PlanChildReused { level: usize, index: usize },

    #[error("unknown {index} not present in the expected reduction block")]
    IndexNotFound { index: usize },

    #[error("unknown {index} is never eliminated by the merge plan")]
    IndexNotEliminated { index: usize },

    #[error("unknown index {index} out of range (group has {count} unknowns)")]
    UnknownOutOfRange { index: usize, count: usize },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("invalid reduction group: {0}")]
    InvalidGroup(String),
}

pub type Result<T> = std::result::Result<T, Error>;
