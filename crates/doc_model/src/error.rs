//! Error types for document model operations

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocModelError {
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Position {pos} out of range for document of size {size}")]
    OutOfRange { pos: usize, size: usize },

    #[error("Position {0} does not address a block")]
    NotABlock(usize),
}

pub type Result<T> = std::result::Result<T, DocModelError>;
