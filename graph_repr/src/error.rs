use thiserror::Error;

/// Errors raised while configuring or running the aggregation.
///
/// All of them are configuration or shape errors. Nothing here is
/// retried: the caller gets the error and no partial result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphReprError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{what}: expected {expected}, got {actual}")]
    WidthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("node strength {value} at graph {graph}, node {node} is outside [0, 1]")]
    StrengthOutOfRange { graph: usize, node: usize, value: f32 },

    #[error("node feature {value} at graph {graph}, node {node} is not finite")]
    NonFiniteFeature { graph: usize, node: usize, value: f32 },

    #[error("node slot ({graph}, {node}) is out of bounds for a {n_batch}x{n_nodes} graph state")]
    IndexOutOfBounds {
        graph: usize,
        node: usize,
        n_batch: usize,
        n_nodes: usize,
    },

    #[error("dropout mask mismatch: {0}")]
    MaskMismatch(String),
}

pub type Result<T> = std::result::Result<T, GraphReprError>;
