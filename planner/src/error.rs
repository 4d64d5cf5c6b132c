use regionmesh_protocol::{ContainerIdentifier, NodeIdentifier};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlannerError {
    /// Two summaries that do not describe the same region and window.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    #[error("container {container} not found on node {node}")]
    ContainerNotFound {
        node: NodeIdentifier,
        container: ContainerIdentifier,
    },

    #[error("no region known for node {0}")]
    UnknownRegion(NodeIdentifier),

    #[error("invalid weight {0}, weights must be finite and non-negative")]
    InvalidWeight(f64),
}

pub type Result<T> = std::result::Result<T, PlannerError>;
