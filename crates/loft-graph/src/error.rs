use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle detected in service dependency graph: {services:?}")]
    CycleDetected { services: Vec<String> },
}
