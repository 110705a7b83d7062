use thiserror::Error;

use crate::types::InfraKind;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("infrastructure kind {0} requires a non-empty IaaS template")]
    MissingIaasTemplate(InfraKind),

    #[error("infrastructure kind {0} requires a compose document")]
    MissingComposeDocument(InfraKind),

    #[error("exposed port {0} outside [1, 65535]")]
    InvalidExposedPort(u16),

    #[error("memory limit {0} MiB outside [128, 32768]")]
    MemoryOutOfRange(u32),

    #[error("cpu limit {0} outside (0, 8.0]")]
    CpuOutOfRange(f64),

    #[error("invalid environment name: {0}")]
    InvalidEnvironmentName(String),
}
