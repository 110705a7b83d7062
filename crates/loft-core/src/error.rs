use loft_driver::DriverError;
use loft_store::StoreError;
use thiserror::Error;

/// Error taxonomy crossing the core boundary. Every variant maps to a stable
/// code that the outer surface turns into its own status space.
#[derive(Debug, Error)]
pub enum OrchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("caller is not the owner")]
    Forbidden,

    #[error("operation '{operation}' not legal: {detail}")]
    InvalidState { operation: &'static str, detail: String },

    #[error("owner {owner} reached the environment limit of {max}")]
    QuotaExceeded { owner: String, max: u32 },

    #[error("insufficient host resources: {0}")]
    InsufficientResources(String),

    #[error("no free ports in the configured range")]
    NoFreePorts,

    #[error("driver failed: {0}")]
    DriverFailed(String),

    #[error("IaaS tool failed during {step}: {tail}")]
    IaasToolFailed { step: String, tail: String },

    #[error("{step} exceeded its deadline of {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error("concurrent modification; re-read and retry")]
    Conflict,

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchError::NotFound(_) => "NOT_FOUND",
            OrchError::Forbidden => "FORBIDDEN",
            OrchError::InvalidState { .. } => "INVALID_STATE",
            OrchError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            OrchError::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            OrchError::NoFreePorts => "NO_FREE_PORTS",
            OrchError::DriverFailed(_) => "DRIVER_FAILED",
            OrchError::IaasToolFailed { .. } => "IAAS_TOOL_FAILED",
            OrchError::Timeout { .. } => "TIMEOUT",
            OrchError::Conflict => "CONFLICT",
            OrchError::Internal(_) => "INTERNAL",
        }
    }

    pub(crate) fn invalid_state(
        operation: &'static str,
        from: loft_domain::EnvironmentStatus,
    ) -> Self {
        OrchError::InvalidState {
            operation,
            detail: format!("environment is {from}"),
        }
    }
}

impl From<StoreError> for OrchError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EnvironmentNotFound(id) => OrchError::NotFound(format!("environment {id}")),
            StoreError::TemplateNotFound(id) => OrchError::NotFound(format!("template {id}")),
            StoreError::ArchiveNotFound(id) => OrchError::NotFound(format!("archive {id}")),
            StoreError::VersionConflict { .. } => OrchError::Conflict,
            StoreError::QuotaExceeded { owner, max, .. } => OrchError::QuotaExceeded { owner, max },
            // the durable lease disagreed with the warmed cache
            StoreError::PortTaken(port) => {
                OrchError::Internal(format!("lease cache out of sync on port {port}"))
            }
            StoreError::TemplateInUse(id) => OrchError::InvalidState {
                operation: "delete_template",
                detail: format!("template {id} still referenced by a live environment"),
            },
            StoreError::Serialization(e) => OrchError::Internal(format!("serialization: {e}")),
            StoreError::Internal(msg) => OrchError::Internal(msg),
        }
    }
}

impl From<DriverError> for OrchError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::IaasTool { step, tail } => OrchError::IaasToolFailed { step, tail },
            DriverError::Timeout { step, seconds } => OrchError::Timeout { step, seconds },
            other => OrchError::DriverFailed(other.reason()),
        }
    }
}

impl From<loft_config::ConfigError> for OrchError {
    fn from(e: loft_config::ConfigError) -> Self {
        OrchError::DriverFailed(format!("compose document invalid: {e}"))
    }
}

impl From<loft_graph::GraphError> for OrchError {
    fn from(e: loft_graph::GraphError) -> Self {
        OrchError::DriverFailed(e.to_string())
    }
}
