use loft_domain::InfraKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container engine failure: {0}")]
    Engine(String),

    #[error("IaaS tool failed during {step}: {tail}")]
    IaasTool { step: String, tail: String },

    #[error("{step} timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error("template rejected by {kind} provider: {reason}")]
    TemplateRejected { kind: InfraKind, reason: String },

    #[error("provider hook '{hook}' failed: {reason}")]
    HookFailed { hook: String, reason: String },

    #[error("no driver registered for infrastructure kind {0}")]
    DriverNotConfigured(InfraKind),

    #[error(transparent)]
    Graph(#[from] loft_graph::GraphError),

    #[error("archive checksum mismatch: expected {expected}, got {actual}")]
    ArchiveCorrupt { expected: String, actual: String },

    #[error("internal driver error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Short operator-facing reason, persisted as the environment's
    /// `status_reason` on failure.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
