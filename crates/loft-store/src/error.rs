use loft_domain::TemplateId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("version conflict on environment {environment_id}: expected {expected}")]
    VersionConflict { environment_id: String, expected: u64 },

    #[error("owner {owner} already holds {count} environments (max {max})")]
    QuotaExceeded { owner: String, count: u32, max: u32 },

    #[error("host port {0} already leased")]
    PortTaken(u16),

    #[error("template {0} is referenced by a live environment")]
    TemplateInUse(TemplateId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store internal error: {0}")]
    Internal(String),
}
