mod compose;
mod error;
mod tests;
mod types;

pub use compose::{ComposeDocument, ComposeService, PortMapping, VolumeMount};
pub use error::DomainError;
pub use types::*;
