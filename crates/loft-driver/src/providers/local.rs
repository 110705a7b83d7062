use async_trait::async_trait;
use loft_domain::InfraKind;

use super::ProviderHooks;

/// No-op hook set for the local container engine. The compose driver
/// constructs it by default so LOCAL and HYBRID environments run the same
/// hook-bracketed pipeline as every cloud kind.
#[derive(Debug, Default, Clone)]
pub struct LocalHooks;

impl LocalHooks {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderHooks for LocalHooks {
    fn kind(&self) -> InfraKind {
        InfraKind::Local
    }
}
