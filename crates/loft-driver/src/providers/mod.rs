mod aws;
mod azure;
mod gcp;
mod local;

use std::collections::HashMap;

use async_trait::async_trait;
use loft_domain::{Environment, InfraKind};

use crate::error::DriverError;

pub use aws::AwsHooks;
pub use azure::AzureHooks;
pub use gcp::GcpHooks;
pub use local::LocalHooks;

/// Per-cloud lifecycle hooks bracketing the IaaS tool.
///
/// `pre_*` failures abort the pipeline; `post_*` failures are logged by the
/// caller and never roll anything back — the infrastructure already exists,
/// and undoing a successful apply must stay an explicit user action.
///
/// Hooks never call cloud SDKs. Their leverage is environment variables for
/// the tool subprocess (`auth_env`), default template variables, and
/// validation of what is about to run.
#[async_trait]
pub trait ProviderHooks: Send + Sync + 'static {
    fn kind(&self) -> InfraKind;

    async fn pre_provision(&self, _env: &Environment) -> Result<(), DriverError> {
        Ok(())
    }

    async fn post_provision(&self, _env: &Environment) -> Result<(), DriverError> {
        Ok(())
    }

    async fn pre_destroy(&self, _env: &Environment) -> Result<(), DriverError> {
        Ok(())
    }

    async fn post_destroy(&self, _env: &Environment) -> Result<(), DriverError> {
        Ok(())
    }

    async fn start_resources(&self, _env: &Environment) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop_resources(&self, _env: &Environment) -> Result<(), DriverError> {
        Ok(())
    }

    /// Cheap syntactic check that the template targets this provider at all.
    fn validate_template(&self, _template_text: &str) -> bool {
        true
    }

    /// Variables injected into every workspace for this provider.
    fn default_variables(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Environment variables for the tool subprocess. Credentials only ever
    /// travel this way; they are never written into the workspace.
    fn auth_env(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Forward the named process environment variables, skipping absent ones.
pub(crate) fn passthrough_env(keys: &[&str]) -> HashMap<String, String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}
