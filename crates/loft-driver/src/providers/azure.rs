use std::collections::HashMap;

use async_trait::async_trait;
use loft_domain::{Environment, InfraKind};
use tracing::{debug, info};

use super::{passthrough_env, ProviderHooks};
use crate::error::DriverError;

/// Service-principal variables the tool's azurerm provider reads.
const REQUIRED_VARS: [&str; 2] = ["ARM_SUBSCRIPTION_ID", "ARM_TENANT_ID"];

#[derive(Debug, Clone)]
pub struct AzureHooks {
    pub default_location: String,
}

impl AzureHooks {
    pub fn new(default_location: impl Into<String>) -> Self {
        Self { default_location: default_location.into() }
    }

    fn missing_credentials(&self) -> Vec<&'static str> {
        REQUIRED_VARS
            .iter()
            .copied()
            .filter(|key| std::env::var(key).is_err())
            .collect()
    }
}

#[async_trait]
impl ProviderHooks for AzureHooks {
    fn kind(&self) -> InfraKind {
        InfraKind::Azure
    }

    async fn pre_provision(&self, env: &Environment) -> Result<(), DriverError> {
        let missing = self.missing_credentials();
        if !missing.is_empty() {
            return Err(DriverError::HookFailed {
                hook: "pre_provision".into(),
                reason: format!("missing Azure credentials: {}", missing.join(", ")),
            });
        }
        debug!(environment_id = %env.id, "Azure credentials present");
        Ok(())
    }

    async fn pre_destroy(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await
    }

    async fn start_resources(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await?;
        info!(environment_id = %env.id, "resuming Azure resources");
        Ok(())
    }

    async fn stop_resources(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await?;
        info!(environment_id = %env.id, "deallocating Azure resources");
        Ok(())
    }

    fn validate_template(&self, template_text: &str) -> bool {
        template_text.contains("provider \"azurerm\"") || template_text.contains("azurerm_")
    }

    fn default_variables(&self) -> HashMap<String, String> {
        HashMap::from([("azure_location".to_string(), self.default_location.clone())])
    }

    fn auth_env(&self) -> HashMap<String, String> {
        passthrough_env(&[
            "ARM_CLIENT_ID",
            "ARM_CLIENT_SECRET",
            "ARM_SUBSCRIPTION_ID",
            "ARM_TENANT_ID",
            "ARM_USE_MSI",
        ])
    }
}
