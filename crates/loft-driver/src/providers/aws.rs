use std::collections::HashMap;

use async_trait::async_trait;
use loft_domain::{Environment, InfraKind};
use tracing::{debug, info};

use super::{passthrough_env, ProviderHooks};
use crate::error::DriverError;

/// Credential variables the tool's AWS provider understands; at least one
/// must be present before we spend thirty minutes on an apply.
const CREDENTIAL_VARS: [&str; 3] = ["AWS_ACCESS_KEY_ID", "AWS_PROFILE", "AWS_ROLE_ARN"];

#[derive(Debug, Clone)]
pub struct AwsHooks {
    pub default_region: String,
}

impl AwsHooks {
    pub fn new(default_region: impl Into<String>) -> Self {
        Self { default_region: default_region.into() }
    }

    fn credentials_present(&self) -> bool {
        CREDENTIAL_VARS.iter().any(|key| std::env::var(key).is_ok())
    }
}

#[async_trait]
impl ProviderHooks for AwsHooks {
    fn kind(&self) -> InfraKind {
        InfraKind::Aws
    }

    async fn pre_provision(&self, env: &Environment) -> Result<(), DriverError> {
        if !self.credentials_present() {
            return Err(DriverError::HookFailed {
                hook: "pre_provision".into(),
                reason: format!(
                    "no AWS credentials in process environment (checked {})",
                    CREDENTIAL_VARS.join(", ")
                ),
            });
        }
        debug!(environment_id = %env.id, "AWS credentials present");
        Ok(())
    }

    async fn pre_destroy(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await
    }

    async fn start_resources(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await?;
        info!(environment_id = %env.id, "resuming AWS resources");
        Ok(())
    }

    async fn stop_resources(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await?;
        info!(environment_id = %env.id, "suspending AWS resources");
        Ok(())
    }

    fn validate_template(&self, template_text: &str) -> bool {
        template_text.contains("provider \"aws\"") || template_text.contains("aws_")
    }

    fn default_variables(&self) -> HashMap<String, String> {
        HashMap::from([("aws_region".to_string(), self.default_region.clone())])
    }

    fn auth_env(&self) -> HashMap<String, String> {
        let mut env = passthrough_env(&[
            "AWS_ACCESS_KEY_ID",
            "AWS_SECRET_ACCESS_KEY",
            "AWS_SESSION_TOKEN",
            "AWS_PROFILE",
            "AWS_ROLE_ARN",
            "AWS_SHARED_CREDENTIALS_FILE",
        ]);
        env.entry("AWS_REGION".to_string())
            .or_insert_with(|| self.default_region.clone());
        env
    }
}
