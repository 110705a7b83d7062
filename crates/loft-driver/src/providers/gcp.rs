use std::collections::HashMap;

use async_trait::async_trait;
use loft_domain::{Environment, InfraKind};
use tracing::{debug, info};

use super::{passthrough_env, ProviderHooks};
use crate::error::DriverError;

#[derive(Debug, Clone)]
pub struct GcpHooks {
    pub project: String,
    pub default_region: String,
}

impl GcpHooks {
    pub fn new(project: impl Into<String>, default_region: impl Into<String>) -> Self {
        Self { project: project.into(), default_region: default_region.into() }
    }

    fn credentials_present(&self) -> bool {
        // ADC file or an explicit credentials path both satisfy the provider
        std::env::var("GOOGLE_APPLICATION_CREDENTIALS").is_ok()
            || std::env::var("HOME").map_or(false, |home| {
                std::path::Path::new(&home)
                    .join(".config/gcloud/application_default_credentials.json")
                    .exists()
            })
    }
}

#[async_trait]
impl ProviderHooks for GcpHooks {
    fn kind(&self) -> InfraKind {
        InfraKind::Gcp
    }

    async fn pre_provision(&self, env: &Environment) -> Result<(), DriverError> {
        if !self.credentials_present() {
            return Err(DriverError::HookFailed {
                hook: "pre_provision".into(),
                reason: "no GCP application default credentials found".into(),
            });
        }
        debug!(environment_id = %env.id, project = %self.project, "GCP credentials present");
        Ok(())
    }

    async fn pre_destroy(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await
    }

    async fn start_resources(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await?;
        info!(environment_id = %env.id, "resuming GCP resources");
        Ok(())
    }

    async fn stop_resources(&self, env: &Environment) -> Result<(), DriverError> {
        self.pre_provision(env).await?;
        info!(environment_id = %env.id, "suspending GCP resources");
        Ok(())
    }

    fn validate_template(&self, template_text: &str) -> bool {
        template_text.contains("provider \"google\"") || template_text.contains("google_")
    }

    fn default_variables(&self) -> HashMap<String, String> {
        HashMap::from([
            ("gcp_project".to_string(), self.project.clone()),
            ("gcp_region".to_string(), self.default_region.clone()),
        ])
    }

    fn auth_env(&self) -> HashMap<String, String> {
        let mut env = passthrough_env(&[
            "GOOGLE_APPLICATION_CREDENTIALS",
            "GOOGLE_IMPERSONATE_SERVICE_ACCOUNT",
            "CLOUDSDK_CORE_PROJECT",
        ]);
        env.entry("GOOGLE_PROJECT".to_string()).or_insert_with(|| self.project.clone());
        env.entry("GOOGLE_REGION".to_string())
            .or_insert_with(|| self.default_region.clone());
        env
    }
}
