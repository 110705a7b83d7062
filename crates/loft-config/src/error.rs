use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("compose document declares no services")]
    NoServices,

    #[error("service '{service}' has no image")]
    MissingImage { service: String },

    #[error("service '{service}' has invalid port spec '{spec}'")]
    InvalidPort { service: String, spec: String },

    #[error("service '{service}' has invalid environment entry '{entry}'")]
    InvalidEnvEntry { service: String, entry: String },

    #[error("service '{service}' has invalid volume spec '{spec}'")]
    InvalidVolume { service: String, spec: String },

    #[error("service '{service}' depends on undeclared service '{depends_on}'")]
    UnknownDependency { service: String, depends_on: String },

    #[error("invalid setting {key}={value}")]
    InvalidSetting { key: String, value: String },

    #[error("domain error: {0}")]
    Domain(#[from] loft_domain::DomainError),
}
