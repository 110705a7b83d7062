use serde::Deserialize;
use std::collections::BTreeMap;

/// Raw YAML representation of a template's compose-style document.
#[derive(Debug, Deserialize)]
pub struct RawCompose {
    pub services: BTreeMap<String, RawService>,
    #[serde(default)]
    pub volumes: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub networks: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RawService {
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Vec<RawPort>,
    #[serde(default)]
    pub environment: RawEnvironment,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Non-standard extension: URL probed for service health.
    pub health_url: Option<String>,
}

/// Compose accepts `8080`, `"8080"`, and `"8080:80"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawPort {
    Number(u32),
    Spec(String),
}

/// Compose accepts both the map form and the `KEY=value` list form.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
pub enum RawEnvironment {
    #[default]
    Empty,
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}
