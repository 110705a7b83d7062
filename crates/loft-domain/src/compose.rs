use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Canonical form of a template's compose-style document, produced by the
/// config loader. Service order is stable (BTreeMap) so drivers behave
/// deterministically; execution order comes from the dependency graph, not
/// from document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeDocument {
    pub services: BTreeMap<String, ComposeService>,
    /// Named volumes declared at the top level.
    pub volumes: Vec<String>,
    /// Named networks declared at the top level. The driver always creates a
    /// dedicated per-environment network regardless.
    pub networks: Vec<String>,
}

impl ComposeDocument {
    pub fn service(&self, name: &str) -> Option<&ComposeService> {
        self.services.get(name)
    }

    /// All container ports any service asks to expose, in ascending order.
    pub fn exposed_container_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .services
            .values()
            .flat_map(|s| s.ports.iter().map(|p| p.container))
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeService {
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub environment: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    /// URL probed by the metrics tick when present.
    pub health_url: Option<String>,
}

/// One `container[:host]` port declaration. The host side is advisory — the
/// allocator assigns the actual host port at create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container: u16,
    pub host_hint: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}
