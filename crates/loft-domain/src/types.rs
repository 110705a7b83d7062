use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentId(pub Uuid);

impl EnvironmentId {
    pub fn random() -> Self {
        EnvironmentId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn new(s: impl Into<String>) -> Self {
        TemplateId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(s: impl Into<String>) -> Self {
        OwnerId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveId(pub Uuid);

impl ArchiveId {
    pub fn random() -> Self {
        ArchiveId(Uuid::new_v4())
    }
}

impl std::fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InfraKind {
    Local,
    Aws,
    Azure,
    Gcp,
    Hybrid,
}

impl InfraKind {
    /// Whether environments of this kind run containers on the local engine.
    pub fn has_containers(&self) -> bool {
        matches!(self, InfraKind::Local | InfraKind::Hybrid)
    }

    /// Whether environments of this kind provision cloud infrastructure
    /// through the IaaS tool.
    pub fn has_cloud(&self) -> bool {
        !matches!(self, InfraKind::Local)
    }
}

impl std::fmt::Display for InfraKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfraKind::Local => write!(f, "LOCAL"),
            InfraKind::Aws => write!(f, "AWS"),
            InfraKind::Azure => write!(f, "AZURE"),
            InfraKind::Gcp => write!(f, "GCP"),
            InfraKind::Hybrid => write!(f, "HYBRID"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    Owner(OwnerId),
}

impl Visibility {
    /// Whether `owner` may instantiate a template with this visibility.
    pub fn permits(&self, owner: &OwnerId, template_owner: Option<&OwnerId>) -> bool {
        match self {
            Visibility::Public => true,
            Visibility::Private => template_owner == Some(owner),
            Visibility::Owner(o) => o == owner,
        }
    }
}

/// Lifecycle state of an environment.
///
/// Transitions:
///   CREATING → RUNNING | FAILED | STOPPING
///   RUNNING → STOPPING, STOPPING → STOPPED, STOPPED → STARTING → RUNNING
///   FAILED → STARTING
///   any non-terminal → ERROR, ERROR → DELETING
///   any !DELETING,!DESTROYED → DELETING → DESTROYED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvironmentStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Destroyed,
    Failed,
    Error,
}

impl EnvironmentStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        if *self == next {
            return false;
        }
        match (*self, next) {
            // delete is legal from every non-terminal state
            (Destroyed, _) => false,
            (s, Deleting) => s != Deleting,
            (Deleting, Destroyed) => true,
            // delete retries exhausted
            (Deleting, Error) => true,
            (Error, _) => false,

            (Creating, Running) | (Creating, Failed) | (Creating, Stopping) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, Starting) => true,
            (Starting, Running) => true,
            (Failed, Starting) => true,

            // unhandled driver failure from any non-terminal state
            (Creating, Error)
            | (Starting, Error)
            | (Running, Error)
            | (Stopping, Error)
            | (Stopped, Error)
            | (Failed, Error) => true,

            _ => false,
        }
    }

    /// DESTROYED is the only state with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvironmentStatus::Destroyed)
    }

    /// States the orchestrator should only ever hold briefly. The reaper
    /// treats environments stuck here as failed.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            EnvironmentStatus::Creating
                | EnvironmentStatus::Starting
                | EnvironmentStatus::Stopping
                | EnvironmentStatus::Deleting
        )
    }
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvironmentStatus::Creating => "CREATING",
            EnvironmentStatus::Starting => "STARTING",
            EnvironmentStatus::Running => "RUNNING",
            EnvironmentStatus::Stopping => "STOPPING",
            EnvironmentStatus::Stopped => "STOPPED",
            EnvironmentStatus::Deleting => "DELETING",
            EnvironmentStatus::Destroyed => "DESTROYED",
            EnvironmentStatus::Failed => "FAILED",
            EnvironmentStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopped,
    Error,
    Destroyed,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Starting => "STARTING",
            ContainerStatus::Running => "RUNNING",
            ContainerStatus::Stopped => "STOPPED",
            ContainerStatus::Error => "ERROR",
            ContainerStatus::Destroyed => "DESTROYED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Custom,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MetricKind::Cpu => "CPU",
            MetricKind::Memory => "MEMORY",
            MetricKind::Disk => "DISK",
            MetricKind::Network => "NETWORK",
            MetricKind::Custom => "CUSTOM",
        };
        write!(f, "{}", s)
    }
}

// ── Templates ─────────────────────────────────────────────────────────────────

pub const MIN_MEMORY_MIB: u32 = 128;
pub const MAX_MEMORY_MIB: u32 = 32_768;
pub const MAX_CPU_CORES: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mib: u32,
    pub cpu_cores: f64,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.memory_mib < MIN_MEMORY_MIB || self.memory_mib > MAX_MEMORY_MIB {
            return Err(DomainError::MemoryOutOfRange(self.memory_mib));
        }
        if self.cpu_cores <= 0.0 || self.cpu_cores > MAX_CPU_CORES {
            return Err(DomainError::CpuOutOfRange(self.cpu_cores));
        }
        Ok(())
    }
}

/// Immutable recipe describing how to build an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    /// Compose-style service document. Required for LOCAL and HYBRID kinds.
    pub compose: String,
    /// IaaS template text. Required for every kind except LOCAL.
    pub iaas_template: Option<String>,
    /// Variables file text passed alongside the IaaS template.
    pub iaas_variables: Option<String>,
    /// Container ports the environment exposes on the host.
    pub exposed_ports: Vec<u16>,
    pub limits: ResourceLimits,
    pub infra: InfraKind,
    pub region: Option<String>,
    pub visibility: Visibility,
    /// Owner of PRIVATE templates; None for shared catalogue entries.
    pub owner: Option<OwnerId>,
}

impl Template {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.infra.has_cloud()
            && self.iaas_template.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return Err(DomainError::MissingIaasTemplate(self.infra));
        }
        if self.infra.has_containers() && self.compose.trim().is_empty() {
            return Err(DomainError::MissingComposeDocument(self.infra));
        }
        for port in &self.exposed_ports {
            if *port == 0 {
                return Err(DomainError::InvalidExposedPort(*port));
            }
        }
        self.limits.validate()
    }
}

// ── Environments ──────────────────────────────────────────────────────────────

/// A running or stopped instance of a template, owned by exactly one user.
///
/// Persisted as a value record keyed by id; the orchestrator loads and stores
/// it under a keyed mutex and never holds references between environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    pub template_id: TemplateId,
    pub owner: OwnerId,
    pub status: EnvironmentStatus,
    /// Copied from the template at creation; templates are mutable only
    /// through replacement, environments never re-read it.
    pub infra: InfraKind,
    /// Workspace archive holding the IaaS tool's state, once applied.
    pub archive_id: Option<ArchiveId>,
    /// container-port → host-port.
    pub port_map: BTreeMap<u16, u16>,
    /// resource-kind → opaque cloud resource id, from the tool's outputs.
    pub resource_map: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Hours of idleness before the reaper stops the environment.
    pub auto_stop_after_hours: u32,
    /// Optimistic concurrency token; the store rejects writes that carry a
    /// stale version.
    pub version: u64,
    /// Why the environment is FAILED or ERROR, for operators.
    pub status_reason: Option<String>,
}

impl Environment {
    pub fn new(
        template: &Template,
        name: impl Into<String>,
        owner: OwnerId,
        auto_stop_after_hours: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Environment {
            id: EnvironmentId::random(),
            name: name.into(),
            template_id: template.id.clone(),
            owner,
            status: EnvironmentStatus::Creating,
            infra: template.infra,
            archive_id: None,
            port_map: BTreeMap::new(),
            resource_map: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            auto_stop_after_hours,
            version: 0,
            status_reason: None,
        }
    }

    /// Clear everything a DESTROYED environment may no longer own.
    pub fn clear_owned_resources(&mut self) {
        self.port_map.clear();
        self.resource_map.clear();
        self.archive_id = None;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
    }
}

// ── Container instances ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub id: Uuid,
    pub environment_id: EnvironmentId,
    /// Service name, unique within the environment.
    pub service: String,
    /// Engine-assigned container id; None until the engine created it.
    pub engine_id: Option<String>,
    pub status: ContainerStatus,
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
    pub health_url: Option<String>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl ContainerInstance {
    pub fn new(environment_id: EnvironmentId, service: impl Into<String>) -> Self {
        ContainerInstance {
            id: Uuid::new_v4(),
            environment_id,
            service: service.into(),
            engine_id: None,
            status: ContainerStatus::Starting,
            host_port: None,
            container_port: None,
            health_url: None,
            last_probe_at: None,
        }
    }

    /// A non-null engine id implies the engine acknowledged creation, so the
    /// instance must have left STARTING.
    pub fn invariant_holds(&self) -> bool {
        self.engine_id.is_none() || self.status != ContainerStatus::Starting
    }
}

// ── Metrics ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub environment_id: EnvironmentId,
    /// Engine container id; None for environment-ambient samples.
    pub container_id: Option<String>,
    pub kind: MetricKind,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub recorded_at: DateTime<Utc>,
}

// ── Port leases ───────────────────────────────────────────────────────────────

/// Durable binding of a host port to an environment, released only on
/// teardown. The in-memory allocator is a cache warmed from these rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLease {
    pub host_port: u16,
    pub environment_id: EnvironmentId,
    pub leased_at: DateTime<Utc>,
}

// ── Workspace archives ────────────────────────────────────────────────────────

/// Opaque zipped workspace holding the IaaS tool's state and inputs for one
/// environment. Created at first apply, replaced on each apply, deleted on
/// successful destroy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceArchive {
    pub id: ArchiveId,
    pub environment_id: EnvironmentId,
    /// SHA-256 hex digest of the blob, verified on restore.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

// ── Usage reports ─────────────────────────────────────────────────────────────

/// Per-owner roll-up of live environments and their committed limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub owner: OwnerId,
    pub environment_count: u32,
    pub committed_cpu_cores: f64,
    pub committed_memory_mib: u64,
}

// ── Audit events ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    EnvironmentCreated {
        id: Uuid,
        at: DateTime<Utc>,
        environment_id: EnvironmentId,
        owner: OwnerId,
        template_id: TemplateId,
    },
    StatusChanged {
        id: Uuid,
        at: DateTime<Utc>,
        environment_id: EnvironmentId,
        from: EnvironmentStatus,
        to: EnvironmentStatus,
    },
    ProvisionFailed {
        id: Uuid,
        at: DateTime<Utc>,
        environment_id: EnvironmentId,
        message: String,
    },
    EnvironmentReaped {
        id: Uuid,
        at: DateTime<Utc>,
        environment_id: EnvironmentId,
        reason: String,
    },
}

impl AuditEvent {
    pub fn environment_id(&self) -> &EnvironmentId {
        match self {
            AuditEvent::EnvironmentCreated { environment_id, .. } => environment_id,
            AuditEvent::StatusChanged { environment_id, .. } => environment_id,
            AuditEvent::ProvisionFailed { environment_id, .. } => environment_id,
            AuditEvent::EnvironmentReaped { environment_id, .. } => environment_id,
        }
    }
}
