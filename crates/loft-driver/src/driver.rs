use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use loft_domain::{ComposeDocument, ContainerInstance, Environment, Template};

use crate::error::DriverError;

/// Everything a driver needs to provision an environment. Assembled by the
/// orchestrator after admission and port reservation; drivers never reach
/// back into the repository for these.
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    pub environment: Environment,
    pub template: Template,
    /// Parsed compose document; present for LOCAL and HYBRID kinds.
    pub document: Option<ComposeDocument>,
    /// container-port → host-port, from the allocator.
    pub port_map: BTreeMap<u16, u16>,
}

/// What a successful provision produced. The orchestrator merges outcomes
/// when an environment spans more than one driver.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOutcome {
    pub containers: Vec<ContainerInstance>,
    /// resource-kind → opaque cloud resource id.
    pub resources: BTreeMap<String, String>,
    pub archive_id: Option<loft_domain::ArchiveId>,
}

/// One-shot per-container resource snapshot, consumed by the metrics
/// collector.
#[derive(Debug, Clone, Default)]
pub struct ContainerStatsSnapshot {
    pub container_id: String,
    pub service: String,
    pub cpu_percent: f64,
    pub memory_used_mib: f64,
    pub memory_limit_mib: f64,
    pub memory_percent: f64,
    pub network_rx_mib: f64,
    pub network_tx_mib: f64,
    pub disk_read_mib: f64,
    pub disk_write_mib: f64,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub service: String,
    pub line: String,
    pub at: DateTime<Utc>,
}

pub type LogStream = BoxStream<'static, LogLine>;

/// A backend capable of running an environment's workload.
///
/// Implementations are idempotent for `start`/`stop`/`teardown`: repeating a
/// call on an environment already in the target state succeeds. Every
/// long-running engine or subprocess interaction enforces its own step
/// timeout and surfaces [`DriverError::Timeout`] so the orchestrator can
/// transition the environment to ERROR.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn provision(&self, ctx: &ProvisionContext) -> Result<ProvisionOutcome, DriverError>;

    async fn start(&self, env: &Environment) -> Result<(), DriverError>;

    async fn stop(&self, env: &Environment, grace: Duration) -> Result<(), DriverError>;

    async fn teardown(&self, env: &Environment) -> Result<(), DriverError>;

    /// Per-container resource snapshot. Default: nothing to report — cloud
    /// drivers have no engine-visible containers.
    async fn stats(
        &self,
        _env: &Environment,
    ) -> Result<Vec<ContainerStatsSnapshot>, DriverError> {
        Ok(vec![])
    }

    /// Stream engine log lines for the environment, optionally restricted to
    /// one service. Default: empty stream.
    async fn logs(
        &self,
        _env: &Environment,
        _service: Option<&str>,
        _tail: u32,
        _follow: bool,
    ) -> Result<LogStream, DriverError> {
        Ok(Box::pin(futures_util::stream::empty()))
    }
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("name", &self.name()).finish()
    }
}
