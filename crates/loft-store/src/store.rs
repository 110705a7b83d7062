use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loft_domain::{
    ArchiveId, AuditEvent, ContainerInstance, Environment, EnvironmentId, EnvironmentStatus,
    MetricSample, OwnerId, PortLease, Template, TemplateId, WorkspaceArchive,
};

use crate::error::StoreError;

/// Narrow persistence facade consumed by the orchestration core.
///
/// Implementations return plain values; no query language or row types leak
/// through. Writes that must be atomic (insert-with-quota, lease batches,
/// versioned updates) are atomic inside a single call.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    // ── Templates ─────────────────────────────────────────────────────────────

    async fn get_template(&self, id: &TemplateId) -> Result<Option<Template>, StoreError>;

    /// Templates visible to `viewer`: PUBLIC plus the viewer's own. `None`
    /// lists everything (operator surface).
    async fn list_templates(&self, viewer: Option<&OwnerId>) -> Result<Vec<Template>, StoreError>;

    async fn put_template(&self, template: &Template) -> Result<(), StoreError>;

    /// Refused with [`StoreError::TemplateInUse`] while any non-DESTROYED
    /// environment references the template.
    async fn delete_template(&self, id: &TemplateId) -> Result<(), StoreError>;

    // ── Environments ──────────────────────────────────────────────────────────

    async fn get_environment(&self, id: &EnvironmentId)
        -> Result<Option<Environment>, StoreError>;

    async fn list_environments(&self) -> Result<Vec<Environment>, StoreError>;

    async fn list_environments_by_owner(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<Environment>, StoreError>;

    async fn list_environments_by_status(
        &self,
        status: EnvironmentStatus,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError>;

    /// RUNNING environments whose `last_accessed_at` precedes `before`,
    /// oldest first. Feeds the idle auto-stop scan.
    async fn list_running_accessed_before(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError>;

    /// Transitional-status environments whose `updated_at` precedes `before`.
    /// Feeds the stale-cleanup scan.
    async fn list_stale_transitional(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError>;

    /// Insert a CREATING row, re-checking the owner quota inside the same
    /// transaction so racing creates cannot both pass the guard.
    async fn insert_environment(
        &self,
        env: &Environment,
        max_per_owner: u32,
    ) -> Result<(), StoreError>;

    /// Optimistic-concurrency write: succeeds only when `env.version` matches
    /// the stored row, and returns the environment with its bumped version.
    async fn update_environment(&self, env: &Environment) -> Result<Environment, StoreError>;

    async fn count_non_destroyed(&self, owner: &OwnerId) -> Result<u32, StoreError>;

    // ── Container instances ───────────────────────────────────────────────────

    async fn upsert_container(&self, instance: &ContainerInstance) -> Result<(), StoreError>;

    async fn list_containers(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<Vec<ContainerInstance>, StoreError>;

    async fn delete_containers(&self, environment_id: &EnvironmentId) -> Result<(), StoreError>;

    // ── Port leases ───────────────────────────────────────────────────────────

    /// All-or-nothing: if any port in the batch is already leased, nothing is
    /// written and [`StoreError::PortTaken`] names the first collision.
    async fn insert_port_leases(&self, leases: &[PortLease]) -> Result<(), StoreError>;

    async fn delete_port_leases(&self, environment_id: &EnvironmentId)
        -> Result<(), StoreError>;

    async fn list_port_leases(&self) -> Result<Vec<PortLease>, StoreError>;

    // ── Metrics ───────────────────────────────────────────────────────────────

    async fn insert_metrics(&self, samples: &[MetricSample]) -> Result<(), StoreError>;

    async fn list_metrics(
        &self,
        environment_id: &EnvironmentId,
        limit: u32,
    ) -> Result<Vec<MetricSample>, StoreError>;

    /// Delete samples recorded before `horizon`; returns how many went.
    async fn prune_metrics_before(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── Workspace archives ────────────────────────────────────────────────────

    /// Store a blob under `meta.id`. A previous archive for the same
    /// environment is left in place; the environment row points at the
    /// current one and the reaper collects the rest.
    async fn put_archive(&self, meta: &WorkspaceArchive, data: &[u8]) -> Result<(), StoreError>;

    async fn get_archive(
        &self,
        id: &ArchiveId,
    ) -> Result<Option<(WorkspaceArchive, Vec<u8>)>, StoreError>;

    async fn delete_archive(&self, id: &ArchiveId) -> Result<(), StoreError>;

    /// Archives no live environment points at, created before `before`.
    async fn list_unreferenced_archives(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkspaceArchive>, StoreError>;

    // ── Audit events ──────────────────────────────────────────────────────────

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError>;

    async fn list_events(
        &self,
        environment_id: Option<&EnvironmentId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError>;
}
