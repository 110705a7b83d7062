use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loft_domain::{
    AuditEvent, ComposeDocument, ContainerInstance, Environment, EnvironmentId,
    EnvironmentStatus, MetricSample, OwnerId, Template, TemplateId, UsageReport,
};
use loft_driver::{DriverRegistry, LogStream, ProvisionContext, ProvisionOutcome};
use loft_notifier::Notifier;
use loft_store::Repository;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::ResourceGuard;
use crate::error::OrchError;
use crate::keyed_lock::KeyedLocks;
use crate::ports::PortAllocator;
use crate::worker::WorkerPool;

/// Who is asking. The reaper and other internal loops act as `System`;
/// everything arriving from the outside carries a verified owner id.
#[derive(Debug, Clone)]
pub enum Caller {
    System,
    User(OwnerId),
}

impl Caller {
    fn may_access(&self, env: &Environment) -> bool {
        match self {
            Caller::System => true,
            Caller::User(owner) => env.owner == *owner,
        }
    }
}

/// A mutating operation accepted by the orchestrator: the synchronous view
/// of the environment plus the handle of the task driving it to completion.
#[derive(Debug)]
pub struct OperationHandle {
    pub environment: Environment,
    pub task: JoinHandle<()>,
}

/// Owns the environment state machine and sequences drivers, ports,
/// admission, persistence and notification around it.
pub struct Orchestrator {
    repo: Arc<dyn Repository>,
    registry: Arc<DriverRegistry>,
    notifier: Arc<Notifier>,
    ports: Arc<PortAllocator>,
    guard: Arc<ResourceGuard>,
    locks: Arc<KeyedLocks>,
    pool: WorkerPool,
    max_environments_per_owner: u32,
    default_auto_stop_hours: u32,
    /// Grace handed to drivers when stopping containers.
    stop_grace: Duration,
    /// Hard wall-clock cap on any single driver call.
    driver_cap: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<DriverRegistry>,
        notifier: Arc<Notifier>,
        ports: Arc<PortAllocator>,
        guard: Arc<ResourceGuard>,
        max_environments_per_owner: u32,
        default_auto_stop_hours: u32,
    ) -> Self {
        Self {
            repo,
            registry,
            notifier,
            ports,
            guard,
            locks: Arc::new(KeyedLocks::new()),
            pool: WorkerPool::default(),
            max_environments_per_owner,
            default_auto_stop_hours,
            stop_grace: Duration::from_secs(30),
            driver_cap: Duration::from_secs(45 * 60),
        }
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Warm the committed-resource ledger from persisted environments. Call
    /// once at startup, after the allocator warmed its lease cache.
    pub async fn warm_admission(&self) -> Result<(), OrchError> {
        let mut live = Vec::new();
        for env in self.repo.list_environments().await? {
            if env.status == EnvironmentStatus::Destroyed {
                continue;
            }
            if let Some(template) = self.repo.get_template(&env.template_id).await? {
                live.push((env.id, template.limits));
            }
        }
        self.guard.warm(live);
        Ok(())
    }

    // ── Create ────────────────────────────────────────────────────────────────

    pub async fn create(
        self: &Arc<Self>,
        caller: &Caller,
        template_id: &TemplateId,
        name: &str,
    ) -> Result<OperationHandle, OrchError> {
        let Caller::User(owner) = caller else {
            return Err(OrchError::Forbidden);
        };

        let template = self
            .repo
            .get_template(template_id)
            .await?
            .ok_or_else(|| OrchError::NotFound(format!("template {template_id}")))?;
        if !template.visibility.permits(owner, template.owner.as_ref()) {
            return Err(OrchError::Forbidden);
        }
        template
            .validate()
            .map_err(|e| OrchError::Internal(format!("stored template invalid: {e}")))?;

        // cycles and malformed documents are rejected before anything is
        // reserved
        let document = self.parse_document(&template)?;

        let now = Utc::now();
        let mut env = Environment::new(
            &template,
            name,
            owner.clone(),
            self.default_auto_stop_hours,
            now,
        );

        // hold order: admission → port
        self.guard.try_commit(env.id, template.limits)?;

        let mut exposed: Vec<u16> = template.exposed_ports.clone();
        exposed.sort_unstable();
        exposed.dedup();
        let host_ports = match self.ports.reserve(env.id, exposed.len()).await {
            Ok(ports) => ports,
            Err(e) => {
                self.guard.release(&env.id);
                return Err(e);
            }
        };
        env.port_map = exposed.into_iter().zip(host_ports).collect::<BTreeMap<u16, u16>>();

        if let Err(e) = self
            .repo
            .insert_environment(&env, self.max_environments_per_owner)
            .await
        {
            let _ = self.ports.release(env.id).await;
            self.guard.release(&env.id);
            return Err(e.into());
        }

        self.audit(AuditEvent::EnvironmentCreated {
            id: Uuid::new_v4(),
            at: now,
            environment_id: env.id,
            owner: owner.clone(),
            template_id: template.id.clone(),
        })
        .await;
        self.notifier.publish_status(&env);
        info!(environment_id = %env.id, template = %template.id, "environment accepted");

        let this = self.clone();
        let env_id = env.id;
        let spawn = self.pool.spawn(async move {
            this.run_provision(env_id, template, document).await;
        });
        let task = match spawn {
            Ok(task) => task,
            Err(e) => {
                // nothing is running; fail the create in place
                self.fail_create(env_id, OrchError::Internal("worker pool saturated".into()))
                    .await;
                return Err(e);
            }
        };

        Ok(OperationHandle { environment: env, task })
    }

    fn parse_document(&self, template: &Template) -> Result<Option<ComposeDocument>, OrchError> {
        if !template.infra.has_containers() {
            return Ok(None);
        }
        let doc = loft_config::parse_compose(&template.compose)?;
        loft_graph::service_order(&doc)?;
        Ok(Some(doc))
    }

    async fn run_provision(
        self: Arc<Self>,
        env_id: EnvironmentId,
        template: Template,
        document: Option<ComposeDocument>,
    ) {
        let _guard = self.locks.lock(env_id).await;
        if let Err(e) = self.provision_inner(env_id, template, document).await {
            self.fail_create(env_id, e).await;
        }
    }

    async fn provision_inner(
        &self,
        env_id: EnvironmentId,
        template: Template,
        document: Option<ComposeDocument>,
    ) -> Result<(), OrchError> {
        let env = self.load(env_id).await?;
        if env.status != EnvironmentStatus::Creating {
            // stopped or deleted while queued; nothing to do
            return Ok(());
        }

        let ctx = ProvisionContext {
            port_map: env.port_map.clone(),
            environment: env,
            template,
            document,
        };

        let mut merged = ProvisionOutcome::default();
        for driver in self.registry.drivers_for(ctx.environment.infra)? {
            let outcome = self.capped(driver.name(), driver.provision(&ctx)).await??;
            merged.containers.extend(outcome.containers);
            merged.resources.extend(outcome.resources);
            merged.archive_id = outcome.archive_id.or(merged.archive_id);
        }

        for instance in &merged.containers {
            self.repo.upsert_container(instance).await?;
        }

        let mut env = self.load(env_id).await?;
        env.resource_map = merged.resources;
        env.archive_id = merged.archive_id.or(env.archive_id);
        self.transition(&mut env, EnvironmentStatus::Running, "provision").await?;
        Ok(())
    }

    /// CREATING → FAILED: release everything the environment had reserved.
    /// The workspace archive, if any apply got far enough to write one, is
    /// deliberately retained for operators.
    async fn fail_create(&self, env_id: EnvironmentId, err: OrchError) {
        warn!(environment_id = %env_id, error = %err, "provisioning failed");
        let _ = self.ports.release(env_id).await;
        self.guard.release(&env_id);

        match self.load(env_id).await {
            Ok(mut env) => {
                if env.status != EnvironmentStatus::Creating {
                    return;
                }
                env.port_map.clear();
                env.status_reason = Some(err.to_string());
                if let Err(e) = self
                    .transition(&mut env, EnvironmentStatus::Failed, "provision")
                    .await
                {
                    warn!(environment_id = %env_id, error = %e, "could not record FAILED");
                }
                self.audit(AuditEvent::ProvisionFailed {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    environment_id: env_id,
                    message: err.to_string(),
                })
                .await;
            }
            Err(e) => warn!(environment_id = %env_id, error = %e, "failed create lost its row"),
        }
    }

    // ── Start / stop ──────────────────────────────────────────────────────────

    pub async fn start(
        self: &Arc<Self>,
        caller: &Caller,
        env_id: EnvironmentId,
    ) -> Result<OperationHandle, OrchError> {
        let _guard = self.locks.lock(env_id).await;
        let mut env = self.load_for(caller, env_id).await?;
        match env.status {
            EnvironmentStatus::Stopped | EnvironmentStatus::Failed => {}
            other => return Err(OrchError::invalid_state("start", other)),
        }
        env.touch(Utc::now());
        self.transition(&mut env, EnvironmentStatus::Starting, "start").await?;

        let this = self.clone();
        let task = self.pool.spawn(async move {
            let _guard = this.locks.lock(env_id).await;
            let result = this.drive(env_id, DriverOp::Start).await;
            this.settle(env_id, result, EnvironmentStatus::Running, "start").await;
        })?;
        Ok(OperationHandle { environment: env, task })
    }

    pub async fn stop(
        self: &Arc<Self>,
        caller: &Caller,
        env_id: EnvironmentId,
    ) -> Result<OperationHandle, OrchError> {
        let _guard = self.locks.lock(env_id).await;
        let mut env = self.load_for(caller, env_id).await?;
        match env.status {
            EnvironmentStatus::Running | EnvironmentStatus::Creating => {}
            other => return Err(OrchError::invalid_state("stop", other)),
        }
        self.transition(&mut env, EnvironmentStatus::Stopping, "stop").await?;

        let this = self.clone();
        let task = self.pool.spawn(async move {
            let _guard = this.locks.lock(env_id).await;
            let result = this.drive(env_id, DriverOp::Stop).await;
            this.settle(env_id, result, EnvironmentStatus::Stopped, "stop").await;
        })?;
        Ok(OperationHandle { environment: env, task })
    }

    async fn drive(&self, env_id: EnvironmentId, op: DriverOp) -> Result<(), OrchError> {
        let env = self.load(env_id).await?;
        let mut drivers = self.registry.drivers_for(env.infra)?;
        if matches!(op, DriverOp::Stop) {
            drivers.reverse();
        }
        for driver in drivers {
            match op {
                DriverOp::Start => {
                    self.capped(driver.name(), driver.start(&env)).await??;
                }
                DriverOp::Stop => {
                    self.capped(driver.name(), driver.stop(&env, self.stop_grace)).await??;
                }
            }
        }
        Ok(())
    }

    /// Record the outcome of an asynchronous start/stop: the target status
    /// on success, ERROR with the reason on failure.
    async fn settle(
        &self,
        env_id: EnvironmentId,
        result: Result<(), OrchError>,
        on_success: EnvironmentStatus,
        operation: &'static str,
    ) {
        let Ok(mut env) = self.load(env_id).await else {
            warn!(environment_id = %env_id, operation, "environment vanished mid-operation");
            return;
        };
        match result {
            Ok(()) => {
                if let Err(e) = self.transition(&mut env, on_success, operation).await {
                    warn!(environment_id = %env_id, error = %e, "could not settle {operation}");
                }
            }
            Err(err) => {
                warn!(environment_id = %env_id, error = %err, "{operation} failed");
                env.status_reason = Some(err.to_string());
                if let Err(e) = self.transition(&mut env, EnvironmentStatus::Error, operation).await
                {
                    warn!(environment_id = %env_id, error = %e, "could not record ERROR");
                }
            }
        }
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    pub async fn delete(
        self: &Arc<Self>,
        caller: &Caller,
        env_id: EnvironmentId,
    ) -> Result<OperationHandle, OrchError> {
        let _guard = self.locks.lock(env_id).await;
        let mut env = self.load_for(caller, env_id).await?;
        if matches!(
            env.status,
            EnvironmentStatus::Deleting | EnvironmentStatus::Destroyed
        ) {
            return Err(OrchError::invalid_state("delete", env.status));
        }
        self.transition(&mut env, EnvironmentStatus::Deleting, "delete").await?;

        let this = self.clone();
        let task = self.pool.spawn(async move {
            this.run_delete(env_id).await;
        })?;
        Ok(OperationHandle { environment: env, task })
    }

    async fn run_delete(self: Arc<Self>, env_id: EnvironmentId) {
        let _guard = self.locks.lock(env_id).await;

        // teardown is retried with exponential backoff before giving up
        let mut result = Ok(());
        for attempt in 0..3u32 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
            result = self.teardown_once(env_id).await;
            if result.is_ok() {
                break;
            }
            warn!(environment_id = %env_id, attempt, "teardown attempt failed");
        }

        match result {
            Ok(()) => self.finalize_destroy(env_id, "delete").await,
            Err(err) => {
                // the reaper re-drives stuck deletes
                if let Ok(mut env) = self.load(env_id).await {
                    env.status_reason = Some(err.to_string());
                    let _ = self.transition(&mut env, EnvironmentStatus::Error, "delete").await;
                }
            }
        }
    }

    async fn teardown_once(&self, env_id: EnvironmentId) -> Result<(), OrchError> {
        let env = self.load(env_id).await?;
        let mut drivers = self.registry.drivers_for(env.infra)?;
        drivers.reverse();
        for driver in drivers {
            self.capped(driver.name(), driver.teardown(&env)).await??;
        }
        Ok(())
    }

    /// Resources-released checkpoint: from here the delete always runs to
    /// DESTROYED, without timeouts or cancellation.
    async fn finalize_destroy(&self, env_id: EnvironmentId, operation: &'static str) {
        let _ = self.repo.delete_containers(&env_id).await;
        let _ = self.ports.release(env_id).await;
        self.guard.release(&env_id);

        match self.load(env_id).await {
            Ok(mut env) => {
                env.clear_owned_resources();
                env.status_reason = None;
                if let Err(e) = self
                    .transition(&mut env, EnvironmentStatus::Destroyed, operation)
                    .await
                {
                    warn!(environment_id = %env_id, error = %e, "could not record DESTROYED");
                }
            }
            Err(e) => warn!(environment_id = %env_id, error = %e, "destroyed environment lost its row"),
        }
        self.locks.forget(&env_id);
    }

    /// Reaper entry: force a stuck transitional environment to DESTROYED
    /// after a best-effort driver cleanup.
    pub async fn reap_stale(self: &Arc<Self>, env_id: EnvironmentId) -> Result<(), OrchError> {
        let _guard = self.locks.lock(env_id).await;
        let mut env = self.load(env_id).await?;
        if !env.status.is_transitional() {
            return Ok(());
        }
        if env.status != EnvironmentStatus::Deleting {
            self.transition(&mut env, EnvironmentStatus::Deleting, "reap").await?;
        }

        if let Ok(mut drivers) = self.registry.drivers_for(env.infra) {
            drivers.reverse();
            for driver in drivers {
                if let Ok(Err(e)) | Err(e) = self.capped(driver.name(), driver.teardown(&env)).await
                {
                    warn!(environment_id = %env_id, error = %e, "best-effort cleanup failed");
                }
            }
        }

        self.finalize_destroy(env_id, "reap").await;
        self.audit(AuditEvent::EnvironmentReaped {
            id: Uuid::new_v4(),
            at: Utc::now(),
            environment_id: env_id,
            reason: "stuck in a transitional state".into(),
        })
        .await;
        Ok(())
    }

    // ── Reads & bookkeeping ───────────────────────────────────────────────────

    pub async fn get_environment(
        &self,
        caller: &Caller,
        env_id: EnvironmentId,
    ) -> Result<Environment, OrchError> {
        self.load_for(caller, env_id).await
    }

    pub async fn list_environments(&self, caller: &Caller) -> Result<Vec<Environment>, OrchError> {
        match caller {
            Caller::System => Ok(self.repo.list_environments().await?),
            Caller::User(owner) => Ok(self.repo.list_environments_by_owner(owner).await?),
        }
    }

    pub async fn list_containers(
        &self,
        caller: &Caller,
        env_id: EnvironmentId,
    ) -> Result<Vec<ContainerInstance>, OrchError> {
        self.load_for(caller, env_id).await?;
        Ok(self.repo.list_containers(&env_id).await?)
    }

    pub async fn list_metrics(
        &self,
        caller: &Caller,
        env_id: EnvironmentId,
        limit: u32,
    ) -> Result<Vec<MetricSample>, OrchError> {
        self.load_for(caller, env_id).await?;
        Ok(self.repo.list_metrics(&env_id, limit).await?)
    }

    /// Stream engine logs for an environment the caller may access.
    pub async fn logs(
        &self,
        caller: &Caller,
        env_id: EnvironmentId,
        service: Option<&str>,
        tail: u32,
        follow: bool,
    ) -> Result<LogStream, OrchError> {
        let env = self.load_for(caller, env_id).await?;
        match self.registry.container_driver(env.infra) {
            Some(driver) => Ok(driver.logs(&env, service, tail, follow).await?),
            None => Ok(Box::pin(futures_util::stream::empty())),
        }
    }

    /// Record client activity so the idle reaper leaves the environment be.
    pub async fn record_access(&self, env_id: EnvironmentId) {
        if let Ok(mut env) = self.load(env_id).await {
            env.touch(Utc::now());
            // a racing transition wins; access time is best-effort
            let _ = self.repo.update_environment(&env).await;
        }
    }

    /// Per-owner usage roll-up: live environment count plus the committed
    /// limits of those environments' templates.
    pub async fn usage(&self, caller: &Caller) -> Result<UsageReport, OrchError> {
        let Caller::User(owner) = caller else {
            return Err(OrchError::Forbidden);
        };
        let mut report = UsageReport {
            owner: owner.clone(),
            environment_count: self.repo.count_non_destroyed(owner).await?,
            committed_cpu_cores: 0.0,
            committed_memory_mib: 0,
        };
        for env in self.repo.list_environments_by_owner(owner).await? {
            if env.status == EnvironmentStatus::Destroyed {
                continue;
            }
            if let Some(template) = self.repo.get_template(&env.template_id).await? {
                report.committed_cpu_cores += template.limits.cpu_cores;
                report.committed_memory_mib += template.limits.memory_mib as u64;
            }
        }
        Ok(report)
    }

    // ── Templates ─────────────────────────────────────────────────────────────

    pub async fn put_template(&self, template: &Template) -> Result<(), OrchError> {
        template
            .validate()
            .map_err(|e| OrchError::InvalidState { operation: "put_template", detail: e.to_string() })?;
        Ok(self.repo.put_template(template).await?)
    }

    pub async fn delete_template(&self, id: &TemplateId) -> Result<(), OrchError> {
        Ok(self.repo.delete_template(id).await?)
    }

    pub async fn list_templates(&self, caller: &Caller) -> Result<Vec<Template>, OrchError> {
        match caller {
            Caller::System => Ok(self.repo.list_templates(None).await?),
            Caller::User(owner) => Ok(self.repo.list_templates(Some(owner)).await?),
        }
    }

    // ── Shared plumbing ───────────────────────────────────────────────────────

    async fn load(&self, env_id: EnvironmentId) -> Result<Environment, OrchError> {
        self.repo
            .get_environment(&env_id)
            .await?
            .ok_or_else(|| OrchError::NotFound(format!("environment {env_id}")))
    }

    async fn load_for(
        &self,
        caller: &Caller,
        env_id: EnvironmentId,
    ) -> Result<Environment, OrchError> {
        let env = self.load(env_id).await?;
        if !caller.may_access(&env) {
            return Err(OrchError::Forbidden);
        }
        Ok(env)
    }

    /// Persist a status change, then publish it. Publishing after the write
    /// keeps every event equal to a persisted status, and the per-environment
    /// lock held by all mutators keeps subscribers' view in order.
    async fn transition(
        &self,
        env: &mut Environment,
        to: EnvironmentStatus,
        operation: &'static str,
    ) -> Result<(), OrchError> {
        if !env.status.can_transition_to(to) {
            return Err(OrchError::invalid_state(operation, env.status));
        }
        let from = env.status;
        env.status = to;
        env.updated_at = Utc::now();
        if to != EnvironmentStatus::Error && to != EnvironmentStatus::Failed {
            env.status_reason = None;
        }
        *env = self.repo.update_environment(env).await?;

        self.audit(AuditEvent::StatusChanged {
            id: Uuid::new_v4(),
            at: env.updated_at,
            environment_id: env.id,
            from,
            to,
        })
        .await;
        self.notifier.publish_status(env);
        info!(environment_id = %env.id, %from, %to, "status transition");
        Ok(())
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.repo.append_event(&event).await {
            warn!(error = %e, "audit event not persisted");
        }
    }

    /// Apply the hard wall-clock cap to a driver call.
    async fn capped<T>(
        &self,
        step: &str,
        fut: impl std::future::Future<Output = Result<T, loft_driver::DriverError>>,
    ) -> Result<Result<T, OrchError>, OrchError> {
        match tokio::time::timeout(self.driver_cap, fut).await {
            Ok(result) => Ok(result.map_err(OrchError::from)),
            Err(_) => Err(OrchError::Timeout {
                step: step.to_string(),
                seconds: self.driver_cap.as_secs(),
            }),
        }
    }
}

enum DriverOp {
    Start,
    Stop,
}
