use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loft_domain::{
    ArchiveId, AuditEvent, ContainerInstance, Environment, EnvironmentId, EnvironmentStatus,
    MetricSample, OwnerId, PortLease, Template, TemplateId, Visibility, WorkspaceArchive,
};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::Repository;

#[derive(Debug, Default)]
struct Inner {
    templates: HashMap<TemplateId, Template>,
    environments: HashMap<EnvironmentId, Environment>,
    containers: HashMap<EnvironmentId, HashMap<String, ContainerInstance>>,
    leases: HashMap<u16, PortLease>,
    metrics: Vec<MetricSample>,
    archives: HashMap<ArchiveId, (WorkspaceArchive, Vec<u8>)>,
    events: Vec<AuditEvent>,
}

impl Inner {
    fn non_destroyed_count(&self, owner: &OwnerId) -> u32 {
        self.environments
            .values()
            .filter(|e| e.owner == *owner && e.status != EnvironmentStatus::Destroyed)
            .count() as u32
    }

    fn template_referenced(&self, id: &TemplateId) -> bool {
        self.environments
            .values()
            .any(|e| e.template_id == *id && e.status != EnvironmentStatus::Destroyed)
    }
}

/// In-memory implementation of [`Repository`].
///
/// All data is lost on process exit. Suitable for tests and single-node
/// development runs without a database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryStore {
    // ── Templates ─────────────────────────────────────────────────────────────

    async fn get_template(&self, id: &TemplateId) -> Result<Option<Template>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.templates.get(id).cloned())
    }

    async fn list_templates(&self, viewer: Option<&OwnerId>) -> Result<Vec<Template>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<Template> = guard
            .templates
            .values()
            .filter(|t| match viewer {
                None => true,
                Some(v) => match &t.visibility {
                    Visibility::Public => true,
                    Visibility::Private => t.owner.as_ref() == Some(v),
                    Visibility::Owner(o) => o == v,
                },
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(out)
    }

    async fn put_template(&self, template: &Template) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.templates.insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn delete_template(&self, id: &TemplateId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.templates.contains_key(id) {
            return Err(StoreError::TemplateNotFound(id.to_string()));
        }
        if guard.template_referenced(id) {
            return Err(StoreError::TemplateInUse(id.clone()));
        }
        guard.templates.remove(id);
        Ok(())
    }

    // ── Environments ──────────────────────────────────────────────────────────

    async fn get_environment(
        &self,
        id: &EnvironmentId,
    ) -> Result<Option<Environment>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.environments.get(id).cloned())
    }

    async fn list_environments(&self) -> Result<Vec<Environment>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.environments.values().cloned().collect())
    }

    async fn list_environments_by_owner(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<Environment>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .environments
            .values()
            .filter(|e| e.owner == *owner)
            .cloned()
            .collect())
    }

    async fn list_environments_by_status(
        &self,
        status: EnvironmentStatus,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .environments
            .values()
            .filter(|e| e.status == status)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_running_accessed_before(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<Environment> = guard
            .environments
            .values()
            .filter(|e| e.status == EnvironmentStatus::Running && e.last_accessed_at < before)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.last_accessed_at);
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn list_stale_transitional(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<Environment> = guard
            .environments
            .values()
            .filter(|e| e.status.is_transitional() && e.updated_at < before)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.updated_at);
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn insert_environment(
        &self,
        env: &Environment,
        max_per_owner: u32,
    ) -> Result<(), StoreError> {
        // The single write lock makes the count + insert atomic, mirroring
        // the transactional quota re-check in the SQL store.
        let mut guard = self.inner.write().await;
        let count = guard.non_destroyed_count(&env.owner);
        if count >= max_per_owner {
            return Err(StoreError::QuotaExceeded {
                owner: env.owner.to_string(),
                count,
                max: max_per_owner,
            });
        }
        guard.environments.insert(env.id, env.clone());
        Ok(())
    }

    async fn update_environment(&self, env: &Environment) -> Result<Environment, StoreError> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .environments
            .get_mut(&env.id)
            .ok_or_else(|| StoreError::EnvironmentNotFound(env.id.to_string()))?;
        if stored.version != env.version {
            return Err(StoreError::VersionConflict {
                environment_id: env.id.to_string(),
                expected: env.version,
            });
        }
        let mut next = env.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn count_non_destroyed(&self, owner: &OwnerId) -> Result<u32, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.non_destroyed_count(owner))
    }

    // ── Container instances ───────────────────────────────────────────────────

    async fn upsert_container(&self, instance: &ContainerInstance) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .containers
            .entry(instance.environment_id)
            .or_default()
            .insert(instance.service.clone(), instance.clone());
        Ok(())
    }

    async fn list_containers(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<Vec<ContainerInstance>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<ContainerInstance> = guard
            .containers
            .get(environment_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(out)
    }

    async fn delete_containers(&self, environment_id: &EnvironmentId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.containers.remove(environment_id);
        Ok(())
    }

    // ── Port leases ───────────────────────────────────────────────────────────

    async fn insert_port_leases(&self, leases: &[PortLease]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        for lease in leases {
            if guard.leases.contains_key(&lease.host_port) {
                return Err(StoreError::PortTaken(lease.host_port));
            }
        }
        for lease in leases {
            guard.leases.insert(lease.host_port, lease.clone());
        }
        Ok(())
    }

    async fn delete_port_leases(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.leases.retain(|_, l| l.environment_id != *environment_id);
        Ok(())
    }

    async fn list_port_leases(&self) -> Result<Vec<PortLease>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<PortLease> = guard.leases.values().cloned().collect();
        out.sort_by_key(|l| l.host_port);
        Ok(out)
    }

    // ── Metrics ───────────────────────────────────────────────────────────────

    async fn insert_metrics(&self, samples: &[MetricSample]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.metrics.extend_from_slice(samples);
        Ok(())
    }

    async fn list_metrics(
        &self,
        environment_id: &EnvironmentId,
        limit: u32,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let guard = self.inner.read().await;
        let filtered: Vec<MetricSample> = guard
            .metrics
            .iter()
            .filter(|m| m.environment_id == *environment_id)
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit as usize);
        Ok(filtered[start..].to_vec())
    }

    async fn prune_metrics_before(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.inner.write().await;
        let before = guard.metrics.len();
        guard.metrics.retain(|m| m.recorded_at >= horizon);
        Ok((before - guard.metrics.len()) as u64)
    }

    // ── Workspace archives ────────────────────────────────────────────────────

    async fn put_archive(
        &self,
        meta: &WorkspaceArchive,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.archives.insert(meta.id, (meta.clone(), data.to_vec()));
        Ok(())
    }

    async fn get_archive(
        &self,
        id: &ArchiveId,
    ) -> Result<Option<(WorkspaceArchive, Vec<u8>)>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.archives.get(id).cloned())
    }

    async fn delete_archive(&self, id: &ArchiveId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.archives.remove(id);
        Ok(())
    }

    async fn list_unreferenced_archives(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkspaceArchive>, StoreError> {
        let guard = self.inner.read().await;
        let referenced: Vec<ArchiveId> = guard
            .environments
            .values()
            .filter(|e| e.status != EnvironmentStatus::Destroyed)
            .filter_map(|e| e.archive_id)
            .collect();
        let mut out: Vec<WorkspaceArchive> = guard
            .archives
            .values()
            .map(|(meta, _)| meta.clone())
            .filter(|m| m.created_at < before && !referenced.contains(&m.id))
            .collect();
        out.sort_by_key(|m| m.created_at);
        out.truncate(limit as usize);
        Ok(out)
    }

    // ── Audit events ──────────────────────────────────────────────────────────

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        environment_id: Option<&EnvironmentId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let guard = self.inner.read().await;
        let filtered: Vec<AuditEvent> = guard
            .events
            .iter()
            .filter(|ev| environment_id.map_or(true, |id| ev.environment_id() == id))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit as usize);
        Ok(filtered[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loft_domain::{InfraKind, ResourceLimits};

    fn template(id: &str) -> Template {
        Template {
            id: TemplateId::new(id),
            name: id.to_string(),
            compose: "services:\n  app:\n    image: x\n".into(),
            iaas_template: None,
            iaas_variables: None,
            exposed_ports: vec![3000],
            limits: ResourceLimits { memory_mib: 1024, cpu_cores: 1.0 },
            infra: InfraKind::Local,
            region: None,
            visibility: Visibility::Public,
            owner: None,
        }
    }

    fn environment(owner: &str) -> Environment {
        Environment::new(&template("t"), "demo", OwnerId::new(owner), 8, Utc::now())
    }

    #[tokio::test]
    async fn insert_enforces_quota_atomically() {
        let store = InMemoryStore::new();
        store.insert_environment(&environment("alice"), 2).await.unwrap();
        store.insert_environment(&environment("alice"), 2).await.unwrap();

        let err = store.insert_environment(&environment("alice"), 2).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { count: 2, max: 2, .. }));

        // a different owner is unaffected
        store.insert_environment(&environment("bob"), 2).await.unwrap();
    }

    #[tokio::test]
    async fn destroyed_environments_do_not_count_against_quota() {
        let store = InMemoryStore::new();
        let mut env = environment("alice");
        store.insert_environment(&env, 1).await.unwrap();

        env.status = EnvironmentStatus::Destroyed;
        store.update_environment(&env).await.unwrap();

        store.insert_environment(&environment("alice"), 1).await.unwrap();
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let store = InMemoryStore::new();
        let env = environment("alice");
        store.insert_environment(&env, 5).await.unwrap();

        let fresh = store.update_environment(&env).await.unwrap();
        assert_eq!(fresh.version, 1);

        // writing with the old version is a conflict
        let err = store.update_environment(&env).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn lease_batch_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let env_a = EnvironmentId::random();
        let env_b = EnvironmentId::random();
        let lease = |port, env| PortLease {
            host_port: port,
            environment_id: env,
            leased_at: Utc::now(),
        };

        store.insert_port_leases(&[lease(8000, env_a)]).await.unwrap();

        let err = store
            .insert_port_leases(&[lease(8001, env_b), lease(8000, env_b)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PortTaken(8000)));

        // the non-colliding half of the failed batch was not written
        let leases = store.list_port_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].host_port, 8000);
    }

    #[tokio::test]
    async fn template_delete_refused_while_referenced() {
        let store = InMemoryStore::new();
        store.put_template(&template("t")).await.unwrap();
        let mut env = environment("alice");
        store.insert_environment(&env, 5).await.unwrap();

        let err = store.delete_template(&TemplateId::new("t")).await.unwrap_err();
        assert!(matches!(err, StoreError::TemplateInUse(_)));

        env.status = EnvironmentStatus::Destroyed;
        store.update_environment(&env).await.unwrap();
        store.delete_template(&TemplateId::new("t")).await.unwrap();
    }

    #[tokio::test]
    async fn private_templates_hidden_from_other_viewers() {
        let store = InMemoryStore::new();
        let mut t = template("mine");
        t.visibility = Visibility::Private;
        t.owner = Some(OwnerId::new("alice"));
        store.put_template(&t).await.unwrap();
        store.put_template(&template("shared")).await.unwrap();

        let alice = store.list_templates(Some(&OwnerId::new("alice"))).await.unwrap();
        assert_eq!(alice.len(), 2);
        let bob = store.list_templates(Some(&OwnerId::new("bob"))).await.unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].id.as_str(), "shared");
    }

    #[tokio::test]
    async fn unreferenced_archives_listed_for_gc() {
        let store = InMemoryStore::new();
        let mut env = environment("alice");
        let kept = WorkspaceArchive {
            id: ArchiveId::random(),
            environment_id: env.id,
            checksum: "aa".into(),
            created_at: Utc::now() - chrono::Duration::days(60),
        };
        let orphan = WorkspaceArchive {
            id: ArchiveId::random(),
            environment_id: env.id,
            checksum: "bb".into(),
            created_at: Utc::now() - chrono::Duration::days(60),
        };
        store.put_archive(&kept, b"kept").await.unwrap();
        store.put_archive(&orphan, b"orphan").await.unwrap();

        env.archive_id = Some(kept.id);
        store.insert_environment(&env, 5).await.unwrap();

        let gc = store
            .list_unreferenced_archives(Utc::now() - chrono::Duration::days(30), 100)
            .await
            .unwrap();
        assert_eq!(gc.len(), 1);
        assert_eq!(gc[0].id, orphan.id);
    }

    #[tokio::test]
    async fn metrics_prune_by_horizon() {
        let store = InMemoryStore::new();
        let env = EnvironmentId::random();
        let sample = |age_min: i64| MetricSample {
            environment_id: env,
            container_id: None,
            kind: loft_domain::MetricKind::Cpu,
            name: "cpu_usage_percent".into(),
            value: 10.0,
            unit: "percent".into(),
            recorded_at: Utc::now() - chrono::Duration::minutes(age_min),
        };
        store.insert_metrics(&[sample(120), sample(1)]).await.unwrap();

        let pruned = store
            .prune_metrics_before(Utc::now() - chrono::Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.list_metrics(&env, 10).await.unwrap().len(), 1);
    }
}
