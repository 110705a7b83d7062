use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loft_domain::{
    ArchiveId, AuditEvent, ContainerInstance, Environment, EnvironmentId, EnvironmentStatus,
    MetricSample, OwnerId, PortLease, Template, TemplateId, Visibility, WorkspaceArchive,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Repository;

// DDL — idempotent; run at every startup via migrate(). Foreign keys cascade
// from an environment to every row it owns.
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS templates (
    id         TEXT PRIMARY KEY,
    owner_id   TEXT,
    public     BOOLEAN NOT NULL,
    template   JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS environments (
    id            UUID PRIMARY KEY,
    owner_id      TEXT NOT NULL,
    -- no foreign key: DESTROYED rows outlive their template
    template_id   TEXT NOT NULL,
    status        TEXT NOT NULL,
    archive_id    UUID,
    last_accessed TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    version       BIGINT NOT NULL,
    state         JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_environments_owner ON environments (owner_id);
CREATE INDEX IF NOT EXISTS idx_environments_status ON environments (status);

CREATE TABLE IF NOT EXISTS container_instances (
    environment_id UUID NOT NULL REFERENCES environments (id) ON DELETE CASCADE,
    service        TEXT NOT NULL,
    instance       JSONB NOT NULL,
    PRIMARY KEY (environment_id, service)
);

-- leases are written before the CREATING row, so no foreign key here
CREATE TABLE IF NOT EXISTS port_leases (
    host_port      INT PRIMARY KEY,
    environment_id UUID NOT NULL,
    leased_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_port_leases_env ON port_leases (environment_id);

CREATE TABLE IF NOT EXISTS metric_samples (
    seq            BIGSERIAL PRIMARY KEY,
    environment_id UUID NOT NULL,
    recorded_at    TIMESTAMPTZ NOT NULL,
    sample         JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metric_samples_env
    ON metric_samples (environment_id, recorded_at DESC);
CREATE INDEX IF NOT EXISTS idx_metric_samples_time ON metric_samples (recorded_at);

CREATE TABLE IF NOT EXISTS workspace_archives (
    id             UUID PRIMARY KEY,
    environment_id UUID NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL,
    meta           JSONB NOT NULL,
    blob           BYTEA NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
    seq            BIGSERIAL PRIMARY KEY,
    environment_id UUID NOT NULL,
    event          JSONB NOT NULL,
    occurred_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_audit_events_env ON audit_events (environment_id);
"#;

/// Persistent repository backed by PostgreSQL.
///
/// Environment state lives in a JSONB column with the columns the core
/// queries by (owner, status, timestamps, version) lifted out and indexed.
/// Archive blobs are BYTEA.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run schema migrations. `url` is a standard libpq-style
    /// connection string.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| StoreError::Internal(format!("postgres connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// All DDL uses `IF NOT EXISTS`; safe to call on every startup.
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(MIGRATIONS)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(format!("migration: {e}")))?;
        Ok(())
    }
}

// ── Helper conversions ────────────────────────────────────────────────────────

fn to_json<T: serde::Serialize>(v: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(v).map_err(StoreError::Serialization)
}

fn from_json<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(v).map_err(StoreError::Serialization)
}

fn internal(e: sqlx::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

fn rows_to_environments(
    rows: Vec<(serde_json::Value,)>,
) -> Result<Vec<Environment>, StoreError> {
    rows.into_iter().map(|(v,)| from_json(v)).collect()
}

// ── Repository implementation ─────────────────────────────────────────────────

#[async_trait]
impl Repository for PostgresStore {
    // ── Templates ─────────────────────────────────────────────────────────────

    async fn get_template(&self, id: &TemplateId) -> Result<Option<Template>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT template FROM templates WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn list_templates(&self, viewer: Option<&OwnerId>) -> Result<Vec<Template>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = match viewer {
            Some(v) => sqlx::query_as(
                "SELECT template FROM templates
                 WHERE public OR owner_id = $1 ORDER BY id",
            )
            .bind(v.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?,
            None => sqlx::query_as("SELECT template FROM templates ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?,
        };
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn put_template(&self, template: &Template) -> Result<(), StoreError> {
        let json = to_json(template)?;
        let public = matches!(template.visibility, Visibility::Public);
        let owner = match (&template.visibility, &template.owner) {
            (Visibility::Owner(o), _) => Some(o.as_str().to_string()),
            (_, Some(o)) => Some(o.as_str().to_string()),
            _ => None,
        };
        sqlx::query(
            "INSERT INTO templates (id, owner_id, public, template, updated_at)
             VALUES ($1, $2, $3, $4::jsonb, NOW())
             ON CONFLICT (id) DO UPDATE
                 SET owner_id = EXCLUDED.owner_id,
                     public = EXCLUDED.public,
                     template = EXCLUDED.template,
                     updated_at = NOW()",
        )
        .bind(template.id.as_str())
        .bind(owner)
        .bind(public)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn delete_template(&self, id: &TemplateId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM templates
             WHERE id = $1
               AND NOT EXISTS (
                   SELECT 1 FROM environments
                   WHERE template_id = $1 AND status != 'DESTROYED')",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT id FROM templates WHERE id = $1")
                    .bind(id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(internal)?;
            return match exists {
                Some(_) => Err(StoreError::TemplateInUse(id.clone())),
                None => Err(StoreError::TemplateNotFound(id.to_string())),
            };
        }
        Ok(())
    }

    // ── Environments ──────────────────────────────────────────────────────────

    async fn get_environment(
        &self,
        id: &EnvironmentId,
    ) -> Result<Option<Environment>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT state FROM environments WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn list_environments(&self) -> Result<Vec<Environment>, StoreError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT state FROM environments ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
        rows_to_environments(rows)
    }

    async fn list_environments_by_owner(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<Environment>, StoreError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT state FROM environments WHERE owner_id = $1 ORDER BY id")
                .bind(owner.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
        rows_to_environments(rows)
    }

    async fn list_environments_by_status(
        &self,
        status: EnvironmentStatus,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT state FROM environments WHERE status = $1 ORDER BY updated_at LIMIT $2",
        )
        .bind(status.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows_to_environments(rows)
    }

    async fn list_running_accessed_before(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT state FROM environments
             WHERE status = 'RUNNING' AND last_accessed < $1
             ORDER BY last_accessed LIMIT $2",
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows_to_environments(rows)
    }

    async fn list_stale_transitional(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Environment>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT state FROM environments
             WHERE status IN ('CREATING', 'STARTING', 'STOPPING', 'DELETING')
               AND updated_at < $1
             ORDER BY updated_at LIMIT $2",
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows_to_environments(rows)
    }

    async fn insert_environment(
        &self,
        env: &Environment,
        max_per_owner: u32,
    ) -> Result<(), StoreError> {
        let json = to_json(env)?;
        let mut tx = self.pool.begin().await.map_err(internal)?;

        // Serialise racing creates for the same owner for the duration of the
        // transaction, then re-check the quota before inserting.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(env.owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(internal)?;

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM environments WHERE owner_id = $1 AND status != 'DESTROYED'",
        )
        .bind(env.owner.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(internal)?;

        if count as u32 >= max_per_owner {
            return Err(StoreError::QuotaExceeded {
                owner: env.owner.to_string(),
                count: count as u32,
                max: max_per_owner,
            });
        }

        sqlx::query(
            "INSERT INTO environments
                 (id, owner_id, template_id, status, archive_id,
                  last_accessed, updated_at, version, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::jsonb)",
        )
        .bind(env.id.as_uuid())
        .bind(env.owner.as_str())
        .bind(env.template_id.as_str())
        .bind(env.status.to_string())
        .bind(env.archive_id.map(|a| a.0))
        .bind(env.last_accessed_at)
        .bind(env.updated_at)
        .bind(env.version as i64)
        .bind(&json)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;

        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn update_environment(&self, env: &Environment) -> Result<Environment, StoreError> {
        let mut next = env.clone();
        next.version += 1;
        let json = to_json(&next)?;

        let result = sqlx::query(
            "UPDATE environments
             SET status = $2, archive_id = $3, last_accessed = $4,
                 updated_at = $5, version = $6, state = $7::jsonb
             WHERE id = $1 AND version = $8",
        )
        .bind(env.id.as_uuid())
        .bind(next.status.to_string())
        .bind(next.archive_id.map(|a| a.0))
        .bind(next.last_accessed_at)
        .bind(next.updated_at)
        .bind(next.version as i64)
        .bind(&json)
        .bind(env.version as i64)
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 {
            return match self.get_environment(&env.id).await? {
                Some(_) => Err(StoreError::VersionConflict {
                    environment_id: env.id.to_string(),
                    expected: env.version,
                }),
                None => Err(StoreError::EnvironmentNotFound(env.id.to_string())),
            };
        }
        Ok(next)
    }

    async fn count_non_destroyed(&self, owner: &OwnerId) -> Result<u32, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM environments WHERE owner_id = $1 AND status != 'DESTROYED'",
        )
        .bind(owner.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(count as u32)
    }

    // ── Container instances ───────────────────────────────────────────────────

    async fn upsert_container(&self, instance: &ContainerInstance) -> Result<(), StoreError> {
        let json = to_json(instance)?;
        sqlx::query(
            "INSERT INTO container_instances (environment_id, service, instance)
             VALUES ($1, $2, $3::jsonb)
             ON CONFLICT (environment_id, service)
                 DO UPDATE SET instance = EXCLUDED.instance",
        )
        .bind(instance.environment_id.as_uuid())
        .bind(&instance.service)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn list_containers(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<Vec<ContainerInstance>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT instance FROM container_instances
             WHERE environment_id = $1 ORDER BY service",
        )
        .bind(environment_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn delete_containers(&self, environment_id: &EnvironmentId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM container_instances WHERE environment_id = $1")
            .bind(environment_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    // ── Port leases ───────────────────────────────────────────────────────────

    async fn insert_port_leases(&self, leases: &[PortLease]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        for lease in leases {
            let result = sqlx::query(
                "INSERT INTO port_leases (host_port, environment_id, leased_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (host_port) DO NOTHING",
            )
            .bind(lease.host_port as i32)
            .bind(lease.environment_id.as_uuid())
            .bind(lease.leased_at)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
            if result.rows_affected() == 0 {
                // dropping the transaction rolls back the whole batch
                return Err(StoreError::PortTaken(lease.host_port));
            }
        }
        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn delete_port_leases(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM port_leases WHERE environment_id = $1")
            .bind(environment_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn list_port_leases(&self) -> Result<Vec<PortLease>, StoreError> {
        let rows: Vec<(i32, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT host_port, environment_id, leased_at FROM port_leases ORDER BY host_port",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows
            .into_iter()
            .map(|(port, env, at)| PortLease {
                host_port: port as u16,
                environment_id: EnvironmentId(env),
                leased_at: at,
            })
            .collect())
    }

    // ── Metrics ───────────────────────────────────────────────────────────────

    async fn insert_metrics(&self, samples: &[MetricSample]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        for sample in samples {
            let json = to_json(sample)?;
            sqlx::query(
                "INSERT INTO metric_samples (environment_id, recorded_at, sample)
                 VALUES ($1, $2, $3::jsonb)",
            )
            .bind(sample.environment_id.as_uuid())
            .bind(sample.recorded_at)
            .bind(&json)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
        }
        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn list_metrics(
        &self,
        environment_id: &EnvironmentId,
        limit: u32,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT sample FROM metric_samples
             WHERE environment_id = $1 ORDER BY seq DESC LIMIT $2",
        )
        .bind(environment_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        let mut samples: Vec<MetricSample> = rows
            .into_iter()
            .map(|(v,)| from_json(v))
            .collect::<Result<_, _>>()?;
        samples.reverse();
        Ok(samples)
    }

    async fn prune_metrics_before(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM metric_samples WHERE recorded_at < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }

    // ── Workspace archives ────────────────────────────────────────────────────

    async fn put_archive(
        &self,
        meta: &WorkspaceArchive,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let json = to_json(meta)?;
        sqlx::query(
            "INSERT INTO workspace_archives (id, environment_id, created_at, meta, blob)
             VALUES ($1, $2, $3, $4::jsonb, $5)
             ON CONFLICT (id) DO UPDATE
                 SET meta = EXCLUDED.meta, blob = EXCLUDED.blob",
        )
        .bind(meta.id.0)
        .bind(meta.environment_id.as_uuid())
        .bind(meta.created_at)
        .bind(&json)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_archive(
        &self,
        id: &ArchiveId,
    ) -> Result<Option<(WorkspaceArchive, Vec<u8>)>, StoreError> {
        let row: Option<(serde_json::Value, Vec<u8>)> =
            sqlx::query_as("SELECT meta, blob FROM workspace_archives WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
        row.map(|(meta, blob)| Ok((from_json(meta)?, blob))).transpose()
    }

    async fn delete_archive(&self, id: &ArchiveId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workspace_archives WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn list_unreferenced_archives(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkspaceArchive>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT a.meta FROM workspace_archives a
             WHERE a.created_at < $1
               AND NOT EXISTS (
                   SELECT 1 FROM environments e
                   WHERE e.archive_id = a.id AND e.status != 'DESTROYED')
             ORDER BY a.created_at LIMIT $2",
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    // ── Audit events ──────────────────────────────────────────────────────────

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let json = to_json(event)?;
        sqlx::query(
            "INSERT INTO audit_events (environment_id, event, occurred_at)
             VALUES ($1, $2::jsonb, NOW())",
        )
        .bind(event.environment_id().as_uuid())
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn list_events(
        &self,
        environment_id: Option<&EnvironmentId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        // Most recent `limit` events, reversed into chronological order so
        // both store implementations behave alike.
        let rows: Vec<(serde_json::Value,)> = match environment_id {
            Some(id) => sqlx::query_as(
                "SELECT event FROM audit_events WHERE environment_id = $1
                 ORDER BY seq DESC LIMIT $2",
            )
            .bind(id.as_uuid())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?,
            None => sqlx::query_as("SELECT event FROM audit_events ORDER BY seq DESC LIMIT $1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?,
        };
        let mut events: Vec<AuditEvent> = rows
            .into_iter()
            .map(|(v,)| from_json(v))
            .collect::<Result<_, _>>()?;
        events.reverse();
        Ok(events)
    }
}
