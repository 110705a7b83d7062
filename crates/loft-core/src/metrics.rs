use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use loft_domain::{Environment, EnvironmentStatus, MetricKind, MetricSample};
use loft_driver::{ContainerStatsSnapshot, DriverRegistry};
use loft_notifier::Notifier;
use loft_store::Repository;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BATCH: u32 = 100;

/// Polls container and host statistics on a fixed interval, persists the
/// samples, and forwards them to live subscribers.
///
/// Metrics are lossy by design: when one tick's persistence overruns the
/// interval, the next tick is skipped rather than letting a backlog build.
pub struct MetricsCollector {
    repo: Arc<dyn Repository>,
    registry: Arc<DriverRegistry>,
    notifier: Arc<Notifier>,
    guard: Arc<crate::ResourceGuard>,
    interval: Duration,
    lagging: AtomicBool,
    http: reqwest::Client,
}

impl MetricsCollector {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<DriverRegistry>,
        notifier: Arc<Notifier>,
        guard: Arc<crate::ResourceGuard>,
        interval: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            repo,
            registry,
            notifier,
            guard,
            interval,
            lagging: AtomicBool::new(false),
            http,
        }
    }

    pub fn run(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    pub async fn tick(&self) {
        if self.lagging.swap(false, Ordering::SeqCst) {
            debug!("previous metrics tick overran the interval; skipping this one");
            return;
        }
        let started = Instant::now();

        let environments = match self
            .repo
            .list_environments_by_status(EnvironmentStatus::Running, BATCH)
            .await
        {
            Ok(envs) => envs,
            Err(e) => {
                warn!(error = %e, "metrics tick could not list environments");
                return;
            }
        };

        let ambient = self.guard.snapshot();
        for env in &environments {
            let mut samples = Vec::new();

            if let Some(driver) = self.registry.container_driver(env.infra) {
                match driver.stats(env).await {
                    Ok(snapshots) => {
                        for snapshot in &snapshots {
                            samples.extend(container_samples(env, snapshot));
                        }
                    }
                    Err(e) => {
                        debug!(environment_id = %env.id, error = %e, "stats unavailable this tick");
                    }
                }
            }

            // system-wide ambient, stamped once per tick onto each environment
            let now = Utc::now();
            samples.push(MetricSample {
                environment_id: env.id,
                container_id: None,
                kind: MetricKind::Cpu,
                name: "infrastructure_cpu_percent".into(),
                value: ambient.cpu_used_percent,
                unit: "percent".into(),
                recorded_at: now,
            });
            samples.push(MetricSample {
                environment_id: env.id,
                container_id: None,
                kind: MetricKind::Memory,
                name: "infrastructure_memory_percent".into(),
                value: ambient.memory_used_percent,
                unit: "percent".into(),
                recorded_at: now,
            });

            self.probe_health(env).await;

            if let Err(e) = self.repo.insert_metrics(&samples).await {
                warn!(environment_id = %env.id, error = %e, "metric persistence failed");
                continue;
            }
            self.notifier.publish_metrics(env.id, &samples);
        }

        if started.elapsed() > self.interval {
            self.lagging.store(true, Ordering::SeqCst);
        }
    }

    /// Hit each instance's health URL and stamp the probe time.
    async fn probe_health(&self, env: &Environment) {
        let instances = match self.repo.list_containers(&env.id).await {
            Ok(list) => list,
            Err(_) => return,
        };
        for mut instance in instances {
            let Some(url) = instance.health_url.clone() else { continue };
            let healthy = matches!(
                self.http.get(&url).send().await,
                Ok(resp) if resp.status().is_success()
            );
            if !healthy {
                debug!(environment_id = %env.id, service = %instance.service, "health probe failed");
            }
            instance.last_probe_at = Some(Utc::now());
            if let Err(e) = self.repo.upsert_container(&instance).await {
                warn!(error = %e, "could not record health probe");
            }
        }
    }
}

fn container_samples(env: &Environment, snapshot: &ContainerStatsSnapshot) -> Vec<MetricSample> {
    let now = Utc::now();
    let sample = |kind: MetricKind, name: &str, value: f64, unit: &str| MetricSample {
        environment_id: env.id,
        container_id: Some(snapshot.container_id.clone()),
        kind,
        name: name.into(),
        value,
        unit: unit.into(),
        recorded_at: now,
    };
    vec![
        sample(MetricKind::Cpu, "cpu_usage_percent", snapshot.cpu_percent, "percent"),
        sample(MetricKind::Memory, "memory_used_mib", snapshot.memory_used_mib, "mib"),
        sample(MetricKind::Memory, "memory_limit_mib", snapshot.memory_limit_mib, "mib"),
        sample(MetricKind::Memory, "memory_usage_percent", snapshot.memory_percent, "percent"),
        sample(MetricKind::Network, "network_rx_mib", snapshot.network_rx_mib, "mib"),
        sample(MetricKind::Network, "network_tx_mib", snapshot.network_tx_mib, "mib"),
        sample(MetricKind::Disk, "disk_read_mib", snapshot.disk_read_mib, "mib"),
        sample(MetricKind::Disk, "disk_write_mib", snapshot.disk_write_mib, "mib"),
    ]
}
