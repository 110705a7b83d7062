use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;
use loft_domain::{
    ComposeService, ContainerInstance, ContainerStatus, Environment, EnvironmentId,
};
use tracing::{debug, info, warn};

use crate::driver::{
    ContainerStatsSnapshot, Driver, LogLine, LogStream, ProvisionContext, ProvisionOutcome,
};
use crate::error::DriverError;
use crate::providers::{LocalHooks, ProviderHooks};

const LABEL_ENVIRONMENT: &str = "loft.environment-id";
const LABEL_SERVICE: &str = "loft.service";
const LABEL_OWNER: &str = "loft.owner";
const LABEL_START_ORDER: &str = "loft.start-order";

/// Container driver over the local engine API.
///
/// All state the driver needs at stop/teardown time is recovered from
/// engine labels, so the operations stay idempotent across restarts.
/// Operations are bracketed by the LOCAL hook set, so the pipeline shape is
/// the same one cloud drivers run.
pub struct ComposeDriver {
    docker: Docker,
    hooks: Arc<dyn ProviderHooks>,
    /// Timeout applied to each engine interaction.
    op_timeout: Duration,
}

impl ComposeDriver {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            hooks: Arc::new(LocalHooks::new()),
            op_timeout: Duration::from_secs(300),
        }
    }

    pub fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Engine(format!("connect to engine: {e}")))?;
        Ok(Self::new(docker))
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ProviderHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    fn hook_failed(hook: &str, e: DriverError) -> DriverError {
        DriverError::HookFailed { hook: hook.to_string(), reason: e.to_string() }
    }

    async fn with_timeout<T, F>(&self, step: &str, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        tokio::time::timeout(self.op_timeout, fut).await.map_err(|_| DriverError::Timeout {
            step: step.to_string(),
            seconds: self.op_timeout.as_secs(),
        })?
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!(image, "image already present");
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                info!(image, "image not present, pulling");
            }
            Err(e) => {
                warn!(image, error = %e, "image inspect failed, attempting pull");
            }
        }

        let options = CreateImageOptions { from_image: image, ..Default::default() };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| DriverError::Engine(format!("pull {image}: {e}")))?;
        }
        Ok(())
    }

    async fn create_service_container(
        &self,
        ctx: &ProvisionContext,
        service_name: &str,
        service: &ComposeService,
        start_order: usize,
        network: &str,
    ) -> Result<ContainerInstance, DriverError> {
        let env_id = ctx.environment.id;
        let name = container_name(&env_id, service_name);

        self.with_timeout(&format!("pull {service_name}"), self.ensure_image(&service.image))
            .await?;

        let env_vars: Vec<String> = service
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let (exposed_ports, port_bindings) = port_config(service, &ctx.port_map);

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            memory: Some(ctx.template.limits.memory_mib as i64 * 1024 * 1024),
            nano_cpus: Some((ctx.template.limits.cpu_cores * 1e9) as i64),
            network_mode: Some(network.to_string()),
            binds: volume_binds(&env_id, service),
            ..Default::default()
        };

        let config = Config {
            image: Some(service.image.clone()),
            env: Some(env_vars),
            labels: Some(container_labels(ctx, service_name, start_order)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: name.as_str(), platform: None };
        let created = self
            .with_timeout(&format!("create {service_name}"), async {
                self.docker
                    .create_container(Some(options), config)
                    .await
                    .map_err(|e| DriverError::Engine(format!("create {name}: {e}")))
            })
            .await?;

        self.with_timeout(&format!("start {service_name}"), async {
            self.docker
                .start_container::<String>(&name, None)
                .await
                .map_err(|e| DriverError::Engine(format!("start {name}: {e}")))
        })
        .await?;

        let mut instance = ContainerInstance::new(env_id, service_name);
        instance.engine_id = Some(created.id);
        instance.status = ContainerStatus::Running;
        instance.container_port = service.ports.first().map(|p| p.container);
        instance.host_port = service
            .ports
            .first()
            .and_then(|p| ctx.port_map.get(&p.container))
            .copied();
        instance.health_url = service.health_url.clone();
        info!(environment_id = %env_id, service = service_name, "container started");
        Ok(instance)
    }

    /// Containers labelled with this environment id, newest state included.
    async fn list_owned(&self, env_id: &EnvironmentId) -> Result<Vec<ContainerSummary>, DriverError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_ENVIRONMENT}={env_id}")],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        self.docker
            .list_containers(Some(options))
            .await
            .map_err(|e| DriverError::Engine(format!("list containers: {e}")))
    }

    fn network_name(env_id: &EnvironmentId) -> String {
        format!("loft-{env_id}")
    }
}

#[async_trait]
impl Driver for ComposeDriver {
    fn name(&self) -> &'static str {
        "compose"
    }

    async fn provision(&self, ctx: &ProvisionContext) -> Result<ProvisionOutcome, DriverError> {
        let doc = ctx
            .document
            .as_ref()
            .ok_or_else(|| DriverError::Internal("compose driver needs a document".into()))?;
        if !self.hooks.validate_template(&ctx.template.compose) {
            return Err(DriverError::TemplateRejected {
                kind: self.hooks.kind(),
                reason: "provider validation failed".into(),
            });
        }
        self.hooks
            .pre_provision(&ctx.environment)
            .await
            .map_err(|e| Self::hook_failed("pre_provision", e))?;

        let order = loft_graph::service_order(doc)?;
        let env_id = ctx.environment.id;

        let network = Self::network_name(&env_id);
        self.with_timeout("create network", async {
            let options = CreateNetworkOptions {
                name: network.clone(),
                driver: "bridge".to_string(),
                labels: HashMap::from([(
                    LABEL_ENVIRONMENT.to_string(),
                    env_id.to_string(),
                )]),
                ..Default::default()
            };
            match self.docker.create_network(options).await {
                Ok(_) => Ok(()),
                // already there from a previous attempt
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                }) => Ok(()),
                Err(e) => Err(DriverError::Engine(format!("create network {network}: {e}"))),
            }
        })
        .await?;

        let mut containers = Vec::with_capacity(order.startup.len());
        for (idx, service_name) in order.startup.iter().enumerate() {
            let service = doc
                .service(service_name)
                .ok_or_else(|| DriverError::Internal(format!("service {service_name} vanished")))?;
            let instance = self
                .create_service_container(ctx, service_name, service, idx, &network)
                .await?;
            containers.push(instance);
        }

        // containers are up; a post-hook failure is logged, never rolled back
        if let Err(e) = self.hooks.post_provision(&ctx.environment).await {
            warn!(environment_id = %env_id, error = %e, "post_provision hook failed");
        }

        Ok(ProvisionOutcome { containers, ..Default::default() })
    }

    async fn start(&self, env: &Environment) -> Result<(), DriverError> {
        self.hooks
            .start_resources(env)
            .await
            .map_err(|e| Self::hook_failed("start_resources", e))?;
        let mut owned = self.list_owned(&env.id).await?;
        sort_by_start_order(&mut owned, false);
        for summary in owned {
            let Some(id) = summary.id else { continue };
            self.with_timeout("start container", async {
                match self.docker.start_container::<String>(&id, None).await {
                    Ok(_) => Ok(()),
                    // already running
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 304, ..
                    }) => Ok(()),
                    Err(e) => Err(DriverError::Engine(format!("start {id}: {e}"))),
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn stop(&self, env: &Environment, grace: Duration) -> Result<(), DriverError> {
        self.hooks
            .stop_resources(env)
            .await
            .map_err(|e| Self::hook_failed("stop_resources", e))?;
        let mut owned = self.list_owned(&env.id).await?;
        sort_by_start_order(&mut owned, true);
        let options = StopContainerOptions { t: grace.as_secs() as i64 };
        for summary in owned {
            let Some(id) = summary.id else { continue };
            self.with_timeout("stop container", async {
                match self.docker.stop_container(&id, Some(options)).await {
                    Ok(_) => Ok(()),
                    // already stopped / gone
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 304 | 404,
                        ..
                    }) => Ok(()),
                    Err(e) => Err(DriverError::Engine(format!("stop {id}: {e}"))),
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn teardown(&self, env: &Environment) -> Result<(), DriverError> {
        self.hooks
            .pre_destroy(env)
            .await
            .map_err(|e| Self::hook_failed("pre_destroy", e))?;
        let mut owned = self.list_owned(&env.id).await?;
        sort_by_start_order(&mut owned, true);
        for summary in owned {
            let Some(id) = summary.id else { continue };
            self.with_timeout("remove container", async {
                let options = RemoveContainerOptions { force: true, ..Default::default() };
                match self.docker.remove_container(&id, Some(options)).await {
                    Ok(_) => Ok(()),
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404, ..
                    }) => Ok(()),
                    Err(e) => Err(DriverError::Engine(format!("remove {id}: {e}"))),
                }
            })
            .await?;
        }

        let network = Self::network_name(&env.id);
        match self.docker.remove_network(&network).await {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(DriverError::Engine(format!("remove network {network}: {e}"))),
        }

        if let Err(e) = self.hooks.post_destroy(env).await {
            warn!(environment_id = %env.id, error = %e, "post_destroy hook failed");
        }
        Ok(())
    }

    async fn stats(&self, env: &Environment) -> Result<Vec<ContainerStatsSnapshot>, DriverError> {
        let owned = self.list_owned(&env.id).await?;
        let mut snapshots = Vec::with_capacity(owned.len());
        for summary in owned {
            let (Some(id), Some(labels)) = (summary.id, summary.labels) else { continue };
            let service = labels.get(LABEL_SERVICE).cloned().unwrap_or_default();
            // one sample with precpu filled; no streaming
            let options = StatsOptions { stream: false, one_shot: false };
            let mut stream = self.docker.stats(&id, Some(options));
            match stream.next().await {
                Some(Ok(stats)) => snapshots.push(snapshot_from_stats(id, service, &stats)),
                Some(Err(e)) => {
                    debug!(container = %id, error = %e, "stats read failed, skipping container");
                }
                None => {}
            }
        }
        Ok(snapshots)
    }

    async fn logs(
        &self,
        env: &Environment,
        service: Option<&str>,
        tail: u32,
        follow: bool,
    ) -> Result<LogStream, DriverError> {
        let owned = self.list_owned(&env.id).await?;
        let mut streams = Vec::new();
        for summary in owned {
            let (Some(id), Some(labels)) = (summary.id, summary.labels) else { continue };
            let svc = labels.get(LABEL_SERVICE).cloned().unwrap_or_default();
            if let Some(wanted) = service {
                if svc != wanted {
                    continue;
                }
            }
            let options = LogsOptions::<String> {
                follow,
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            };
            let stream: LogStream =
                Box::pin(self.docker.logs(&id, Some(options)).filter_map(move |item| {
                    let svc = svc.clone();
                    async move {
                        match item {
                            Ok(output) => Some(LogLine {
                                service: svc,
                                line: String::from_utf8_lossy(&output.into_bytes())
                                    .trim_end()
                                    .to_string(),
                                at: Utc::now(),
                            }),
                            Err(_) => None,
                        }
                    }
                }));
            streams.push(stream);
        }
        Ok(Box::pin(futures_util::stream::select_all(streams)))
    }
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

fn container_name(env_id: &EnvironmentId, service: &str) -> String {
    // first uuid segment keeps names readable while staying unique per env
    let id = env_id.to_string();
    let short = id.split('-').next().unwrap_or(&id).to_string();
    format!("loft-{short}-{service}")
}

fn container_labels(
    ctx: &ProvisionContext,
    service: &str,
    start_order: usize,
) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_ENVIRONMENT.to_string(), ctx.environment.id.to_string()),
        (LABEL_SERVICE.to_string(), service.to_string()),
        (LABEL_OWNER.to_string(), ctx.environment.owner.to_string()),
        (LABEL_START_ORDER.to_string(), start_order.to_string()),
    ])
}

type PortBindings = HashMap<String, Option<Vec<PortBinding>>>;

fn port_config(
    service: &ComposeService,
    port_map: &std::collections::BTreeMap<u16, u16>,
) -> (HashMap<String, HashMap<(), ()>>, PortBindings) {
    let mut exposed = HashMap::new();
    let mut bindings: PortBindings = HashMap::new();
    for mapping in &service.ports {
        let key = format!("{}/tcp", mapping.container);
        exposed.insert(key.clone(), HashMap::new());
        if let Some(host_port) = port_map.get(&mapping.container) {
            bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }
    }
    (exposed, bindings)
}

fn volume_binds(env_id: &EnvironmentId, service: &ComposeService) -> Option<Vec<String>> {
    if service.volumes.is_empty() {
        return None;
    }
    Some(
        service
            .volumes
            .iter()
            .map(|v| {
                // named volumes are scoped to the environment
                let source = if v.source.starts_with('/') || v.source.starts_with('.') {
                    v.source.clone()
                } else {
                    format!("loft-{env_id}-{}", v.source)
                };
                let mut bind = format!("{source}:{}", v.target);
                if v.read_only {
                    bind.push_str(":ro");
                }
                bind
            })
            .collect(),
    )
}

fn sort_by_start_order(containers: &mut [ContainerSummary], reverse: bool) {
    containers.sort_by_key(|c| {
        c.labels
            .as_ref()
            .and_then(|l| l.get(LABEL_START_ORDER))
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(i64::MAX)
    });
    if reverse {
        containers.reverse();
    }
}

fn snapshot_from_stats(
    container_id: String,
    service: String,
    stats: &bollard::container::Stats,
) -> ContainerStatsSnapshot {
    const MIB: f64 = 1024.0 * 1024.0;

    let memory_used = stats.memory_stats.usage.unwrap_or(0) as f64 / MIB;
    let memory_limit = stats.memory_stats.limit.unwrap_or(0) as f64 / MIB;
    let memory_percent = if memory_limit > 0.0 {
        memory_used / memory_limit * 100.0
    } else {
        0.0
    };

    let (mut rx, mut tx) = (0u64, 0u64);
    if let Some(networks) = &stats.networks {
        for net in networks.values() {
            rx += net.rx_bytes;
            tx += net.tx_bytes;
        }
    }

    let (mut disk_read, mut disk_write) = (0u64, 0u64);
    if let Some(entries) = &stats.blkio_stats.io_service_bytes_recursive {
        for entry in entries {
            match entry.op.to_ascii_lowercase().as_str() {
                "read" => disk_read += entry.value,
                "write" => disk_write += entry.value,
                _ => {}
            }
        }
    }

    ContainerStatsSnapshot {
        container_id,
        service,
        cpu_percent: cpu_percent(stats),
        memory_used_mib: memory_used,
        memory_limit_mib: memory_limit,
        memory_percent,
        network_rx_mib: rx as f64 / MIB,
        network_tx_mib: tx as f64 / MIB,
        disk_read_mib: disk_read as f64 / MIB,
        disk_write_mib: disk_write as f64 / MIB,
    }
}

/// (container_cpu_delta / system_cpu_delta) × online cpus × 100, capped at
/// 100% per core. Deltas come from the `precpu` half of the same sample.
fn cpu_percent(stats: &bollard::container::Stats) -> f64 {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
    let cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;

    if system_delta > 0 && cpu_delta > 0 {
        ((cpu_delta as f64 / system_delta as f64) * 100.0 * cpus).min(100.0 * cpus)
    } else {
        0.0
    }
}
