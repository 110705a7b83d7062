use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use loft_api::build_app;
use loft_config::Settings;
use loft_core::{MetricsCollector, Orchestrator, PortAllocator, Reaper, ResourceGuard};
use loft_domain::InfraKind;
use loft_driver::providers::{AwsHooks, AzureHooks, GcpHooks};
use loft_driver::{CloudDriver, ComposeDriver, DriverRegistry, IaasToolRunner};
use loft_notifier::Notifier;
use loft_store::{InMemoryStore, PostgresStore, Repository};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ServeOptions {
    pub bind: String,
    pub port: u16,
    pub default_cloud: String,
    pub no_engine: bool,
    pub aws_region: String,
    pub azure_location: String,
    pub gcp_project: Option<String>,
    pub gcp_region: String,
}

pub async fn serve(options: ServeOptions) -> Result<()> {
    let settings = Settings::from_env().context("reading ORCH_* settings")?;

    let repo: Arc<dyn Repository> = match &settings.database_url {
        Some(url) => {
            info!("connecting to postgres");
            Arc::new(PostgresStore::connect(url).await.context("postgres connect")?)
        }
        None => {
            warn!("ORCH_DATABASE_URL not set; using the in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let default_cloud = parse_cloud(&options.default_cloud)?;
    let mut registry = DriverRegistry::new(default_cloud);

    if options.no_engine {
        info!("container engine disabled by flag");
    } else {
        match ComposeDriver::connect() {
            Ok(driver) => {
                registry.register(InfraKind::Local, Arc::new(driver));
            }
            Err(e) => warn!(error = %e, "container engine unavailable; LOCAL templates disabled"),
        }
    }

    let runner = IaasToolRunner::new(settings.iaas_bin.clone(), settings.archive_dir.clone());
    registry.register(
        InfraKind::Aws,
        Arc::new(CloudDriver::new(
            runner.clone(),
            Arc::new(AwsHooks::new(options.aws_region.clone())),
            repo.clone(),
        )),
    );
    registry.register(
        InfraKind::Azure,
        Arc::new(CloudDriver::new(
            runner.clone(),
            Arc::new(AzureHooks::new(options.azure_location.clone())),
            repo.clone(),
        )),
    );
    if let Some(project) = &options.gcp_project {
        registry.register(
            InfraKind::Gcp,
            Arc::new(CloudDriver::new(
                runner.clone(),
                Arc::new(GcpHooks::new(project.clone(), options.gcp_region.clone())),
                repo.clone(),
            )),
        );
    }
    let registry = Arc::new(registry);

    // Process-wide singletons, initialised here and torn down on shutdown.
    let notifier = Arc::new(Notifier::default());
    let ports = Arc::new(PortAllocator::new(settings.port_range, repo.clone()).await?);
    let guard = Arc::new(ResourceGuard::new(
        settings.cpu_cap_pct,
        settings.mem_cap_pct,
        settings.disk_cap_pct,
    ));
    {
        let guard = guard.clone();
        tokio::task::spawn_blocking(move || guard.refresh_from_host())
            .await
            .context("initial host snapshot")?;
    }

    let orchestrator = Arc::new(Orchestrator::new(
        repo.clone(),
        registry.clone(),
        notifier.clone(),
        ports,
        guard.clone(),
        settings.max_environments_per_owner,
        settings.reap_idle_hours,
    ));
    orchestrator.warm_admission().await?;

    let shutdown = CancellationToken::new();
    let snapshot_task = guard.clone().spawn_refresh(Duration::from_secs(30), shutdown.clone());
    let collector = Arc::new(MetricsCollector::new(
        repo.clone(),
        registry.clone(),
        notifier.clone(),
        guard.clone(),
        settings.metrics_interval,
    ));
    let metrics_task = collector.run(shutdown.clone());
    let reaper = Arc::new(Reaper::new(
        orchestrator.clone(),
        repo.clone(),
        settings.archive_retention_days,
    ));
    let reaper_task = reaper.run(shutdown.clone());

    let app = build_app(orchestrator);
    let listener = tokio::net::TcpListener::bind((options.bind.as_str(), options.port))
        .await
        .with_context(|| format!("bind {}:{}", options.bind, options.port))?;
    info!(bind = %options.bind, port = options.port, "loft listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // drain the timers before exiting
    shutdown.cancel();
    for task in [snapshot_task, metrics_task, reaper_task] {
        let _ = task.await;
    }
    Ok(())
}

pub fn validate(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let document = loft_config::parse_compose(&text)?;
    let order = loft_graph::service_order(&document)?;
    println!(
        "ok: {} services, startup order: {}",
        document.services.len(),
        order.startup.join(" → ")
    );
    Ok(())
}

fn parse_cloud(value: &str) -> Result<InfraKind> {
    match value.to_ascii_lowercase().as_str() {
        "aws" => Ok(InfraKind::Aws),
        "azure" => Ok(InfraKind::Azure),
        "gcp" => Ok(InfraKind::Gcp),
        other => bail!("unsupported default cloud '{other}' (expected aws, azure or gcp)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_names_parse() {
        assert_eq!(parse_cloud("aws").unwrap(), InfraKind::Aws);
        assert_eq!(parse_cloud("AZURE").unwrap(), InfraKind::Azure);
        assert_eq!(parse_cloud("gcp").unwrap(), InfraKind::Gcp);
        assert!(parse_cloud("digitalocean").is_err());
    }
}
