use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use loft_core::{Caller, HostSnapshot, Orchestrator, PortAllocator, Reaper, ResourceGuard};
use loft_domain::{
    AuditEvent, ContainerInstance, ContainerStatus, Environment, EnvironmentStatus, InfraKind,
    OwnerId, ResourceLimits, Template, TemplateId, Visibility,
};
use loft_driver::{Driver, DriverError, DriverRegistry, ProvisionContext, ProvisionOutcome};
use loft_notifier::Notifier;
use loft_store::{InMemoryStore, Repository};

// ── Scripted driver ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    provisions: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    teardowns: AtomicUsize,
}

struct StubDriver {
    counters: Arc<Counters>,
    fail_provision_with: Option<String>,
}

impl StubDriver {
    fn ok(counters: Arc<Counters>) -> Self {
        Self { counters, fail_provision_with: None }
    }

    fn failing(counters: Arc<Counters>, tail: &str) -> Self {
        Self { counters, fail_provision_with: Some(tail.to_string()) }
    }
}

#[async_trait]
impl Driver for StubDriver {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn provision(&self, ctx: &ProvisionContext) -> Result<ProvisionOutcome, DriverError> {
        self.counters.provisions.fetch_add(1, Ordering::SeqCst);
        if let Some(tail) = &self.fail_provision_with {
            return Err(DriverError::IaasTool { step: "apply".into(), tail: tail.clone() });
        }
        let mut containers = Vec::new();
        if let Some(doc) = &ctx.document {
            for (name, svc) in &doc.services {
                let mut instance = ContainerInstance::new(ctx.environment.id, name.as_str());
                instance.engine_id = Some(format!("engine-{name}"));
                instance.status = ContainerStatus::Running;
                instance.container_port = svc.ports.first().map(|p| p.container);
                instance.host_port = svc
                    .ports
                    .first()
                    .and_then(|p| ctx.port_map.get(&p.container))
                    .copied();
                containers.push(instance);
            }
        }
        Ok(ProvisionOutcome { containers, resources: BTreeMap::new(), archive_id: None })
    }

    async fn start(&self, _env: &Environment) -> Result<(), DriverError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _env: &Environment, _grace: Duration) -> Result<(), DriverError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self, _env: &Environment) -> Result<(), DriverError> {
        self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

const COMPOSE: &str = r#"
services:
  backend:
    image: node:20
    ports: ["3000:3000"]
    depends_on: [db]
  frontend:
    image: nginx:1.27
    ports: ["3001:3001"]
    depends_on: [backend]
  db:
    image: postgres:16
    ports: ["5432:5432"]
"#;

fn local_template() -> Template {
    Template {
        id: TemplateId::new("nodejs-react-dev"),
        name: "Node.js + React".into(),
        compose: COMPOSE.into(),
        iaas_template: None,
        iaas_variables: None,
        exposed_ports: vec![3000, 3001, 5432],
        limits: ResourceLimits { memory_mib: 2048, cpu_cores: 2.0 },
        infra: InfraKind::Local,
        region: None,
        visibility: Visibility::Public,
        owner: None,
    }
}

fn cloud_template() -> Template {
    Template {
        id: TemplateId::new("aws-dev"),
        name: "AWS dev stack".into(),
        compose: String::new(),
        iaas_template: Some("resource \"aws_instance\" \"dev\" {}".into()),
        iaas_variables: None,
        exposed_ports: vec![3000],
        limits: ResourceLimits { memory_mib: 1024, cpu_cores: 1.0 },
        infra: InfraKind::Aws,
        region: Some("eu-west-1".into()),
        visibility: Visibility::Public,
        owner: None,
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<InMemoryStore>,
    counters: Arc<Counters>,
}

async fn harness_with(
    max_per_owner: u32,
    port_range: (u16, u16),
    cloud_tail: Option<&str>,
) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let counters = Arc::new(Counters::default());

    let mut registry = DriverRegistry::new(InfraKind::Aws);
    registry.register(InfraKind::Local, Arc::new(StubDriver::ok(counters.clone())));
    match cloud_tail {
        Some(tail) => {
            registry.register(InfraKind::Aws, Arc::new(StubDriver::failing(counters.clone(), tail)))
        }
        None => registry.register(InfraKind::Aws, Arc::new(StubDriver::ok(counters.clone()))),
    };

    let guard = Arc::new(ResourceGuard::new(80.0, 80.0, 85.0));
    guard.update_snapshot(HostSnapshot {
        total_cpus: 64.0,
        cpu_used_percent: 5.0,
        memory_total_mib: 131_072.0,
        memory_used_percent: 10.0,
        disk_used_percent: 20.0,
    });

    let ports = Arc::new(
        PortAllocator::new(port_range, store.clone() as Arc<dyn Repository>)
            .await
            .unwrap(),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(Notifier::default()),
        ports,
        guard,
        max_per_owner,
        8,
    ));

    Harness { orchestrator, store, counters }
}

async fn harness() -> Harness {
    harness_with(5, (8000, 9000), None).await
}

fn alice() -> Caller {
    Caller::User(OwnerId::new("alice"))
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_happy_path_local() {
    let h = harness().await;
    h.store.put_template(&local_template()).await.unwrap();

    let handle = h
        .orchestrator
        .create(&alice(), &TemplateId::new("nodejs-react-dev"), "demo")
        .await
        .unwrap();
    assert_eq!(handle.environment.status, EnvironmentStatus::Creating);
    handle.task.await.unwrap();

    let env = h
        .orchestrator
        .get_environment(&alice(), handle.environment.id)
        .await
        .unwrap();
    assert_eq!(env.status, EnvironmentStatus::Running);
    assert_eq!(env.port_map.len(), 3);
    for host_port in env.port_map.values() {
        assert!((8000..=9000).contains(host_port), "port {host_port} outside range");
    }

    let containers = h.store.list_containers(&env.id).await.unwrap();
    let services: Vec<&str> = containers.iter().map(|c| c.service.as_str()).collect();
    assert_eq!(services, vec!["backend", "db", "frontend"]);
    assert!(containers.iter().all(|c| c.invariant_holds()));

    // the stored status history is a legal path of the machine
    let events = h.store.list_events(Some(&env.id), 100).await.unwrap();
    let transitions: Vec<(EnvironmentStatus, EnvironmentStatus)> = events
        .iter()
        .filter_map(|e| match e {
            AuditEvent::StatusChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![(EnvironmentStatus::Creating, EnvironmentStatus::Running)]
    );
    for (from, to) in transitions {
        assert!(from.can_transition_to(to));
    }
}

#[tokio::test]
async fn quota_guard_rejects_the_third_create() {
    let h = harness_with(2, (8000, 9000), None).await;
    h.store.put_template(&local_template()).await.unwrap();
    let template_id = TemplateId::new("nodejs-react-dev");

    for name in ["one", "two"] {
        let handle = h.orchestrator.create(&alice(), &template_id, name).await.unwrap();
        handle.task.await.unwrap();
    }

    let err = h.orchestrator.create(&alice(), &template_id, "three").await.unwrap_err();
    assert_eq!(err.code(), "QUOTA_EXCEEDED");

    // no third row, and the rejected create leaked no leases
    assert_eq!(h.store.list_environments().await.unwrap().len(), 2);
    assert_eq!(h.store.list_port_leases().await.unwrap().len(), 6);
}

#[tokio::test]
async fn port_exhaustion_and_reuse() {
    let h = harness_with(5, (8000, 8001), None).await;
    let mut template = local_template();
    template.id = TemplateId::new("single-port");
    template.exposed_ports = vec![3000];
    template.compose = "services:\n  app:\n    image: node:20\n    ports: [\"3000:3000\"]\n".into();
    h.store.put_template(&template).await.unwrap();
    let template_id = TemplateId::new("single-port");

    let first = h.orchestrator.create(&alice(), &template_id, "one").await.unwrap();
    first.task.await.unwrap();
    let second = h.orchestrator.create(&alice(), &template_id, "two").await.unwrap();
    second.task.await.unwrap();

    let err = h.orchestrator.create(&alice(), &template_id, "three").await.unwrap_err();
    assert_eq!(err.code(), "NO_FREE_PORTS");

    // destroying the first environment frees its port for the next create
    let delete = h.orchestrator.delete(&alice(), first.environment.id).await.unwrap();
    delete.task.await.unwrap();

    let fourth = h.orchestrator.create(&alice(), &template_id, "four").await.unwrap();
    fourth.task.await.unwrap();
    let env = h.orchestrator.get_environment(&alice(), fourth.environment.id).await.unwrap();
    assert_eq!(env.port_map.get(&3000), Some(&8000), "lowest freed port is reused");
}

#[tokio::test]
async fn iaas_failure_leaves_failed_with_reason() {
    let tail = "Error: creating EC2 instance: InvalidAMIID.NotFound";
    let h = harness_with(5, (8000, 9000), Some(tail)).await;
    h.store.put_template(&cloud_template()).await.unwrap();

    let handle = h
        .orchestrator
        .create(&alice(), &TemplateId::new("aws-dev"), "cloudy")
        .await
        .unwrap();
    handle.task.await.unwrap();

    let env = h.orchestrator.get_environment(&alice(), handle.environment.id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Failed);
    assert!(env.resource_map.is_empty());
    assert!(env.port_map.is_empty());
    assert!(env.status_reason.as_deref().unwrap_or_default().contains(tail));

    // reserved ports were returned on failure
    assert!(h.store.list_port_leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn idle_auto_stop_then_restart_without_reprovision() {
    let h = harness().await;
    h.store.put_template(&local_template()).await.unwrap();

    let handle = h
        .orchestrator
        .create(&alice(), &TemplateId::new("nodejs-react-dev"), "sleepy")
        .await
        .unwrap();
    handle.task.await.unwrap();

    // two hours idle with a one-hour threshold
    let mut env = h.store.get_environment(&handle.environment.id).await.unwrap().unwrap();
    env.auto_stop_after_hours = 1;
    env.last_accessed_at = Utc::now() - chrono::Duration::hours(2);
    h.store.update_environment(&env).await.unwrap();

    let reaper = Reaper::new(h.orchestrator.clone(), h.store.clone(), 30);
    assert_eq!(reaper.scan_idle().await, 1);

    let env = h.orchestrator.get_environment(&alice(), env.id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Stopped);

    let restarted = h.orchestrator.start(&alice(), env.id).await.unwrap();
    restarted.task.await.unwrap();
    let env = h.orchestrator.get_environment(&alice(), env.id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Running);

    // started, not re-provisioned
    assert_eq!(h.counters.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_stops_cannot_both_win() {
    let h = harness().await;
    h.store.put_template(&local_template()).await.unwrap();

    let handle = h
        .orchestrator
        .create(&alice(), &TemplateId::new("nodejs-react-dev"), "contested")
        .await
        .unwrap();
    handle.task.await.unwrap();
    let env_id = handle.environment.id;

    let caller = alice();
    let (a, b) = tokio::join!(
        h.orchestrator.stop(&caller, env_id),
        h.orchestrator.stop(&caller, env_id),
    );

    let (winner, loser) = match (a, b) {
        (Ok(w), Err(l)) => (w, l),
        (Err(l), Ok(w)) => (w, l),
        (Ok(_), Ok(_)) => panic!("both stops succeeded"),
        (Err(a), Err(b)) => panic!("no stop succeeded: {a} / {b}"),
    };
    assert!(matches!(loser.code(), "INVALID_STATE" | "CONFLICT"));

    winner.task.await.unwrap();
    let env = h.orchestrator.get_environment(&alice(), env_id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Stopped);
    assert_eq!(h.counters.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn teardown_is_complete() {
    let h = harness().await;
    h.store.put_template(&local_template()).await.unwrap();

    let handle = h
        .orchestrator
        .create(&alice(), &TemplateId::new("nodejs-react-dev"), "doomed")
        .await
        .unwrap();
    handle.task.await.unwrap();
    let env_id = handle.environment.id;

    let delete = h.orchestrator.delete(&alice(), env_id).await.unwrap();
    delete.task.await.unwrap();

    let env = h.store.get_environment(&env_id).await.unwrap().unwrap();
    assert_eq!(env.status, EnvironmentStatus::Destroyed);
    assert!(env.port_map.is_empty());
    assert!(env.resource_map.is_empty());
    assert!(env.archive_id.is_none());
    assert!(h.store.list_containers(&env_id).await.unwrap().is_empty());
    assert!(h.store.list_port_leases().await.unwrap().is_empty());
    assert_eq!(h.counters.teardowns.load(Ordering::SeqCst), 1);

    // deleting again is refused
    let err = h.orchestrator.delete(&alice(), env_id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn foreign_environments_are_forbidden() {
    let h = harness().await;
    h.store.put_template(&local_template()).await.unwrap();

    let handle = h
        .orchestrator
        .create(&alice(), &TemplateId::new("nodejs-react-dev"), "mine")
        .await
        .unwrap();
    handle.task.await.unwrap();

    let bob = Caller::User(OwnerId::new("bob"));
    let err = h.orchestrator.get_environment(&bob, handle.environment.id).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let err = h.orchestrator.stop(&bob, handle.environment.id).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn cyclic_compose_documents_are_rejected_at_create() {
    let h = harness().await;
    let mut template = local_template();
    template.id = TemplateId::new("cyclic");
    template.compose =
        "services:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: y\n    depends_on: [a]\n"
            .into();
    h.store.put_template(&template).await.unwrap();

    let err = h
        .orchestrator
        .create(&alice(), &TemplateId::new("cyclic"), "never")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DRIVER_FAILED");
    // nothing was reserved or persisted
    assert!(h.store.list_environments().await.unwrap().is_empty());
    assert!(h.store.list_port_leases().await.unwrap().is_empty());
}
