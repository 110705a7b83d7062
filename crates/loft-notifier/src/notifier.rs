use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use loft_domain::{Environment, EnvironmentId, MetricSample, OwnerId};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::envelope::{MetricPayload, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session outbound queue. The broadcast ring drops the oldest message
/// when the queue is full; readers observe the gap as a lag and the counter
/// records it.
struct Session {
    sender: broadcast::Sender<ServerMessage>,
    lagged: Arc<AtomicU64>,
    principal: OwnerId,
}

/// What the transport layer holds for one connected client.
pub struct SessionHandle {
    pub id: SessionId,
    pub receiver: broadcast::Receiver<ServerMessage>,
    pub lagged: Arc<AtomicU64>,
}

#[derive(Default)]
struct Index {
    sessions: HashMap<SessionId, Session>,
    /// environment id → subscribed sessions.
    subscriptions: HashMap<EnvironmentId, HashSet<SessionId>>,
}

/// Fan-out hub for lifecycle events, log lines, and metric batches.
///
/// Delivery is best-effort: a slow session loses its oldest messages, a
/// session whose transport errored is removed from every index by the
/// transport calling [`Notifier::disconnect`].
pub struct Notifier {
    index: Mutex<Index>,
    queue_capacity: usize,
}

impl Notifier {
    pub fn new(queue_capacity: usize) -> Self {
        Self { index: Mutex::new(Index::default()), queue_capacity }
    }

    /// Register a connected client with its verified principal.
    pub fn connect(&self, principal: OwnerId) -> SessionHandle {
        let (sender, receiver) = broadcast::channel(self.queue_capacity);
        let id = SessionId(Uuid::new_v4());
        let lagged = Arc::new(AtomicU64::new(0));
        let mut index = self.index.lock().expect("notifier index poisoned");
        index.sessions.insert(id, Session { sender, lagged: lagged.clone(), principal });
        debug!(session = %id, "client session connected");
        SessionHandle { id, receiver, lagged }
    }

    /// Drop a session and remove it from every subscription.
    pub fn disconnect(&self, session: SessionId) {
        let mut index = self.index.lock().expect("notifier index poisoned");
        index.sessions.remove(&session);
        for subscribers in index.subscriptions.values_mut() {
            subscribers.remove(&session);
        }
        index.subscriptions.retain(|_, subs| !subs.is_empty());
        info!(session = %session, "client session disconnected");
    }

    /// Subscribe a session to an environment's events. Only the owner (or an
    /// operator session flagged by the transport) should reach this; the
    /// transport enforces that with the environment's owner.
    pub fn subscribe(&self, session: SessionId, environment_id: EnvironmentId) -> bool {
        let mut index = self.index.lock().expect("notifier index poisoned");
        if !index.sessions.contains_key(&session) {
            return false;
        }
        index.subscriptions.entry(environment_id).or_default().insert(session);
        true
    }

    pub fn unsubscribe(&self, session: SessionId, environment_id: EnvironmentId) {
        let mut index = self.index.lock().expect("notifier index poisoned");
        if let Some(subscribers) = index.subscriptions.get_mut(&environment_id) {
            subscribers.remove(&session);
            if subscribers.is_empty() {
                index.subscriptions.remove(&environment_id);
            }
        }
    }

    /// The verified principal a session connected with.
    pub fn principal(&self, session: SessionId) -> Option<OwnerId> {
        let index = self.index.lock().expect("notifier index poisoned");
        index.sessions.get(&session).map(|s| s.principal.clone())
    }

    // ── Publish ───────────────────────────────────────────────────────────────

    pub fn publish_status(&self, env: &Environment) {
        let message = ServerMessage::EnvironmentStatus {
            environment_id: env.id,
            status: env.status,
            timestamp: Utc::now(),
            updated_at: env.updated_at,
        };
        self.fan_out(&env.id, message);
    }

    pub fn publish_log_line(&self, environment_id: EnvironmentId, service: &str, line: &str) {
        let message = ServerMessage::LogLine {
            environment_id,
            service: service.to_string(),
            line: line.to_string(),
            timestamp: Utc::now(),
        };
        self.fan_out(&environment_id, message);
    }

    pub fn publish_metrics(&self, environment_id: EnvironmentId, samples: &[MetricSample]) {
        if samples.is_empty() {
            return;
        }
        let message = ServerMessage::MetricsUpdate {
            project_id: environment_id,
            metrics: samples.iter().map(MetricPayload::from).collect(),
            timestamp: Utc::now(),
        };
        self.fan_out(&environment_id, message);
    }

    /// Direct reply to one session (command acks, errors).
    pub fn send_to(&self, session: SessionId, message: ServerMessage) {
        let index = self.index.lock().expect("notifier index poisoned");
        if let Some(s) = index.sessions.get(&session) {
            let _ = s.sender.send(message);
        }
    }

    fn fan_out(&self, environment_id: &EnvironmentId, message: ServerMessage) {
        let index = self.index.lock().expect("notifier index poisoned");
        let Some(subscribers) = index.subscriptions.get(environment_id) else {
            return;
        };
        for session_id in subscribers {
            if let Some(session) = index.sessions.get(session_id) {
                // send only errors when there are no receivers; a full ring
                // silently drops the oldest entry, which readers see as lag
                let _ = session.sender.send(message.clone());
            }
        }
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn session_count(&self) -> usize {
        self.index.lock().expect("notifier index poisoned").sessions.len()
    }

    pub fn subscriber_count(&self, environment_id: &EnvironmentId) -> usize {
        self.index
            .lock()
            .expect("notifier index poisoned")
            .subscriptions
            .get(environment_id)
            .map_or(0, |s| s.len())
    }

    /// Record `n` messages lost by a lagging session. Called by the transport
    /// when its receiver reports the gap.
    pub fn record_lag(&self, session: SessionId, n: u64) {
        let index = self.index.lock().expect("notifier index poisoned");
        if let Some(s) = index.sessions.get(&session) {
            s.lagged.fetch_add(n, Ordering::Relaxed);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loft_domain::{
        EnvironmentStatus, InfraKind, ResourceLimits, Template, TemplateId, Visibility,
    };

    fn environment() -> Environment {
        let template = Template {
            id: TemplateId::new("t"),
            name: "t".into(),
            compose: "services: {}".into(),
            iaas_template: None,
            iaas_variables: None,
            exposed_ports: vec![],
            limits: ResourceLimits { memory_mib: 512, cpu_cores: 0.5 },
            infra: InfraKind::Local,
            region: None,
            visibility: Visibility::Public,
            owner: None,
        };
        Environment::new(&template, "demo", OwnerId::new("alice"), 8, Utc::now())
    }

    #[tokio::test]
    async fn subscribers_receive_status_events() {
        let notifier = Notifier::default();
        let env = environment();
        let mut handle = notifier.connect(OwnerId::new("alice"));
        assert!(notifier.subscribe(handle.id, env.id));

        notifier.publish_status(&env);

        let msg = handle.receiver.recv().await.unwrap();
        match msg {
            ServerMessage::EnvironmentStatus { environment_id, status, .. } => {
                assert_eq!(environment_id, env.id);
                assert_eq!(status, EnvironmentStatus::Creating);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribed_sessions_stop_receiving() {
        let notifier = Notifier::default();
        let env = environment();
        let mut handle = notifier.connect(OwnerId::new("alice"));
        notifier.subscribe(handle.id, env.id);
        notifier.unsubscribe(handle.id, env.id);

        notifier.publish_status(&env);

        assert!(matches!(
            handle.receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_counts_lag() {
        let notifier = Notifier::new(4);
        let env = environment();
        let mut handle = notifier.connect(OwnerId::new("alice"));
        notifier.subscribe(handle.id, env.id);

        for _ in 0..10 {
            notifier.publish_status(&env);
        }

        match handle.receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                notifier.record_lag(handle.id, n);
                assert!(n > 0);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(handle.lagged.load(Ordering::Relaxed) > 0);
        // newest messages still arrive after the gap
        assert!(handle.receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_removes_session_everywhere() {
        let notifier = Notifier::default();
        let env = environment();
        let handle = notifier.connect(OwnerId::new("alice"));
        notifier.subscribe(handle.id, env.id);
        assert_eq!(notifier.subscriber_count(&env.id), 1);

        notifier.disconnect(handle.id);
        assert_eq!(notifier.session_count(), 0);
        assert_eq!(notifier.subscriber_count(&env.id), 0);
        assert!(!notifier.subscribe(handle.id, env.id));
    }

    #[tokio::test]
    async fn metrics_fan_out_only_to_that_environment() {
        let notifier = Notifier::default();
        let env_a = environment();
        let env_b = environment();
        let mut sub_a = notifier.connect(OwnerId::new("alice"));
        let mut sub_b = notifier.connect(OwnerId::new("alice"));
        notifier.subscribe(sub_a.id, env_a.id);
        notifier.subscribe(sub_b.id, env_b.id);

        let sample = MetricSample {
            environment_id: env_a.id,
            container_id: None,
            kind: loft_domain::MetricKind::Cpu,
            name: "cpu_usage_percent".into(),
            value: 12.0,
            unit: "percent".into(),
            recorded_at: Utc::now(),
        };
        notifier.publish_metrics(env_a.id, &[sample]);

        assert!(matches!(
            sub_a.receiver.try_recv(),
            Ok(ServerMessage::MetricsUpdate { .. })
        ));
        assert!(sub_b.receiver.try_recv().is_err());
    }
}
