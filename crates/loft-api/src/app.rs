use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use loft_core::Orchestrator;
use tower_http::trace::TraceLayer;

use crate::auth::require_principal;
use crate::handlers;
use crate::state::AppState;
use crate::ws;

pub fn build_app(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // Environments
        .route(
            "/environments",
            get(handlers::list_environments).post(handlers::create_environment),
        )
        .route(
            "/environments/:id",
            get(handlers::get_environment).delete(handlers::delete_environment),
        )
        .route("/environments/:id/start", post(handlers::start_environment))
        .route("/environments/:id/stop", post(handlers::stop_environment))
        .route("/environments/:id/containers", get(handlers::list_containers))
        .route("/environments/:id/metrics", get(handlers::list_metrics))
        .route("/environments/:id/events", get(handlers::list_events))
        // Usage
        .route("/usage", get(handlers::usage))
        // Templates
        .route("/templates", get(handlers::list_templates))
        .route(
            "/templates/:id",
            put(handlers::put_template).delete(handlers::delete_template),
        )
        // Live events over the persistent connection
        .route("/ws", get(ws::event_socket))
        // Principal middleware applies to all routes above
        .route_layer(middleware::from_fn(require_principal))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PRINCIPAL_HEADER;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use loft_core::{HostSnapshot, PortAllocator, ResourceGuard};
    use loft_domain::{
        Environment, InfraKind, ResourceLimits, Template, TemplateId, Visibility,
    };
    use loft_driver::{
        Driver, DriverError, DriverRegistry, ProvisionContext, ProvisionOutcome,
    };
    use loft_notifier::Notifier;
    use loft_store::{InMemoryStore, Repository};
    use std::time::Duration;
    use tower::util::ServiceExt;

    struct NullDriver;

    #[async_trait]
    impl Driver for NullDriver {
        fn name(&self) -> &'static str {
            "null"
        }
        async fn provision(
            &self,
            _ctx: &ProvisionContext,
        ) -> Result<ProvisionOutcome, DriverError> {
            Ok(ProvisionOutcome::default())
        }
        async fn start(&self, _env: &Environment) -> Result<(), DriverError> {
            Ok(())
        }
        async fn stop(&self, _env: &Environment, _grace: Duration) -> Result<(), DriverError> {
            Ok(())
        }
        async fn teardown(&self, _env: &Environment) -> Result<(), DriverError> {
            Ok(())
        }
    }

    async fn test_app() -> (Router, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new(InfraKind::Aws);
        registry.register(InfraKind::Local, Arc::new(NullDriver));

        let guard = Arc::new(ResourceGuard::new(80.0, 80.0, 85.0));
        guard.update_snapshot(HostSnapshot {
            total_cpus: 16.0,
            cpu_used_percent: 5.0,
            memory_total_mib: 32_768.0,
            memory_used_percent: 10.0,
            disk_used_percent: 20.0,
        });
        let ports = Arc::new(
            PortAllocator::new((8000, 9000), store.clone() as Arc<dyn Repository>)
                .await
                .unwrap(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(Notifier::default()),
            ports,
            guard,
            5,
            8,
        ));
        (build_app(orchestrator), store)
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header(PRINCIPAL_HEADER, "alice")
    }

    fn template() -> Template {
        Template {
            id: TemplateId::new("dev"),
            name: "dev".into(),
            compose: "services:\n  app:\n    image: node:20\n    ports: [\"3000:3000\"]\n".into(),
            iaas_template: None,
            iaas_variables: None,
            exposed_ports: vec![3000],
            limits: ResourceLimits { memory_mib: 512, cpu_cores: 0.5 },
            infra: InfraKind::Local,
            region: None,
            visibility: Visibility::Public,
            owner: None,
        }
    }

    #[tokio::test]
    async fn unauthenticated_request_returns_401() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn websocket_route_refuses_anonymous_upgrade() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("upgrade", "websocket")
                    .header("connection", "upgrade")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .header("sec-websocket-version", "13")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_returns_200() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(authed(Request::builder().uri("/health")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn environments_empty_list() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(authed(Request::builder().uri("/environments")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn environment_not_found_returns_404() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(
                authed(Request::builder().uri(format!(
                    "/environments/{}",
                    uuid::Uuid::new_v4()
                )))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_environment_id_returns_400() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(
                authed(Request::builder().uri("/environments/not-a-uuid"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_is_accepted() {
        let (app, store) = test_app().await;
        store.put_template(&template()).await.unwrap();

        let body = serde_json::json!({ "templateId": "dev", "name": "demo" });
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/environments")
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body.to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn create_with_unknown_template_returns_404() {
        let (app, _) = test_app().await;
        let body = serde_json::json!({ "templateId": "ghost", "name": "demo" });
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/environments")
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body.to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn templates_round_trip() {
        let (app, _) = test_app().await;
        let body = serde_json::to_string(&template()).unwrap();
        let resp = app
            .clone()
            .oneshot(
                authed(
                    Request::builder()
                        .method(Method::PUT)
                        .uri("/templates/dev")
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(authed(Request::builder().uri("/templates")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
