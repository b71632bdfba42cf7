//! Route modules for the Marketsync service

pub mod health;
pub mod sync;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/sync", sync::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::db::{initialize_schema, UpsertGateway};
    use crate::sync::{ClientContext, SyncSettings};
    use crate::test_support::{client_context, memory_pool, ScriptedClient};
    use crate::transport::{AuthScheme, Provider, RetryPolicy};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const CATALOG: &str = r#"{
        "providers": [
            {"name": "acme", "base_url": "https://api.acme.test", "auth": {"type": "bearer"}}
        ],
        "entities": [{
            "name": "sales",
            "provider": "acme",
            "schema": {
                "table": "sales",
                "key": ["client_id", "sku"],
                "columns": [
                    {"name": "client_id"},
                    {"name": "sku"},
                    {"name": "qty", "kind": "integer"}
                ]
            },
            "source": {
                "kind": "paginated",
                "request": {"path": "/orders"},
                "pagination": {"style": "offset", "page_size": 100},
                "items_pointer": "/items"
            }
        }, {
            "name": "stock",
            "provider": "acme",
            "schema": {
                "table": "stock",
                "key": ["client_id", "sku", "warehouse"],
                "columns": [
                    {"name": "client_id"},
                    {"name": "sku"},
                    {"name": "warehouse"},
                    {"name": "present", "kind": "integer"}
                ]
            },
            "source": {
                "kind": "paginated",
                "request": {"path": "/stocks"},
                "pagination": {"style": "page_token", "next_token_pointer": "/next"},
                "items_pointer": "/rows"
            }
        }]
    }"#;

    async fn test_app(http: Arc<ScriptedClient>) -> Router {
        test_app_with_clients(http, vec![client_context()]).await
    }

    async fn test_app_with_clients(http: Arc<ScriptedClient>, clients: Vec<ClientContext>) -> Router {
        let pool = memory_pool().await;
        initialize_schema(&pool).await.unwrap();

        let catalog = Catalog::from_json(CATALOG).unwrap();
        let provider = Provider::new(
            "acme",
            "https://api.acme.test",
            AuthScheme::Bearer,
            RetryPolicy::no_retry(),
            http,
            4,
        )
        .unwrap();
        let orchestrator = catalog.assemble(
            vec![Arc::new(provider)],
            UpsertGateway::new(pool.clone(), RetryPolicy::new(1, Duration::ZERO)),
            SyncSettings {
                unit_retries: 0,
                unit_retry_delay: Duration::ZERO,
                ..SyncSettings::default()
            },
        );
        orchestrator.prepare().await.unwrap();

        app(AppState::new(pool, orchestrator, clients))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_sync(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/sync")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(Arc::new(ScriptedClient::new())).await;
        let (status, body) = send(
            app,
            Request::builder()
                .uri("/api/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "marketsync");
    }

    #[tokio::test]
    async fn test_sync_runs_every_entity_and_records_ledger() {
        let http = Arc::new(ScriptedClient::new());
        http.route_json(
            "/orders",
            200,
            json!({"items": [{"sku": "A", "qty": 3}, {"sku": "A", "qty": 5}]}),
        );
        http.route_json(
            "/stocks",
            200,
            json!({"rows": [{"sku": "A", "warehouse": "W1", "present": 4}], "next": "p2"}),
        );
        http.route_json(
            "/stocks",
            200,
            json!({"rows": [
                {"sku": "A", "warehouse": "W2", "present": 1},
                {"sku": "B", "warehouse": "W1", "present": 7}
            ]}),
        );
        let app = test_app(http.clone()).await;

        let (status, body) = send(
            app.clone(),
            post_sync(json!({
                "client_id": "client-1",
                "from": "2024-01-01T00:00:00Z",
                "to": "2024-01-02T00:00:00Z"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["client_id"], "client-1");
        assert_eq!(body[0]["rows_written"], 4);
        assert_eq!(body[0]["errors"], json!([]));
        assert_eq!(body[0]["outcomes"].as_array().unwrap().len(), 2);
        assert_eq!(http.requests_to("/orders").len(), 1);
        assert_eq!(http.requests_to("/stocks").len(), 2);

        let (status, runs) = send(
            app,
            Request::builder()
                .uri("/api/v1/sync/runs?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let runs = runs.as_array().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r["status"] == "succeeded"));
        let mut entities: Vec<&str> = runs.iter().map(|r| r["entity"].as_str().unwrap()).collect();
        entities.sort();
        assert_eq!(entities, vec!["sales", "stock"]);
    }

    #[tokio::test]
    async fn test_sync_client_id_shared_by_providers_needs_provider() {
        let http = Arc::new(ScriptedClient::new());
        let mut other = client_context();
        other.provider = "globex".into();
        let app = test_app_with_clients(http.clone(), vec![client_context(), other]).await;

        let (status, _) = send(
            app.clone(),
            post_sync(json!({
                "client_id": "client-1",
                "from": "2024-01-01T00:00:00Z",
                "to": "2024-01-02T00:00:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(http.call_count(), 0);

        // globex has no provider engine, so its run reports a config failure
        let (status, body) = send(
            app,
            post_sync(json!({
                "client_id": "client-1",
                "provider": "globex",
                "from": "2024-01-01T00:00:00Z",
                "to": "2024-01-02T00:00:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["errors"][0]["kind"], "config");
        assert_eq!(http.call_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_unknown_client_is_not_found() {
        let app = test_app(Arc::new(ScriptedClient::new())).await;
        let (status, body) = send(
            app,
            post_sync(json!({
                "client_id": "nobody",
                "from": "2024-01-01T00:00:00Z",
                "to": "2024-01-02T00:00:00Z"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_sync_rejects_inverted_window() {
        let http = Arc::new(ScriptedClient::new());
        let app = test_app(http.clone()).await;
        let (status, _) = send(
            app,
            post_sync(json!({
                "from": "2024-02-01T00:00:00Z",
                "to": "2024-01-01T00:00:00Z"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(http.call_count(), 0);
    }
}
