pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::pipeline::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Orchestration trigger
        .route("/api/v1/run", post(handlers::handle_run))
        // Front-end / storefront reads
        .route("/api/v1/segmentations", get(handlers::handle_list_pairs))
        .route("/api/v1/ad-image", get(handlers::handle_ad_image))
        .route("/api/v1/queue", get(handlers::handle_queue_depth))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::PipelineSettings;
    use crate::notify::ProgressReporter;
    use crate::pipeline::catalog::ContentDispatchCatalog;
    use crate::pipeline::driver::FlowDriver;
    use crate::pipeline::orchestrator::BatchOrchestrator;
    use crate::pipeline::segmentation::RuleBasedSegmenter;
    use crate::test_utils::{make_event, FakeRenderer, MemoryLease, MemoryPairStore, MemoryStore};

    fn make_app_with(store: Arc<MemoryStore>, lease: MemoryLease) -> Router {
        let pairs = Arc::new(MemoryPairStore::default());
        let catalog = Arc::new(ContentDispatchCatalog::new(
            store.clone(),
            store.clone(),
            pairs,
        ));
        let settings = PipelineSettings::default();
        let driver = FlowDriver::new(
            BatchOrchestrator::new(
                store.clone(),
                store.clone(),
                Arc::new(RuleBasedSegmenter),
                settings.page_size,
            ),
            catalog.clone(),
            Arc::new(FakeRenderer::default()),
            Arc::new(lease),
            ProgressReporter::disabled(),
            settings,
        );
        build_router(AppState {
            driver: Arc::new(driver),
            catalog,
            queue: store,
        })
    }

    fn make_app(store: Arc<MemoryStore>) -> Router {
        make_app_with(store, MemoryLease::default())
    }

    fn make_run_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/run")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn seed(store: &MemoryStore) {
        store.add_event(make_event("alice", "s1", "page_view", 0));
        store.set_profile("alice", "Berlin, Germany");
    }

    #[tokio::test]
    async fn test_health() {
        let app = make_app(Arc::new(MemoryStore::new()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["service"], json!("adgen-api"));
    }

    #[tokio::test]
    async fn test_run_segment_returns_token_and_run_id() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        let app = make_app(store.clone());

        let response = app
            .oneshot(make_run_request(json!({"directive": "segment", "run_id": "r-1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-run-id"], "r-1");
        let body = read_json(response).await;
        assert_eq!(body["status"], json!("segmentation_finished"));
        assert_eq!(body["run_id"], json!("r-1"));
        assert!(store.segmentation("alice").is_some());
    }

    #[tokio::test]
    async fn test_run_id_header_is_honoured() {
        let app = make_app(Arc::new(MemoryStore::new()));
        let mut request = make_run_request(json!({"directive": "segment"}));
        request
            .headers_mut()
            .insert("x-run-id", "from-header".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();
        let body = read_json(response).await;
        assert_eq!(body["status"], json!("no_pending_users"));
        assert_eq!(body["run_id"], json!("from-header"));
    }

    #[tokio::test]
    async fn test_failed_round_is_503() {
        let app = make_app_with(Arc::new(MemoryStore::new()), MemoryLease::held_by("someone"));
        let response = app
            .oneshot(make_run_request(json!({"directive": "continue"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = read_json(response).await;
        assert_eq!(body["status"], json!("failed"));
        assert_eq!(body["detail"]["error"], json!("round_in_progress"));
    }

    #[tokio::test]
    async fn test_unknown_directive_is_rejected() {
        let app = make_app(Arc::new(MemoryStore::new()));
        let response = app
            .oneshot(make_run_request(json!({"directive": "launch"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["status"], json!("failed"));
        assert_eq!(body["detail"]["error"], json!("invalid_request"));
        assert!(!body["run_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_keeps_header_run_id() {
        let app = make_app(Arc::new(MemoryStore::new()));
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/run")
            .header("content-type", "application/json")
            .header("x-run-id", "r-bad")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-run-id"], "r-bad");
        let body = read_json(response).await;
        assert_eq!(body["status"], json!("failed"));
        assert_eq!(body["run_id"], json!("r-bad"));
    }

    #[tokio::test]
    async fn test_ad_image_after_flow() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        let app = make_app(store);

        let flow = app
            .clone()
            .oneshot(make_run_request(json!({"directive": "flow", "run_id": "r-2"})))
            .await
            .unwrap();
        assert_eq!(read_json(flow).await["status"], json!("flow_finished"));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ad-image?user_id=alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        let key = body["pair_key"].as_str().unwrap().to_string();
        assert!(key.ends_with("_Berlin_Germany"));
        assert_eq!(
            body["image_url"],
            json!(format!("https://cdn.test/segmentations/{key}.png"))
        );

        let listed = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/segmentations?limit=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let pairs = read_json(listed).await;
        assert_eq!(pairs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ad_image_unknown_user_is_404() {
        let app = make_app(Arc::new(MemoryStore::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ad-image?user_id=ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_queue_depth() {
        let store = Arc::new(MemoryStore::new());
        for user in ["a", "b", "c", "d", "e", "f", "g"] {
            store.add_event(make_event(user, "s1", "page_view", 0));
        }
        let app = make_app(store);

        app.clone()
            .oneshot(make_run_request(json!({"directive": "segment"})))
            .await
            .unwrap();
        let response = app
            .oneshot(Request::builder().uri("/api/v1/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(read_json(response).await, json!({"pending": 2}));
    }
}
