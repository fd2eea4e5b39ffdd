pub mod routes;
pub mod state;

use anyhow::Result;
use axum::Router;
use tower_http::trace::TraceLayer;

pub use state::{AppState, Registry};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("palaver-server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use palaver_core::{builtin_tools, ChannelGateway, NullSink};
    use palaver_provider::{ProviderRegistry, SpeechRegistry, StubProvider};
    use palaver_schema::{Experiment, ExperimentChannel};
    use palaver_store::SessionStore;
    use tower::ServiceExt;

    fn experiment() -> Experiment {
        serde_json::from_value(serde_json::json!({
            "id": "exp-1",
            "team": "acme",
            "name": "Test",
            "prompt_text": "You are a helpful assistant",
            "llm_provider": "stub",
            "llm": "test-model"
        }))
        .unwrap()
    }

    fn channels() -> Vec<ExperimentChannel> {
        vec![
            serde_json::from_value(serde_json::json!({
                "id": "ch-api", "experiment_id": "exp-1", "platform": "api"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "id": "ch-web", "experiment_id": "exp-1", "platform": "web"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "id": "ch-fb", "experiment_id": "exp-1", "platform": "facebook",
                "page_id": "page-1", "page_access_token": "tok", "verify_token": "vt-9"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "id": "ch-slack", "experiment_id": "exp-1", "platform": "slack",
                "bot_token": "xoxb-1"
            }))
            .unwrap(),
        ]
    }

    fn app(responses: Vec<&str>) -> Router {
        let store = SessionStore::open_in_memory().unwrap();
        let mut providers = ProviderRegistry::new();
        providers.register("stub", Arc::new(StubProvider::with_responses(responses)));
        let gateway = ChannelGateway::new(
            store.clone(),
            providers,
            SpeechRegistry::new(),
            builtin_tools(&store),
            Arc::new(NullSink),
        );
        let state = AppState {
            gateway: Arc::new(gateway),
            registry: Arc::new(Registry::new(vec![experiment()], channels())),
        };
        create_router(state)
    }

    #[tokio::test]
    async fn api_chat_returns_the_reply_synchronously() {
        let app = app(vec!["api says hello"]);
        let request = Request::builder()
            .method("POST")
            .uri("/api/experiments/exp-1/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({"chat_id": "caller-1", "message": "hi"}).to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["response"], "api says hello");
    }

    #[tokio::test]
    async fn api_chat_unknown_experiment_is_404() {
        let app = app(vec![]);
        let request = Request::builder()
            .method("POST")
            .uri("/api/experiments/nope/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({"chat_id": "c", "message": "hi"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn web_session_lifecycle_over_http() {
        let app = app(vec!["web reply"]);

        let request = Request::builder()
            .method("POST")
            .uri("/api/experiments/exp-1/sessions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({"participant_identifier": "visitor-1"}).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "active");
        let session_id = value["session_id"].as_str().unwrap().to_string();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/sessions/{session_id}/messages"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({"message": "hi"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["response"], "web reply");
    }

    #[tokio::test]
    async fn facebook_verification_echoes_the_challenge() {
        let app = app(vec![]);
        let request = Request::builder()
            .method("GET")
            .uri("/channels/facebook?hub.mode=subscribe&hub.verify_token=vt-9&hub.challenge=12345")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"12345");
    }

    #[tokio::test]
    async fn facebook_verification_rejects_bad_tokens() {
        let app = app(vec![]);
        let request = Request::builder()
            .method("GET")
            .uri("/channels/facebook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn slack_url_verification_is_answered_inline() {
        let app = app(vec![]);
        let request = Request::builder()
            .method("POST")
            .uri("/channels/slack/ch-slack")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({"type": "url_verification", "challenge": "abc123"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["challenge"], "abc123");
    }

    #[tokio::test]
    async fn telegram_webhook_unknown_channel_is_404() {
        let app = app(vec![]);
        let request = Request::builder()
            .method("POST")
            .uri("/channels/telegram/ch-tg")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({"update_id": 1, "my_chat_member": {}}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
