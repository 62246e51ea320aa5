//! HTTP API: the conversation surface plus admin routes.
//!
//! Chat turns answer with a `text/event-stream` of UI message frames; every
//! other route speaks JSON and reports failures as `{error, code}`.

pub mod admin;
pub mod chats;
pub mod errors;

use std::sync::Arc;

use axum::{
    http::HeaderName,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::chat::ChatEngine;
use crate::store::Store;
use crate::tool_server::Launcher;

pub use errors::ApiError;

/// Shared state of the API routes.
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub store: Arc<Store>,
    pub launcher: Arc<Launcher>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(chats::CHAT_ID_HEADER)]);

    Router::new()
        .route("/chats", post(chats::create_chat_handler))
        .route(
            "/chats/:chat_id/messages",
            post(chats::send_message_handler).get(chats::get_messages_handler),
        )
        .route("/images", post(admin::register_image_handler))
        .route("/oauth/providers", post(admin::register_provider_handler))
        .route("/oauth/:provider/token", post(admin::store_token_handler))
        .route(
            "/instances",
            get(admin::list_instances_handler).post(admin::start_instance_handler),
        )
        .route("/instances/:instance_id", delete(admin::kill_instance_handler))
        .route("/health", get(admin::health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::chat::EngineConfig;
    use crate::inference::{AssistantReply, ChatMessage, InferenceError, LlmClient, ToolDefinition};
    use crate::tool_server::{FacadeClient, LauncherConfig};

    struct ScriptedLlm {
        replies: Mutex<VecDeque<AssistantReply>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<AssistantReply, InferenceError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(InferenceError::ResponseError {
                    reason: "script exhausted".into(),
                })
        }
    }

    struct Harness {
        app: Router,
        store: Arc<Store>,
        _dir: tempfile::TempDir,
    }

    fn harness(replies: Vec<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(":memory:").unwrap());
        let llm = Arc::new(ScriptedLlm {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|text| AssistantReply {
                        text: Some(text.to_string()),
                        tool_calls: Vec::new(),
                        stop_reason: Some("stop".into()),
                    })
                    .collect(),
            ),
        });
        let engine = Arc::new(ChatEngine::new(
            Arc::clone(&store),
            llm,
            Arc::new(FacadeClient::new().unwrap()),
            EngineConfig::default(),
        ));
        let launcher = Arc::new(
            Launcher::new(
                Arc::clone(&store),
                LauncherConfig {
                    container_runtime: "docker".into(),
                    instance_host_bin: PathBuf::from("true"),
                    rendezvous_dir: dir.path().join("rv"),
                    rendezvous_timeout: Duration::from_secs(1),
                    database_path: ":memory:".into(),
                    log_dir: dir.path().join("logs"),
                },
            )
            .unwrap(),
        );
        let app = router(Arc::new(AppState {
            engine,
            store: Arc::clone(&store),
            launcher,
        }));
        Harness {
            app,
            store,
            _dir: dir,
        }
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_new_chat_streams_frames_and_persists() {
        let h = harness(vec!["Hi there"]);
        let resp = h
            .app
            .clone()
            .oneshot(json_request("POST", "/chats", json!({"content": "Hello"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["x-vercel-ai-ui-message-stream"], "v1");
        let chat_id = resp.headers()["x-chat-id"].to_str().unwrap().to_string();

        let text = body_text(resp).await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 6);
        assert!(frames[0].starts_with("data: {\"type\":\"start\""));
        assert!(frames[2].contains("\"delta\":\"Hi there\""));
        assert_eq!(frames[4], "data: {\"type\":\"finish\"}");
        assert_eq!(frames[5], "data: [DONE]");

        let resp = h
            .app
            .oneshot(
                Request::get(format!("/chats/{chat_id}/messages"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let history: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(history.as_array().unwrap().len(), 2);
        assert_eq!(history[0]["role"], "human");
        assert_eq!(history[1]["parts"][0]["type"], "text");
        assert_eq!(history[1]["parts"][0]["content"], "Hi there");
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected_without_persisting() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(json_request("POST", "/chats", json!({"content": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(
                Request::post("/chats")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_chat_is_404() {
        let h = harness(vec![]);
        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/chats/nope/messages",
                json!({"content": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = h
            .app
            .oneshot(Request::get("/chats/nope/messages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_image_is_400() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(json_request(
                "POST",
                "/images",
                json!({
                    "name": "Mail",
                    "slug": "mail",
                    "version": 1,
                    "container_ref": "example/mail:1",
                    "auth_mode": "SOMETIMES",
                    "tools": []
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_image_with_declared_tools_is_registered() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(json_request(
                "POST",
                "/images",
                json!({
                    "name": "Search",
                    "slug": "search",
                    "version": 2,
                    "container_ref": "example/search:2",
                    "auth_mode": "PUBLIC",
                    "env_schema": {"API_KEY": "your key"},
                    "tools": [{"name": "query", "description": "Run a query", "input_schema": {"type": "object"}}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["image"]["id"], "search-v2");
        assert_eq!(body["tools"][0]["name"], "query");
        assert!(h.store.get_image("search-v2").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_instance_for_unknown_image_is_404() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(json_request(
                "POST",
                "/instances",
                json!({"image_id": "ghost-v1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_unknown_instance_is_idempotent() {
        let h = harness(vec![]);
        for _ in 0..2 {
            let resp = h
                .app
                .clone()
                .oneshot(
                    Request::delete("/instances/ghost-v1-inst-0")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
    }

    #[tokio::test]
    async fn test_provider_and_token_registration() {
        let h = harness(vec![]);
        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/oauth/providers",
                json!({
                    "name": "google",
                    "client_id": "cid",
                    "client_secret": "secret",
                    "authorization_endpoint": "https://accounts.example.com/auth",
                    "callback_url": "https://app.example.com/cb",
                    "scopes": ["mail.read"]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(!body_text(resp).await.contains("secret"));

        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/oauth/google/token",
                json!({"refresh_token": "rt-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["provider"], "google");
        assert_eq!(body["resolved"], json!([]));
        assert_eq!(
            h.store.get_refresh_token("google").unwrap().as_deref(),
            Some("rt-1")
        );

        let resp = h
            .app
            .oneshot(json_request(
                "POST",
                "/oauth/google/token",
                json!({"refresh_token": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cors_exposes_chat_id() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(
                Request::get("/health")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let exposed = resp.headers()["access-control-expose-headers"]
            .to_str()
            .unwrap()
            .to_string();
        assert!(exposed.contains("x-chat-id"));
    }
}
