//! Admin routes: images, OAuth providers and tokens, instances, health.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::errors::{ApiError, Result};
use super::AppState;
use crate::store::{ImageRecord, ImageTool, InstanceRecord, OAuthProvider};
use crate::tool_server::NewImage;

type JsonBody<T> = std::result::Result<Json<T>, JsonRejection>;

#[derive(Debug, Serialize)]
pub struct RegisteredImage {
    pub image: ImageRecord,
    pub tools: Vec<ImageTool>,
}

#[derive(Debug, Serialize)]
pub struct RegisteredProvider {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub provider: String,
    /// Auth requests resolved by this token.
    pub resolved: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartInstanceRequest {
    pub image_id: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// GET /health
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /images
pub async fn register_image_handler(
    State(state): State<Arc<AppState>>,
    body: JsonBody<NewImage>,
) -> Result<(StatusCode, Json<RegisteredImage>)> {
    let Json(new) = body?;
    let (image, tools) = state.launcher.register_image(new).await?;
    Ok((StatusCode::CREATED, Json(RegisteredImage { image, tools })))
}

/// POST /oauth/providers
pub async fn register_provider_handler(
    State(state): State<Arc<AppState>>,
    body: JsonBody<OAuthProvider>,
) -> Result<(StatusCode, Json<RegisteredProvider>)> {
    let Json(provider) = body?;
    if provider.name.trim().is_empty() || provider.authorization_endpoint.trim().is_empty() {
        return Err(ApiError::Validation(
            "name and authorization_endpoint are required".into(),
        ));
    }
    state.store.upsert_oauth_provider(&provider)?;
    tracing::info!(provider = %provider.name, "OAuth provider registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisteredProvider {
            name: provider.name,
        }),
    ))
}

/// POST /oauth/:provider/token
pub async fn store_token_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    body: JsonBody<TokenRequest>,
) -> Result<Json<TokenResponse>> {
    let Json(request) = body?;
    let resolved = state
        .engine
        .reauthenticate(&provider, &request.refresh_token)
        .await?;
    Ok(Json(TokenResponse {
        provider,
        resolved: resolved.into_iter().map(|r| r.id).collect(),
    }))
}

/// GET /instances
pub async fn list_instances_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InstanceRecord>>> {
    Ok(Json(state.launcher.list_instances()?))
}

/// POST /instances
pub async fn start_instance_handler(
    State(state): State<Arc<AppState>>,
    body: JsonBody<StartInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceRecord>)> {
    let Json(request) = body?;
    let record = state
        .launcher
        .start_instance(&request.image_id, &request.env)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// DELETE /instances/:instance_id
pub async fn kill_instance_handler(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode> {
    state.launcher.kill_instance(&instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
