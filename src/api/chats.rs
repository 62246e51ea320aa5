//! Conversation routes: create or continue a chat, read its history.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderName},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;

use super::errors::Result;
use super::AppState;
use crate::chat::{encode_frame, StreamFrame};
use crate::store::StoredMessage;

pub(crate) const CHAT_ID_HEADER: &str = "x-chat-id";
const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
}

/// POST /chats
pub async fn create_chat_handler(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = body?;
    let chat_id = state.engine.prepare_chat(None, &request.content)?;
    let frames = state.engine.spawn_turn(chat_id.clone(), request.content);
    Ok(stream_response(chat_id, frames))
}

/// POST /chats/:chat_id/messages
pub async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    body: std::result::Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = body?;
    let chat_id = state.engine.prepare_chat(Some(&chat_id), &request.content)?;
    let frames = state.engine.spawn_turn(chat_id.clone(), request.content);
    Ok(stream_response(chat_id, frames))
}

/// GET /chats/:chat_id/messages
pub async fn get_messages_handler(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<StoredMessage>>> {
    Ok(Json(state.engine.history(&chat_id)?))
}

/// Wrap a turn's frames in a `text/event-stream` response.
fn stream_response(chat_id: String, frames: UnboundedReceiver<StreamFrame>) -> Response {
    let events = futures::stream::unfold(frames, |mut frames| async move {
        frames
            .recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(encode_frame(&frame)), frames))
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (HeaderName::from_static(UI_STREAM_HEADER), "v1".to_string()),
            (HeaderName::from_static(CHAT_ID_HEADER), chat_id),
        ],
        Body::from_stream(events),
    )
        .into_response()
}
