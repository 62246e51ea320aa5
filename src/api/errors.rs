use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::chat::ChatError;
use crate::store::StoreError;
use crate::tool_server::ToolServerError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    ToolServer(#[from] ToolServerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Chat(e) => match e {
                ChatError::Validation { .. } => StatusCode::BAD_REQUEST,
                ChatError::ChatNotFound { .. } => StatusCode::NOT_FOUND,
                ChatError::Upstream { .. } | ChatError::Timeout { .. } | ChatError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::ToolServer(e) => match e {
                ToolServerError::InvalidEnv { .. } | ToolServerError::InvalidImage { .. } => {
                    StatusCode::BAD_REQUEST
                }
                ToolServerError::NotFound { .. } => StatusCode::NOT_FOUND,
                ToolServerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_GATEWAY,
            },
            ApiError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %message, "request rejected");
        }

        let body = Json(ErrorResponse {
            error: message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
