use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use batch_common::error::{CatalogError, ErrorKind, StoreError};

/// An API-facing error: an HTTP status, an optional stable error kind and a
/// human-readable message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Serialize)]
struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    message: String,
}

impl ApiError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: Some(ErrorKind::InvalidInput),
            message: message.into(),
        }
    }

    /// Admission capacity rejections: 503 with Retry-After semantics.
    pub fn unavailable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: Some(kind),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: None,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: None,
            message: message.into(),
        }
    }

    pub fn already_retried() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: Some(ErrorKind::AlreadyRetried),
            message: "dead letter was already retried successfully, pass force=true to repeat"
                .into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: None,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: ErrorDetails {
                kind: self.kind,
                message: self.message,
            },
        });

        let mut response = (self.status, body).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("30"));
        }
        response
    }
}

impl From<CatalogError> for ApiError {
    fn from(error: CatalogError) -> Self {
        tracing::error!(error = %error, "catalog error");
        Self::internal("catalog unavailable")
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::not_found(format!("file {} not found", id)),
            other => {
                tracing::error!(error = %other, "file store error");
                Self::internal("file store unavailable")
            }
        }
    }
}
