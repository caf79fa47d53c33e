//! HTTP error mapping.

use crate::application::intake::IntakeError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Intake(e) => match e {
                IntakeError::InvalidVideoId(_) | IntakeError::InvalidSource(_) => {
                    StatusCode::BAD_REQUEST
                }
                IntakeError::NotFound(_) => StatusCode::NOT_FOUND,
                IntakeError::AlreadySubmitted(_) => StatusCode::CONFLICT,
                IntakeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match &self {
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                "An internal error occurred".to_string()
            }
            _ => self.to_string(),
        };
        (status, Json(ErrorResponse { detail })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::jobs::VideoId;

    #[test]
    fn test_status_mapping() {
        let id = VideoId::new("v1").unwrap();
        let cases = [
            (ApiError::Intake(IntakeError::NotFound(id.clone())), StatusCode::NOT_FOUND),
            (
                ApiError::Intake(IntakeError::AlreadySubmitted(id)),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::Intake(IntakeError::Unavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::Intake(IntakeError::InvalidSource("empty".into())),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::bad_request("no file"), StatusCode::BAD_REQUEST),
            (ApiError::internal("disk"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err}");
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
