use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// JSON error body returned by the detached service.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// Numbered code listing, present on job failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Error)]
pub enum DetachedError {
    #[error("Request body has no code")]
    MissingCode,

    #[error("No job with id '{0}'")]
    UnknownJob(String),

    #[error("Job failed: {error}")]
    JobFailed { error: String, listing: String },

    #[error("Invalid variable bundle: {0}")]
    InvalidBundle(String),

    #[error("Detached service at {0} never became ready")]
    ServiceUnready(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error(transparent)]
    ScaleSet(#[from] domain_scalesets::ScaleSetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DetachedResult<T> = Result<T, DetachedError>;

impl IntoResponse for DetachedError {
    fn into_response(self) -> Response {
        match self {
            // Unknown ids get a plain-text diagnostic.
            DetachedError::UnknownJob(_) => {
                (StatusCode::NOT_FOUND, self.to_string()).into_response()
            }
            DetachedError::MissingCode | DetachedError::InvalidBundle(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "BadRequest".to_string(),
                    message: self.to_string(),
                    code: None,
                }),
            )
                .into_response(),
            DetachedError::JobFailed { error, listing } => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "JobFailed".to_string(),
                    message: error,
                    code: Some(listing),
                }),
            )
                .into_response(),
            other => {
                tracing::error!(error = %other, "Detached service error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "InternalServerError".to_string(),
                        message: other.to_string(),
                        code: None,
                    }),
                )
                    .into_response()
            }
        }
    }
}
