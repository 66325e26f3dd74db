use tokio::task::JoinError;
use exif::Error as ExifError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use actix_web::{HttpResponse, ResponseError, http::StatusCode};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("EXIF error: {0}")]
    Exif(#[from] ExifError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    #[error("Tokio join error: {0}")]
    Join(#[from] JoinError),

    #[error("Channel send error")]
    SendError,

    #[error("Infrastructure unavailable: {0}")]
    Infrastructure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Generic error: {0}")]
    Generic(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({
                "error": self.to_string(),
            }))
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Walkdir(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Image(_) => StatusCode::BAD_REQUEST,
            AppError::Exif(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::SendError => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for AppError {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        AppError::SendError
    }
}

/// Failure of a single photo's analysis call.
///
/// Everything except `Unavailable` is recovered per item by the scheduler.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by remote service")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("model '{0}' not found or not supported")]
    ModelNotFound(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("could not load image: {0}")]
    Image(String),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("analysis cancelled")]
    Cancelled,

    /// The analyzer cannot serve any request, e.g. the endpoint URL is not
    /// usable. A missing key or unknown model is caught earlier, when the
    /// analyzer is created.
    #[error("analyzer unavailable: {0}")]
    Unavailable(String),
}

impl AnalysisError {
    /// Whether this failure means the analyzer itself cannot serve any item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AnalysisError::Unavailable(_))
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AnalysisError::Timeout
        } else if e.is_builder() {
            // Same request shape every time, so no item can succeed.
            AnalysisError::Unavailable(e.to_string())
        } else {
            AnalysisError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_fatal() {
        assert!(AnalysisError::Unavailable("no key".into()).is_fatal());
        assert!(!AnalysisError::Timeout.is_fatal());
        assert!(!AnalysisError::Auth("bad key".into()).is_fatal());
        assert!(!AnalysisError::Cancelled.is_fatal());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::NotFound("task".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::InvalidRequest("dir".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Infrastructure("store".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
