use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Terminal failure of one conversion.
///
/// Every fatal condition in the pipeline is classified into exactly one of
/// these kinds. Failures local to a single content document are absorbed
/// (skipped and logged) and never surface here.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The archive cannot be opened or its reading order cannot be resolved.
    #[error("Malformed EPUB package: {0}")]
    MalformedPackage(String),

    /// No content document yielded usable content.
    #[error("Nothing to convert: {0}")]
    Synthesis(String),

    /// The layout stage could not produce a PDF.
    #[error("PDF rendering failed: {0}")]
    Render(String),
}

impl From<zip::result::ZipError> for ConvertError {
    fn from(err: zip::result::ZipError) -> Self {
        ConvertError::MalformedPackage(err.to_string())
    }
}

impl From<roxmltree::Error> for ConvertError {
    fn from(err: roxmltree::Error) -> Self {
        ConvertError::MalformedPackage(format!("XML parsing error: {}", err))
    }
}

impl From<lopdf::Error> for ConvertError {
    fn from(err: lopdf::Error) -> Self {
        ConvertError::Render(err.to_string())
    }
}

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Rejected request (bad extension, missing field, ...).
    #[error("{0}")]
    BadRequest(String),

    /// Upload larger than the configured limit.
    #[error("File size exceeds maximum allowed size of {0}MB")]
    PayloadTooLarge(u64),

    /// Resource not found error.
    #[error("{0}")]
    NotFound(String),

    /// Conversion error.
    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Convert(ConvertError::Render(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Convert(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(status = %status, error = %self, "Request error");

        // Don't leak internal details for unexpected failures
        let message = match &self {
            AppError::Io(_) | AppError::Internal(_) | AppError::Config(_) => {
                "An unexpected error occurred".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
