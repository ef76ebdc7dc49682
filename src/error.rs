//! Error types for the photo service

use crate::encoder::OutputFormat;
use crate::engine::EngineState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

/// Why an encode call failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeCause {
    #[error("no image data")]
    NoImageData,

    #[error("{0}")]
    Encoder(String),
}

/// Errors raised by the engine, the transform pipeline and the request orchestrator.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to initialize engine: {0}")]
    EngineInit(String),

    #[error("Engine is not ready (state: {0})")]
    EngineNotReady(EngineState),

    #[error("Empty buffer")]
    EmptyInput,

    #[error("Buffer is not in a known format")]
    UnrecognizedFormat,

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Image too large: {width}x{height} (max: {max}x{max})")]
    ImageTooLarge { width: u32, height: u32, max: u32 },

    #[error("Error {operation}: no image data")]
    InvalidImage { operation: &'static str },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Error saving to {format} buffer: {cause}")]
    Encode {
        format: OutputFormat,
        cause: EncodeCause,
    },

    #[error("Queue full, try again later")]
    QueueFull,

    #[error("Processing timeout")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True when the failure stems from an operation on an imageless handle.
    pub fn is_no_image_data(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidImage { .. }
                | PipelineError::Encode {
                    cause: EncodeCause::NoImageData,
                    ..
                }
        )
    }
}

/// Errors surfaced by HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Database(#[from] crate::database::DatabaseError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        use crate::database::DatabaseError;
        use crate::storage::StorageError;

        match self {
            ApiError::Pipeline(e) => match e {
                PipelineError::EmptyInput
                | PipelineError::UnrecognizedFormat
                | PipelineError::ImageTooLarge { .. }
                | PipelineError::InvalidParameter(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                // Decoder diagnostics stay in the logs.
                PipelineError::Decode(_) => {
                    (StatusCode::BAD_REQUEST, "Invalid image data".to_string())
                }
                PipelineError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
                PipelineError::EngineNotReady(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service unavailable".to_string(),
                ),
                PipelineError::Timeout => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
                PipelineError::EngineInit(_)
                | PipelineError::InvalidImage { .. }
                | PipelineError::Encode { .. }
                | PipelineError::Internal(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong".to_string(),
                ),
            },
            ApiError::Database(DatabaseError::NotFound) | ApiError::Storage(StorageError::NotFound) => {
                (StatusCode::NOT_FOUND, "Image does not exist".to_string())
            }
            ApiError::Storage(StorageError::InvalidId(_)) => {
                (StatusCode::BAD_REQUEST, "Invalid image id".to_string())
            }
            ApiError::Database(_) | ApiError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong".to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseError;

    #[test]
    fn no_image_data_is_detected_by_kind() {
        assert!(PipelineError::InvalidImage { operation: "resizing image" }.is_no_image_data());
        assert!(PipelineError::Encode {
            format: OutputFormat::Jpeg,
            cause: EncodeCause::NoImageData,
        }
        .is_no_image_data());
        assert!(!PipelineError::Encode {
            format: OutputFormat::Webp,
            cause: EncodeCause::Encoder("boom".into()),
        }
        .is_no_image_data());
        assert!(!PipelineError::EmptyInput.is_no_image_data());
    }

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (ApiError::from(PipelineError::EmptyInput), StatusCode::BAD_REQUEST),
            (ApiError::from(PipelineError::UnrecognizedFormat), StatusCode::BAD_REQUEST),
            (
                ApiError::from(PipelineError::InvalidParameter("blur".into())),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::from(PipelineError::Timeout), StatusCode::GATEWAY_TIMEOUT),
            (ApiError::from(PipelineError::QueueFull), StatusCode::SERVICE_UNAVAILABLE),
            (
                ApiError::from(PipelineError::InvalidImage { operation: "applying blur" }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::from(DatabaseError::NotFound), StatusCode::NOT_FOUND),
        ];

        for (err, expected) in cases {
            assert_eq!(err.status_and_message().0, expected, "{err}");
        }
    }

    #[test]
    fn internal_causes_do_not_leak() {
        let err = ApiError::from(PipelineError::Decode("jpeg: marker 0xd9 truncated".into()));
        let (_, message) = err.status_and_message();
        assert!(!message.contains("marker"));

        let err = ApiError::from(PipelineError::Encode {
            format: OutputFormat::Jpeg,
            cause: EncodeCause::Encoder("tj3Compress8 failed".into()),
        });
        let (_, message) = err.status_and_message();
        assert!(!message.contains("tj3"));
    }
}
