//! HTTP error responses

use bytes::Bytes;
use http::{header, StatusCode};
use http_body_util::Full;
use mediaflow_db::DbError;
use mediaflow_jobs::JobError;
use serde::Serialize;
use std::fmt;

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

/// Error returned to HTTP clients.
///
/// Only `error_type` and `message` reach the client; `internal` is logged.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
    pub(crate) internal: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type: error_type.into(),
            message: message.into(),
            internal: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message)
    }

    /// Add internal details (logged, never sent)
    pub fn with_internal(mut self, details: impl Into<String>) -> Self {
        self.internal = Some(details.into());
        self
    }

    pub fn internal_details(&self) -> Option<&str> {
        self.internal.as_deref()
    }

    pub fn into_response(self) -> hyper::Response<Full<Bytes>> {
        let body = ErrorResponse {
            success: false,
            error: ErrorBody {
                error_type: self.error_type,
                message: self.message,
            },
        };
        let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| {
            br#"{"success":false,"error":{"type":"internal_error","message":"Internal error"}}"#
                .to_vec()
        });

        let mut response = hyper::Response::new(Full::new(Bytes::from(bytes)));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::bad_request(format!("Invalid JSON: {}", err))
    }
}

/// Submission-time job errors: validation is the caller's fault, broker
/// trouble is ours and transient.
impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match &err {
            JobError::QueueNotFound(name) => ApiError::not_found(format!("Unknown queue: {name}")),
            JobError::NotFound(id) => ApiError::not_found(format!("Unknown job: {id}")),
            JobError::UnknownJobType(_) | JobError::InvalidPayload(_) | JobError::SerializationError(_) => {
                ApiError::bad_request(err.to_string())
            }
            JobError::ShuttingDown => ApiError::service_unavailable("Server is shutting down"),
            JobError::BackendError(_) | JobError::Timeout(_) => {
                ApiError::service_unavailable("Job broker unavailable").with_internal(err.to_string())
            }
            _ => ApiError::internal("Job error").with_internal(err.to_string()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match &err {
            DbError::Constraint { .. } => {
                ApiError::conflict("Data conflicts with existing records").with_internal(err.to_string())
            }
            DbError::InvalidInput(message) => ApiError::bad_request(message.clone()),
            DbError::Unavailable(_) => {
                ApiError::service_unavailable("Database unavailable").with_internal(err.to_string())
            }
            DbError::Query(_) => ApiError::internal("Database error").with_internal(err.to_string()),
        }
    }
}
