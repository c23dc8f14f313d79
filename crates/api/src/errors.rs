use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;

use lineguard_core::annotator::AnnotatorError;
use lineguard_core::detector::DetectorError;
use lineguard_core::files::FilesError;
use lineguard_core::tasks::TaskStoreError;
use lineguard_core::validation::ValidationError;

/// API-surface error taxonomy. Upstream service errors propagate their
/// status and detail verbatim; everything storage- or transport-shaped
/// surfaces as 503.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Oversize(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("upstream service error ({status}): {detail}")]
    Upstream { status: u16, detail: String },
    #[error("{0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Oversize(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            ApiError::Upstream { detail, .. } => detail.clone(),
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(json!({ "error": message }))
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        match e {
            // Query-parameter range violations surface as 422
            ValidationError::ConfidenceOutOfRange
            | ValidationError::PreviewLimitOutOfRange { .. }
            | ValidationError::RouteNameTooLong { .. } => ApiError::Unprocessable(e.to_string()),
            other => ApiError::Validation(other.to_string()),
        }
    }
}

impl From<TaskStoreError> for ApiError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::TaskNotFound => ApiError::NotFound("Задача не найдена".to_string()),
            TaskStoreError::ImageNotFound => {
                ApiError::NotFound("Изображение не найдено".to_string())
            }
            TaskStoreError::StorageUnavailable(err) => ApiError::Unavailable(err.to_string()),
            TaskStoreError::Storage(err) => ApiError::Internal(err.to_string()),
            TaskStoreError::InvalidSummary(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<FilesError> for ApiError {
    fn from(e: FilesError) -> Self {
        match e {
            FilesError::NotFound => ApiError::NotFound("Файл не найден".to_string()),
            FilesError::Oversize => ApiError::Oversize(e.to_string()),
            FilesError::BadRequest(detail) => ApiError::Validation(detail),
            FilesError::Unavailable(detail) => ApiError::Unavailable(detail),
            FilesError::Upstream { status, detail } => ApiError::Upstream { status, detail },
            FilesError::Decode(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<DetectorError> for ApiError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::Timeout => ApiError::Upstream {
                status: 504,
                detail: "Таймаут при обращении к сервису детекции".to_string(),
            },
            DetectorError::Unavailable(detail) => ApiError::Unavailable(detail),
            DetectorError::Oversize { .. } => ApiError::Validation(e.to_string()),
            DetectorError::Upstream { status, detail } => ApiError::Upstream { status, detail },
            DetectorError::Decode(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<AnnotatorError> for ApiError {
    fn from(e: AnnotatorError) -> Self {
        match e {
            AnnotatorError::Unavailable(detail) => ApiError::Unavailable(detail),
            AnnotatorError::Upstream { status, detail } => ApiError::Upstream { status, detail },
            AnnotatorError::Decode(detail) => ApiError::Internal(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unprocessable(String::new()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Unavailable(String::new()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Upstream {
                status: 504,
                detail: String::new()
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_query_range_violations_are_422() {
        let err: ApiError = ValidationError::PreviewLimitOutOfRange { max: 10 }.into();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = ValidationError::NoFiles.into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
