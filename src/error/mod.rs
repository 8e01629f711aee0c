use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::delivery::StoreError;
use crate::dispatcher::{DispatchError, RecoveryError};
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
}

fn production_mode() -> bool {
    matches!(
        std::env::var("RUN_MODE").as_deref(),
        Ok("production") | Ok("prod")
    )
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Auth(_) => "UNAUTHORIZED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Unavailable(_) => "BACKEND_UNAVAILABLE",
        }
    }

    /// Detail shown to API callers. Server-side failures are replaced with a
    /// generic message in production.
    fn client_message(&self) -> String {
        let generic = match self {
            AppError::Config(_) => Some("Configuration error"),
            AppError::Internal(_) => Some("Internal server error"),
            AppError::Unavailable(_) => Some("Service temporarily unavailable"),
            _ => None,
        };
        match generic {
            Some(msg) if production_mode() => msg.to_string(),
            _ => self.detail(),
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::Config(e) => e.to_string(),
            AppError::Auth(msg)
            | AppError::Validation(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Internal(msg)
            | AppError::Unavailable(msg) => msg.clone(),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
            RegistryError::InvalidUrl(_) | RegistryError::Validation(_) => {
                AppError::Validation(err.to_string())
            }
            RegistryError::Postgres(_) | RegistryError::Unavailable(_) => {
                AppError::Unavailable(err.to_string())
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => AppError::NotFound(err.to_string()),
            StoreError::Serialization(_) => AppError::Internal(err.to_string()),
            StoreError::Postgres(_) | StoreError::Unavailable(_) => {
                AppError::Unavailable(err.to_string())
            }
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        AppError::Unavailable(err.to_string())
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(msg) => AppError::Validation(msg),
            DispatchError::Store(e) => e.into(),
            DispatchError::Registry(e) => e.into(),
        }
    }
}

impl From<RecoveryError> for AppError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::DeliveryNotFound(_)
            | RecoveryError::DeadLetterNotFound(_)
            | RecoveryError::EndpointNotFound(_) => AppError::NotFound(err.to_string()),
            RecoveryError::AlreadyDelivered(_)
            | RecoveryError::AttemptInFlight(_)
            | RecoveryError::AlreadyReplayed(_)
            | RecoveryError::EndpointInactive(_) => AppError::Conflict(err.to_string()),
            RecoveryError::Store(e) => e.into(),
            RecoveryError::Registry(e) => e.into(),
            RecoveryError::Scheduler(e) => e.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        if status.is_server_error() {
            tracing::error!(code, status = status.as_u16(), error = %self.detail(), "API error");
        } else {
            tracing::debug!(
                code,
                status = status.as_u16(),
                error = %self.detail(),
                "API request rejected"
            );
        }

        let message = self.client_message();
        let body = ErrorResponse {
            error: ErrorBody {
                code,
                message: &message,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_recovery_errors_map_to_http_status() {
        let id = Uuid::new_v4();

        let resp = AppError::from(RecoveryError::DeliveryNotFound(id)).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = AppError::from(RecoveryError::AlreadyDelivered(id)).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_registry_validation_maps_to_bad_request() {
        let resp =
            AppError::from(RegistryError::InvalidUrl("ftp://x".to_string())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
