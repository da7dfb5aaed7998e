use crate::config::ConfigError;
use crate::telemetry::TelemetryError;
use crate::workflows::repairs::RepairError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Repair(RepairError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Repair(err) => write!(f, "repair workflow error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Repair(err) => Some(err),
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Repair(err) => match err {
                RepairError::InvalidTransition { .. }
                | RepairError::ConflictingActiveOffer { .. }
                | RepairError::DuplicateOpenRequest { .. }
                | RepairError::AlreadyRated { .. } => StatusCode::CONFLICT,
                RepairError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                RepairError::NotFound { .. } => StatusCode::NOT_FOUND,
                RepairError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                RepairError::Repository { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "error": self.to_string() });
        if let AppError::Repair(err) = &self {
            body["operation"] = json!(err.operation().label());
            if let Some(ticket) = err.ticket() {
                body["ticket"] = json!(ticket);
            }
        }
        (status, Json(body)).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<RepairError> for AppError {
    fn from(value: RepairError) -> Self {
        Self::Repair(value)
    }
}
