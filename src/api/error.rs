//! Translation of runtime errors into wire responses.
//!
//! Application errors are carried as an [`ExceptionTransfer`] body with HTTP
//! status 511, keeping them distinct from transport-level failures so a
//! client can re-raise the exact [`ErrorKind`] on its side. Only
//! authentication (401) and malformed requests (400) use conventional
//! statuses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::execute::ExecuteError;
use crate::fsio::FileError;
use crate::protocol::{ErrorKind, ExceptionTransfer};
use crate::pty::PtyError;
use crate::session::SessionError;

#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn auth_failed() -> Self {
        Self::new(ErrorKind::AuthFailed, "invalid or missing bearer token")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::AuthFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            // 511 is the application-error channel; clients re-raise from
            // the body instead of guessing from the status.
            _ => StatusCode::NETWORK_AUTHENTICATION_REQUIRED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ExceptionTransfer {
            error_kind: self.kind,
            message: self.message,
            traceback: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let kind = match &err {
            SessionError::NotFound(_) => ErrorKind::SessionNotFound,
            SessionError::Exists(_) => ErrorKind::SessionExists,
            SessionError::Busy(_) => ErrorKind::SessionBusy,
            SessionError::Spawn(_) | SessionError::StartupTimeout(_) => ErrorKind::SpawnFailed,
            SessionError::TimeoutUnrecoverable => ErrorKind::CommandTimeoutUnrecoverable,
            SessionError::InterruptFailed(_) => ErrorKind::CommandTimeout,
            SessionError::CommandFailed(_) => ErrorKind::CommandFailed,
            SessionError::BadExpect(_) => ErrorKind::BadRequest,
            SessionError::Channel(PtyError::ChannelClosed) => ErrorKind::ChannelClosed,
            SessionError::Channel(_) => ErrorKind::InternalError,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ExecuteError> for ApiError {
    fn from(err: ExecuteError) -> Self {
        let kind = match &err {
            ExecuteError::EmptyCommand => ErrorKind::BadRequest,
            ExecuteError::Spawn { .. } => ErrorKind::SpawnFailed,
            ExecuteError::CommandFailed(_) => ErrorKind::CommandFailed,
            ExecuteError::Io(_) => ErrorKind::InternalError,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        let kind = match &err {
            FileError::NotFound(_) => ErrorKind::FileNotFound,
            FileError::IsDirectory(_) => ErrorKind::IsDirectory,
            FileError::NotADirectory(_) => ErrorKind::NotADirectory,
            FileError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            FileError::Decode { .. } => ErrorKind::DecodeError,
            FileError::UnsupportedEncoding(_) | FileError::UnsupportedErrors(_) => {
                ErrorKind::BadRequest
            }
            FileError::Io { .. } => ErrorKind::InternalError,
        };
        Self::new(kind, err.to_string())
    }
}
