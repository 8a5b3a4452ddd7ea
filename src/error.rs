//! Gateway error taxonomy.
//!
//! Every error that can cross the HTTP boundary is one of these variants;
//! the wire body is `{"type": ..., "message": ..., ...}` with extra fields
//! per variant (`code`/`position` for driver errors, `field` for request
//! validation).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Structured gateway error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A SQL error reported by the server, with its position within the
    /// statement text when the driver provides one (1-based).
    #[error("{severity} {code}: {message}")]
    Pg {
        severity: String,
        code: String,
        message: String,
        position: Option<u32>,
    },

    /// Pool exhausted or the database could not be reached.
    #[error("{0}")]
    Unavailable(String),

    /// Password resolution or authentication handshake failed.
    #[error("{0}")]
    AuthFailure(String),

    /// Malformed request: missing routing header, bad pagination, bad filter.
    #[error("{message}")]
    BadRequest {
        message: String,
        field: Option<String>,
    },

    /// The request was cancelled (client went away or the budget lapsed).
    #[error("request cancelled")]
    Canceled,

    /// A config mutation was rejected.
    #[error("{0}")]
    InvalidConfig(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest {
            message: message.into(),
            field: None,
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Error::BadRequest {
            message: format!("missing required `{field}`"),
            field: Some(field.to_owned()),
        }
    }

    /// Shift the driver-reported error position, used by the rewriter to map
    /// positions inside the wrapped query back into the user's statement.
    pub fn offset_position(mut self, offset_by: i64) -> Self {
        if let Error::Pg {
            position: Some(pos),
            ..
        } = &mut self
        {
            let shifted = *pos as i64 + offset_by;
            *pos = if shifted > 0 { shifted as u32 } else { 1 };
        }
        self
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Pg { .. } | Error::BadRequest { .. } | Error::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            Error::Canceled => StatusCode::REQUEST_TIMEOUT,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            Error::Pg {
                severity,
                code,
                message,
                position,
            } => serde_json::json!({
                "type": "PgError",
                "severity": severity,
                "code": code,
                "message": message,
                "position": position,
            }),
            Error::Unavailable(message) => serde_json::json!({
                "type": "Unavailable",
                "message": message,
            }),
            Error::AuthFailure(message) => serde_json::json!({
                "type": "AuthFailure",
                "message": message,
            }),
            Error::BadRequest { message, field } => serde_json::json!({
                "type": "BadRequest",
                "message": message,
                "field": field,
            }),
            Error::Canceled => serde_json::json!({
                "type": "Canceled",
                "message": self.to_string(),
            }),
            Error::InvalidConfig(message) => serde_json::json!({
                "type": "InvalidConfig",
                "message": message,
            }),
            Error::Internal(message) => serde_json::json!({
                "type": "Internal",
                "message": message,
            }),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::ErrorPosition;

        if let Some(db) = err.as_db_error() {
            return Error::Pg {
                severity: db.severity().to_owned(),
                code: db.code().code().to_owned(),
                message: db.message().to_owned(),
                position: db.position().and_then(|p| match p {
                    ErrorPosition::Original(pos) => Some(*pos),
                    // positions inside server-generated SQL are meaningless
                    // to the editor
                    ErrorPosition::Internal { .. } => None,
                }),
            };
        }

        if err.is_closed() {
            return Error::Unavailable(format!("connection closed: {err}"));
        }

        Error::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
