//! Serializable api error types and error kinds returned by the escrow
//! engine.
//!
//! Every handler failure is serialized as the single wire shape
//! `{"ok": false, "error": {"kind": <stable string>, "message": <human>}}`.
//! Kind strings are stable so clients can switch on them; messages are for
//! humans and may change.

use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Associated constants can't be imported.
pub const CLIENT_400_BAD_REQUEST: StatusCode = StatusCode::BAD_REQUEST;
pub const CLIENT_401_UNAUTHORIZED: StatusCode = StatusCode::UNAUTHORIZED;
pub const CLIENT_403_FORBIDDEN: StatusCode = StatusCode::FORBIDDEN;
pub const CLIENT_404_NOT_FOUND: StatusCode = StatusCode::NOT_FOUND;
pub const CLIENT_409_CONFLICT: StatusCode = StatusCode::CONFLICT;
pub const SERVER_500_INTERNAL_SERVER_ERROR: StatusCode =
    StatusCode::INTERNAL_SERVER_ERROR;
pub const SERVER_502_BAD_GATEWAY: StatusCode = StatusCode::BAD_GATEWAY;

/// A trait to get the HTTP status code for a given error.
pub trait ToHttpStatus {
    fn to_http_status(&self) -> StatusCode;
}

/// The engine's error taxonomy.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, strum::VariantArray,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input: missing field, unparseable amount, amount ≤ 0,
    /// insufficient dispute reason, out-of-range split percent.
    Validation,
    /// The request carried no (or unusable) identity.
    Authentication,
    /// The requester is not the required party for this operation.
    Authorization,
    /// The referenced entity does not exist.
    NotFound,
    /// The requested operation is not allowed from the current status.
    InvalidStateTransition,
    /// An outbound payment-provider call failed.
    Provider,
    /// An invariant was violated: unique constraint, conflicting
    /// concurrent update.
    Integrity,
    /// Anything unexpected.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::InvalidStateTransition => "invalid_state_transition",
            Self::Provider => "provider",
            Self::Integrity => "integrity",
            Self::Internal => "internal",
        }
    }
}

impl ToHttpStatus for ErrorKind {
    fn to_http_status(&self) -> StatusCode {
        match self {
            Self::Validation => CLIENT_400_BAD_REQUEST,
            Self::Authentication => CLIENT_401_UNAUTHORIZED,
            Self::Authorization => CLIENT_403_FORBIDDEN,
            Self::NotFound => CLIENT_404_NOT_FOUND,
            Self::InvalidStateTransition => CLIENT_409_CONFLICT,
            Self::Integrity => CLIENT_409_CONFLICT,
            Self::Provider => SERVER_502_BAD_GATEWAY,
            Self::Internal => SERVER_500_INTERNAL_SERVER_ERROR,
        }
    }
}

/// An api error: a stable kind plus a human-readable message.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, msg)
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, msg)
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        let what = what.into();
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    /// Log this error and get its HTTP [`StatusCode`]. Server-side errors
    /// log at ERROR, client-side at WARN.
    pub fn log_and_status(&self) -> StatusCode {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!("{self}");
        } else {
            tracing::warn!("{self}");
        }
        status
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.msg)
    }
}

impl ToHttpStatus for ApiError {
    fn to_http_status(&self) -> StatusCode {
        self.kind.to_http_status()
    }
}

// --- Wire shapes --- //

/// The JSON-serialized error payload inside [`ErrorResponse`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// `ErrorResponse` is the only error shape sent across the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: ErrorBody,
}

impl From<ApiError> for ErrorResponse {
    fn from(err: ApiError) -> Self {
        Self {
            ok: false,
            error: ErrorBody {
                kind: err.kind,
                message: err.msg,
            },
        }
    }
}

impl From<ErrorResponse> for ApiError {
    fn from(resp: ErrorResponse) -> Self {
        Self {
            kind: resp.error.kind,
            msg: resp.error.message,
        }
    }
}

/// The success envelope: `{"ok": true, "data": <payload>}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiOk<T> {
    pub ok: bool,
    pub data: T,
}

impl<T> ApiOk<T> {
    pub fn new(data: T) -> Self {
        Self { ok: true, data }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        // Server-side errors must be logged here: by the time axum's layers
        // see this, it is already an opaque `http::Response`.
        let status = self.log_and_status();
        let body = axum::Json(ErrorResponse::from(self));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod test {
    use strum::VariantArray;

    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let expected = [
            "validation",
            "authentication",
            "authorization",
            "not_found",
            "invalid_state_transition",
            "provider",
            "integrity",
            "internal",
        ];
        for (kind, expected) in ErrorKind::VARIANTS.iter().zip(expected) {
            assert_eq!(kind.as_str(), expected);
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
        }
    }

    #[test]
    fn wire_shape() {
        let err = ApiError::validation("amount must be positive");
        let resp = ErrorResponse::from(err);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ok": false,
                "error": {
                    "kind": "validation",
                    "message": "amount must be positive",
                },
            })
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ErrorKind::InvalidStateTransition.to_http_status(),
            CLIENT_409_CONFLICT
        );
        assert_eq!(ErrorKind::Provider.to_http_status(), SERVER_502_BAD_GATEWAY);
        assert_eq!(
            ErrorKind::Authentication.to_http_status(),
            CLIENT_401_UNAUTHORIZED
        );
        assert_eq!(
            ErrorKind::Authorization.to_http_status(),
            CLIENT_403_FORBIDDEN
        );
    }
}
