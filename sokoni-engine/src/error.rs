//! Engine error type, mapped onto the api error taxonomy at the HTTP
//! boundary.

use sokoni_api::error::{ApiError, ErrorKind};
use sokoni_api::types::EscrowStatus;
use sokoni_provider::ProviderError;
use thiserror::Error;

use crate::store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: bad amount, short dispute reason, missing field.
    #[error("{0}")]
    Validation(String),

    /// The requester is not the required party for this operation.
    #[error("{0}")]
    Unauthorized(String),

    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The operation is not allowed from the escrow's current status.
    #[error("cannot {op} while {status}")]
    InvalidTransition {
        op: &'static str,
        status: EscrowStatus,
    },

    /// A pre-commit provider call failed; post-commit failures are absorbed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// An invariant was violated (unique constraint, conflicting update).
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn invalid_transition(op: &'static str, status: EscrowStatus) -> Self {
        Self::InvalidTransition { op, status }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let msg = err.to_string();
        let kind = match err {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Unauthorized(_) => ErrorKind::Authorization,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidTransition { .. } =>
                ErrorKind::InvalidStateTransition,
            EngineError::Provider(_) => ErrorKind::Provider,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::Store(_) => ErrorKind::Internal,
        };
        // Internal and provider details stay in the logs, not on the wire.
        let msg = match kind {
            ErrorKind::Internal => {
                tracing::error!("internal error: {msg}");
                "internal error".to_owned()
            }
            ErrorKind::Provider => {
                tracing::error!("provider error: {msg}");
                "payment provider request failed".to_owned()
            }
            _ => msg,
        };
        ApiError::new(kind, msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn maps_to_api_kinds() {
        let api = ApiError::from(EngineError::Validation("bad".into()));
        assert_eq!(api.kind, ErrorKind::Validation);

        let api = ApiError::from(EngineError::invalid_transition(
            "release",
            EscrowStatus::Pending,
        ));
        assert_eq!(api.kind, ErrorKind::InvalidStateTransition);
        assert_eq!(api.msg, "cannot release while PENDING");

        let api = ApiError::from(EngineError::Store(StoreError::Database(
            "secret detail".into(),
        )));
        assert_eq!(api.kind, ErrorKind::Internal);
        assert_eq!(api.msg, "internal error");
    }
}
