//! Provider error types.

use std::fmt;

use thiserror::Error;

/// Whether a failed provider call is worth retrying.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// Timeouts, connection failures, 5xx, rate limits.
    Retryable,
    /// The provider understood the request and rejected it.
    Permanent,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
        }
    }
}

/// An outbound provider call failed.
#[derive(Clone, Debug, Error)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub msg: String,
    /// HTTP status of the provider response, when one was received.
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Retryable,
            msg: msg.into(),
            status: None,
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            msg: msg.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "provider call failed ({}, http {status}): {}",
                self.kind.as_str(),
                self.msg
            ),
            None => write!(
                f,
                "provider call failed ({}): {}",
                self.kind.as_str(),
                self.msg
            ),
        }
    }
}
