//! Error types for the tracker integration.

use thiserror::Error;

/// Authentication failures: inbound signatures and outbound credentials.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing payload")]
    MissingPayload,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Could not generate installation token: {0}")]
    Credential(String),
}

impl AuthError {
    pub fn credential(msg: impl Into<String>) -> Self {
        AuthError::Credential(msg.into())
    }

    /// True for failures of the inbound request itself (HTTP 400 territory).
    pub fn is_rejected_request(&self) -> bool {
        matches!(
            self,
            AuthError::MissingPayload | AuthError::MissingSignature | AuthError::InvalidSignature
        )
    }
}

/// Failures of tracker REST operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Upstream(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl TrackerError {
    pub fn upstream(msg: impl Into<String>) -> Self {
        TrackerError::Upstream(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TrackerError::NotFound(_))
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, TrackerError::Upstream(_))
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;
