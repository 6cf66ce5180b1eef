//! Error types for Parley
//!
//! Every variant has one row in [`Error::class`]: the HTTP status the API
//! answers with, the stable code clients match on, and whether the same
//! work can succeed when tried again later.

use thiserror::Error;

/// Main error type for Parley
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// The store could not be reached or had no free connection
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness rule rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Parley
pub type Result<T> = std::result::Result<T, Error>;

/// How an error surfaces and whether retrying makes sense
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClass {
    pub status: u16,
    pub code: &'static str,
    pub retryable: bool,
}

impl ErrorClass {
    const fn new(status: u16, code: &'static str, retryable: bool) -> Self {
        Self {
            status,
            code,
            retryable,
        }
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_) => ErrorClass::new(500, "CONFIG_ERROR", false),
            Error::Database(_) => ErrorClass::new(500, "DATABASE_ERROR", true),
            Error::Unavailable(_) => ErrorClass::new(503, "UNAVAILABLE", true),
            Error::Gateway(_) => ErrorClass::new(502, "GATEWAY_ERROR", true),
            Error::Auth(_) => ErrorClass::new(401, "UNAUTHORIZED", false),
            Error::Validation(_) => ErrorClass::new(422, "VALIDATION_ERROR", false),
            Error::NotFound(_) => ErrorClass::new(404, "NOT_FOUND", false),
            Error::Conflict(_) => ErrorClass::new(409, "CONFLICT", false),
            Error::InvalidState(_) => ErrorClass::new(409, "INVALID_STATE", false),
            Error::Internal(_) | Error::Other(_) => {
                ErrorClass::new(500, "INTERNAL_ERROR", true)
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        self.class().status
    }

    pub fn code(&self) -> &'static str {
        self.class().code
    }

    /// Whether the same operation may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        self.class().retryable
    }

    /// Whether the message is safe to show to API callers
    pub fn is_client_facing(&self) -> bool {
        self.status_code() < 500
    }

    /// Find a Parley error anywhere in an `anyhow` chain
    pub fn find_in(err: &anyhow::Error) -> Option<&Error> {
        err.chain().find_map(|cause| cause.downcast_ref::<Error>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::NotFound("campaign".into()).status_code(), 404);
        assert_eq!(Error::InvalidState("paused".into()).status_code(), 409);
        assert_eq!(Error::Conflict("instance id".into()).code(), "CONFLICT");
        assert_eq!(Error::Auth("bad signature".into()).code(), "UNAUTHORIZED");
        assert_eq!(Error::Unavailable("pool timed out".into()).status_code(), 503);
    }

    #[test]
    fn test_only_infrastructure_errors_are_retryable() {
        assert!(Error::Database("deadlock detected".into()).is_retryable());
        assert!(Error::Unavailable("pool timed out".into()).is_retryable());
        assert!(Error::Gateway("502".into()).is_retryable());

        assert!(!Error::Validation("bad phone".into()).is_retryable());
        assert!(!Error::NotFound("campaign".into()).is_retryable());
        assert!(!Error::Config("missing url".into()).is_retryable());
    }

    #[test]
    fn test_client_facing_split() {
        assert!(Error::Validation("bad".into()).is_client_facing());
        assert!(Error::Conflict("slug".into()).is_client_facing());
        assert!(!Error::Database("relation missing".into()).is_client_facing());
        assert!(!Error::Unavailable("down".into()).is_client_facing());
    }

    #[test]
    fn test_find_in_walks_context_chain() {
        let err = anyhow::Error::from(Error::Validation("unknown event".into()))
            .context("reconcile webhook");
        assert_eq!(Error::find_in(&err).map(Error::code), Some("VALIDATION_ERROR"));

        let plain = anyhow::anyhow!("io timeout");
        assert!(Error::find_in(&plain).is_none());
    }
}
