//! Crate-wide error type.
//!
//! Every component wraps its failures in [`Error`] before letting them cross
//! its boundary, tagging the originating component via `domain` as described
//! in the propagation policy: retryable errors (`Unavailable`,
//! `DeadlineExceeded`) are expected to be retried *inside* the component and
//! never leak out as transient; everything else is surfaced to the caller.

use thiserror::Error;

/// The domain tag attached to every [`Error`], identifying which component
/// raised it.
pub type Domain = &'static str;

pub const DOMAIN_CONSENSUS: Domain = "consensus";
pub const DOMAIN_FAILURE_DETECTOR: Domain = "failure-detector";
pub const DOMAIN_PLANNER: Domain = "planner";
pub const DOMAIN_EXECUTOR: Domain = "executor";
pub const DOMAIN_CLUSTER: Domain = "cluster-manager";

#[derive(Debug, Error)]
pub enum Error {
    #[error("[{domain}] invalid argument: {message}")]
    InvalidArgument { domain: Domain, message: String },

    #[error("[{domain}] not found: {message}")]
    NotFound { domain: Domain, message: String },

    #[error("[{domain}] already exists: {message}")]
    AlreadyExists { domain: Domain, message: String },

    #[error("[{domain}] unavailable: {message}")]
    Unavailable { domain: Domain, message: String },

    #[error("[{domain}] resource exhausted: {message}")]
    ResourceExhausted { domain: Domain, message: String },

    #[error("[{domain}] deadline exceeded: {message}")]
    DeadlineExceeded { domain: Domain, message: String },

    #[error("[{domain}] failed precondition: {message}")]
    FailedPrecondition { domain: Domain, message: String },

    #[error("[{domain}] internal invariant violation: {message}")]
    Internal { domain: Domain, message: String },
}

impl Error {
    pub fn invalid_argument(domain: Domain, message: impl Into<String>) -> Self {
        Error::InvalidArgument { domain, message: message.into() }
    }

    pub fn not_found(domain: Domain, message: impl Into<String>) -> Self {
        Error::NotFound { domain, message: message.into() }
    }

    pub fn already_exists(domain: Domain, message: impl Into<String>) -> Self {
        Error::AlreadyExists { domain, message: message.into() }
    }

    pub fn unavailable(domain: Domain, message: impl Into<String>) -> Self {
        Error::Unavailable { domain, message: message.into() }
    }

    pub fn resource_exhausted(domain: Domain, message: impl Into<String>) -> Self {
        Error::ResourceExhausted { domain, message: message.into() }
    }

    pub fn deadline_exceeded(domain: Domain, message: impl Into<String>) -> Self {
        Error::DeadlineExceeded { domain, message: message.into() }
    }

    pub fn failed_precondition(domain: Domain, message: impl Into<String>) -> Self {
        Error::FailedPrecondition { domain, message: message.into() }
    }

    pub fn internal(domain: Domain, message: impl Into<String>) -> Self {
        Error::Internal { domain, message: message.into() }
    }

    /// `true` for error kinds the spec designates as internally-retryable
    /// (i.e. that should never be the ones observed leaking out of a
    /// component under normal operation).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable { .. } | Error::DeadlineExceeded { .. })
    }

    pub fn domain(&self) -> Domain {
        match self {
            Error::InvalidArgument { domain, .. }
            | Error::NotFound { domain, .. }
            | Error::AlreadyExists { domain, .. }
            | Error::Unavailable { domain, .. }
            | Error::ResourceExhausted { domain, .. }
            | Error::DeadlineExceeded { domain, .. }
            | Error::FailedPrecondition { domain, .. }
            | Error::Internal { domain, .. } => domain,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
