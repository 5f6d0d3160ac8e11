//! Error types for the LTI bridge

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the LTI bridge
pub type Result<T> = std::result::Result<T, Error>;

/// LTI bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Issuer or platform id is not registered
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// Request is missing required parameters or is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An inbound token failed validation
    #[error("Token validation failed: {0}")]
    TokenValidation(#[from] TokenValidationError),

    /// The platform could not be reached or rejected the call
    #[error("Platform unreachable or rejected the request: {0}")]
    Upstream(#[from] UpstreamError),

    /// Deep Linking selection was empty or out of range
    #[error("Invalid content selection: {0}")]
    ContentSelection(String),

    /// A collaborator record (assignment, identity, launch) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used when this error reaches a handler
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownPlatform(_) | Self::InvalidRequest(_) | Self::ContentSelection(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::TokenValidation(_) => StatusCode::UNAUTHORIZED,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error code for JSON responses
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::UnknownPlatform(_) => "unknown_platform",
            Self::InvalidRequest(_) => "invalid_request",
            Self::TokenValidation(TokenValidationError::ReplayedNonce) => "replayed_nonce",
            Self::TokenValidation(_) => "invalid_token",
            Self::Upstream(_) => "platform_error",
            Self::ContentSelection(_) => "invalid_selection",
            Self::NotFound(_) => "not_found",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal_error",
        }
    }
}

/// Reasons an inbound `id_token` is rejected.
///
/// Every variant is an authentication failure; none is ever downgraded.
#[derive(Error, Debug)]
pub enum TokenValidationError {
    /// The token is not a structurally valid JWT
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Only RS256 is accepted for LTI 1.3 messages
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The platform JWKS has no key usable for this token
    #[error("no usable key in platform JWKS (kid: {0})")]
    NoUsableKey(String),

    /// Signature did not verify against the platform key
    #[error("invalid signature")]
    BadSignature,

    /// `aud` does not contain the registered client id
    #[error("audience does not match client id {expected}")]
    AudienceMismatch {
        /// Registered client id
        expected: String,
    },

    /// `iss` does not match the platform lookup key
    #[error("issuer mismatch: expected {expected}")]
    IssuerMismatch {
        /// Registered issuer
        expected: String,
    },

    /// `exp` has passed
    #[error("token expired")]
    Expired,

    /// The nonce is unknown, expired, or was already consumed
    #[error("replayed or unknown nonce")]
    ReplayedNonce,

    /// A required LTI claim is absent
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),

    /// A claim is present but carries an unexpected value
    #[error("invalid claim {claim}: {reason}")]
    InvalidClaim {
        /// Claim name
        claim: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Any other decoding failure reported by the JWT library
    #[error("JWT verification failed: {0}")]
    Jwt(jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for TokenValidationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => Self::BadSignature,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                Self::Malformed(err.to_string())
            }
            ErrorKind::InvalidAlgorithm => Self::UnsupportedAlgorithm(err.to_string()),
            _ => Self::Jwt(err),
        }
    }
}

/// Failures talking to a platform (JWKS fetch, token exchange, AGS calls).
///
/// Retryable by the caller with backoff; never retried by this crate.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Connection, TLS, or timeout failure
    #[error("{operation} request failed: {source}")]
    Transport {
        /// What we were doing
        operation: &'static str,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// The platform answered with a non-success status
    #[error("{operation} rejected with HTTP {status}: {body}")]
    Status {
        /// What we were doing
        operation: &'static str,
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// The platform answered with a body we could not decode
    #[error("{operation} returned an unreadable body: {reason}")]
    Decode {
        /// What we were doing
        operation: &'static str,
        /// Decode failure
        reason: String,
    },

    /// The operation exceeded its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// What we were doing
        operation: &'static str,
        /// Deadline in seconds
        seconds: u64,
    },
}

impl UpstreamError {
    /// Wrap a transport error with the operation it interrupted
    #[must_use]
    pub fn transport(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { operation, source }
    }
}
