//! # Error Handling
//!
//! Defines the domain error taxonomy for the broadcast lifecycle layer and the
//! conversion into HTTP responses for the REST surface.
//!
//! ## Error Categories:
//! - **AuthError**: bad/expired/missing-when-required credential
//! - **AdmissionError**: a connection attempt the registry refuses
//! - **RefreshError**: failure standing up a successor connection
//! - **BufferOverflowError**: audio buffer overflow (non-fatal, signals loss risk)
//! - **TransportError**: unexpected loss of the underlying socket
//! - **AppError**: HTTP-facing wrapper used by the REST handlers
//!
//! Auth and admission failures are terminal for the attempt: the connection is
//! refused with a close code and a human-readable message, never silently
//! demoted to a different role.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Credential verification failures for the speaker path.
///
/// A missing token is deliberately absent here: the Authorizer treats "no
/// token" as the anonymous listener path, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Signature did not verify or the token could not be parsed
    InvalidToken(String),

    /// The `exp` claim has passed
    Expired,

    /// The `aud` claim does not match the configured audience
    WrongAudience,

    /// The `iss` claim does not match the configured issuer
    WrongIssuer,

    /// The `token_use` claim is not the expected type
    WrongTokenUse(String),

    /// The token names a signing key the issuer no longer publishes
    UnknownKey(String),

    /// The signing key set could not be fetched from the issuer
    KeyFetch(String),
}

impl AuthError {
    /// Machine-readable code carried in the wire `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::Expired => "token_expired",
            AuthError::WrongAudience => "wrong_audience",
            AuthError::WrongIssuer => "wrong_issuer",
            AuthError::WrongTokenUse(_) => "wrong_token_use",
            AuthError::UnknownKey(_) => "unknown_signing_key",
            AuthError::KeyFetch(_) => "key_fetch_failed",
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidToken(msg) => write!(f, "Invalid token: {}", msg),
            AuthError::Expired => write!(f, "Token has expired"),
            AuthError::WrongAudience => write!(f, "Token audience mismatch"),
            AuthError::WrongIssuer => write!(f, "Token issuer mismatch"),
            AuthError::WrongTokenUse(got) => write!(f, "Unexpected token_use claim: {}", got),
            AuthError::UnknownKey(kid) => write!(f, "Unknown signing key: {}", kid),
            AuthError::KeyFetch(msg) => write!(f, "Failed to fetch signing keys: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Reasons the ConnectionRegistry refuses a connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionError {
    /// No session with that ID, or the session is no longer active
    SessionNotFound(String),

    /// Another live speaker connection already exists for the session
    DuplicateSpeaker(String),

    /// Listener admission without a target language
    MissingLanguage,

    /// Refresh admission referenced a connection the registry does not know
    UnknownPredecessor(String),

    /// The configured concurrent-session ceiling was reached
    CapacityExceeded(usize),

    /// The session/connection store rejected the write
    Store(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::SessionNotFound(_) => "session_not_found",
            AdmissionError::DuplicateSpeaker(_) => "duplicate_speaker",
            AdmissionError::MissingLanguage => "missing_language",
            AdmissionError::UnknownPredecessor(_) => "unknown_predecessor",
            AdmissionError::CapacityExceeded(_) => "capacity_exceeded",
            AdmissionError::Store(_) => "store_error",
        }
    }
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::SessionNotFound(id) => {
                write!(f, "Session '{}' not found or not active", id)
            }
            AdmissionError::DuplicateSpeaker(id) => {
                write!(f, "Session '{}' already has a live speaker connection", id)
            }
            AdmissionError::MissingLanguage => {
                write!(f, "Listener admission requires a target language")
            }
            AdmissionError::UnknownPredecessor(id) => {
                write!(f, "Refresh admission references unknown connection '{}'", id)
            }
            AdmissionError::CapacityExceeded(limit) => {
                write!(f, "Capacity limit ({}) reached", limit)
            }
            AdmissionError::Store(msg) => write!(f, "Session store error: {}", msg),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Failures of the make-before-break connection refresh.
///
/// These are retried with bounded backoff and never tear down the existing
/// connection on their own.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// The successor connection did not reach CONNECTED in time
    SuccessorTimeout { attempts: u32 },

    /// A successor arrived for a window the coordinator is not tracking
    WindowNotFound(String),

    /// The old connection closed for unrelated reasons; refresh abandoned
    Abandoned(String),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::SuccessorTimeout { attempts } => {
                write!(f, "Successor connection timed out after {} attempts", attempts)
            }
            RefreshError::WindowNotFound(id) => {
                write!(f, "No refresh window open for connection '{}'", id)
            }
            RefreshError::Abandoned(id) => {
                write!(f, "Refresh abandoned, connection '{}' closed", id)
            }
        }
    }
}

impl std::error::Error for RefreshError {}

/// Audio buffer overflow. Non-fatal: the pipeline keeps running, the event is
/// metered and surfaced as a buffering indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferOverflowError {
    /// Milliseconds of audio evicted to make room
    pub dropped_ms: u64,
}

impl fmt::Display for BufferOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer overflow, evicted {}ms of audio", self.dropped_ms)
    }
}

impl std::error::Error for BufferOverflowError {}

/// Unexpected loss or misbehavior of the underlying socket. Triggers the
/// ordinary client reconnect path, distinct from the planned refresh.
#[derive(Debug)]
pub enum TransportError {
    /// Could not establish the connection
    Connect(String),

    /// Protocol-level failure on an established connection
    Protocol(String),

    /// The peer closed without the expected handshake
    ClosedUnexpectedly(Option<u16>),

    /// Envelope could not be encoded/decoded
    Serialization(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "Connect failed: {}", msg),
            TransportError::Protocol(msg) => write!(f, "Transport protocol error: {}", msg),
            TransportError::ClosedUnexpectedly(code) => {
                write!(f, "Connection closed unexpectedly (code {:?})", code)
            }
            TransportError::Serialization(msg) => write!(f, "Envelope error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

/// HTTP-facing error type for the REST handlers.
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (store failures, poisoned state, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Missing or failed speaker credential
    Unauthorized(String),

    /// Authenticated, but not the speaker for this session
    Forbidden(String),

    /// Requested resource was not found
    NotFound(String),

    /// The request conflicts with current state (e.g. duplicate speaker)
    Conflict(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Maps each error variant to an HTTP status and a consistent JSON body:
/// `{ "error": { "type", "message", "timestamp" } }`.
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::Unauthorized(msg) => (
                actix_web::http::StatusCode::UNAUTHORIZED,
                "unauthorized",
                msg.clone(),
            ),
            AppError::Forbidden(msg) => (
                actix_web::http::StatusCode::FORBIDDEN,
                "forbidden",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Conflict(msg) => (
                actix_web::http::StatusCode::CONFLICT,
                "conflict",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Credential failures on the REST surface appear as 401.
impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}

/// Admission refusals map onto the closest HTTP semantics.
impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match &err {
            AdmissionError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            AdmissionError::DuplicateSpeaker(_) => AppError::Conflict(err.to_string()),
            AdmissionError::MissingLanguage => AppError::BadRequest(err.to_string()),
            AdmissionError::UnknownPredecessor(_) => AppError::BadRequest(err.to_string()),
            AdmissionError::CapacityExceeded(_) => AppError::Conflict(err.to_string()),
            AdmissionError::Store(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our HTTP-facing error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_token_message_mentions_expiry() {
        let err = AuthError::Expired;
        assert!(err.to_string().contains("expired"));
        assert_eq!(err.code(), "token_expired");
    }

    #[test]
    fn admission_errors_map_to_http_semantics() {
        let not_found: AppError = AdmissionError::SessionNotFound("x".into()).into();
        assert!(matches!(not_found, AppError::NotFound(_)));

        let dup: AppError = AdmissionError::DuplicateSpeaker("x".into()).into();
        assert!(matches!(dup, AppError::Conflict(_)));

        let missing: AppError = AdmissionError::MissingLanguage.into();
        assert!(matches!(missing, AppError::BadRequest(_)));
    }
}
