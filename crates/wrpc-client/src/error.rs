// ABOUTME: Error types for the wrpc-client crate.
// ABOUTME: Separates connect, exchange, mask, and convergence failures so callers can pick compensation.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while establishing a connection or running one exchange on it.
///
/// Every exchange-level variant carries the method being invoked and the
/// correlation token so an operator can match a failure to a backend exchange.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The configured address could not be turned into an upgrade request.
    #[error("invalid backend address: {0}")]
    InvalidAddress(String),

    /// The backend rejected the credential. Never retried.
    #[error("unauthorized: backend at {address} rejected the credential")]
    Unauthorized { address: String },

    /// Every connection attempt failed with a retryable error.
    #[error("connection to {address} failed after {attempts} attempts: {last}")]
    ConnectExhausted {
        address: String,
        attempts: u32,
        last: String,
    },

    /// The caller cancelled while the connection was still being established.
    #[error("connecting to {address} cancelled after {attempts} attempts")]
    ConnectCancelled { address: String, attempts: u32 },

    /// The request envelope could not be serialized.
    #[error("failed to encode request for {method} (token {token}): {source}")]
    Encode {
        method: String,
        token: String,
        #[source]
        source: serde_json::Error,
    },

    /// Writing the request frame failed.
    #[error("failed to send request for {method} (token {token}): {message}")]
    Send {
        method: String,
        token: String,
        message: String,
    },

    /// Reading a response frame failed at the transport level.
    #[error("failed to read response for {method} (token {token}): {message}")]
    Receive {
        method: String,
        token: String,
        message: String,
    },

    /// The peer closed the connection before the call was drained.
    #[error("connection closed before {method} (token {token}) completed")]
    ConnectionClosed { method: String, token: String },

    /// A response frame was not a well-formed keyed mapping.
    #[error("malformed response frame for {method} (token {token}): {source}")]
    Decode {
        method: String,
        token: String,
        #[source]
        source: serde_json::Error,
    },

    /// The backend rejected the call. The value is propagated verbatim.
    #[error("{method} (token {token}) failed: {message}")]
    Application {
        method: String,
        token: String,
        message: String,
    },

    /// The two-frame protocol was violated (missing or wrong sentinel).
    #[error("protocol violation during {method} (token {token}): {detail}")]
    Protocol {
        method: String,
        token: String,
        detail: String,
    },

    /// The reply did not have the shape the caller expected.
    #[error("unexpected response shape from {method} (token {token}): {detail}")]
    SchemaMismatch {
        method: String,
        token: String,
        detail: String,
    },

    /// The caller cancelled the exchange before it completed.
    #[error("{method} (token {token}) cancelled")]
    Cancelled { method: String, token: String },
}

impl RpcError {
    /// True for the backend's own rejection of a call, as opposed to a broken channel.
    pub fn is_application(&self) -> bool {
        matches!(self, RpcError::Application { .. })
    }

    /// True when the connection can no longer be trusted for reuse.
    pub fn is_fatal(&self) -> bool {
        !self.is_application()
    }

    /// True for a channel that broke mid-exchange; a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Send { .. } | RpcError::Receive { .. } | RpcError::ConnectionClosed { .. }
        )
    }

    /// The application error text, if this is a backend rejection.
    pub fn application_message(&self) -> Option<&str> {
        match self {
            RpcError::Application { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Errors raised while deriving a field mask.
#[derive(Error, Debug)]
pub enum MaskError {
    /// The payload could not be serialized.
    #[error("failed to serialize payload for field mask: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The payload does not serialize to a keyed structure.
    #[error("field mask payload must serialize to an object, got {0}")]
    NotAnObject(&'static str),
}

/// Terminal failures of a convergence loop.
#[derive(Error, Debug)]
pub enum ConvergenceError<E> {
    /// The deadline elapsed while the probe kept reporting "not yet".
    #[error("not converged after {attempts} attempts in {elapsed:?}: {last_reason}")]
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last_reason: String,
    },

    /// The probe reported a non-retryable failure.
    #[error("convergence aborted: {0}")]
    Aborted(#[source] E),

    /// The caller cancelled the loop.
    #[error("convergence cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    /// The loop timed out and the compensating action failed as well.
    #[error("not converged after {attempts} attempts ({last_reason}) and cleanup failed: {cleanup}")]
    CompensationFailed {
        attempts: u32,
        last_reason: String,
        #[source]
        cleanup: E,
    },
}

impl<E> ConvergenceError<E> {
    /// True if the loop ran out of time, with or without a failed cleanup.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ConvergenceError::TimedOut { .. } | ConvergenceError::CompensationFailed { .. }
        )
    }
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No config path was given and no default location exists.
    #[error("could not determine config path")]
    NoPath,

    /// The config file could not be read.
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
