use thiserror::Error;

use crate::{codec::CodecError, protocol::ProtocolError};

/// Error codes carried by application-level error responses.
pub mod error_codes {
    /// The remote handler failed.
    pub const APPLICATION_ERROR: u32 = 0x0000_0201;
    /// The remote side refused the call (e.g. it is shutting down).
    pub const REJECTED: u32 = 0x0000_0202;
    pub const CANCELED: u32 = 0x0000_0203;
    /// No handler for the routing key, wrong interaction model, or undecodable request.
    pub const INVALID: u32 = 0x0000_0204;
}

/// Errors surfaced by the upstream call path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The selected service has no active connection.
    #[error("No available connection for service {0}")]
    NoAvailableConnection(String),

    /// No cluster is registered for the service and no broker is configured.
    #[error("No route for service {0} and no broker configured")]
    NoRoute(String),

    /// Two different service identities hash to the same routing id.
    #[error("Service id {id:#010x} of {incoming} already routes to {existing}")]
    RouteConflict { id: u32, existing: String, incoming: String },

    /// The session closed underneath the call.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection aborted: {0}")]
    ConnectionAborted(String),

    /// Generic transport failure.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Health probe answered with a non-serving status, timed out or failed.
    #[error("Health check failed for {uri}: {reason}")]
    HealthCheckFailed { uri: String, reason: String },

    #[error("Request timeout")]
    Timeout,

    /// A well-formed error response from the remote handler.
    #[error("Application error {code:#x}: {message}")]
    Application { code: u32, message: String },

    /// The requester, cluster or manager has been disposed.
    #[error("Disposed: {0}")]
    Disposed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl UpstreamError {
    pub fn application(code: u32, message: impl Into<String>) -> Self {
        Self::Application { code, message: message.into() }
    }

    /// Returns `true` for failures of the session itself: closed, refused, aborted,
    /// generic connection failure, and failed health probes.
    ///
    /// These mark the connection unhealthy and start a reconnect campaign.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_) |
                Self::ConnectionRefused(_) |
                Self::ConnectionAborted(_) |
                Self::ConnectionFailed(_) |
                Self::HealthCheckFailed { .. }
        )
    }

    /// Returns `true` if an in-flight call may be retried once on another connection.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed(_))
    }

    /// Returns `true` if this error should count against the connection's latency score.
    ///
    /// Application errors are well-formed answers and do not.
    #[must_use]
    pub fn should_penalize_connection(&self) -> bool {
        self.is_connection_error() || matches!(self, Self::Timeout)
    }

    /// Application error code, if this is an application error.
    #[must_use]
    pub fn application_code(&self) -> Option<u32> {
        match self {
            Self::Application { code, .. } => Some(*code),
            _ => None,
        }
    }
}
