//! Error types for icap-core
//!
//! Follows the teacher's pattern of one flat, richly-contexted error
//! enum rather than per-module error types. Each variant maps to one
//! of the error kinds enumerated in the ICAP error-handling design:
//! protocol framing, resource-not-found, method-not-allowed,
//! access-denied (with/without auth challenge), timeout, service
//! error, and transport error.

use thiserror::Error;

/// Result type for icap-core operations
pub type IcapResult<T> = Result<T, IcapError>;

/// Error kinds the ICAP core distinguishes, following the wire status
/// codes they map onto at the transaction loop.
#[derive(Error, Debug)]
pub enum IcapError {
    /// Bad request line, bad Encapsulated: list, oversized chunk-def
    /// line, invalid hex length. Maps to 400 + close.
    #[error("protocol error in {context}: {message}")]
    Protocol { message: String, context: &'static str },

    /// Unknown service name. Maps to 404 + close.
    #[error("no such service: {0}")]
    NoSuchService(String),

    /// Service exists but does not support the requested method.
    /// Maps to 405 + close.
    #[error("service {service} does not support {method}")]
    MethodNotAllowed { service: String, method: String },

    /// Access-control chain denied the request without an auth
    /// challenge. Maps to 403 + close.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Access-control chain requires authentication. Maps to 407 with
    /// a `Proxy-Authenticate:` challenge; connection is kept alive.
    #[error("authentication required (realm {realm})")]
    AuthRequired { realm: String },

    /// Read or write did not complete before the deadline. Maps to
    /// 408 if nothing has been sent yet, otherwise drop silently.
    #[error("timeout during {operation}")]
    Timeout { operation: &'static str },

    /// A service hook (`check_preview`/`io`/`end_of_data`/`init_request`)
    /// returned an error. Maps to 500 + close.
    #[error("service error: {0}")]
    Service(String),

    /// Lower-level I/O failure on the connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A header value, URI, or other wire token failed to parse.
    #[error("malformed http: {0}")]
    Http(#[from] http::Error),

    /// Configuration directive (acl / icap_access / LogFormat) is malformed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IcapError {
    pub fn protocol(message: impl Into<String>, context: &'static str) -> Self {
        IcapError::Protocol { message: message.into(), context }
    }

    /// The ICAP status code this error would produce if no bytes of a
    /// response have been sent yet (see the propagation policy in the
    /// error-handling design).
    pub fn status_code(&self) -> u16 {
        match self {
            IcapError::Protocol { .. } => 400,
            IcapError::NoSuchService(_) => 404,
            IcapError::MethodNotAllowed { .. } => 405,
            IcapError::AccessDenied(_) => 403,
            IcapError::AuthRequired { .. } => 407,
            IcapError::Timeout { .. } => 408,
            IcapError::Service(_) => 500,
            IcapError::Io(_) | IcapError::Http(_) | IcapError::Config(_) => 500,
        }
    }

    /// Whether the connection should be kept alive after this error is
    /// reported (only true for the 407 auth-challenge case).
    pub fn keeps_connection_alive(&self) -> bool {
        matches!(self, IcapError::AuthRequired { .. })
    }
}
