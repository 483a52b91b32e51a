use thiserror::Error;

/// Library-level failures surfaced to callers. Server-side faults never take
/// this path; the lifecycle engine converts them into coded responses.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no service available for method {0}")]
    NoServiceAvailable(String),
    #[error("request timed out: {0}")]
    RequestTimeout(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("terminal disposed")]
    Disposed,
    #[error("trace ended without a response")]
    MissingResponse,
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("invalid host url: {0}")]
    InvalidHostUrl(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("tunnel unavailable: {0}")]
    Tunnel(String),
    #[error("transport closed")]
    TransportClosed,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Numeric response codes carried on the wire.
pub mod codes {
    pub const OK: i64 = 0;
    /// Method not found, no schema match, or ambiguous schema match.
    pub const BAD_REQUEST: i64 = 400;
    /// Ingress rate limit exceeded.
    pub const TOO_MANY_REQUESTS: i64 = 429;
    /// Handler failed.
    pub const INTERNAL_ERROR: i64 = 500;
    /// Pending queue at capacity.
    pub const SERVICE_UNAVAILABLE: i64 = 503;
    /// Handler exceeded the processing deadline.
    pub const GATEWAY_TIMEOUT: i64 = 504;
}
