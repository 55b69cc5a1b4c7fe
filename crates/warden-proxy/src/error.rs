//! Error types for the proxy.
//!
//! Per-session errors close the session and surface through the warning
//! channel; configuration and start-up errors propagate to the caller.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Bad constructor arguments or an unusable CA bundle.
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform diversion handle could not be opened.
    #[error("traffic diversion unavailable: {0}")]
    DiversionUnavailable(String),

    /// A key generation or signing operation failed while forging a leaf.
    #[error("certificate forging failed: {0}")]
    TlsForge(String),

    /// The upstream connection could not be established.
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    /// The upstream server certificate failed verification.
    #[error("upstream TLS verification failed: {0}")]
    UpstreamTlsVerify(String),

    /// Malformed HTTP or TLS received from a peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An I/O deadline elapsed.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// No diversion record matched an accepted connection.
    #[error("no flow record for local port {0}")]
    UnknownFlow(u16),

    /// Temporary resource exhaustion.
    #[error("transient error: {0}")]
    Transient(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Core filtering error.
    #[error(transparent)]
    Core(#[from] warden_core::CoreError),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
