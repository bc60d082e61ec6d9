//! Error types for glacis-proxy-rdp.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MitmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TPKT or X.224 negotiation data from either peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Backend leg could not be established.
    #[error("backend connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS setup or handshake failure on either leg.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The relay was started without a routed target.
    #[error("no target set before outbound leg")]
    NoTarget,

    /// Replay file failure.
    #[error("replay recording error: {0}")]
    Replay(String),

    /// Core runtime failure (registry, engine, store).
    #[error(transparent)]
    Core(#[from] glacis_core::CoreError),
}

pub type RdpResult<T> = Result<T, MitmError>;
