//! Error types for glacis-proxy-ssh.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshProxyError {
    /// Protocol-level SSH failure on either leg.
    #[error("SSH error: {0}")]
    Russh(#[from] russh::Error),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core runtime failure (registry, engine, store).
    #[error(transparent)]
    Core(#[from] glacis_core::CoreError),

    /// Could not reach the backend within the connect deadline.
    #[error("backend connection failed: {0}")]
    ConnectionFailed(String),

    /// The backend rejected the replayed credentials.
    #[error("backend authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Client authenticated with a public key but never requested agent
    /// forwarding, so there is nothing to sign with for the backend.
    #[error("public key authentication requires agent forwarding")]
    AgentRequired,

    /// Forwarded-agent protocol failure.
    #[error("agent forwarding failed: {0}")]
    Agent(String),

    /// Neither an agent nor a password is available for the backend.
    #[error("no credentials available for backend authentication")]
    NoCredentials,

    /// Backend refused to open a channel.
    #[error("failed to open backend channel: {0}")]
    ChannelOpenFailed(String),

    /// Recording file failure.
    #[error("recording error: {0}")]
    Recording(String),
}

pub type SshResult<T> = Result<T, SshProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_required_display() {
        assert_eq!(
            SshProxyError::AgentRequired.to_string(),
            "public key authentication requires agent forwarding"
        );
    }

    #[test]
    fn test_connection_failed_display() {
        let err = SshProxyError::ConnectionFailed("timed out".to_string());
        assert_eq!(err.to_string(), "backend connection failed: timed out");
    }
}
