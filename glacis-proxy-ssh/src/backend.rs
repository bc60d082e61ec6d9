//! SSH client leg towards the backend host.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle};
use russh::keys::agent::client::AgentClient;
use russh::{Channel, Disconnect, Preferred};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{SshProxyError, SshResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Connected, possibly authenticated SSH client towards one backend.
pub struct BackendClient {
    handle: Handle<BackendHandler>,
    pub agent_used: bool,
}

impl BackendClient {
    /// TCP connect and SSH handshake, bounded by the connect deadline.
    /// Broad algorithm support so older backends still negotiate.
    pub async fn connect(address: &str, port: u16) -> SshResult<Self> {
        let ssh_config = client::Config {
            preferred: Preferred {
                kex: Cow::Borrowed(&[
                    russh::kex::CURVE25519,
                    russh::kex::CURVE25519_PRE_RFC_8731,
                    russh::kex::ECDH_SHA2_NISTP256,
                    russh::kex::ECDH_SHA2_NISTP384,
                    russh::kex::ECDH_SHA2_NISTP521,
                    russh::kex::DH_G16_SHA512,
                    russh::kex::DH_G14_SHA256,
                    russh::kex::DH_GEX_SHA256,
                    russh::kex::DH_G14_SHA1,
                ]),
                ..Preferred::default()
            },
            ..client::Config::default()
        };
        let ssh_config = Arc::new(ssh_config);

        let addr = format!("{address}:{port}");
        debug!(addr = %addr, "connecting to backend");
        let handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(ssh_config, addr.clone(), BackendHandler),
        )
        .await
        .map_err(|_| SshProxyError::ConnectionFailed(format!("{addr}: connect timed out")))?
        .map_err(|e| SshProxyError::ConnectionFailed(format!("{addr}: {e}")))?;

        Ok(Self {
            handle,
            agent_used: false,
        })
    }

    /// Replay the client's password against the backend under the login
    /// the client asked for.
    pub async fn auth_password(&mut self, login: &str, password: &SecretString) -> SshResult<bool> {
        let result = tokio::time::timeout(
            AUTH_TIMEOUT,
            self.handle
                .authenticate_password(login, password.expose_secret()),
        )
        .await
        .map_err(|_| SshProxyError::AuthenticationFailed("password auth timed out".to_string()))?
        .map_err(|e| SshProxyError::AuthenticationFailed(e.to_string()))?;

        match result {
            AuthResult::Success => {
                info!(login = %login, "backend password authentication succeeded");
                Ok(true)
            }
            AuthResult::Failure { .. } => Ok(false),
        }
    }

    /// Sign for the backend with the client's forwarded agent: try every
    /// identity the agent offers until one is accepted.
    pub async fn auth_with_agent<S>(&mut self, login: &str, agent_stream: S) -> SshResult<bool>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut agent = AgentClient::connect(agent_stream);
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| SshProxyError::Agent(e.to_string()))?;
        debug!(keys = identities.len(), "agent identities received");

        for key in identities {
            let fingerprint = key.fingerprint(Default::default()).to_string();
            let attempt = tokio::time::timeout(
                AUTH_TIMEOUT,
                self.handle
                    .authenticate_publickey_with(login, key, None, &mut agent),
            )
            .await
            .map_err(|_| SshProxyError::AuthenticationFailed("agent auth timed out".to_string()))?;

            match attempt {
                Ok(AuthResult::Success) => {
                    info!(login = %login, fingerprint = %fingerprint, "backend agent authentication succeeded");
                    self.agent_used = true;
                    return Ok(true);
                }
                Ok(AuthResult::Failure { .. }) => continue,
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %e, "agent key attempt failed");
                    continue;
                }
            }
        }
        Ok(false)
    }

    pub async fn open_session_channel(&self) -> SshResult<Channel<client::Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SshProxyError::ChannelOpenFailed(e.to_string()))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator: &str,
        originator_port: u32,
    ) -> SshResult<Channel<client::Msg>> {
        self.handle
            .channel_open_direct_tcpip(host, port, originator, originator_port)
            .await
            .map_err(|e| SshProxyError::ChannelOpenFailed(e.to_string()))
    }

    pub async fn disconnect(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!(error = %e, "backend disconnect failed");
        }
    }
}

/// Handler for backend SSH client events. The gateway accepts whatever
/// host key the backend presents; the routing table, not the key, pins
/// identity.
struct BackendHandler;

impl client::Handler for BackendHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(key_type = ?server_public_key.algorithm(), "backend host key received");
        Ok(true)
    }
}
