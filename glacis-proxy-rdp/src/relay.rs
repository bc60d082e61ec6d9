//! The RDP MITM driver.
//!
//! `TlsRelay::accept` reads the client's connection request and yields a
//! `PendingMitm`. The caller resolves routing from the pending
//! connection's local address and calls `set_target`; only then may
//! `connect` open the outbound leg. A connected relay splices bytes,
//! records the replay, and merges the stay's termination signals into its
//! own select loop. The relay knows nothing about stays or policies, so
//! the underlying implementation can be swapped freely.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glacis_core::registry::StaySignal;
use glacis_store::models::TerminationReason;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::rustls::pki_types;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

use crate::error::{MitmError, RdpResult};
use crate::nego;
use crate::tls::TlsContext;

const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// No bytes in either direction for this long ends the connection.
const RDP_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Factory for pending MITM connections.
pub struct TlsRelay {
    tls: Arc<TlsContext>,
}

impl TlsRelay {
    pub fn new(tls: Arc<TlsContext>) -> Self {
        Self { tls }
    }

    /// Begin the handshake: read the client's connection request so the
    /// local address is readable and routing can happen. No outbound
    /// traffic is produced.
    pub async fn accept(&self, mut client: TcpStream) -> RdpResult<PendingMitm> {
        let local = client.local_addr()?;
        let peer = client.peer_addr()?;
        let frame = nego::read_tpkt(&mut client).await?;
        let request = nego::parse_connection_request(&frame)?;
        trace!(
            peer = %peer,
            local = %local,
            protocols = request.requested_protocols,
            "connection request read"
        );
        Ok(PendingMitm {
            tls: Arc::clone(&self.tls),
            client,
            request,
            local,
            peer,
            target: None,
        })
    }
}

/// An accepted inbound connection whose outbound leg has not started.
/// Dropping it closes the inbound TCP without touching the backend.
pub struct PendingMitm {
    tls: Arc<TlsContext>,
    client: TcpStream,
    request: nego::ConnectionRequest,
    local: SocketAddr,
    peer: SocketAddr,
    target: Option<(String, u16)>,
}

impl PendingMitm {
    /// The proxy IP the client connected to; drives destination routing.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Rewrite the effective target. Must happen before `connect`.
    pub fn set_target(&mut self, address: String, port: u16) {
        self.target = Some((address, port));
    }

    /// Open the outbound leg: TCP connect, negotiation rewritten to plain
    /// TLS, then TLS on both legs.
    pub async fn connect(self) -> RdpResult<ConnectedMitm> {
        let (address, port) = self.target.clone().ok_or(MitmError::NoTarget)?;
        let mut client = self.client;

        let backend_addr = format!("{address}:{port}");
        let mut backend = tokio::time::timeout(
            BACKEND_CONNECT_TIMEOUT,
            TcpStream::connect(&backend_addr),
        )
        .await
        .map_err(|_| MitmError::ConnectionFailed(format!("{backend_addr}: connect timed out")))?
        .map_err(|e| MitmError::ConnectionFailed(format!("{backend_addr}: {e}")))?;

        let request =
            nego::build_connection_request(self.request.cookie.as_deref(), nego::PROTOCOL_SSL);
        backend.write_all(&request).await?;
        let confirm = nego::read_tpkt(&mut backend).await?;
        let selected = nego::parse_connection_confirm(&confirm)?;
        if selected != nego::PROTOCOL_SSL {
            return Err(MitmError::Protocol(format!(
                "backend selected protocol {selected}, TLS required"
            )));
        }

        client
            .write_all(&nego::build_connection_confirm(nego::PROTOCOL_SSL))
            .await?;

        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls.server));
        let client_tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(client))
            .await
            .map_err(|_| MitmError::Tls("client TLS handshake timed out".to_string()))?
            .map_err(|e| MitmError::Tls(format!("client TLS handshake: {e}")))?;

        let server_name: pki_types::ServerName<'static> = address
            .clone()
            .try_into()
            .unwrap_or_else(|_| pki_types::ServerName::IpAddress(self.local.ip().into()));
        let connector = TlsConnector::from(Arc::clone(&self.tls.client));
        let backend_tls = tokio::time::timeout(
            TLS_HANDSHAKE_TIMEOUT,
            connector.connect(server_name, backend),
        )
        .await
        .map_err(|_| MitmError::Tls("backend TLS handshake timed out".to_string()))?
        .map_err(|e| MitmError::Tls(format!("backend TLS handshake: {e}")))?;

        debug!(backend = %backend_addr, "RDP relay established");
        Ok(ConnectedMitm {
            client: client_tls,
            backend: backend_tls,
        })
    }
}

/// Both legs up; ready to splice.
pub struct ConnectedMitm {
    client: server::TlsStream<TcpStream>,
    backend: client::TlsStream<TcpStream>,
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reason: TerminationReason,
}

impl ConnectedMitm {
    /// Splice until either side closes, the idle budget runs out, or a
    /// termination signal arrives. Counter deltas stream out per chunk.
    pub async fn run(
        self,
        replay_path: Option<PathBuf>,
        mut signals: broadcast::Receiver<StaySignal>,
        counters: mpsc::UnboundedSender<(i64, i64)>,
    ) -> RdpResult<RelayOutcome> {
        let mut replay = match replay_path {
            Some(path) => Some(ReplayWriter::create(&path).await?),
            None => None,
        };
        Ok(splice(self.client, self.backend, &mut replay, &counters, &mut signals).await)
    }
}

async fn splice<C, B>(
    mut client: C,
    mut backend: B,
    replay: &mut Option<ReplayWriter>,
    counters: &mpsc::UnboundedSender<(i64, i64)>,
    signals: &mut broadcast::Receiver<StaySignal>,
) -> RelayOutcome
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; 32 * 1024];
    let mut backend_buf = vec![0u8; 32 * 1024];
    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let idle = tokio::time::sleep(RDP_IDLE_TIMEOUT);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            read = client.read(&mut client_buf) => {
                match read {
                    Ok(0) => break TerminationReason::ClientClosed,
                    Ok(n) => {
                        idle.as_mut().reset(tokio::time::Instant::now() + RDP_IDLE_TIMEOUT);
                        bytes_in += n as u64;
                        let _ = counters.send((n as i64, 0));
                        if let Some(writer) = replay {
                            if let Err(e) = writer.append(ReplayDirection::ClientToServer, &client_buf[..n]).await {
                                warn!(error = %e, "replay write failed, recording stops");
                                *replay = None;
                            }
                        }
                        if backend.write_all(&client_buf[..n]).await.is_err() {
                            break TerminationReason::ServerClosed;
                        }
                    }
                    Err(_) => break TerminationReason::ClientClosed,
                }
            }
            read = backend.read(&mut backend_buf) => {
                match read {
                    Ok(0) => break TerminationReason::ServerClosed,
                    Ok(n) => {
                        idle.as_mut().reset(tokio::time::Instant::now() + RDP_IDLE_TIMEOUT);
                        bytes_out += n as u64;
                        let _ = counters.send((0, n as i64));
                        if let Some(writer) = replay {
                            if let Err(e) = writer.append(ReplayDirection::ServerToClient, &backend_buf[..n]).await {
                                warn!(error = %e, "replay write failed, recording stops");
                                *replay = None;
                            }
                        }
                        if client.write_all(&backend_buf[..n]).await.is_err() {
                            break TerminationReason::ClientClosed;
                        }
                    }
                    Err(_) => break TerminationReason::ServerClosed,
                }
            }
            signal = signals.recv() => {
                if let Ok(StaySignal::Terminate { reason }) = signal {
                    break reason;
                }
            }
            _ = &mut idle => {
                debug!("RDP idle timeout");
                break TerminationReason::ClientClosed;
            }
        }
    };

    let _ = client.shutdown().await;
    let _ = backend.shutdown().await;

    RelayOutcome {
        bytes_in,
        bytes_out,
        reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    ClientToServer = 0,
    ServerToClient = 1,
}

/// Opaque replay file: framed records `[t_ms u64][dir u8][len u32][data]`,
/// all integers big-endian, flushed per record.
pub struct ReplayWriter {
    file: tokio::fs::File,
}

impl ReplayWriter {
    pub async fn create(path: &Path) -> RdpResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MitmError::Replay(format!("create {}: {e}", parent.display())))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| MitmError::Replay(format!("open {}: {e}", path.display())))?;
        Ok(Self { file })
    }

    pub async fn append(&mut self, direction: ReplayDirection, data: &[u8]) -> RdpResult<()> {
        let t = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut record = Vec::with_capacity(13 + data.len());
        record.extend_from_slice(&t.to_be_bytes());
        record.push(direction as u8);
        record.extend_from_slice(&(data.len() as u32).to_be_bytes());
        record.extend_from_slice(data);
        self.file
            .write_all(&record)
            .await
            .map_err(|e| MitmError::Replay(e.to_string()))?;
        self.file
            .flush()
            .await
            .map_err(|e| MitmError::Replay(e.to_string()))?;
        Ok(())
    }
}
