//! Client-facing SSH server, one instance per proxy IP.
//!
//! The listener's bind address drives destination routing. Client
//! authentication never proves identity by itself (the source IP already
//! did); public keys are accepted as a placeholder and passwords are
//! buffered for the backend cascade. Denials are delivered as a banner on
//! the first channel, then the connection closes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use glacis_core::engine::{Admission, Decision, PolicyEngine};
use glacis_core::registry::{SessionRegistry, StaySignal};
use glacis_core::AuditSink;
use glacis_store::models::{NewAuditEvent, Protocol, SessionKind, TerminationReason};
use ipnetwork::IpNetwork;
use russh::keys::PrivateKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{client, Channel, ChannelId, CryptoVec, Disconnect, MethodKind, MethodSet};
use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::BackendClient;
use crate::banner;
use crate::error::{SshProxyError, SshResult};
use crate::recorder::{EventKind, Recorder, RecordingEvent};

/// Idle budget for interactive shells. Forward channels have none.
const SHELL_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// After a termination signal the client half closes within this budget.
const TERMINATION_CLIENT_GRACE: Duration = Duration::from_millis(500);

/// SSH front-end bound to one proxy IP.
pub struct SshFrontend {
    engine: Arc<PolicyEngine>,
    registry: Arc<SessionRegistry>,
    audit: Arc<dyn AuditSink>,
    recordings_dir: PathBuf,
    proxy_ip: IpAddr,
    port: u16,
    host_key: PrivateKey,
}

impl SshFrontend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<PolicyEngine>,
        registry: Arc<SessionRegistry>,
        audit: Arc<dyn AuditSink>,
        recordings_dir: PathBuf,
        proxy_ip: IpAddr,
        port: u16,
        host_key: PrivateKey,
    ) -> Self {
        Self {
            engine,
            registry,
            audit,
            recordings_dir,
            proxy_ip,
            port,
            host_key,
        }
    }

    /// Bind and serve until the task is aborted.
    pub async fn run(mut self) -> SshResult<()> {
        let config = Arc::new(russh::server::Config {
            keys: vec![self.host_key.clone()],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        let addr = (self.proxy_ip, self.port);
        info!(proxy_ip = %self.proxy_ip, port = self.port, "SSH listener starting");
        russh::server::Server::run_on_address(&mut self, config, addr).await?;
        Ok(())
    }
}

impl russh::server::Server for SshFrontend {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ClientHandler {
        let peer = peer_addr.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        debug!(peer = %peer, proxy_ip = %self.proxy_ip, "client connected");
        ClientHandler {
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            audit: Arc::clone(&self.audit),
            recordings_dir: self.recordings_dir.clone(),
            proxy_ip: self.proxy_ip,
            peer,
            login: None,
            password: None,
            pubkey_offered: false,
            agent_requested: false,
            decision: None,
            backend: None,
            stay: None,
            pty: None,
            pending_channels: HashMap::new(),
            channels: HashMap::new(),
            forwards: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        debug!(proxy_ip = %self.proxy_ip, error = %error, "session ended with error");
    }
}

struct PtyParams {
    term: String,
    cols: u32,
    rows: u32,
}

struct StayContext {
    stay_id: i64,
    admission: Admission,
    recorder: Arc<Mutex<Recorder>>,
}

struct ChannelCtl {
    tx: mpsc::UnboundedSender<ChannelCmd>,
}

#[derive(Debug)]
enum ChannelCmd {
    Data(Vec<u8>),
    WindowChange { cols: u32, rows: u32 },
    Eof,
}

pub struct ClientHandler {
    engine: Arc<PolicyEngine>,
    registry: Arc<SessionRegistry>,
    audit: Arc<dyn AuditSink>,
    recordings_dir: PathBuf,
    proxy_ip: IpAddr,
    peer: SocketAddr,
    login: Option<String>,
    password: Option<SecretString>,
    pubkey_offered: bool,
    agent_requested: bool,
    decision: Option<Decision>,
    backend: Option<BackendClient>,
    stay: Option<StayContext>,
    pty: Option<PtyParams>,
    /// Session channels opened but not yet bound to a shell/exec/subsystem.
    pending_channels: HashMap<ChannelId, Channel<Msg>>,
    channels: HashMap<ChannelId, ChannelCtl>,
    /// Remote-forward listeners keyed by the client's requested binding.
    forwards: HashMap<(String, u32), tokio::task::JoinHandle<()>>,
}

impl ClientHandler {
    /// Evaluate policy once per connection, audit the decision, keep it.
    async fn decide(&mut self, login: &str) {
        if self.decision.is_some() {
            return;
        }
        let decision = self
            .engine
            .decide(self.peer.ip(), self.proxy_ip, Protocol::Ssh, Some(login))
            .await;

        match &decision {
            Decision::Admit(adm) => {
                info!(
                    person = %adm.person_handle,
                    source = %self.peer.ip(),
                    backend = %adm.backend.name,
                    login = login,
                    "SSH admission granted"
                );
                self.audit
                    .record(NewAuditEvent::admission(
                        IpNetwork::from(self.peer.ip()),
                        Some(adm.backend.id),
                        Protocol::Ssh,
                        true,
                        "admitted",
                        Some(format!("policy {} login {login}", adm.policy_id)),
                    ))
                    .await;
            }
            Decision::Deny { reason, detail } => {
                warn!(
                    source = %self.peer.ip(),
                    proxy_ip = %self.proxy_ip,
                    reason = %reason,
                    "SSH admission denied"
                );
                self.audit
                    .record(NewAuditEvent::admission(
                        IpNetwork::from(self.peer.ip()),
                        None,
                        Protocol::Ssh,
                        false,
                        reason.as_str(),
                        detail.clone(),
                    ))
                    .await;
            }
        }
        self.decision = Some(decision);
    }

    fn admission(&self) -> Option<&Admission> {
        match self.decision.as_ref() {
            Some(Decision::Admit(adm)) => Some(adm),
            _ => None,
        }
    }

    /// Deliver the deny banner over a freshly opened channel, then drop
    /// the connection.
    fn deliver_deny_banner(&self, channel: Channel<Msg>, handle: Handle) {
        let reason = match self.decision.as_ref() {
            Some(Decision::Deny { reason, .. }) => *reason,
            _ => glacis_core::DenyReason::NoMatchingPolicy,
        };
        let text = banner::deny_banner(self.peer.ip(), reason);
        tokio::spawn(async move {
            let _ = channel.data(text.as_bytes()).await;
            let _ = channel.eof().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = handle
                .disconnect(Disconnect::ByApplication, "access denied".to_string(), "en".to_string())
                .await;
        });
    }

    /// Write an error banner (backend trouble) and drop the connection.
    fn deliver_error_banner(&self, channel: Channel<Msg>, handle: Handle, text: String) {
        tokio::spawn(async move {
            let _ = channel.data(text.as_bytes()).await;
            let _ = channel.eof().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = handle
                .disconnect(Disconnect::ByApplication, "backend unavailable".to_string(), "en".to_string())
                .await;
        });
    }

    /// Connect and authenticate the backend leg once per connection.
    async fn ensure_backend(&mut self, session: &mut Session) -> SshResult<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let admission = self
            .admission()
            .cloned()
            .ok_or(SshProxyError::NoCredentials)?;
        let login = self.login.clone().ok_or(SshProxyError::NoCredentials)?;

        let mut client =
            BackendClient::connect(&admission.backend.address, admission.backend.port).await?;

        let mut authenticated = false;
        if self.agent_requested {
            match session.handle().channel_open_agent().await {
                Ok(agent_channel) => {
                    authenticated = client
                        .auth_with_agent(&login, agent_channel.into_stream())
                        .await?;
                    if !authenticated {
                        debug!("no agent identity accepted by backend");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to open agent channel");
                }
            }
        }

        if !authenticated {
            if let Some(password) = self.password.clone() {
                authenticated = client.auth_password(&login, &password).await?;
                if !authenticated {
                    return Err(SshProxyError::AuthenticationFailed(
                        "backend rejected password".to_string(),
                    ));
                }
            } else if self.pubkey_offered && !self.agent_requested {
                return Err(SshProxyError::AgentRequired);
            } else {
                return Err(SshProxyError::AuthenticationFailed(
                    "no agent identity accepted and no password available".to_string(),
                ));
            }
        }

        self.backend = Some(client);
        Ok(())
    }

    /// Open the stay and its recording on first use.
    async fn ensure_stay(&mut self) -> SshResult<i64> {
        if let Some(stay) = &self.stay {
            return Ok(stay.stay_id);
        }
        let admission = self
            .admission()
            .cloned()
            .ok_or(SshProxyError::NoCredentials)?;
        let agent_used = self.backend.as_ref().is_some_and(|b| b.agent_used);

        let handle = self.registry.open(&admission, agent_used).await?;
        let stay_id = handle.stay_id;

        let path = self
            .recordings_dir
            .join("ssh")
            .join(format!("{stay_id}.jsonl"));
        let recorder = Recorder::create(path.clone()).await?;
        self.registry
            .attach_recording(stay_id, path.to_string_lossy().into_owned())
            .await?;

        self.stay = Some(StayContext {
            stay_id,
            admission,
            recorder: Arc::new(Mutex::new(recorder)),
        });
        Ok(stay_id)
    }

    /// Wire one session channel (shell, exec or subsystem) end to end.
    async fn start_session_channel(
        &mut self,
        channel_id: ChannelId,
        kind: SessionKind,
        command: Option<Vec<u8>>,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let Some(client_channel) = self.pending_channels.remove(&channel_id) else {
            debug!(?channel_id, "request on unknown channel");
            return Ok(());
        };
        let handle = session.handle();

        if self.admission().is_none() {
            self.deliver_deny_banner(client_channel, handle);
            return Ok(());
        }

        if let Err(e) = self.ensure_backend(session).await {
            let admission = self.admission().cloned();
            let text = match (&e, &admission) {
                (SshProxyError::AgentRequired, Some(adm)) => {
                    let login = adm.login.clone().unwrap_or_default();
                    format!("ERROR: {e}\r\n{}", banner::agent_hint(&login, self.proxy_ip))
                }
                _ => format!("ERROR: {e}\r\n"),
            };
            warn!(error = %e, "backend authentication cascade failed");
            self.audit
                .record(NewAuditEvent::admission(
                    IpNetwork::from(self.peer.ip()),
                    admission.map(|a| a.backend.id),
                    Protocol::Ssh,
                    false,
                    "backend_unreachable",
                    Some(e.to_string()),
                ))
                .await;
            self.deliver_error_banner(client_channel, handle, text);
            return Ok(());
        }

        let stay_id = match self.ensure_stay().await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "failed to open stay");
                self.deliver_error_banner(client_channel, handle, "ERROR: internal error\r\n".into());
                return Ok(());
            }
        };

        let stay = match &self.stay {
            Some(stay) => stay,
            None => return Ok(()),
        };
        let backend = match &self.backend {
            Some(backend) => backend,
            None => return Ok(()),
        };

        // Backend channel with the client's PTY and request replayed.
        let backend_channel = match backend.open_session_channel().await {
            Ok(ch) => ch,
            Err(e) => {
                warn!(error = %e, "backend refused session channel");
                self.deliver_error_banner(client_channel, handle, "ERROR: backend refused channel\r\n".into());
                return Ok(());
            }
        };
        if let Some(pty) = &self.pty {
            if kind == SessionKind::Shell {
                if let Err(e) = backend_channel
                    .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
                    .await
                {
                    warn!(error = %e, "backend PTY request failed");
                }
            }
        }
        let request_result = match (kind, &command) {
            (SessionKind::Shell, _) => backend_channel.request_shell(false).await,
            (SessionKind::Sftp, _) => backend_channel.request_subsystem(false, "sftp").await,
            (_, Some(cmd)) => backend_channel.exec(false, cmd.as_slice()).await,
            (_, None) => backend_channel.request_shell(false).await,
        };
        if let Err(e) = request_result {
            warn!(error = %e, ?kind, "backend channel request failed");
            self.deliver_error_banner(client_channel, handle, "ERROR: backend request failed\r\n".into());
            return Ok(());
        }

        let session_id = match self.registry.attach_session(stay_id, kind).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "failed to record session");
                return Ok(());
            }
        };
        let signals = match self.registry.subscribe(stay_id).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "failed to subscribe to stay signals");
                return Ok(());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(channel_id, ChannelCtl { tx });

        let task = SessionChannelTask {
            kind,
            stay_id,
            session_id,
            channel_id,
            client_channel,
            backend_channel,
            cmd_rx: rx,
            signals,
            handle,
            registry: Arc::clone(&self.registry),
            recorder: Arc::clone(&stay.recorder),
            preamble: match kind {
                SessionKind::Shell => Some(banner::shell_preamble(
                    &stay.admission.backend.name,
                    stay.admission.expires_at,
                )),
                _ => None,
            },
        };
        tokio::spawn(task.run());
        let _ = session.channel_success(channel_id);
        Ok(())
    }
}

impl russh::server::Handler for ClientHandler {
    type Error = SshProxyError;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::PublicKey, MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    /// Any offered key is accepted as an identity placeholder; the source
    /// IP already identified the person and the backend will be the judge
    /// of key material via the forwarded agent.
    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.login = Some(user.to_string());
        self.pubkey_offered = true;
        self.decide(user).await;
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.login = Some(user.to_string());
        self.password = Some(SecretString::from(password.to_string()));
        self.decide(user).await;
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.pending_channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = Some(PtyParams {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        });
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session_channel(channel, SessionKind::Shell, None, session)
            .await?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(command = %String::from_utf8_lossy(data), "exec request");
        self.start_session_channel(channel, SessionKind::Exec, Some(data.to_vec()), session)
            .await?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = if name == "sftp" {
            SessionKind::Sftp
        } else {
            SessionKind::Exec
        };
        debug!(subsystem = name, "subsystem request");
        self.start_session_channel(channel, kind, Some(name.as_bytes().to_vec()), session)
            .await?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pty) = &mut self.pty {
            pty.cols = col_width;
            pty.rows = row_height;
        }
        if let Some(ctl) = self.channels.get(&channel) {
            let _ = ctl.tx.send(ChannelCmd::WindowChange {
                cols: col_width,
                rows: row_height,
            });
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("client offered agent forwarding");
        self.agent_requested = true;
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ctl) = self.channels.get(&channel) {
            let _ = ctl.tx.send(ChannelCmd::Data(data.to_vec()));
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ctl) = self.channels.get(&channel) {
            let _ = ctl.tx.send(ChannelCmd::Eof);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the control sender ends the channel task's command
        // stream, which it reads as a client close.
        self.channels.remove(&channel);
        self.pending_channels.remove(&channel);
        Ok(())
    }

    /// Local forward (`-L`) and SOCKS dynamic forwards arrive here.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(admission) = self.admission().cloned() else {
            return Ok(false);
        };
        if !admission.allow_port_forwarding {
            info!(
                source = %self.peer.ip(),
                target = %format!("{host_to_connect}:{port_to_connect}"),
                "direct-tcpip refused: port forwarding not allowed"
            );
            return Ok(false);
        }
        if self.ensure_backend(session).await.is_err() {
            return Ok(false);
        }
        let stay_id = match self.ensure_stay().await {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };

        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        let backend_channel = match backend
            .open_direct_tcpip(host_to_connect, port_to_connect, originator_address, originator_port)
            .await
        {
            Ok(ch) => ch,
            Err(e) => {
                debug!(error = %e, "backend refused direct-tcpip");
                return Ok(false);
            }
        };

        let session_id = self
            .registry
            .attach_session(stay_id, SessionKind::DirectTcpip)
            .await?;
        let signals = self.registry.subscribe(stay_id).await?;
        let registry = Arc::clone(&self.registry);
        let recorder = self.stay.as_ref().map(|s| Arc::clone(&s.recorder));

        debug!(
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "direct-tcpip channel opened"
        );
        tokio::spawn(async move {
            record_meta(&recorder, session_id, "direct_tcpip_open").await;
            let client_stream = channel.into_stream();
            let backend_stream = backend_channel.into_stream();
            let reason =
                splice_with_signals(client_stream, backend_stream, &registry, stay_id, signals).await;
            record_meta(&recorder, session_id, "direct_tcpip_close").await;
            if let Err(e) = registry.session_closed(stay_id, session_id, reason).await {
                warn!(stay_id, error = %e, "failed to close forward session");
            }
        });
        Ok(true)
    }

    /// Remote forward (`-R`): the gateway listens on the proxy IP so every
    /// backend can claim the same port on its own address.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(admission) = self.admission().cloned() else {
            return Ok(false);
        };
        if !admission.allow_port_forwarding {
            info!(source = %self.peer.ip(), port = *port, "tcpip-forward refused: port forwarding not allowed");
            return Ok(false);
        }
        let stay_id = match self.ensure_stay().await {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };

        let listener = match TcpListener::bind((self.proxy_ip, *port as u16)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(port = *port, error = %e, "remote forward bind failed");
                return Ok(false);
            }
        };
        if *port == 0 {
            if let Ok(local) = listener.local_addr() {
                *port = u32::from(local.port());
            }
        }

        let handle = session.handle();
        let registry = Arc::clone(&self.registry);
        let client_address = address.to_string();
        let client_port = *port;
        let key = (address.to_string(), *port);
        info!(proxy_ip = %self.proxy_ip, port = client_port, "remote forward listening");

        let accept_loop = tokio::spawn(async move {
            loop {
                let (tcp, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "remote forward accept failed");
                        break;
                    }
                };
                let opened = handle
                    .channel_open_forwarded_tcpip(
                        client_address.clone(),
                        client_port,
                        peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await;
                let channel = match opened {
                    Ok(ch) => ch,
                    Err(e) => {
                        debug!(error = %e, "client refused forwarded-tcpip channel");
                        continue;
                    }
                };
                let session_id = match registry
                    .attach_session(stay_id, SessionKind::ForwardedTcpip)
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(error = %e, "failed to record forwarded session");
                        continue;
                    }
                };
                let signals = match registry.subscribe(stay_id).await {
                    Ok(rx) => rx,
                    Err(_) => continue,
                };
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let reason = splice_with_signals(
                        channel.into_stream(),
                        tcp,
                        &registry,
                        stay_id,
                        signals,
                    )
                    .await;
                    if let Err(e) = registry.session_closed(stay_id, session_id, reason).await {
                        warn!(stay_id, error = %e, "failed to close forwarded session");
                    }
                });
            }
        });
        self.forwards.insert(key, accept_loop);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(task) = self.forwards.remove(&(address.to_string(), port)) {
            task.abort();
            info!(port, "remote forward cancelled");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        for (_, task) in self.forwards.drain() {
            task.abort();
        }
        if let Some(stay) = self.stay.take() {
            let registry = Arc::clone(&self.registry);
            let backend = self.backend.take();
            // The handler can be dropped during runtime teardown, where
            // there is no executor left to finish the close.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Some(backend) = backend {
                        backend.disconnect().await;
                    }
                    if let Err(e) = registry
                        .close(stay.stay_id, TerminationReason::ClientClosed)
                        .await
                    {
                        warn!(stay_id = stay.stay_id, error = %e, "failed to close stay");
                    }
                });
            }
        }
        debug!(peer = %self.peer, "client disconnected");
    }
}

/// Everything one session channel needs to run on its own task: the two
/// legs, the command stream from the handler, the stay's signal channel
/// and the shared recorder.
struct SessionChannelTask {
    kind: SessionKind,
    stay_id: i64,
    session_id: i64,
    channel_id: ChannelId,
    client_channel: Channel<Msg>,
    backend_channel: Channel<client::Msg>,
    cmd_rx: mpsc::UnboundedReceiver<ChannelCmd>,
    signals: broadcast::Receiver<StaySignal>,
    handle: Handle,
    registry: Arc<SessionRegistry>,
    recorder: Arc<Mutex<Recorder>>,
    preamble: Option<String>,
}

impl SessionChannelTask {
    async fn run(mut self) {
        let payload_recording = self.kind == SessionKind::Shell;
        let kind_label = self.kind.as_str();

        {
            let mut recorder = self.recorder.lock().await;
            let _ = recorder.append(&RecordingEvent::open(self.session_id, kind_label)).await;
        }
        if let Some(preamble) = &self.preamble {
            let _ = self.client_channel.data(preamble.as_bytes()).await;
        }

        let idle = tokio::time::sleep(SHELL_IDLE_TIMEOUT);
        tokio::pin!(idle);
        let mut reason = TerminationReason::ClientClosed;
        let mut terminated = false;

        loop {
            tokio::select! {
                backend_msg = self.backend_channel.wait() => {
                    match backend_msg {
                        Some(russh::ChannelMsg::Data { data }) => {
                            idle.as_mut().reset(tokio::time::Instant::now() + SHELL_IDLE_TIMEOUT);
                            self.registry.push_counters(self.stay_id, 0, data.len() as i64).await;
                            if payload_recording {
                                let mut recorder = self.recorder.lock().await;
                                let _ = recorder
                                    .append(&RecordingEvent::payload(self.session_id, EventKind::ServerToClient, &data))
                                    .await;
                            }
                            if self.client_channel.data(&data[..]).await.is_err() {
                                reason = TerminationReason::Error;
                                break;
                            }
                        }
                        Some(russh::ChannelMsg::ExtendedData { data, ext }) => {
                            self.registry.push_counters(self.stay_id, 0, data.len() as i64).await;
                            let _ = self
                                .handle
                                .extended_data(self.channel_id, ext, CryptoVec::from_slice(&data))
                                .await;
                        }
                        Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                            let _ = self.handle.exit_status_request(self.channel_id, exit_status).await;
                        }
                        Some(russh::ChannelMsg::Eof) => {
                            let _ = self.handle.eof(self.channel_id).await;
                        }
                        Some(russh::ChannelMsg::Close) | None => {
                            reason = TerminationReason::ServerClosed;
                            break;
                        }
                        Some(other) => {
                            debug!(?other, "unhandled backend channel message");
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCmd::Data(data)) => {
                            idle.as_mut().reset(tokio::time::Instant::now() + SHELL_IDLE_TIMEOUT);
                            self.registry.push_counters(self.stay_id, data.len() as i64, 0).await;
                            if payload_recording {
                                let mut recorder = self.recorder.lock().await;
                                let _ = recorder
                                    .append(&RecordingEvent::payload(self.session_id, EventKind::ClientToServer, &data))
                                    .await;
                            }
                            if self.backend_channel.data(&data[..]).await.is_err() {
                                reason = TerminationReason::Error;
                                break;
                            }
                        }
                        Some(ChannelCmd::WindowChange { cols, rows }) => {
                            let _ = self.backend_channel.window_change(cols, rows, 0, 0).await;
                        }
                        Some(ChannelCmd::Eof) => {
                            let _ = self.backend_channel.eof().await;
                        }
                        None => {
                            reason = TerminationReason::ClientClosed;
                            break;
                        }
                    }
                }

                signal = self.signals.recv() => {
                    match signal {
                        Ok(StaySignal::Warning { minutes_left }) => {
                            if self.kind == SessionKind::Shell {
                                let line = banner::warning_line(minutes_left);
                                let _ = self.client_channel.data(line.as_bytes()).await;
                                let mut recorder = self.recorder.lock().await;
                                let _ = recorder
                                    .append(&RecordingEvent::note(
                                        self.session_id,
                                        &format!("expiry warning: {minutes_left} minutes"),
                                    ))
                                    .await;
                            }
                        }
                        Ok(StaySignal::Terminate { reason: signalled }) => {
                            terminated = true;
                            reason = signalled;
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }

                _ = &mut idle, if self.kind == SessionKind::Shell => {
                    info!(stay_id = self.stay_id, "shell idle timeout");
                    reason = TerminationReason::ClientClosed;
                    {
                        let mut recorder = self.recorder.lock().await;
                        let _ = recorder
                            .append(&RecordingEvent::note(self.session_id, "idle timeout"))
                            .await;
                    }
                    break;
                }
            }
        }

        // Backend half first, final recording flush, then the client half
        // within the grace budget.
        let _ = self.backend_channel.eof().await;
        {
            let mut recorder = self.recorder.lock().await;
            let _ = recorder
                .append(&RecordingEvent::close(self.session_id, reason.as_str()))
                .await;
        }
        if terminated {
            if self.kind == SessionKind::Shell {
                let line = banner::termination_line(reason);
                let _ = self.client_channel.data(line.as_bytes()).await;
            }
            tokio::time::sleep(TERMINATION_CLIENT_GRACE).await;
        }
        let _ = self.client_channel.eof().await;
        let _ = self.handle.close(self.channel_id).await;

        if let Err(e) = self
            .registry
            .session_closed(self.stay_id, self.session_id, reason)
            .await
        {
            warn!(stay_id = self.stay_id, error = %e, "failed to close session");
        }

        if terminated {
            let _ = self
                .handle
                .disconnect(Disconnect::ByApplication, "session terminated".to_string(), "en".to_string())
                .await;
        }
    }
}

async fn record_meta(recorder: &Option<Arc<Mutex<Recorder>>>, session_id: i64, label: &str) {
    if let Some(recorder) = recorder {
        let mut recorder = recorder.lock().await;
        let _ = recorder.append(&RecordingEvent::note(session_id, label)).await;
    }
}

/// Splice two byte streams, pushing counter deltas per chunk and bailing
/// out on a termination signal. Returns the close reason.
async fn splice_with_signals<A, B>(
    mut client_side: A,
    mut backend_side: B,
    registry: &Arc<SessionRegistry>,
    stay_id: i64,
    mut signals: broadcast::Receiver<StaySignal>,
) -> TerminationReason
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; 16 * 1024];
    let mut backend_buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = client_side.read(&mut client_buf) => {
                match read {
                    Ok(0) => return TerminationReason::ClientClosed,
                    Ok(n) => {
                        registry.push_counters(stay_id, n as i64, 0).await;
                        if backend_side.write_all(&client_buf[..n]).await.is_err() {
                            return TerminationReason::ServerClosed;
                        }
                    }
                    Err(_) => return TerminationReason::ClientClosed,
                }
            }
            read = backend_side.read(&mut backend_buf) => {
                match read {
                    Ok(0) => return TerminationReason::ServerClosed,
                    Ok(n) => {
                        registry.push_counters(stay_id, 0, n as i64).await;
                        if client_side.write_all(&backend_buf[..n]).await.is_err() {
                            return TerminationReason::ClientClosed;
                        }
                    }
                    Err(_) => return TerminationReason::ServerClosed,
                }
            }
            signal = signals.recv() => {
                if let Ok(StaySignal::Terminate { reason }) = signal {
                    return reason;
                }
            }
        }
    }
}
