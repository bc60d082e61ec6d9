//! RDP listener, one per proxy IP: accept, defer routing until the local
//! address is readable, admit, then let the relay open its outbound leg.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use glacis_core::engine::{Decision, PolicyEngine};
use glacis_core::registry::SessionRegistry;
use glacis_core::AuditSink;
use glacis_store::models::{NewAuditEvent, Protocol, SessionKind, TerminationReason};
use ipnetwork::IpNetwork;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RdpResult;
use crate::relay::TlsRelay;
use crate::tls::TlsContext;

pub struct RdpFrontend {
    engine: Arc<PolicyEngine>,
    registry: Arc<SessionRegistry>,
    audit: Arc<dyn AuditSink>,
    recordings_dir: PathBuf,
    proxy_ip: IpAddr,
    port: u16,
    tls: Arc<TlsContext>,
}

impl RdpFrontend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<PolicyEngine>,
        registry: Arc<SessionRegistry>,
        audit: Arc<dyn AuditSink>,
        recordings_dir: PathBuf,
        proxy_ip: IpAddr,
        port: u16,
        tls: Arc<TlsContext>,
    ) -> Self {
        Self {
            engine,
            registry,
            audit,
            recordings_dir,
            proxy_ip,
            port,
            tls,
        }
    }

    /// Bind and serve until the task is aborted.
    pub async fn run(self) -> RdpResult<()> {
        let listener = TcpListener::bind((self.proxy_ip, self.port)).await?;
        info!(proxy_ip = %self.proxy_ip, port = self.port, "RDP listener starting");
        let frontend = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(peer = %peer, "RDP connection accepted");
            let frontend = Arc::clone(&frontend);
            tokio::spawn(async move {
                if let Err(e) = frontend.handle_connection(stream).await {
                    debug!(peer = %peer, error = %e, "RDP connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> RdpResult<()> {
        let relay = TlsRelay::new(Arc::clone(&self.tls));
        let mut pending = relay.accept(stream).await?;
        let src_ip = pending.peer_addr().ip();
        let local_ip = pending.local_addr().ip();

        // Routing and admission happen before the outbound leg may start.
        let decision = self
            .engine
            .decide(src_ip, local_ip, Protocol::Rdp, None)
            .await;
        let admission = match decision {
            Decision::Admit(adm) => adm,
            Decision::Deny { reason, detail } => {
                warn!(source = %src_ip, proxy_ip = %local_ip, reason = %reason, "RDP admission denied");
                self.audit
                    .record(NewAuditEvent::admission(
                        IpNetwork::from(src_ip),
                        None,
                        Protocol::Rdp,
                        false,
                        reason.as_str(),
                        detail,
                    ))
                    .await;
                // Dropping the pending connection closes the inbound TCP;
                // the MITM never opened the outbound leg.
                return Ok(());
            }
        };

        info!(
            person = %admission.person_handle,
            source = %src_ip,
            backend = %admission.backend.name,
            "RDP admission granted"
        );
        self.audit
            .record(NewAuditEvent::admission(
                IpNetwork::from(src_ip),
                Some(admission.backend.id),
                Protocol::Rdp,
                true,
                "admitted",
                Some(format!("policy {}", admission.policy_id)),
            ))
            .await;

        pending.set_target(admission.backend.address.clone(), admission.backend.port);

        // The stay opens only once the outbound leg is up: a dead backend
        // leaves no stay behind.
        let connected = match pending.connect().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(backend = %admission.backend.name, error = %e, "RDP backend leg failed");
                self.audit
                    .record(NewAuditEvent::admission(
                        IpNetwork::from(src_ip),
                        Some(admission.backend.id),
                        Protocol::Rdp,
                        false,
                        "backend_unreachable",
                        Some(e.to_string()),
                    ))
                    .await;
                return Err(e);
            }
        };

        let handle = self.registry.open(&admission, false).await?;
        let stay_id = handle.stay_id;
        let session_id = self
            .registry
            .attach_session(stay_id, SessionKind::Rdp)
            .await?;

        // One replay writer per stay: the first sub-connection records,
        // dedup joins do not.
        let replay_path = if handle.reused {
            None
        } else {
            let path = self
                .recordings_dir
                .join("rdp")
                .join(format!("{stay_id}.replay"));
            self.registry
                .attach_recording(stay_id, path.to_string_lossy().into_owned())
                .await?;
            Some(path)
        };

        let (counter_tx, mut counter_rx) = mpsc::unbounded_channel::<(i64, i64)>();
        let registry = Arc::clone(&self.registry);
        let counter_task = tokio::spawn(async move {
            while let Some((delta_in, delta_out)) = counter_rx.recv().await {
                registry.push_counters(stay_id, delta_in, delta_out).await;
            }
        });

        let result = connected
            .run(replay_path, handle.signals, counter_tx)
            .await;
        counter_task.abort();

        let reason = match &result {
            Ok(outcome) => outcome.reason,
            Err(_) => TerminationReason::Error,
        };
        if let Err(e) = self
            .registry
            .session_closed(stay_id, session_id, reason)
            .await
        {
            warn!(stay_id, error = %e, "failed to close RDP session");
        }

        result.map(|outcome| {
            debug!(
                stay_id,
                bytes_in = outcome.bytes_in,
                bytes_out = outcome.bytes_out,
                reason = %outcome.reason,
                "RDP sub-connection finished"
            );
        })
    }
}
