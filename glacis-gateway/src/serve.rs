//! `glacis serve`: wire the core together and run until signalled.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use glacis_core::store::StayStore;
use glacis_core::{
    AuditSink, ExpiryTicker, PolicyEngine, RoutingTable, SessionRegistry, Store, StoreAuditSink,
    TranscodeConfig, TranscodeQueue,
};
use glacis_proxy_rdp::{RdpFrontend, TlsContext};
use glacis_proxy_ssh::SshFrontend;
use glacis_store::repo::StayRepo;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::hostkey;

/// Allocation diff cadence; also bounds how stale the routing cache gets.
const LISTENER_REFRESH: Duration = Duration::from_secs(5);

struct IpListeners {
    ssh: Option<JoinHandle<()>>,
    rdp: Option<JoinHandle<()>>,
}

impl IpListeners {
    fn abort(&self) {
        if let Some(task) = &self.ssh {
            task.abort();
        }
        if let Some(task) = &self.rdp {
            task.abort();
        }
    }
}

pub async fn serve(config: Config) -> Result<()> {
    for dir in [
        config.recordings_dir().join("ssh"),
        config.rdp_recordings_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let pool = glacis_store::db::create_pool(&config.db_url).context("database setup failed")?;
    let store = Store::new(pool);

    // Boot hygiene: nothing may look active that predates this process.
    let stranded = store.with_conn(StayRepo::close_stranded).await?;
    if stranded > 0 {
        warn!(stranded, "closed stays left open by a previous run");
    }

    let audit = Arc::new(StoreAuditSink::new(store.clone()));
    let registry = SessionRegistry::new(
        Arc::new(store.clone()) as Arc<dyn StayStore>,
        Arc::clone(&audit) as Arc<dyn AuditSink>,
    );
    let engine = Arc::new(PolicyEngine::new(store.clone()));
    let routing = Arc::new(RoutingTable::new(store.clone()));
    routing.reload().await.context("routing table load failed")?;

    let host_key = hostkey::load_or_generate(&config.host_key_path())?;
    let tls = Arc::new(
        TlsContext::load_or_generate(&config.tls_dir())
            .context("RDP TLS material setup failed")?,
    );

    let ticker = ExpiryTicker::new(Arc::clone(&registry), Arc::clone(&engine));
    let ticker_task = ticker.spawn();
    let flusher_task = registry.spawn_counter_flusher();

    let transcode = TranscodeQueue::new(
        store.clone(),
        TranscodeConfig::new(
            config.transcode_workers,
            config.transcode_queue_max,
            config.transcoder_bin.clone(),
            config.rdp_recordings_dir(),
        ),
    );
    transcode.recover().await?;
    let worker_tasks = transcode.spawn_workers();

    info!(
        ssh_port = config.ssh_listen_port,
        rdp_port = config.rdp_listen_port,
        transcode_workers = config.transcode_workers,
        "glacis gateway up"
    );

    let mut listeners: HashMap<IpAddr, IpListeners> = HashMap::new();
    let mut refresh = tokio::time::interval(LISTENER_REFRESH);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = refresh.tick() => {
                if let Err(e) = routing.reload().await {
                    warn!(error = %e, "routing table refresh failed");
                    continue;
                }
                engine.invalidate().await;
                ticker.poke();
                reconcile_listeners(
                    &config,
                    &routing,
                    &engine,
                    &registry,
                    &audit,
                    &host_key,
                    &tls,
                    &mut listeners,
                ).await;
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received, draining");
                break;
            }
        }
    }

    for (_, tasks) in listeners.drain() {
        tasks.abort();
    }
    ticker_task.abort();
    flusher_task.abort();
    for task in worker_tasks {
        task.abort();
    }
    info!("glacis gateway stopped");
    Ok(())
}

/// Start listeners for newly routed proxy IPs and stop the ones whose
/// allocation went away. A release is refused while stays are live, so a
/// stopped listener has nothing to tear down.
#[allow(clippy::too_many_arguments)]
async fn reconcile_listeners(
    config: &Config,
    routing: &Arc<RoutingTable>,
    engine: &Arc<PolicyEngine>,
    registry: &Arc<SessionRegistry>,
    audit: &Arc<StoreAuditSink>,
    host_key: &russh::keys::PrivateKey,
    tls: &Arc<TlsContext>,
    listeners: &mut HashMap<IpAddr, IpListeners>,
) {
    let routed: Vec<IpAddr> = routing.proxy_ips().await;

    let stale: Vec<IpAddr> = listeners
        .keys()
        .filter(|ip| !routed.contains(ip))
        .copied()
        .collect();
    for ip in stale {
        if let Some(tasks) = listeners.remove(&ip) {
            info!(proxy_ip = %ip, "stopping listeners for released proxy IP");
            tasks.abort();
        }
    }

    for ip in routed {
        if listeners.contains_key(&ip) {
            continue;
        }
        let Some(route) = routing.resolve(ip).await else {
            continue;
        };

        let ssh = route.backend.ssh_enabled.then(|| {
            let frontend = SshFrontend::new(
                Arc::clone(engine),
                Arc::clone(registry),
                Arc::clone(audit) as Arc<dyn AuditSink>,
                config.recordings_dir(),
                ip,
                config.ssh_listen_port,
                host_key.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = frontend.run().await {
                    error!(proxy_ip = %ip, error = %e, "SSH listener failed");
                }
            })
        });

        let rdp = route.backend.rdp_enabled.then(|| {
            let frontend = RdpFrontend::new(
                Arc::clone(engine),
                Arc::clone(registry),
                Arc::clone(audit) as Arc<dyn AuditSink>,
                config.recordings_dir(),
                ip,
                config.rdp_listen_port,
                Arc::clone(tls),
            );
            tokio::spawn(async move {
                if let Err(e) = frontend.run().await {
                    error!(proxy_ip = %ip, error = %e, "RDP listener failed");
                }
            })
        });

        info!(
            proxy_ip = %ip,
            backend = %route.backend.name,
            ssh = ssh.is_some(),
            rdp = rdp.is_some(),
            "listeners started"
        );
        listeners.insert(ip, IpListeners { ssh, rdp });
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
