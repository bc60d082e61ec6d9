//! Session registry: owner of every live stay.
//!
//! A stay is a state machine `opening -> admitted -> closing -> closed`
//! with a single channel of termination signals merged from all sources
//! (ticker expiry, revocation, driver observers). Front-ends subscribe to
//! that channel and call back in for counters, sessions and the final
//! close.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use glacis_store::models::{
    NewAuditEvent, NewStay, NewStaySession, Protocol, SessionKind, TerminationReason,
};
use ipnetwork::IpNetwork;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::engine::Admission;
use crate::error::{CoreError, CoreResult};
use crate::store::StayStore;

/// RDP clients open several TCP connections for one logical session; TCP
/// connections this close together join the existing stay, and the stay
/// survives this long after its last session closes.
pub const RDP_DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// How long a signalled front-end gets before the registry force-closes
/// the stay record itself.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(2);

const SIGNAL_CAPACITY: usize = 16;

/// Signals delivered to every task of a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaySignal {
    /// Advance expiry warning (5 and 1 minutes out).
    Warning { minutes_left: u32 },
    /// The stay must die now.
    Terminate { reason: TerminationReason },
}

struct StayEntry {
    person_id: i32,
    policy_id: i32,
    backend_id: i32,
    protocol: Protocol,
    source_ip: IpAddr,
    proxy_ip: IpAddr,
    login: Option<String>,
    started_at: tokio::time::Instant,
    expires_at: Option<DateTime<Utc>>,
    warned_5m: bool,
    warned_1m: bool,
    open_sessions: u32,
    /// RDP only: all sessions closed, waiting out the reconnect window.
    lingering: bool,
    pending_in: i64,
    pending_out: i64,
    recording_path: Option<String>,
    signal_tx: broadcast::Sender<StaySignal>,
    /// Reason imposed by a termination signal; overrides whatever reason
    /// the front-end reports when it unwinds.
    pending_reason: Option<TerminationReason>,
}

/// What the expiry ticker needs to know about a live stay.
#[derive(Debug, Clone)]
pub struct ActiveStayView {
    pub stay_id: i64,
    pub source_ip: IpAddr,
    pub proxy_ip: IpAddr,
    pub protocol: Protocol,
    pub login: Option<String>,
    pub policy_id: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub warned_5m: bool,
    pub warned_1m: bool,
}

/// Handle returned to the front-end that admitted the connection.
pub struct StayHandle {
    pub stay_id: i64,
    /// True when an RDP sub-connection joined an existing stay.
    pub reused: bool,
    pub signals: broadcast::Receiver<StaySignal>,
}

pub struct SessionRegistry {
    store: Arc<dyn StayStore>,
    audit: Arc<dyn AuditSink>,
    inner: Mutex<HashMap<i64, StayEntry>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn StayStore>, audit: Arc<dyn AuditSink>) -> Arc<Self> {
        Arc::new(Self {
            store,
            audit,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Open a stay for an admission, or join an existing RDP stay from the
    /// same person/backend/source within the dedup window.
    pub async fn open(
        self: &Arc<Self>,
        admission: &Admission,
        agent_used: bool,
    ) -> CoreResult<StayHandle> {
        if admission.protocol == Protocol::Rdp {
            let mut inner = self.inner.lock().await;
            let existing = inner.iter_mut().find(|(_, e)| {
                e.protocol == Protocol::Rdp
                    && e.person_id == admission.person_id
                    && e.backend_id == admission.backend.id
                    && e.source_ip == admission.source_ip
                    && (e.open_sessions > 0
                        || e.lingering
                        || e.started_at.elapsed() < RDP_DEDUP_WINDOW)
            });
            if let Some((stay_id, entry)) = existing {
                debug!(stay_id, "joining existing RDP stay");
                return Ok(StayHandle {
                    stay_id: *stay_id,
                    reused: true,
                    signals: entry.signal_tx.subscribe(),
                });
            }
        }

        let stay = self
            .store
            .open_stay(NewStay {
                person_id: admission.person_id,
                policy_id: admission.policy_id,
                backend_id: admission.backend.id,
                protocol: admission.protocol,
                source_ip: IpNetwork::from(admission.source_ip),
                proxy_ip: IpNetwork::from(admission.proxy_ip),
                ssh_login: admission.login.clone(),
                agent_used,
            })
            .await?;

        let (signal_tx, signals) = broadcast::channel(SIGNAL_CAPACITY);
        let entry = StayEntry {
            person_id: admission.person_id,
            policy_id: admission.policy_id,
            backend_id: admission.backend.id,
            protocol: admission.protocol,
            source_ip: admission.source_ip,
            proxy_ip: admission.proxy_ip,
            login: admission.login.clone(),
            started_at: tokio::time::Instant::now(),
            expires_at: admission.expires_at,
            warned_5m: false,
            warned_1m: false,
            open_sessions: 0,
            lingering: false,
            pending_in: 0,
            pending_out: 0,
            recording_path: None,
            signal_tx,
            pending_reason: None,
        };
        self.inner.lock().await.insert(stay.id, entry);

        info!(
            stay_id = stay.id,
            person_id = admission.person_id,
            backend = %admission.backend.name,
            protocol = %admission.protocol,
            "stay opened"
        );
        Ok(StayHandle {
            stay_id: stay.id,
            reused: false,
            signals,
        })
    }

    /// Register one session (SSH channel or RDP sub-connection) under a
    /// stay. Returns the session id for the matching `session_closed`.
    pub async fn attach_session(&self, stay_id: i64, kind: SessionKind) -> CoreResult<i64> {
        {
            let mut inner = self.inner.lock().await;
            let entry = inner.get_mut(&stay_id).ok_or(CoreError::StayNotLive(stay_id))?;
            entry.open_sessions += 1;
            entry.lingering = false;
        }
        self.store.add_session(NewStaySession { stay_id, kind }).await
    }

    /// A session ended. For RDP, closing the last session arms the
    /// reconnect window instead of closing the stay; a new session within
    /// the window disarms it.
    pub async fn session_closed(
        self: &Arc<Self>,
        stay_id: i64,
        session_id: i64,
        reason_hint: TerminationReason,
    ) -> CoreResult<()> {
        self.store.end_session(session_id).await?;

        let arm_linger = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(&stay_id) else {
                return Ok(());
            };
            entry.open_sessions = entry.open_sessions.saturating_sub(1);
            if entry.open_sessions == 0 && entry.protocol == Protocol::Rdp {
                entry.lingering = true;
                true
            } else {
                false
            }
        };

        if arm_linger {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(RDP_DEDUP_WINDOW).await;
                let still_idle = {
                    let inner = registry.inner.lock().await;
                    inner
                        .get(&stay_id)
                        .is_some_and(|e| e.lingering && e.open_sessions == 0)
                };
                if still_idle {
                    if let Err(e) = registry.close(stay_id, reason_hint).await {
                        warn!(stay_id, error = %e, "failed to close lingering RDP stay");
                    }
                }
            });
        }
        Ok(())
    }

    /// Fold byte-counter deltas into the stay. Cheap; flushed to the store
    /// by the periodic flusher.
    pub async fn push_counters(&self, stay_id: i64, delta_in: i64, delta_out: i64) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(&stay_id) {
            entry.pending_in += delta_in;
            entry.pending_out += delta_out;
        }
    }

    /// Attach the recording file path once the first byte has been written.
    pub async fn attach_recording(&self, stay_id: i64, path: String) -> CoreResult<()> {
        {
            let mut inner = self.inner.lock().await;
            let entry = inner.get_mut(&stay_id).ok_or(CoreError::StayNotLive(stay_id))?;
            entry.recording_path = Some(path.clone());
        }
        self.store.attach_recording(stay_id, path).await
    }

    /// Subscribe another task to a stay's signal channel.
    pub async fn subscribe(&self, stay_id: i64) -> CoreResult<broadcast::Receiver<StaySignal>> {
        let inner = self.inner.lock().await;
        inner
            .get(&stay_id)
            .map(|e| e.signal_tx.subscribe())
            .ok_or(CoreError::StayNotLive(stay_id))
    }

    /// Send an expiry warning and remember that it was sent.
    pub async fn warn_expiry(&self, stay_id: i64, minutes_left: u32) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(&stay_id) {
            match minutes_left {
                m if m <= 1 => entry.warned_1m = true,
                _ => entry.warned_5m = true,
            }
            let _ = entry.signal_tx.send(StaySignal::Warning { minutes_left });
        }
    }

    /// Update a stay's effective deadline after re-evaluation (a replaced
    /// or extended policy moves it).
    pub async fn set_expiry(&self, stay_id: i64, expires_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(&stay_id) {
            if entry.expires_at != expires_at {
                entry.expires_at = expires_at;
                entry.warned_5m = false;
                entry.warned_1m = false;
            }
        }
    }

    /// Signal a stay to die. Front-end tasks close their halves within the
    /// cancellation budget; if the record is still live after the grace
    /// period the registry closes it directly so the stay row never
    /// outlives the decision.
    pub async fn terminate(self: &Arc<Self>, stay_id: i64, reason: TerminationReason) {
        {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(&stay_id) else {
                return;
            };
            entry.pending_reason = Some(reason);
            let _ = entry.signal_tx.send(StaySignal::Terminate { reason });
            info!(stay_id, reason = %reason, "stay termination signalled");
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(FORCE_CLOSE_GRACE).await;
            let still_live = registry.inner.lock().await.contains_key(&stay_id);
            if still_live {
                warn!(stay_id, "front-end did not close in time, force-closing stay");
                if let Err(e) = registry.close(stay_id, reason).await {
                    warn!(stay_id, error = %e, "force-close failed");
                }
            }
        });
    }

    /// Close a stay: flush counters, stat the recording, write the close
    /// transaction, audit. Idempotent; a termination-imposed reason beats
    /// the one the front-end reports.
    pub async fn close(&self, stay_id: i64, reason: TerminationReason) -> CoreResult<bool> {
        let Some(entry) = self.inner.lock().await.remove(&stay_id) else {
            return Ok(false);
        };
        let reason = entry.pending_reason.unwrap_or(reason);

        if entry.pending_in != 0 || entry.pending_out != 0 {
            if let Err(e) = self
                .store
                .add_traffic(stay_id, entry.pending_in, entry.pending_out)
                .await
            {
                warn!(stay_id, error = %e, "failed to flush final byte counters");
            }
        }

        let recording_bytes = match &entry.recording_path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len() as i64)
                .unwrap_or(0),
            None => 0,
        };

        let closed = self.store.close_stay(stay_id, reason, recording_bytes).await?;

        self.audit
            .record(NewAuditEvent::stay_closed(
                IpNetwork::from(entry.source_ip),
                entry.backend_id,
                entry.protocol,
                reason.as_str(),
                Some(format!("stay {stay_id}")),
            ))
            .await;

        info!(stay_id, reason = %reason, recording_bytes, "stay closed");
        Ok(closed)
    }

    /// Live stays as the ticker sees them.
    pub async fn active_stays(&self) -> Vec<ActiveStayView> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .map(|(stay_id, e)| ActiveStayView {
                stay_id: *stay_id,
                source_ip: e.source_ip,
                proxy_ip: e.proxy_ip,
                protocol: e.protocol,
                login: e.login.clone(),
                policy_id: e.policy_id,
                expires_at: e.expires_at,
                warned_5m: e.warned_5m,
                warned_1m: e.warned_1m,
            })
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Number of live stays bound to one proxy IP (listener teardown check).
    pub async fn active_on_proxy_ip(&self, proxy_ip: IpAddr) -> usize {
        let inner = self.inner.lock().await;
        inner.values().filter(|e| e.proxy_ip == proxy_ip).count()
    }

    /// Write accumulated byte-counter deltas to the store.
    pub async fn flush_counters_once(&self) {
        let deltas: Vec<(i64, i64, i64)> = {
            let mut inner = self.inner.lock().await;
            inner
                .iter_mut()
                .filter(|(_, e)| e.pending_in != 0 || e.pending_out != 0)
                .map(|(id, e)| {
                    let d = (*id, e.pending_in, e.pending_out);
                    e.pending_in = 0;
                    e.pending_out = 0;
                    d
                })
                .collect()
        };
        for (stay_id, delta_in, delta_out) in deltas {
            if let Err(e) = self.store.add_traffic(stay_id, delta_in, delta_out).await {
                warn!(stay_id, error = %e, "failed to flush byte counters");
            }
        }
    }

    /// Periodic counter flusher, once per second under load.
    pub fn spawn_counter_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.flush_counters_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testing::MemoryAuditSink;
    use crate::engine::{Admission, BackendTarget};
    use async_trait::async_trait;
    use glacis_store::models::Stay;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryStayStore {
        next_stay: AtomicI64,
        next_session: AtomicI64,
        closed: StdMutex<Vec<(i64, TerminationReason, i64)>>,
        traffic: StdMutex<Vec<(i64, i64, i64)>>,
    }

    #[async_trait]
    impl StayStore for MemoryStayStore {
        async fn open_stay(&self, new: NewStay) -> CoreResult<Stay> {
            let id = self.next_stay.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Stay {
                id,
                person_id: new.person_id,
                policy_id: new.policy_id,
                backend_id: new.backend_id,
                protocol: new.protocol,
                source_ip: new.source_ip,
                proxy_ip: new.proxy_ip,
                ssh_login: new.ssh_login,
                agent_used: new.agent_used,
                started_at: Utc::now(),
                ends_at: None,
                termination_reason: None,
                recording_path: None,
                recording_bytes: 0,
                bytes_in: 0,
                bytes_out: 0,
            })
        }

        async fn close_stay(
            &self,
            stay_id: i64,
            reason: TerminationReason,
            recording_bytes: i64,
        ) -> CoreResult<bool> {
            self.closed
                .lock()
                .expect("closed lock")
                .push((stay_id, reason, recording_bytes));
            Ok(true)
        }

        async fn add_session(&self, _new: NewStaySession) -> CoreResult<i64> {
            Ok(self.next_session.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn end_session(&self, _session_id: i64) -> CoreResult<()> {
            Ok(())
        }

        async fn add_traffic(&self, stay_id: i64, din: i64, dout: i64) -> CoreResult<()> {
            self.traffic.lock().expect("traffic lock").push((stay_id, din, dout));
            Ok(())
        }

        async fn attach_recording(&self, _stay_id: i64, _path: String) -> CoreResult<()> {
            Ok(())
        }
    }

    fn admission(protocol: Protocol) -> Admission {
        Admission {
            person_id: 1,
            person_handle: "bob".to_string(),
            policy_id: 5,
            backend: BackendTarget {
                id: 10,
                name: "win-01".to_string(),
                address: "192.168.10.9".to_string(),
                port: 3389,
            },
            protocol,
            allow_port_forwarding: false,
            ssh_login_filter: vec![],
            expires_at: None,
            source_ip: "100.64.0.39".parse().expect("ip"),
            proxy_ip: "10.0.160.130".parse().expect("ip"),
            login: None,
        }
    }

    fn registry() -> (Arc<SessionRegistry>, Arc<MemoryStayStore>, Arc<MemoryAuditSink>) {
        let store = Arc::new(MemoryStayStore::default());
        let audit = Arc::new(MemoryAuditSink::default());
        let registry = SessionRegistry::new(
            Arc::clone(&store) as Arc<dyn StayStore>,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
        );
        (registry, store, audit)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rdp_dedup_single_stay() {
        let (registry, _store, _) = registry();
        let adm = admission(Protocol::Rdp);

        let first = registry.open(&adm, false).await.expect("open");
        assert!(!first.reused);
        let mut session_ids = vec![];
        session_ids.push(registry.attach_session(first.stay_id, SessionKind::Rdp).await.unwrap());

        // Three more connections over ~3 seconds all join the same stay.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            let h = registry.open(&adm, false).await.expect("open");
            assert!(h.reused);
            assert_eq!(h.stay_id, first.stay_id);
            session_ids.push(registry.attach_session(h.stay_id, SessionKind::Rdp).await.unwrap());
        }
        assert_eq!(registry.active_count().await, 1);
        assert_eq!(session_ids.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rdp_linger_close_after_window() {
        let (registry, store, _) = registry();
        let adm = admission(Protocol::Rdp);
        let handle = registry.open(&adm, false).await.expect("open");
        let session = registry.attach_session(handle.stay_id, SessionKind::Rdp).await.unwrap();

        registry
            .session_closed(handle.stay_id, session, TerminationReason::ClientClosed)
            .await
            .expect("session close");
        // Still live during the reconnect window.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.active_count().await, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.active_count().await, 0);
        let closed = store.closed.lock().expect("lock");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1, TerminationReason::ClientClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rdp_reconnect_cancels_linger() {
        let (registry, _store, _) = registry();
        let adm = admission(Protocol::Rdp);
        let handle = registry.open(&adm, false).await.expect("open");
        let session = registry.attach_session(handle.stay_id, SessionKind::Rdp).await.unwrap();
        registry
            .session_closed(handle.stay_id, session, TerminationReason::ClientClosed)
            .await
            .expect("session close");

        // Reconnect inside the window.
        tokio::time::advance(Duration::from_secs(4)).await;
        let again = registry.open(&adm, false).await.expect("open");
        assert!(again.reused);
        registry.attach_session(again.stay_id, SessionKind::Rdp).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        // The reconnect kept the stay alive.
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_signals_and_force_closes() {
        let (registry, store, _) = registry();
        let adm = admission(Protocol::Ssh);
        let mut handle = registry.open(&adm, false).await.expect("open");

        registry.terminate(handle.stay_id, TerminationReason::Revoked).await;
        let signal = handle.signals.recv().await.expect("signal");
        assert_eq!(signal, StaySignal::Terminate { reason: TerminationReason::Revoked });

        // Front-end never calls close; the registry does after the grace.
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.active_count().await, 0);
        let closed = store.closed.lock().expect("lock");
        assert_eq!(closed[0].1, TerminationReason::Revoked);
    }

    #[tokio::test]
    async fn test_pending_reason_overrides_front_end_reason() {
        let (registry, store, _) = registry();
        let adm = admission(Protocol::Ssh);
        let handle = registry.open(&adm, false).await.expect("open");

        registry.terminate(handle.stay_id, TerminationReason::PolicyExpired).await;
        // Front-end unwinds and reports a plain client close.
        registry
            .close(handle.stay_id, TerminationReason::ClientClosed)
            .await
            .expect("close");
        let closed = store.closed.lock().expect("lock");
        assert_eq!(closed[0].1, TerminationReason::PolicyExpired);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (registry, store, _) = registry();
        let adm = admission(Protocol::Ssh);
        let handle = registry.open(&adm, false).await.expect("open");
        assert!(registry.close(handle.stay_id, TerminationReason::ClientClosed).await.unwrap());
        assert!(!registry.close(handle.stay_id, TerminationReason::ClientClosed).await.unwrap());
        assert_eq!(store.closed.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_close_writes_audit_row() {
        let (registry, _store, audit) = registry();
        let adm = admission(Protocol::Ssh);
        let handle = registry.open(&adm, false).await.expect("open");
        registry.close(handle.stay_id, TerminationReason::ServerClosed).await.unwrap();
        let rows = audit.rows.lock().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "stay_closed");
        assert_eq!(rows[0].reason, "server_closed");
    }

    #[tokio::test]
    async fn test_counter_flush() {
        let (registry, store, _) = registry();
        let adm = admission(Protocol::Ssh);
        let handle = registry.open(&adm, false).await.expect("open");

        registry.push_counters(handle.stay_id, 100, 200).await;
        registry.push_counters(handle.stay_id, 1, 2).await;
        registry.flush_counters_once().await;

        let traffic = store.traffic.lock().expect("lock");
        assert_eq!(traffic.as_slice(), &[(handle.stay_id, 101, 202)]);
    }

    #[tokio::test]
    async fn test_ssh_stays_do_not_dedup() {
        let (registry, _store, _) = registry();
        let adm = admission(Protocol::Ssh);
        let a = registry.open(&adm, false).await.expect("open");
        let b = registry.open(&adm, false).await.expect("open");
        assert_ne!(a.stay_id, b.stay_id);
        assert_eq!(registry.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_warn_expiry_marks_and_signals() {
        let (registry, _store, _) = registry();
        let adm = admission(Protocol::Ssh);
        let mut handle = registry.open(&adm, false).await.expect("open");

        registry.warn_expiry(handle.stay_id, 5).await;
        let signal = handle.signals.recv().await.expect("signal");
        assert_eq!(signal, StaySignal::Warning { minutes_left: 5 });
        let views = registry.active_stays().await;
        assert!(views[0].warned_5m);
        assert!(!views[0].warned_1m);
    }
}
