//! Expiry ticker.
//!
//! One logical timer for the whole gateway. On every wake it re-evaluates
//! each active stay against the policy engine; a stay whose policy no
//! longer admits it is signalled for termination, everything else gets its
//! effective deadline refreshed and its advance warnings (5 and 1 minutes
//! out) delivered. Control-plane writes poke the ticker so a revocation is
//! observed well inside its two-second budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use glacis_store::models::TerminationReason;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{Decision, DenyReason, PolicyEngine};
use crate::registry::{ActiveStayView, SessionRegistry};

/// Snapshot staleness tolerated while stays are live. Keeps revocation
/// visible within the two-second observation budget.
const SWEEP_SNAPSHOT_AGE: Duration = Duration::from_secs(1);

/// Poll ceiling while any stay is live.
const BUSY_WAKE: Duration = Duration::from_secs(1);

/// Idle fallback when nothing is live and nothing pokes us.
const IDLE_WAKE: Duration = Duration::from_secs(60);

const WARN_5M: Duration = Duration::from_secs(5 * 60);
const WARN_1M: Duration = Duration::from_secs(60);

pub struct ExpiryTicker {
    registry: Arc<SessionRegistry>,
    engine: Arc<PolicyEngine>,
    notify: Notify,
}

/// Which warning a stay is due for right now, if any.
fn warning_due(view: &ActiveStayView, now: DateTime<Utc>) -> Option<u32> {
    let deadline = view.expires_at?;
    let left = (deadline - now).to_std().ok()?;
    if left <= WARN_1M && !view.warned_1m {
        Some(1)
    } else if left <= WARN_5M && !view.warned_5m {
        Some(5)
    } else {
        None
    }
}

/// Whether the stay's effective deadline has passed.
fn is_expired(view: &ActiveStayView, now: DateTime<Utc>) -> bool {
    view.expires_at.is_some_and(|deadline| now >= deadline)
}

impl ExpiryTicker {
    pub fn new(registry: Arc<SessionRegistry>, engine: Arc<PolicyEngine>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            notify: Notify::new(),
        })
    }

    /// Wake the ticker early; called after every policy or stay write this
    /// process performs.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let ticker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let sleep_for = ticker.sweep().await;
                tokio::select! {
                    _ = ticker.notify.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
        })
    }

    /// One pass over every active stay. Returns how long to sleep.
    async fn sweep(&self) -> Duration {
        let views = self.registry.active_stays().await;
        if views.is_empty() {
            return IDLE_WAKE;
        }
        let now = Utc::now();

        for view in &views {
            let decision = self
                .engine
                .decide_fresh(
                    SWEEP_SNAPSHOT_AGE,
                    view.source_ip,
                    view.proxy_ip,
                    view.protocol,
                    view.login.as_deref(),
                )
                .await;

            match decision {
                Ok(Decision::Admit(adm)) => {
                    self.registry.set_expiry(view.stay_id, adm.expires_at).await;
                    let refreshed = ActiveStayView {
                        expires_at: adm.expires_at,
                        ..view.clone()
                    };
                    if is_expired(&refreshed, now) {
                        self.registry
                            .terminate(view.stay_id, TerminationReason::PolicyExpired)
                            .await;
                    } else if let Some(minutes) = warning_due(&refreshed, now) {
                        debug!(stay_id = view.stay_id, minutes, "sending expiry warning");
                        self.registry.warn_expiry(view.stay_id, minutes).await;
                    }
                }
                Ok(Decision::Deny { reason, .. }) => {
                    let termination = match reason {
                        DenyReason::PolicyExpired | DenyReason::OutsideSchedule => {
                            TerminationReason::PolicyExpired
                        }
                        _ => TerminationReason::Revoked,
                    };
                    self.registry.terminate(view.stay_id, termination).await;
                }
                Err(e) => {
                    // A store hiccup must not tear down live stays; the
                    // next sweep retries.
                    warn!(stay_id = view.stay_id, error = %e, "stay re-evaluation failed");
                }
            }
        }

        BUSY_WAKE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use glacis_store::models::Protocol;

    fn view(expires_in: Option<i64>, warned_5m: bool, warned_1m: bool) -> ActiveStayView {
        ActiveStayView {
            stay_id: 1,
            source_ip: "100.64.0.20".parse().expect("ip"),
            proxy_ip: "10.0.160.129".parse().expect("ip"),
            protocol: Protocol::Ssh,
            login: Some("postgres".to_string()),
            policy_id: 7,
            expires_at: expires_in.map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
            warned_5m,
            warned_1m,
        }
    }

    #[test]
    fn test_no_warning_far_from_deadline() {
        let v = view(Some(3600), false, false);
        assert_eq!(warning_due(&v, Utc::now()), None);
    }

    #[test]
    fn test_five_minute_warning() {
        let v = view(Some(290), false, false);
        assert_eq!(warning_due(&v, Utc::now()), Some(5));
    }

    #[test]
    fn test_one_minute_warning() {
        let v = view(Some(50), false, false);
        assert_eq!(warning_due(&v, Utc::now()), Some(1));
    }

    #[test]
    fn test_one_minute_warning_after_five_sent() {
        let v = view(Some(50), true, false);
        assert_eq!(warning_due(&v, Utc::now()), Some(1));
    }

    #[test]
    fn test_no_repeat_warnings() {
        let v = view(Some(290), true, false);
        assert_eq!(warning_due(&v, Utc::now()), None);
        let v = view(Some(50), true, true);
        assert_eq!(warning_due(&v, Utc::now()), None);
    }

    #[test]
    fn test_open_ended_never_warns() {
        let v = view(None, false, false);
        assert_eq!(warning_due(&v, Utc::now()), None);
    }

    #[test]
    fn test_expired() {
        let v = view(Some(-1), true, true);
        assert!(is_expired(&v, Utc::now()));
        let v = view(Some(30), false, false);
        assert!(!is_expired(&v, Utc::now()));
        let v = view(None, false, false);
        assert!(!is_expired(&v, Utc::now()));
    }
}
