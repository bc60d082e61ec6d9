//! Policy evaluation.
//!
//! The engine is a value constructed at startup and injected into both
//! front-ends. It evaluates against an in-memory snapshot of the policy
//! tables, refreshed read-through with a short TTL and invalidated
//! explicitly after control-plane writes. Evaluation itself is pure, so the
//! decision logic is testable without a database.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use glacis_store::models::{Backend, Person, Policy, Protocol, ScopeKind, SourceIp, SubjectKind};
use glacis_store::repo::directory::GroupTree;
use glacis_store::repo::{AllocationRepo, DirectoryRepo, PolicyRepo};
use ipnetwork::IpNetwork;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::groups::GroupIndex;
use crate::schedule;
use crate::store::Store;

/// Database budget for one decision. A slower snapshot refresh is treated
/// as `no_matching_policy` and audited by the caller.
pub const DECISION_BUDGET: Duration = Duration::from_millis(500);

/// Snapshot TTL when nothing invalidates the cache explicitly.
const SNAPSHOT_TTL: Duration = Duration::from_secs(5);

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoPersonForSourceIp,
    NoBackendForProxyIp,
    NoMatchingPolicy,
    PolicyExpired,
    OutsideSchedule,
    ProtocolNotAllowed,
    LoginNotPermitted,
    BackendDisabled,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPersonForSourceIp => "no_person_for_source_ip",
            Self::NoBackendForProxyIp => "no_backend_for_proxy_ip",
            Self::NoMatchingPolicy => "no_matching_policy",
            Self::PolicyExpired => "policy_expired",
            Self::OutsideSchedule => "outside_schedule",
            Self::ProtocolNotAllowed => "protocol_not_allowed",
            Self::LoginNotPermitted => "login_not_permitted",
            Self::BackendDisabled => "backend_disabled",
        }
    }

    /// How far along the evaluation a candidate got before failing. When
    /// several candidates fail for different reasons the most specific one
    /// is reported.
    fn specificity(&self) -> u8 {
        match self {
            Self::NoPersonForSourceIp | Self::NoBackendForProxyIp | Self::BackendDisabled => 0,
            Self::NoMatchingPolicy => 1,
            Self::PolicyExpired => 2,
            Self::OutsideSchedule => 3,
            Self::ProtocolNotAllowed => 4,
            Self::LoginNotPermitted => 5,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend half of an admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub id: i32,
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// The positive outcome of policy evaluation, carried by the front-end for
/// the lifetime of the stay.
#[derive(Debug, Clone)]
pub struct Admission {
    pub person_id: i32,
    pub person_handle: String,
    pub policy_id: i32,
    pub backend: BackendTarget,
    pub protocol: Protocol,
    pub allow_port_forwarding: bool,
    /// Empty means any login the backend accepts.
    pub ssh_login_filter: Vec<String>,
    /// Effective deadline: the earlier of the policy end and the current
    /// schedule window end. `None` for an open-ended admission.
    pub expires_at: Option<DateTime<Utc>>,
    pub source_ip: IpAddr,
    pub proxy_ip: IpAddr,
    pub login: Option<String>,
}

/// Outcome of `decide`.
#[derive(Debug, Clone)]
pub enum Decision {
    Admit(Box<Admission>),
    Deny {
        reason: DenyReason,
        detail: Option<String>,
    },
}

impl Decision {
    fn deny(reason: DenyReason) -> Self {
        Decision::Deny { reason, detail: None }
    }

    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit(_))
    }
}

/// Immutable view of the policy tables used for evaluation.
pub struct Snapshot {
    pub taken_at: Instant,
    pub source_ips: Vec<SourceIp>,
    pub persons: HashMap<i32, Person>,
    pub backends: HashMap<i32, Backend>,
    /// proxy IP -> backend id, active allocations only.
    pub routes: HashMap<IpAddr, i32>,
    pub user_groups: GroupIndex,
    pub server_groups: GroupIndex,
    /// person id -> direct user group ids.
    pub user_memberships: HashMap<i32, Vec<i32>>,
    /// backend id -> direct server group ids.
    pub server_memberships: HashMap<i32, Vec<i32>>,
    /// Active policies in evaluation order.
    pub policies: Vec<Policy>,
}

impl Snapshot {
    fn is_fresh(&self, max_age: Duration) -> bool {
        self.taken_at.elapsed() < max_age
    }
}

pub struct PolicyEngine {
    store: Store,
    cache: RwLock<Option<Arc<Snapshot>>>,
}

impl PolicyEngine {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Decide whether to admit `(src_ip, proxy_ip, protocol, login)`.
    ///
    /// The only fallible path is the snapshot refresh; a refresh slower
    /// than the budget degrades into a deny so a struggling database never
    /// admits by accident.
    pub async fn decide(
        &self,
        src_ip: IpAddr,
        proxy_ip: IpAddr,
        protocol: Protocol,
        login: Option<&str>,
    ) -> Decision {
        let snapshot = match tokio::time::timeout(DECISION_BUDGET, self.snapshot(SNAPSHOT_TTL)).await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(error = %e, "policy snapshot refresh failed");
                return Decision::Deny {
                    reason: DenyReason::NoMatchingPolicy,
                    detail: Some(format!("policy store unavailable: {e}")),
                };
            }
            Err(_) => {
                warn!(budget_ms = DECISION_BUDGET.as_millis() as u64, "policy snapshot refresh over budget");
                return Decision::Deny {
                    reason: DenyReason::NoMatchingPolicy,
                    detail: Some("policy query budget exceeded".to_string()),
                };
            }
        };
        evaluate(&snapshot, src_ip, proxy_ip, protocol, login, Utc::now())
    }

    /// Decide with a snapshot no older than `max_age`. The expiry ticker
    /// uses a tight bound so revocations are observed within two seconds.
    pub async fn decide_fresh(
        &self,
        max_age: Duration,
        src_ip: IpAddr,
        proxy_ip: IpAddr,
        protocol: Protocol,
        login: Option<&str>,
    ) -> CoreResult<Decision> {
        let snapshot = self.snapshot(max_age).await?;
        Ok(evaluate(&snapshot, src_ip, proxy_ip, protocol, login, Utc::now()))
    }

    /// Drop the cached snapshot; the next decision re-reads the store.
    /// Called after every policy or allocation write that this process
    /// performs itself.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Current snapshot, refreshed when missing or older than `max_age`.
    pub async fn snapshot(&self, max_age: Duration) -> CoreResult<Arc<Snapshot>> {
        {
            let cache = self.cache.read().await;
            if let Some(snapshot) = cache.as_ref() {
                if snapshot.is_fresh(max_age) {
                    return Ok(Arc::clone(snapshot));
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(snapshot) = cache.as_ref() {
            if snapshot.is_fresh(max_age) {
                return Ok(Arc::clone(snapshot));
            }
        }

        let snapshot = Arc::new(self.load_snapshot().await?);
        debug!(
            policies = snapshot.policies.len(),
            routes = snapshot.routes.len(),
            "policy snapshot refreshed"
        );
        *cache = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    async fn load_snapshot(&self) -> CoreResult<Snapshot> {
        self.store
            .with_conn(|conn| {
                conn.build_transaction()
                    .read_only()
                    .serializable()
                    .run(|conn| {
                        let persons: HashMap<i32, Person> = DirectoryRepo::active_persons(conn)?
                            .into_iter()
                            .map(|p| (p.id, p))
                            .collect();
                        let source_ips = DirectoryRepo::active_source_ips(conn)?
                            .into_iter()
                            .filter(|ip| persons.contains_key(&ip.person_id))
                            .collect();
                        let backends: HashMap<i32, Backend> = DirectoryRepo::active_backends(conn)?
                            .into_iter()
                            .map(|b| (b.id, b))
                            .collect();

                        let routes = AllocationRepo::active(conn)?
                            .into_iter()
                            .map(|a| (a.proxy_ip.ip(), a.backend_id))
                            .collect();

                        let user_groups = GroupIndex::from_nodes(
                            DirectoryRepo::group_nodes(conn, GroupTree::Users)?
                                .into_iter()
                                .map(|n| (n.id, n.parent_id)),
                        );
                        let server_groups = GroupIndex::from_nodes(
                            DirectoryRepo::group_nodes(conn, GroupTree::Servers)?
                                .into_iter()
                                .map(|n| (n.id, n.parent_id)),
                        );

                        let mut user_memberships: HashMap<i32, Vec<i32>> = HashMap::new();
                        for (group, person) in DirectoryRepo::group_members(conn, GroupTree::Users)? {
                            user_memberships.entry(person).or_default().push(group);
                        }
                        let mut server_memberships: HashMap<i32, Vec<i32>> = HashMap::new();
                        for (group, backend) in DirectoryRepo::group_members(conn, GroupTree::Servers)? {
                            server_memberships.entry(backend).or_default().push(group);
                        }

                        let policies = PolicyRepo::active_ordered(conn)?;

                        Ok(Snapshot {
                            taken_at: Instant::now(),
                            source_ips,
                            persons,
                            backends,
                            routes,
                            user_groups,
                            server_groups,
                            user_memberships,
                            server_memberships,
                            policies,
                        })
                    })
            })
            .await
    }

    /// Whether re-parenting `group_id` under `new_parent` keeps the tree
    /// cycle-free. Exposed for the control plane's group writes.
    pub async fn validate_no_cycle(
        &self,
        tree: GroupTree,
        group_id: i32,
        new_parent: Option<i32>,
    ) -> CoreResult<bool> {
        let snapshot = self.snapshot(SNAPSHOT_TTL).await?;
        let index = match tree {
            GroupTree::Users => &snapshot.user_groups,
            GroupTree::Servers => &snapshot.server_groups,
        };
        Ok(!index.creates_cycle(group_id, new_parent))
    }

    /// Transitive closure of a group: itself and every descendant.
    pub async fn group_closure(&self, tree: GroupTree, group_id: i32) -> CoreResult<HashSet<i32>> {
        let snapshot = self.snapshot(SNAPSHOT_TTL).await?;
        let index = match tree {
            GroupTree::Users => &snapshot.user_groups,
            GroupTree::Servers => &snapshot.server_groups,
        };
        Ok(index.with_descendants(group_id))
    }
}

/// Find the source-IP row for an address: exact host entry first, then the
/// longest matching prefix.
fn match_source_ip<'a>(snapshot: &'a Snapshot, src_ip: IpAddr) -> Option<&'a SourceIp> {
    let host = IpNetwork::from(src_ip);
    if let Some(exact) = snapshot
        .source_ips
        .iter()
        .find(|row| row.cidr == host)
    {
        return Some(exact);
    }
    snapshot
        .source_ips
        .iter()
        .filter(|row| row.cidr.contains(src_ip))
        .max_by_key(|row| row.cidr.prefix())
}

/// Pure policy evaluation against a snapshot. First surviving candidate
/// wins; candidates come pre-ordered by `(ends_at IS NULL DESC,
/// created_at ASC)`.
pub fn evaluate(
    snapshot: &Snapshot,
    src_ip: IpAddr,
    proxy_ip: IpAddr,
    protocol: Protocol,
    login: Option<&str>,
    now: DateTime<Utc>,
) -> Decision {
    // 1. Source IP -> person.
    let Some(source_row) = match_source_ip(snapshot, src_ip) else {
        return Decision::deny(DenyReason::NoPersonForSourceIp);
    };
    let Some(person) = snapshot.persons.get(&source_row.person_id) else {
        return Decision::deny(DenyReason::NoPersonForSourceIp);
    };

    // 2. Proxy IP -> backend.
    let Some(backend_id) = snapshot.routes.get(&proxy_ip) else {
        return Decision::deny(DenyReason::NoBackendForProxyIp);
    };
    let Some(backend) = snapshot.backends.get(backend_id) else {
        // Allocation points at a missing or inactive backend.
        return Decision::deny(DenyReason::BackendDisabled);
    };
    if !backend.active {
        return Decision::deny(DenyReason::BackendDisabled);
    }
    if !backend.supports(protocol) {
        return Decision::deny(DenyReason::ProtocolNotAllowed);
    }

    // 3. Transitive user-group set.
    let direct_user_groups = snapshot
        .user_memberships
        .get(&person.id)
        .cloned()
        .unwrap_or_default();
    let user_group_set = snapshot.user_groups.with_ancestors(direct_user_groups);

    // 4. Transitive server-group set.
    let direct_server_groups = snapshot
        .server_memberships
        .get(&backend.id)
        .cloned()
        .unwrap_or_default();
    let server_group_set = snapshot.server_groups.with_ancestors(direct_server_groups);

    // 5-7. Walk candidates in order; remember the most specific failure.
    let mut best_failure: Option<DenyReason> = None;
    let mut observe = |reason: DenyReason| {
        if best_failure.map_or(true, |b| reason.specificity() > b.specificity()) {
            best_failure = Some(reason);
        }
    };

    for policy in &snapshot.policies {
        let subject_matches = match policy.subject_kind {
            SubjectKind::Person => policy.subject_id == person.id,
            SubjectKind::UserGroup => user_group_set.contains(&policy.subject_id),
        };
        if !subject_matches {
            continue;
        }

        let scope_matches = match policy.scope_kind {
            ScopeKind::Server | ScopeKind::Service => policy.scope_id == backend.id,
            ScopeKind::ServerGroup => server_group_set.contains(&policy.scope_id),
        };
        if !scope_matches {
            continue;
        }

        // Optional source-IP pin on the policy itself.
        if let Some(required_ip) = policy.source_ip_id {
            if required_ip != source_row.id {
                continue;
            }
        }

        // 6. Validity window, then schedule, then protocol, then login.
        if !policy.in_validity_window(now) {
            observe(DenyReason::PolicyExpired);
            continue;
        }

        let parsed_schedule = match policy.parsed_schedule() {
            Ok(s) => s,
            Err(e) => {
                warn!(policy_id = policy.id, error = %e, "skipping policy with malformed schedule");
                continue;
            }
        };
        let mut window_deadline = None;
        if let Some(sched) = &parsed_schedule {
            match schedule::in_window(sched, now) {
                Ok(true) => match schedule::window_end(sched, now) {
                    Ok(end) => window_deadline = end,
                    Err(e) => {
                        warn!(policy_id = policy.id, error = %e, "schedule window end unavailable");
                    }
                },
                Ok(false) => {
                    observe(DenyReason::OutsideSchedule);
                    continue;
                }
                Err(e) => {
                    warn!(policy_id = policy.id, error = %e, "skipping policy with bad time zone");
                    continue;
                }
            }
        }

        if !policy.admits_protocol(protocol) {
            observe(DenyReason::ProtocolNotAllowed);
            continue;
        }

        if let Some(login) = login {
            if !policy.admits_login(login) {
                observe(DenyReason::LoginNotPermitted);
                continue;
            }
        }

        // 8. First surviving candidate wins.
        let expires_at = match (policy.ends_at, window_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };
        return Decision::Admit(Box::new(Admission {
            person_id: person.id,
            person_handle: person.handle.clone(),
            policy_id: policy.id,
            backend: BackendTarget {
                id: backend.id,
                name: backend.name.clone(),
                address: backend.address.clone(),
                port: backend.port_for(protocol),
            },
            protocol,
            allow_port_forwarding: policy.allow_port_forwarding,
            ssh_login_filter: policy.ssh_logins.clone(),
            expires_at,
            source_ip: src_ip,
            proxy_ip,
            login: login.map(str::to_string),
        }));
    }

    Decision::deny(best_failure.unwrap_or(DenyReason::NoMatchingPolicy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveTime};
    use glacis_store::models::Schedule;

    fn person(id: i32, handle: &str) -> Person {
        Person {
            id,
            handle: handle.to_string(),
            display_name: handle.to_string(),
            email: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn backend(id: i32, name: &str) -> Backend {
        Backend {
            id,
            name: name.to_string(),
            address: "192.168.10.5".to_string(),
            ssh_port: 22,
            rdp_port: 3389,
            ssh_enabled: true,
            rdp_enabled: true,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn source_ip(id: i32, person_id: i32, cidr: &str) -> SourceIp {
        SourceIp {
            id,
            person_id,
            cidr: cidr.parse().expect("test cidr"),
            label: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    fn policy(id: i32, subject: (SubjectKind, i32), scope: (ScopeKind, i32)) -> Policy {
        Policy {
            id,
            subject_kind: subject.0,
            subject_id: subject.1,
            scope_kind: scope.0,
            scope_id: scope.1,
            protocol: Some(Protocol::Ssh),
            ssh_logins: vec![],
            source_ip_id: None,
            allow_port_forwarding: false,
            starts_at: Utc::now() - ChronoDuration::hours(1),
            ends_at: Some(Utc::now() + ChronoDuration::hours(8)),
            schedule: None,
            active: true,
            created_at: Utc::now() - ChronoDuration::hours(1),
            created_by: None,
        }
    }

    fn snapshot() -> Snapshot {
        let alice = person(1, "alice");
        let db01 = backend(10, "db-01");
        Snapshot {
            taken_at: Instant::now(),
            source_ips: vec![source_ip(100, 1, "100.64.0.20/32")],
            persons: HashMap::from([(1, alice)]),
            backends: HashMap::from([(10, db01)]),
            routes: HashMap::from([("10.0.160.129".parse().unwrap(), 10)]),
            user_groups: GroupIndex::from_nodes([]),
            server_groups: GroupIndex::from_nodes([(50, None)]),
            user_memberships: HashMap::new(),
            server_memberships: HashMap::from([(10, vec![50])]),
            policies: vec![],
        }
    }

    fn src() -> IpAddr {
        "100.64.0.20".parse().unwrap()
    }

    fn proxy() -> IpAddr {
        "10.0.160.129".parse().unwrap()
    }

    #[test]
    fn test_deny_unknown_source_ip() {
        let snap = snapshot();
        let d = evaluate(&snap, "9.9.9.9".parse().unwrap(), proxy(), Protocol::Ssh, None, Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::NoPersonForSourceIp, .. }));
    }

    #[test]
    fn test_deny_unknown_proxy_ip() {
        let snap = snapshot();
        let d = evaluate(&snap, src(), "10.0.160.200".parse().unwrap(), Protocol::Ssh, None, Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::NoBackendForProxyIp, .. }));
    }

    #[test]
    fn test_deny_no_policy() {
        let snap = snapshot();
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, Some("postgres"), Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::NoMatchingPolicy, .. }));
    }

    #[test]
    fn test_admit_direct_person_policy() {
        let mut snap = snapshot();
        snap.policies = vec![policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10))];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, Some("postgres"), Utc::now());
        let Decision::Admit(adm) = d else {
            panic!("expected admit");
        };
        assert_eq!(adm.policy_id, 7);
        assert_eq!(adm.backend.port, 22);
        assert_eq!(adm.person_handle, "alice");
    }

    #[test]
    fn test_admit_via_server_group() {
        let mut snap = snapshot();
        snap.policies = vec![policy(7, (SubjectKind::Person, 1), (ScopeKind::ServerGroup, 50))];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, Some("postgres"), Utc::now());
        assert!(d.is_admit());
    }

    #[test]
    fn test_admit_via_parent_server_group() {
        let mut snap = snapshot();
        // Backend in group 51, whose parent is 50; policy scoped to 50.
        snap.server_groups = GroupIndex::from_nodes([(50, None), (51, Some(50))]);
        snap.server_memberships = HashMap::from([(10, vec![51])]);
        snap.policies = vec![policy(7, (SubjectKind::Person, 1), (ScopeKind::ServerGroup, 50))];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, Utc::now());
        assert!(d.is_admit());
    }

    #[test]
    fn test_admit_via_user_group() {
        let mut snap = snapshot();
        snap.user_groups = GroupIndex::from_nodes([(60, None)]);
        snap.user_memberships = HashMap::from([(1, vec![60])]);
        snap.policies = vec![policy(7, (SubjectKind::UserGroup, 60), (ScopeKind::Server, 10))];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, Utc::now());
        assert!(d.is_admit());
    }

    #[test]
    fn test_deny_wrong_login_is_most_specific() {
        let mut snap = snapshot();
        let mut p = policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        p.ssh_logins = vec!["postgres".to_string()];
        snap.policies = vec![p];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, Some("root"), Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::LoginNotPermitted, .. }));
    }

    #[test]
    fn test_deny_expired_policy() {
        let mut snap = snapshot();
        let mut p = policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        p.starts_at = Utc::now() - ChronoDuration::hours(10);
        p.ends_at = Some(Utc::now() - ChronoDuration::hours(1));
        snap.policies = vec![p];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::PolicyExpired, .. }));
    }

    #[test]
    fn test_deny_wrong_protocol() {
        let mut snap = snapshot();
        snap.policies = vec![policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10))];
        let d = evaluate(&snap, src(), proxy(), Protocol::Rdp, None, Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::ProtocolNotAllowed, .. }));
    }

    #[test]
    fn test_deny_backend_protocol_disabled() {
        let mut snap = snapshot();
        if let Some(b) = snap.backends.get_mut(&10) {
            b.rdp_enabled = false;
        }
        snap.policies = vec![policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10))];
        let d = evaluate(&snap, src(), proxy(), Protocol::Rdp, None, Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::ProtocolNotAllowed, .. }));
    }

    #[test]
    fn test_deny_backend_disabled() {
        let mut snap = snapshot();
        if let Some(b) = snap.backends.get_mut(&10) {
            b.active = false;
        }
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::BackendDisabled, .. }));
    }

    #[test]
    fn test_most_specific_failure_wins() {
        let mut snap = snapshot();
        let mut expired = policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        expired.starts_at = Utc::now() - ChronoDuration::hours(10);
        expired.ends_at = Some(Utc::now() - ChronoDuration::hours(1));
        let mut wrong_login = policy(8, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        wrong_login.ssh_logins = vec!["postgres".to_string()];
        snap.policies = vec![expired, wrong_login];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, Some("root"), Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::LoginNotPermitted, .. }));
    }

    #[test]
    fn test_first_candidate_in_order_wins() {
        let mut snap = snapshot();
        let first = policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        let mut second = policy(8, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        second.allow_port_forwarding = true;
        snap.policies = vec![first, second];
        let Decision::Admit(adm) = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, Utc::now())
        else {
            panic!("expected admit");
        };
        assert_eq!(adm.policy_id, 7);
        assert!(!adm.allow_port_forwarding);
    }

    #[test]
    fn test_cidr_longest_prefix_match() {
        let mut snap = snapshot();
        snap.source_ips = vec![
            source_ip(100, 1, "100.64.0.0/16"),
            source_ip(101, 2, "100.64.0.0/24"),
        ];
        snap.persons.insert(2, person(2, "bob"));
        snap.policies = vec![policy(7, (SubjectKind::Person, 2), (ScopeKind::Server, 10))];
        // /24 is the longest match, so the connection is bob's.
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, Utc::now());
        assert!(d.is_admit());
    }

    #[test]
    fn test_policy_source_ip_pin() {
        let mut snap = snapshot();
        let mut p = policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        p.source_ip_id = Some(999);
        snap.policies = vec![p];
        let d = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, Utc::now());
        assert!(matches!(d, Decision::Deny { reason: DenyReason::NoMatchingPolicy, .. }));
    }

    #[test]
    fn test_expires_at_uses_schedule_window() {
        let now: DateTime<Utc> = "2026-01-05T09:00:00Z".parse().expect("ts");
        let mut snap = snapshot();
        let mut p = policy(7, (SubjectKind::Person, 1), (ScopeKind::Server, 10));
        p.starts_at = now - ChronoDuration::hours(9);
        p.ends_at = Some(now + ChronoDuration::days(30));
        let sched = Schedule {
            weekdays: vec![],
            time_start: None,
            time_end: NaiveTime::from_hms_opt(16, 0, 0),
            months: vec![],
            days_of_month: vec![],
            timezone: "UTC".to_string(),
        };
        p.schedule = Some(serde_json::to_value(&sched).expect("schedule json"));
        snap.policies = vec![p];
        let Decision::Admit(adm) = evaluate(&snap, src(), proxy(), Protocol::Ssh, None, now)
        else {
            panic!("expected admit");
        };
        // The window end (16:00 today) beats the 30-day policy end.
        let deadline = adm.expires_at.expect("deadline");
        assert_eq!(deadline, "2026-01-05T16:00:00Z".parse::<DateTime<Utc>>().expect("ts"));
    }
}
