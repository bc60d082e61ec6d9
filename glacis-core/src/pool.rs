//! Proxy-IP routing table.
//!
//! The routing table is the set of active allocations, cached in memory
//! for O(1) resolution on the accept path. Mutations write through the
//! store (which enforces the unique-active-allocation invariant and the
//! no-rebind-while-stays-live rule) and swap the cache atomically after
//! the transaction commits.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use glacis_store::models::Backend;
use glacis_store::repo::{AllocationRepo, DirectoryRepo};
use ipnetwork::IpNetwork;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::CoreResult;
use crate::store::Store;

/// One routing entry: the backend a proxy IP forwards to.
#[derive(Debug, Clone)]
pub struct Route {
    pub backend: Backend,
}

pub struct RoutingTable {
    store: Store,
    cache: RwLock<Arc<HashMap<IpAddr, Route>>>,
}

impl RoutingTable {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Resolve a proxy IP to its backend. O(1) against the cached table.
    pub async fn resolve(&self, proxy_ip: IpAddr) -> Option<Route> {
        self.cache.read().await.get(&proxy_ip).cloned()
    }

    /// Every proxy IP currently routed. The listener supervisor diffs this
    /// set to start and stop per-IP listeners.
    pub async fn proxy_ips(&self) -> Vec<IpAddr> {
        self.cache.read().await.keys().copied().collect()
    }

    /// Reload the cache from the store. A proxy IP with more than one
    /// active allocation is an invariant violation: it is dropped from
    /// the table (stopping its listener) until an operator re-binds it.
    pub async fn reload(&self) -> CoreResult<()> {
        let table = self
            .store
            .with_conn(|conn| {
                let mut table = HashMap::new();
                let mut violated = Vec::new();
                for alloc in AllocationRepo::active(conn)? {
                    let ip = alloc.proxy_ip.ip();
                    if violated.contains(&ip) {
                        continue;
                    }
                    let backend = DirectoryRepo::backend_by_id(conn, alloc.backend_id)?;
                    if table.insert(ip, Route { backend }).is_some() {
                        table.remove(&ip);
                        violated.push(ip);
                    }
                }
                for ip in &violated {
                    error!(proxy_ip = %ip, "multiple active allocations, routing for this IP disabled");
                }
                Ok(table)
            })
            .await?;
        *self.cache.write().await = Arc::new(table);
        Ok(())
    }

    /// Bind a proxy IP to a backend and refresh the cache.
    pub async fn bind(
        &self,
        proxy_ip: IpAddr,
        backend_id: i32,
        actor: Option<String>,
    ) -> CoreResult<()> {
        let net = IpNetwork::from(proxy_ip);
        self.store
            .with_conn(move |conn| AllocationRepo::bind(conn, net, backend_id, actor).map(|_| ()))
            .await?;
        info!(proxy_ip = %proxy_ip, backend_id, "proxy IP bound");
        self.reload().await
    }

    /// Release a proxy IP and refresh the cache. Refused while any stay is
    /// active on the IP.
    pub async fn release(&self, proxy_ip: IpAddr, actor: Option<String>) -> CoreResult<()> {
        let net = IpNetwork::from(proxy_ip);
        self.store
            .with_conn(move |conn| AllocationRepo::release(conn, net, actor))
            .await?;
        info!(proxy_ip = %proxy_ip, "proxy IP released");
        self.reload().await
    }
}
