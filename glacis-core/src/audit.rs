//! Audit sink.
//!
//! Control-plane writes audit inside their own store transaction (see the
//! repositories). Proxy events go through this sink instead: they must
//! never block or fail a live connection, so the write is best-effort and
//! a failure is logged rather than propagated.

use async_trait::async_trait;
use glacis_store::models::NewAuditEvent;
use glacis_store::repo::{AuditQuery, AuditRepo};
use tracing::{error, warn};

use crate::error::CoreResult;
use crate::store::Store;

/// Where proxy-side audit rows go. A trait seam so registry and front-end
/// tests can capture rows in memory.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one row, best-effort.
    async fn record(&self, event: NewAuditEvent);
}

/// The real, store-backed sink.
#[derive(Clone)]
pub struct StoreAuditSink {
    store: Store,
}

impl StoreAuditSink {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn query(
        &self,
        q: AuditQuery,
    ) -> CoreResult<Vec<glacis_store::models::AuditEvent>> {
        self.store
            .with_conn(move |conn| AuditRepo::query(conn, &q))
            .await
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, event: NewAuditEvent) {
        let kind = event.kind.clone();
        let result = self
            .store
            .with_conn(move |conn| AuditRepo::append(conn, event))
            .await;
        match result {
            Ok(_) => {}
            Err(e) => {
                // An unauditable proxy event is serious but must not take
                // the session down with it.
                if kind == "admission" {
                    error!(error = %e, "failed to write admission audit row");
                } else {
                    warn!(kind = %kind, error = %e, "failed to write audit row");
                }
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects rows in memory for assertions.
    #[derive(Default)]
    pub struct MemoryAuditSink {
        pub rows: Mutex<Vec<NewAuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for MemoryAuditSink {
        async fn record(&self, event: NewAuditEvent) {
            self.rows.lock().expect("audit lock").push(event);
        }
    }
}
