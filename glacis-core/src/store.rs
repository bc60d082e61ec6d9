//! Async facade over the blocking Diesel store.
//!
//! Diesel connections block, so every store call runs on the blocking
//! thread pool. The facade is cheap to clone and shared by the engine,
//! registry, routing table and transcode workers.

use async_trait::async_trait;
use glacis_store::db::{get_conn, DbPool};
use glacis_store::models::{NewStay, NewStaySession, Stay, TerminationReason};
use glacis_store::repo::StayRepo;
use glacis_store::StoreResult;

use crate::error::{CoreError, CoreResult};

#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Run a closure with a pooled connection on the blocking pool.
    pub async fn with_conn<T, F>(&self, f: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut diesel::PgConnection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = get_conn(&pool)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CoreError::Task(e.to_string()))?;
        result.map_err(CoreError::from)
    }
}

/// Stay persistence as seen by the session registry. A trait seam so the
/// registry's timing behaviour (dedup windows, linger close, termination
/// deadlines) is testable without a database.
#[async_trait]
pub trait StayStore: Send + Sync {
    async fn open_stay(&self, new: NewStay) -> CoreResult<Stay>;
    async fn close_stay(
        &self,
        stay_id: i64,
        reason: TerminationReason,
        recording_bytes: i64,
    ) -> CoreResult<bool>;
    async fn add_session(&self, new: NewStaySession) -> CoreResult<i64>;
    async fn end_session(&self, session_id: i64) -> CoreResult<()>;
    async fn add_traffic(&self, stay_id: i64, delta_in: i64, delta_out: i64) -> CoreResult<()>;
    async fn attach_recording(&self, stay_id: i64, path: String) -> CoreResult<()>;
}

#[async_trait]
impl StayStore for Store {
    async fn open_stay(&self, new: NewStay) -> CoreResult<Stay> {
        self.with_conn(move |conn| StayRepo::open(conn, new)).await
    }

    async fn close_stay(
        &self,
        stay_id: i64,
        reason: TerminationReason,
        recording_bytes: i64,
    ) -> CoreResult<bool> {
        self.with_conn(move |conn| StayRepo::close(conn, stay_id, reason, recording_bytes))
            .await
    }

    async fn add_session(&self, new: NewStaySession) -> CoreResult<i64> {
        self.with_conn(move |conn| StayRepo::add_session(conn, new).map(|s| s.id))
            .await
    }

    async fn end_session(&self, session_id: i64) -> CoreResult<()> {
        self.with_conn(move |conn| StayRepo::end_session(conn, session_id))
            .await
    }

    async fn add_traffic(&self, stay_id: i64, delta_in: i64, delta_out: i64) -> CoreResult<()> {
        self.with_conn(move |conn| StayRepo::add_traffic(conn, stay_id, delta_in, delta_out))
            .await
    }

    async fn attach_recording(&self, stay_id: i64, path: String) -> CoreResult<()> {
        self.with_conn(move |conn| StayRepo::attach_recording(conn, stay_id, &path))
            .await
    }
}
