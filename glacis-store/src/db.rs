//! Database connection pool setup.
//!
//! Diesel with r2d2 pooling against PostgreSQL. The pool is created once at
//! startup and every connection is validated before the gateway starts
//! accepting traffic; a broken `DB_URL` is a fatal configuration error.

use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Database connection pool type.
pub type DbPool = Pool<ConnectionManager<PgConnection>>;
/// A single pooled connection.
pub type DbConnection = PooledConnection<ConnectionManager<PgConnection>>;

const DEFAULT_POOL_SIZE: u32 = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create the connection pool and validate one connection.
pub fn create_pool(db_url: &SecretString) -> StoreResult<DbPool> {
    create_pool_sized(db_url, DEFAULT_POOL_SIZE)
}

/// Create a pool with an explicit size (used by tests and the CLI verbs,
/// which only ever need one connection).
pub fn create_pool_sized(db_url: &SecretString, size: u32) -> StoreResult<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(db_url.expose_secret());

    let pool = Pool::builder()
        .max_size(size)
        .connection_timeout(CONNECT_TIMEOUT)
        .build(manager)
        .map_err(|e| StoreError::Pool(format!("failed to create database pool: {e}")))?;

    // Borrow one connection so a bad URL fails at startup, not at first use.
    let _conn = pool
        .get()
        .map_err(|e| StoreError::Pool(format!("failed to establish database connection: {e}")))?;

    tracing::info!(pool_size = size, "database pool initialized");
    Ok(pool)
}

/// Get a connection from the pool.
pub fn get_conn(pool: &DbPool) -> StoreResult<DbConnection> {
    pool.get()
        .map_err(|e| StoreError::Pool(format!("failed to get connection: {e}")))
}
