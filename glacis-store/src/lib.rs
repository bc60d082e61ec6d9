//! Relational store for the Glacis gateway.
//!
//! This crate owns the PostgreSQL schema, the record types for every
//! aggregate (persons, backends, allocations, groups, policies, stays,
//! audit, transcode jobs) and a thin repository per aggregate. Lifecycle
//! transitions are repository methods, never implicit hooks; all multi-row
//! writes run inside a single transaction.

pub mod db;
pub mod error;
pub mod models;
pub mod repo;
pub mod schema;

pub use db::{DbConnection, DbPool};
pub use error::{StoreError, StoreResult};
