//! Append-only audit rows and their query surface.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use ipnetwork::IpNetwork;

use crate::error::StoreResult;
use crate::models::{AuditEvent, NewAuditEvent};
use crate::schema::audit_events;

/// Filters for reading the audit trail.
#[derive(Debug, Default, Clone)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub source_ip: Option<IpNetwork>,
    pub backend_id: Option<i32>,
    pub actor: Option<String>,
    pub limit: i64,
}

pub struct AuditRepo;

impl AuditRepo {
    /// Append one row. Callers that need the row in the same transaction as
    /// the write it describes pass the transaction's connection.
    pub fn append(conn: &mut PgConnection, event: NewAuditEvent) -> StoreResult<i64> {
        let id = diesel::insert_into(audit_events::table)
            .values(&event)
            .returning(audit_events::id)
            .get_result::<i64>(conn)?;
        Ok(id)
    }

    pub fn query(conn: &mut PgConnection, q: &AuditQuery) -> StoreResult<Vec<AuditEvent>> {
        let mut query = audit_events::table
            .order(audit_events::at.desc())
            .into_boxed();
        if let Some(from) = q.from {
            query = query.filter(audit_events::at.ge(from));
        }
        if let Some(to) = q.to {
            query = query.filter(audit_events::at.lt(to));
        }
        if let Some(ip) = q.source_ip {
            query = query.filter(audit_events::source_ip.eq(ip));
        }
        if let Some(backend) = q.backend_id {
            query = query.filter(audit_events::backend_id.eq(backend));
        }
        if let Some(actor) = &q.actor {
            query = query.filter(audit_events::actor.eq(actor.clone()));
        }
        let limit = if q.limit > 0 { q.limit } else { 200 };
        Ok(query.limit(limit).load::<AuditEvent>(conn)?)
    }
}
