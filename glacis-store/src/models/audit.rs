//! Append-only audit rows.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::models::enums::Protocol;
use crate::schema::audit_events;

/// One admission decision or lifecycle transition. Rows are never updated
/// or deleted.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = audit_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AuditEvent {
    pub id: i64,
    pub at: DateTime<Utc>,
    pub actor: Option<String>,
    pub kind: String,
    pub source_ip: Option<IpNetwork>,
    pub backend_id: Option<i32>,
    pub protocol: Option<Protocol>,
    pub admitted: bool,
    pub reason: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = audit_events)]
pub struct NewAuditEvent {
    pub actor: Option<String>,
    pub kind: String,
    pub source_ip: Option<IpNetwork>,
    pub backend_id: Option<i32>,
    pub protocol: Option<Protocol>,
    pub admitted: bool,
    pub reason: String,
    pub detail: Option<String>,
}

impl NewAuditEvent {
    /// An admission decision row.
    pub fn admission(
        source_ip: IpNetwork,
        backend_id: Option<i32>,
        protocol: Protocol,
        admitted: bool,
        reason: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            actor: None,
            kind: "admission".to_string(),
            source_ip: Some(source_ip),
            backend_id,
            protocol: Some(protocol),
            admitted,
            reason: reason.into(),
            detail,
        }
    }

    /// A stay lifecycle row.
    pub fn stay_closed(
        source_ip: IpNetwork,
        backend_id: i32,
        protocol: Protocol,
        reason: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            actor: None,
            kind: "stay_closed".to_string(),
            source_ip: Some(source_ip),
            backend_id: Some(backend_id),
            protocol: Some(protocol),
            admitted: true,
            reason: reason.into(),
            detail,
        }
    }

    /// A control-plane change (policy or allocation write).
    pub fn control(
        actor: Option<String>,
        kind: impl Into<String>,
        reason: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            actor,
            kind: kind.into(),
            source_ip: None,
            backend_id: None,
            protocol: None,
            admitted: true,
            reason: reason.into(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_row() {
        let row = NewAuditEvent::admission(
            "100.64.0.20/32".parse().unwrap(),
            Some(3),
            Protocol::Ssh,
            false,
            "login_not_permitted",
            None,
        );
        assert_eq!(row.kind, "admission");
        assert!(!row.admitted);
        assert_eq!(row.reason, "login_not_permitted");
    }

    #[test]
    fn test_control_row() {
        let row = NewAuditEvent::control(Some("ops".to_string()), "policy_revoked", "revoked", None);
        assert_eq!(row.kind, "policy_revoked");
        assert!(row.source_ip.is_none());
    }
}
