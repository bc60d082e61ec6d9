//! Stays and the sessions (TCP connections) inside them.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::models::enums::{Protocol, SessionKind, TerminationReason};
use crate::schema::{stay_sessions, stays};

/// The authoritative record of one person inside one backend under one
/// policy, possibly spanning multiple TCP connections.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = stays)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Stay {
    pub id: i64,
    pub person_id: i32,
    pub policy_id: i32,
    pub backend_id: i32,
    pub protocol: Protocol,
    pub source_ip: IpNetwork,
    pub proxy_ip: IpNetwork,
    pub ssh_login: Option<String>,
    pub agent_used: bool,
    pub started_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
    pub recording_path: Option<String>,
    pub recording_bytes: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

impl Stay {
    pub fn is_active(&self) -> bool {
        self.ends_at.is_none()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = stays)]
pub struct NewStay {
    pub person_id: i32,
    pub policy_id: i32,
    pub backend_id: i32,
    pub protocol: Protocol,
    pub source_ip: IpNetwork,
    pub proxy_ip: IpNetwork,
    pub ssh_login: Option<String>,
    pub agent_used: bool,
}

/// One TCP connection (SSH channel or RDP sub-connection) within a stay.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations, Serialize)]
#[diesel(table_name = stay_sessions)]
#[diesel(belongs_to(Stay, foreign_key = stay_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StaySession {
    pub id: i64,
    pub stay_id: i64,
    pub kind: SessionKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = stay_sessions)]
pub struct NewStaySession {
    pub stay_id: i64,
    pub kind: SessionKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stay(ends_at: Option<DateTime<Utc>>) -> Stay {
        Stay {
            id: 1,
            person_id: 1,
            policy_id: 1,
            backend_id: 1,
            protocol: Protocol::Ssh,
            source_ip: "100.64.0.20/32".parse().unwrap(),
            proxy_ip: "10.0.160.129/32".parse().unwrap(),
            ssh_login: Some("postgres".to_string()),
            agent_used: false,
            started_at: Utc::now(),
            ends_at,
            termination_reason: None,
            recording_path: None,
            recording_bytes: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    #[test]
    fn test_stay_active() {
        assert!(stay(None).is_active());
        assert!(!stay(Some(Utc::now())).is_active());
    }
}
