//! Persons, source IPs, backends and the two group trees.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::schema::{backends, persons, source_ips};

/// The subject of accountability. Soft-deleted only; a person row is never
/// removed while a stay or policy references it.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = persons)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Person {
    pub id: i32,
    pub handle: String,
    pub display_name: String,
    pub email: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = persons)]
pub struct NewPerson {
    pub handle: String,
    pub display_name: String,
    pub email: Option<String>,
    pub active: bool,
}

/// A source address (or CIDR block) owned by one person. Single addresses
/// are stored as /32 (or /128) networks.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations, Serialize)]
#[diesel(table_name = source_ips)]
#[diesel(belongs_to(Person, foreign_key = person_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SourceIp {
    pub id: i32,
    pub person_id: i32,
    pub cidr: IpNetwork,
    pub label: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = source_ips)]
pub struct NewSourceIp {
    pub person_id: i32,
    pub cidr: IpNetwork,
    pub label: Option<String>,
    pub active: bool,
}

/// The real target host behind a proxy IP.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = backends)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Backend {
    pub id: i32,
    pub name: String,
    pub address: String,
    pub ssh_port: i32,
    pub rdp_port: i32,
    pub ssh_enabled: bool,
    pub rdp_enabled: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Backend {
    /// Whether the backend serves the given protocol at all.
    pub fn supports(&self, protocol: crate::models::Protocol) -> bool {
        match protocol {
            crate::models::Protocol::Ssh => self.ssh_enabled,
            crate::models::Protocol::Rdp => self.rdp_enabled,
        }
    }

    /// Port for the given protocol.
    pub fn port_for(&self, protocol: crate::models::Protocol) -> u16 {
        let port = match protocol {
            crate::models::Protocol::Ssh => self.ssh_port,
            crate::models::Protocol::Rdp => self.rdp_port,
        };
        port as u16
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = backends)]
pub struct NewBackend {
    pub name: String,
    pub address: String,
    pub ssh_port: i32,
    pub rdp_port: i32,
    pub ssh_enabled: bool,
    pub rdp_enabled: bool,
    pub active: bool,
}

/// One node of either group tree. Both trees share the same shape, so the
/// repositories load them into this common record.
#[derive(Debug, Clone, Queryable, Serialize)]
pub struct GroupNode {
    pub id: i32,
    pub name: String,
    pub parent_id: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;

    fn backend(ssh: bool, rdp: bool) -> Backend {
        Backend {
            id: 1,
            name: "db-01".to_string(),
            address: "192.168.10.5".to_string(),
            ssh_port: 22,
            rdp_port: 3389,
            ssh_enabled: ssh,
            rdp_enabled: rdp,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_backend_supports() {
        let b = backend(true, false);
        assert!(b.supports(Protocol::Ssh));
        assert!(!b.supports(Protocol::Rdp));
    }

    #[test]
    fn test_backend_port_for() {
        let b = backend(true, true);
        assert_eq!(b.port_for(Protocol::Ssh), 22);
        assert_eq!(b.port_for(Protocol::Rdp), 3389);
    }
}
