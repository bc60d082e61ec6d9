//! Proxy-IP allocations. The routing table is the set of rows with
//! `released_at IS NULL`; at most one such row may exist per proxy IP.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::schema::allocations;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = allocations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Allocation {
    pub id: i32,
    pub proxy_ip: IpNetwork,
    pub backend_id: i32,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = allocations)]
pub struct NewAllocation {
    pub proxy_ip: IpNetwork,
    pub backend_id: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_active() {
        let alloc = Allocation {
            id: 1,
            proxy_ip: "10.0.160.129/32".parse().unwrap(),
            backend_id: 7,
            created_at: Utc::now(),
            released_at: None,
        };
        assert!(alloc.is_active());
    }

    #[test]
    fn test_allocation_released() {
        let alloc = Allocation {
            id: 1,
            proxy_ip: "10.0.160.129/32".parse().unwrap(),
            backend_id: 7,
            created_at: Utc::now(),
            released_at: Some(Utc::now()),
        };
        assert!(!alloc.is_active());
    }
}
