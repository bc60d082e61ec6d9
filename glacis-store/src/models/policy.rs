//! Access policies and their optional weekly schedule.

use chrono::{DateTime, NaiveTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::models::enums::{Protocol, ScopeKind, SubjectKind};
use crate::schema::policies;

/// Weekly recurrence window gating a policy, evaluated in its own time zone.
///
/// Empty vectors mean "no restriction on that axis". A `time_start` later
/// than `time_end` describes a window that wraps past midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Weekdays the window applies to, 0 = Monday .. 6 = Sunday.
    #[serde(default)]
    pub weekdays: Vec<u8>,
    pub time_start: Option<NaiveTime>,
    pub time_end: Option<NaiveTime>,
    /// Months (1-12) the window applies to.
    #[serde(default)]
    pub months: Vec<u32>,
    /// Days of month (1-31) the window applies to.
    #[serde(default)]
    pub days_of_month: Vec<u32>,
    /// IANA time zone name, e.g. "Europe/Warsaw".
    pub timezone: String,
}

/// A grant of access from a subject (person or user group) to a scope
/// (server group, server, or a single service).
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = policies)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Policy {
    pub id: i32,
    pub subject_kind: SubjectKind,
    pub subject_id: i32,
    pub scope_kind: ScopeKind,
    pub scope_id: i32,
    pub protocol: Option<Protocol>,
    pub ssh_logins: Vec<String>,
    pub source_ip_id: Option<i32>,
    pub allow_port_forwarding: bool,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub schedule: Option<serde_json::Value>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl Policy {
    /// Parse the stored schedule, if any. A malformed schedule is a
    /// constraint error, not an open window.
    pub fn parsed_schedule(&self) -> StoreResult<Option<Schedule>> {
        match &self.schedule {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    StoreError::Constraint(format!("policy {} has malformed schedule: {e}", self.id))
                }),
        }
    }

    /// Whether `now` lies inside `[starts_at, ends_at)`.
    pub fn in_validity_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at && self.ends_at.map_or(true, |end| now < end)
    }

    /// Whether a backend login is permitted. An empty list means any login
    /// the backend itself accepts.
    pub fn admits_login(&self, login: &str) -> bool {
        self.ssh_logins.is_empty() || self.ssh_logins.iter().any(|l| l == login)
    }

    /// Whether the policy covers the given protocol.
    pub fn admits_protocol(&self, protocol: Protocol) -> bool {
        self.protocol.map_or(true, |p| p == protocol)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = policies)]
pub struct NewPolicy {
    pub subject_kind: SubjectKind,
    pub subject_id: i32,
    pub scope_kind: ScopeKind,
    pub scope_id: i32,
    pub protocol: Option<Protocol>,
    pub ssh_logins: Vec<String>,
    pub source_ip_id: Option<i32>,
    pub allow_port_forwarding: bool,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub schedule: Option<serde_json::Value>,
    pub active: bool,
    pub created_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy(starts: DateTime<Utc>, ends: Option<DateTime<Utc>>) -> Policy {
        Policy {
            id: 1,
            subject_kind: SubjectKind::Person,
            subject_id: 10,
            scope_kind: ScopeKind::Server,
            scope_id: 20,
            protocol: Some(Protocol::Ssh),
            ssh_logins: vec![],
            source_ip_id: None,
            allow_port_forwarding: false,
            starts_at: starts,
            ends_at: ends,
            schedule: None,
            active: true,
            created_at: starts,
            created_by: None,
        }
    }

    #[test]
    fn test_validity_window_open_ended() {
        let now = Utc::now();
        let p = policy(now - Duration::hours(1), None);
        assert!(p.in_validity_window(now));
    }

    #[test]
    fn test_validity_window_expired() {
        let now = Utc::now();
        let p = policy(now - Duration::hours(2), Some(now - Duration::hours(1)));
        assert!(!p.in_validity_window(now));
    }

    #[test]
    fn test_validity_window_end_exclusive() {
        let now = Utc::now();
        let p = policy(now - Duration::hours(1), Some(now));
        assert!(!p.in_validity_window(now));
    }

    #[test]
    fn test_validity_window_not_started() {
        let now = Utc::now();
        let p = policy(now + Duration::minutes(5), None);
        assert!(!p.in_validity_window(now));
    }

    #[test]
    fn test_admits_any_login_when_empty() {
        let p = policy(Utc::now(), None);
        assert!(p.admits_login("root"));
        assert!(p.admits_login("postgres"));
    }

    #[test]
    fn test_admits_login_filtered() {
        let mut p = policy(Utc::now(), None);
        p.ssh_logins = vec!["postgres".to_string()];
        assert!(p.admits_login("postgres"));
        assert!(!p.admits_login("root"));
    }

    #[test]
    fn test_admits_protocol() {
        let mut p = policy(Utc::now(), None);
        assert!(p.admits_protocol(Protocol::Ssh));
        assert!(!p.admits_protocol(Protocol::Rdp));
        p.protocol = None;
        assert!(p.admits_protocol(Protocol::Rdp));
    }

    #[test]
    fn test_parsed_schedule_none() {
        let p = policy(Utc::now(), None);
        assert!(p.parsed_schedule().unwrap().is_none());
    }

    #[test]
    fn test_parsed_schedule_roundtrip() {
        let schedule = Schedule {
            weekdays: vec![0, 1, 2, 3, 4],
            time_start: Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap()),
            time_end: Some(NaiveTime::from_hms_opt(16, 0, 0).unwrap()),
            months: vec![],
            days_of_month: vec![],
            timezone: "Europe/Warsaw".to_string(),
        };
        let mut p = policy(Utc::now(), None);
        p.schedule = Some(serde_json::to_value(&schedule).unwrap());
        assert_eq!(p.parsed_schedule().unwrap(), Some(schedule));
    }

    #[test]
    fn test_parsed_schedule_malformed() {
        let mut p = policy(Utc::now(), None);
        p.schedule = Some(serde_json::json!({"timezone": 42}));
        assert!(p.parsed_schedule().is_err());
    }
}
