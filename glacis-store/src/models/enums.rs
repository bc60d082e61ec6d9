//! String-backed enums shared across the data model.
//!
//! Stored as `Varchar` columns; unknown values never silently map to a
//! default on the read path that matters for policy (see `try_parse`).

use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::Pg;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Varchar;
use serde::{Deserialize, Serialize};

macro_rules! varchar_enum_sql {
    ($ty:ty) => {
        impl ToSql<Varchar, Pg> for $ty {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                <str as ToSql<Varchar, Pg>>::to_sql(self.as_str(), out)
            }
        }

        impl FromSql<Varchar, Pg> for $ty {
            fn from_sql(
                bytes: <Pg as diesel::backend::Backend>::RawValue<'_>,
            ) -> deserialize::Result<Self> {
                let s = <String as FromSql<Varchar, Pg>>::from_sql(bytes)?;
                <$ty>::try_parse(&s)
                    .ok_or_else(|| format!("unknown {} value: {s}", stringify!($ty)).into())
            }
        }
    };
}

/// Wire protocol of a stay or policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[serde(rename_all = "lowercase")]
#[diesel(sql_type = Varchar)]
pub enum Protocol {
    Ssh,
    Rdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Rdp => "rdp",
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "ssh" => Some(Self::Ssh),
            "rdp" => Some(Self::Rdp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a policy grants access to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[serde(rename_all = "snake_case")]
#[diesel(sql_type = Varchar)]
pub enum SubjectKind {
    Person,
    UserGroup,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::UserGroup => "user_group",
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(Self::Person),
            "user_group" => Some(Self::UserGroup),
            _ => None,
        }
    }
}

/// What a policy grants access to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[serde(rename_all = "snake_case")]
#[diesel(sql_type = Varchar)]
pub enum ScopeKind {
    ServerGroup,
    Server,
    /// A single (backend, protocol) pair; the policy's protocol is concrete.
    Service,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerGroup => "server_group",
            Self::Server => "server",
            Self::Service => "service",
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "server_group" => Some(Self::ServerGroup),
            "server" => Some(Self::Server),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

/// Why a stay ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[serde(rename_all = "snake_case")]
#[diesel(sql_type = Varchar)]
pub enum TerminationReason {
    ClientClosed,
    ServerClosed,
    PolicyExpired,
    Revoked,
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ServerClosed => "server_closed",
            Self::PolicyExpired => "policy_expired",
            Self::Revoked => "revoked",
            Self::Error => "error",
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "client_closed" => Some(Self::ClientClosed),
            "server_closed" => Some(Self::ServerClosed),
            "policy_expired" => Some(Self::PolicyExpired),
            "revoked" => Some(Self::Revoked),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One TCP connection (or SSH channel) inside a stay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[serde(rename_all = "snake_case")]
#[diesel(sql_type = Varchar)]
pub enum SessionKind {
    Shell,
    Exec,
    Sftp,
    DirectTcpip,
    ForwardedTcpip,
    Dynamic,
    Rdp,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Exec => "exec",
            Self::Sftp => "sftp",
            Self::DirectTcpip => "direct_tcpip",
            Self::ForwardedTcpip => "forwarded_tcpip",
            Self::Dynamic => "dynamic",
            Self::Rdp => "rdp",
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(Self::Shell),
            "exec" => Some(Self::Exec),
            "sftp" => Some(Self::Sftp),
            "direct_tcpip" => Some(Self::DirectTcpip),
            "forwarded_tcpip" => Some(Self::ForwardedTcpip),
            "dynamic" => Some(Self::Dynamic),
            "rdp" => Some(Self::Rdp),
            _ => None,
        }
    }
}

/// Transcode job lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[serde(rename_all = "lowercase")]
#[diesel(sql_type = Varchar)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

varchar_enum_sql!(Protocol);
varchar_enum_sql!(SubjectKind);
varchar_enum_sql!(ScopeKind);
varchar_enum_sql!(TerminationReason);
varchar_enum_sql!(SessionKind);
varchar_enum_sql!(JobStatus);
