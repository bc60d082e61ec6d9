//! Operations CLI: the six verbs and their store-side implementations.

use std::net::IpAddr;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use glacis_core::{CoreError, Store};
use glacis_store::models::{NewPolicy, Protocol, ScopeKind, SubjectKind};
use glacis_store::repo::directory::GroupTree;
use glacis_store::repo::{AllocationRepo, DirectoryRepo, PolicyRepo, StayRepo};
use glacis_store::StoreError;
use ipnetwork::IpNetwork;

use crate::duration::parse_duration;

#[derive(Debug, Parser)]
#[command(name = "glacis", version, about = "Policy-enforcing SSH/RDP gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway: listeners, expiry ticker, transcode workers.
    Serve,
    /// Bind a proxy IP to a backend.
    Bind {
        proxy_ip: IpAddr,
        /// Backend name as registered in the store.
        backend: String,
    },
    /// Release a proxy IP binding.
    Unbind { proxy_ip: IpAddr },
    /// Create an access policy.
    Grant(GrantArgs),
    /// Revoke a policy; live stays under it terminate within seconds.
    Revoke { policy_id: i32 },
    /// List stays.
    Stays {
        /// Only stays that are still open.
        #[arg(long)]
        active: bool,
    },
}

#[derive(Debug, Args)]
pub struct GrantArgs {
    /// Person handle the grant is for.
    #[arg(long, conflicts_with = "user_group")]
    pub person: Option<String>,
    /// User group name the grant is for.
    #[arg(long)]
    pub user_group: Option<String>,
    /// Single backend scope.
    #[arg(long, conflicts_with = "server_group")]
    pub server: Option<String>,
    /// Server group scope.
    #[arg(long)]
    pub server_group: Option<String>,
    /// ssh, rdp or any (default any).
    #[arg(long, default_value = "any")]
    pub protocol: String,
    /// Permitted backend login; repeatable. None means any login.
    #[arg(long = "login")]
    pub logins: Vec<String>,
    /// Validity span from now (30m, 8h, 1.5d, 1h30m); omit or
    /// "permanent" for open-ended.
    #[arg(long)]
    pub duration: Option<String>,
    #[arg(long)]
    pub allow_port_forwarding: bool,
    /// Recorded as the grantor in the policy and audit rows.
    #[arg(long)]
    pub created_by: Option<String>,
}

/// Argument combinations clap's own rules cannot express.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);

/// Map an error chain onto the documented exit codes: 2 usage,
/// 3 policy violation, 4 not found, 5 conflict, 1 other.
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<UsageError>().is_some() {
        return 2;
    }
    let store_error = error.downcast_ref::<StoreError>().or_else(|| {
        match error.downcast_ref::<CoreError>() {
            Some(CoreError::Store(inner)) => Some(inner),
            _ => None,
        }
    });
    match store_error {
        Some(StoreError::Constraint(_)) => 3,
        Some(StoreError::NotFound { .. }) => 4,
        Some(StoreError::Conflict(_)) => 5,
        _ => 1,
    }
}

pub async fn bind(store: &Store, proxy_ip: IpAddr, backend: String) -> Result<()> {
    let net = IpNetwork::from(proxy_ip);
    let allocation = store
        .with_conn(move |conn| {
            let backend = DirectoryRepo::backend_by_name(conn, &backend)?;
            AllocationRepo::bind(conn, net, backend.id, operator())
        })
        .await?;
    println!("bound {} -> backend {}", proxy_ip, allocation.backend_id);
    Ok(())
}

pub async fn unbind(store: &Store, proxy_ip: IpAddr) -> Result<()> {
    let net = IpNetwork::from(proxy_ip);
    store
        .with_conn(move |conn| AllocationRepo::release(conn, net, operator()))
        .await?;
    println!("released {proxy_ip}");
    Ok(())
}

pub async fn grant(store: &Store, args: GrantArgs) -> Result<()> {
    let protocol = match args.protocol.as_str() {
        "any" => None,
        other => Some(
            Protocol::try_parse(other)
                .with_context(|| format!("unknown protocol {other}"))?,
        ),
    };
    let span = match &args.duration {
        Some(text) => parse_duration(text).map_err(anyhow::Error::msg)?,
        None => None,
    };
    let starts_at = Utc::now();
    let ends_at = span.map(|d| starts_at + d);

    let new = store
        .with_conn(move |conn| {
            let (subject_kind, subject_id) = match (&args.person, &args.user_group) {
                (Some(handle), None) => (
                    SubjectKind::Person,
                    DirectoryRepo::person_by_handle(conn, handle)?.id,
                ),
                (None, Some(name)) => (
                    SubjectKind::UserGroup,
                    group_by_name(conn, GroupTree::Users, name)?,
                ),
                _ => {
                    return Err(StoreError::Constraint(
                        "exactly one of --person or --user-group is required".to_string(),
                    ));
                }
            };
            let (scope_kind, scope_id) = match (&args.server, &args.server_group) {
                (Some(name), None) => {
                    let backend = DirectoryRepo::backend_by_name(conn, name)?;
                    let kind = if protocol.is_some() {
                        ScopeKind::Service
                    } else {
                        ScopeKind::Server
                    };
                    (kind, backend.id)
                }
                (None, Some(name)) => (
                    ScopeKind::ServerGroup,
                    group_by_name(conn, GroupTree::Servers, name)?,
                ),
                _ => {
                    return Err(StoreError::Constraint(
                        "exactly one of --server or --server-group is required".to_string(),
                    ));
                }
            };

            PolicyRepo::create(
                conn,
                NewPolicy {
                    subject_kind,
                    subject_id,
                    scope_kind,
                    scope_id,
                    protocol,
                    ssh_logins: args.logins.clone(),
                    source_ip_id: None,
                    allow_port_forwarding: args.allow_port_forwarding,
                    starts_at,
                    ends_at,
                    schedule: None,
                    active: true,
                    created_by: args.created_by.clone().or_else(operator),
                },
                operator(),
            )
        })
        .await?;

    match new.ends_at {
        Some(deadline) => println!("policy {} granted, valid until {}", new.id, deadline),
        None => println!("policy {} granted, open-ended", new.id),
    }
    Ok(())
}

pub async fn revoke(store: &Store, policy_id: i32) -> Result<()> {
    store
        .with_conn(move |conn| PolicyRepo::revoke(conn, policy_id, operator()))
        .await?;
    println!("policy {policy_id} revoked");
    Ok(())
}

pub async fn stays(store: &Store, active_only: bool) -> Result<()> {
    let stays = store
        .with_conn(move |conn| StayRepo::list(conn, active_only))
        .await?;
    if stays.is_empty() {
        println!("no stays");
        return Ok(());
    }
    for stay in stays {
        let state = match (&stay.ends_at, &stay.termination_reason) {
            (None, _) => "active".to_string(),
            (Some(end), Some(reason)) => format!("closed {} ({})", end, reason.as_str()),
            (Some(end), None) => format!("closed {end}"),
        };
        println!(
            "{:>6}  {}  {} -> {}  in={} out={}  {}",
            stay.id,
            stay.protocol,
            stay.source_ip.ip(),
            stay.proxy_ip.ip(),
            stay.bytes_in,
            stay.bytes_out,
            state
        );
    }
    Ok(())
}

fn operator() -> Option<String> {
    std::env::var("USER").ok()
}

fn group_by_name(
    conn: &mut diesel::PgConnection,
    tree: GroupTree,
    name: &str,
) -> Result<i32, StoreError> {
    DirectoryRepo::group_nodes(conn, tree)?
        .into_iter()
        .find(|node| node.name == name)
        .map(|node| node.id)
        .ok_or_else(|| StoreError::NotFound {
            entity: "group",
            id: name.to_string(),
        })
}

/// Grant arguments must name a subject and a scope before touching the
/// store.
pub fn validate_grant_args(args: &GrantArgs) -> Result<()> {
    if args.person.is_none() && args.user_group.is_none() {
        return Err(UsageError("grant requires --person or --user-group".to_string()).into());
    }
    if args.server.is_none() && args.server_group.is_none() {
        return Err(UsageError("grant requires --server or --server-group".to_string()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_not_found() {
        let err = anyhow::Error::new(StoreError::NotFound {
            entity: "backend",
            id: "db-9".to_string(),
        });
        assert_eq!(exit_code_for(&err), 4);
    }

    #[test]
    fn test_exit_code_conflict() {
        let err = anyhow::Error::new(StoreError::Conflict("already bound".to_string()));
        assert_eq!(exit_code_for(&err), 5);
    }

    #[test]
    fn test_exit_code_constraint() {
        let err = anyhow::Error::new(StoreError::Constraint("cycle".to_string()));
        assert_eq!(exit_code_for(&err), 3);
    }

    #[test]
    fn test_exit_code_wrapped_in_core() {
        let err = anyhow::Error::new(CoreError::Store(StoreError::Conflict("x".to_string())));
        assert_eq!(exit_code_for(&err), 5);
    }

    #[test]
    fn test_exit_code_other() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn test_exit_code_usage() {
        let err = anyhow::Error::new(UsageError("missing --person".to_string()));
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_cli_parses_bind() {
        let cli = Cli::try_parse_from(["glacis", "bind", "10.0.160.129", "db-01"]).expect("parse");
        match cli.command {
            Command::Bind { proxy_ip, backend } => {
                assert_eq!(proxy_ip.to_string(), "10.0.160.129");
                assert_eq!(backend, "db-01");
            }
            _ => panic!("expected bind"),
        }
    }

    #[test]
    fn test_cli_parses_grant() {
        let cli = Cli::try_parse_from([
            "glacis", "grant", "--person", "alice", "--server", "db-01", "--protocol", "ssh",
            "--login", "postgres", "--duration", "8h",
        ])
        .expect("parse");
        match cli.command {
            Command::Grant(args) => {
                assert_eq!(args.person.as_deref(), Some("alice"));
                assert_eq!(args.logins, vec!["postgres".to_string()]);
                assert!(!args.allow_port_forwarding);
            }
            _ => panic!("expected grant"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_verb() {
        assert!(Cli::try_parse_from(["glacis", "frobnicate"]).is_err());
    }

    #[test]
    fn test_validate_grant_args() {
        let cli = Cli::try_parse_from(["glacis", "grant", "--person", "alice"]).expect("parse");
        match cli.command {
            Command::Grant(args) => assert!(validate_grant_args(&args).is_err()),
            _ => panic!("expected grant"),
        }
    }

    #[test]
    fn test_stays_flag() {
        let cli = Cli::try_parse_from(["glacis", "stays", "--active"]).expect("parse");
        match cli.command {
            Command::Stays { active } => assert!(active),
            _ => panic!("expected stays"),
        }
    }
}
