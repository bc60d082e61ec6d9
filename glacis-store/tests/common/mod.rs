//! Test infrastructure for the store integration suite.
//!
//! These tests run against a real PostgreSQL instance named by
//! `DATABASE_URL` (a scratch database; every table is wiped between
//! tests). They are `#[ignore]`d by default:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/glacis_test cargo test -p glacis-store -- --ignored
//! ```

use std::sync::OnceLock;

use diesel::prelude::*;
use diesel::sql_query;
use glacis_store::db::{create_pool_sized, DbConnection, DbPool};
use secrecy::SecretString;

/// Test store wrapper.
pub struct TestStore {
    pub pool: DbPool,
}

/// Global test store instance (lazy initialization).
static TEST_STORE: OnceLock<TestStore> = OnceLock::new();

impl TestStore {
    /// Connect to the scratch database and make sure the schema exists.
    pub fn spawn() -> &'static TestStore {
        TEST_STORE.get_or_init(Self::create)
    }

    fn create() -> Self {
        let url = std::env::var("DATABASE_URL").expect(
            "DATABASE_URL must point at a scratch PostgreSQL database \
             (these tests run with `cargo test -- --ignored`)",
        );
        let pool =
            create_pool_sized(&SecretString::from(url), 2).expect("failed to create test pool");
        let mut conn = pool.get().expect("failed to get test connection");
        test_db::ensure_schema(&mut conn);
        Self { pool }
    }

    /// Get a database connection.
    pub fn conn(&self) -> DbConnection {
        self.pool.get().expect("failed to get DB connection")
    }
}

/// Test database utilities.
pub mod test_db {
    use super::*;

    /// Create every table the store expects. Schema provisioning is the
    /// control plane's job in production; the test database is scratch,
    /// so the suite carries its own DDL.
    pub fn ensure_schema(conn: &mut diesel::PgConnection) {
        let statements = [
            "CREATE TABLE IF NOT EXISTS persons (
                id SERIAL PRIMARY KEY,
                handle VARCHAR(255) NOT NULL,
                display_name VARCHAR(255) NOT NULL,
                email VARCHAR(255),
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS source_ips (
                id SERIAL PRIMARY KEY,
                person_id INTEGER NOT NULL,
                cidr INET NOT NULL,
                label VARCHAR(255),
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS backends (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                address VARCHAR(255) NOT NULL,
                ssh_port INTEGER NOT NULL DEFAULT 22,
                rdp_port INTEGER NOT NULL DEFAULT 3389,
                ssh_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                rdp_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS allocations (
                id SERIAL PRIMARY KEY,
                proxy_ip INET NOT NULL,
                backend_id INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                released_at TIMESTAMPTZ
            )",
            "CREATE TABLE IF NOT EXISTS server_groups (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                parent_id INTEGER,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS server_group_members (
                id SERIAL PRIMARY KEY,
                group_id INTEGER NOT NULL,
                backend_id INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS user_groups (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                parent_id INTEGER,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS user_group_members (
                id SERIAL PRIMARY KEY,
                group_id INTEGER NOT NULL,
                person_id INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS policies (
                id SERIAL PRIMARY KEY,
                subject_kind VARCHAR(20) NOT NULL,
                subject_id INTEGER NOT NULL,
                scope_kind VARCHAR(20) NOT NULL,
                scope_id INTEGER NOT NULL,
                protocol VARCHAR(10),
                ssh_logins TEXT[] NOT NULL DEFAULT '{}',
                source_ip_id INTEGER,
                allow_port_forwarding BOOLEAN NOT NULL DEFAULT FALSE,
                starts_at TIMESTAMPTZ NOT NULL,
                ends_at TIMESTAMPTZ,
                schedule JSONB,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                created_by VARCHAR(255)
            )",
            "CREATE TABLE IF NOT EXISTS stays (
                id BIGSERIAL PRIMARY KEY,
                person_id INTEGER NOT NULL,
                policy_id INTEGER NOT NULL,
                backend_id INTEGER NOT NULL,
                protocol VARCHAR(10) NOT NULL,
                source_ip INET NOT NULL,
                proxy_ip INET NOT NULL,
                ssh_login VARCHAR(255),
                agent_used BOOLEAN NOT NULL DEFAULT FALSE,
                started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                ends_at TIMESTAMPTZ,
                termination_reason VARCHAR(32),
                recording_path VARCHAR(512),
                recording_bytes BIGINT NOT NULL DEFAULT 0,
                bytes_in BIGINT NOT NULL DEFAULT 0,
                bytes_out BIGINT NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS stay_sessions (
                id BIGSERIAL PRIMARY KEY,
                stay_id BIGINT NOT NULL,
                kind VARCHAR(20) NOT NULL,
                started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                ended_at TIMESTAMPTZ
            )",
            "CREATE TABLE IF NOT EXISTS audit_events (
                id BIGSERIAL PRIMARY KEY,
                at TIMESTAMPTZ NOT NULL DEFAULT now(),
                actor VARCHAR(255),
                kind VARCHAR(64) NOT NULL,
                source_ip INET,
                backend_id INTEGER,
                protocol VARCHAR(10),
                admitted BOOLEAN NOT NULL,
                reason VARCHAR(64) NOT NULL,
                detail TEXT
            )",
            "CREATE TABLE IF NOT EXISTS transcode_jobs (
                id SERIAL PRIMARY KEY,
                stay_id BIGINT NOT NULL,
                status VARCHAR(16) NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                progress INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                eta_seconds INTEGER,
                output_path VARCHAR(512),
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ
            )",
        ];
        for statement in statements {
            sql_query(statement)
                .execute(conn)
                .unwrap_or_else(|e| panic!("schema setup failed: {e}"));
        }
    }

    /// Wipe every table (run before each test; the suite is serial).
    pub fn cleanup(conn: &mut diesel::PgConnection) {
        for table in [
            "stay_sessions",
            "transcode_jobs",
            "stays",
            "policies",
            "allocations",
            "source_ips",
            "user_group_members",
            "user_groups",
            "server_group_members",
            "server_groups",
            "backends",
            "persons",
            "audit_events",
        ] {
            sql_query(format!("DELETE FROM {table}")).execute(conn).ok();
        }
    }
}

/// Row builders for the entities most tests need.
pub mod fixtures {
    use chrono::Utc;
    use diesel::PgConnection;
    use glacis_store::models::{
        Backend, NewBackend, NewPerson, NewPolicy, NewStay, Person, Policy, Protocol, ScopeKind,
        Stay, SubjectKind,
    };
    use glacis_store::repo::{DirectoryRepo, PolicyRepo, StayRepo};

    pub fn person(conn: &mut PgConnection, handle: &str) -> Person {
        DirectoryRepo::create_person(
            conn,
            NewPerson {
                handle: handle.to_string(),
                display_name: handle.to_string(),
                email: None,
                active: true,
            },
        )
        .expect("create person")
    }

    pub fn backend(conn: &mut PgConnection, name: &str) -> Backend {
        DirectoryRepo::create_backend(
            conn,
            NewBackend {
                name: name.to_string(),
                address: "192.168.10.5".to_string(),
                ssh_port: 22,
                rdp_port: 3389,
                ssh_enabled: true,
                rdp_enabled: true,
                active: true,
            },
        )
        .expect("create backend")
    }

    pub fn policy(conn: &mut PgConnection, person_id: i32, backend_id: i32) -> Policy {
        PolicyRepo::create(
            conn,
            NewPolicy {
                subject_kind: SubjectKind::Person,
                subject_id: person_id,
                scope_kind: ScopeKind::Server,
                scope_id: backend_id,
                protocol: Some(Protocol::Ssh),
                ssh_logins: vec![],
                source_ip_id: None,
                allow_port_forwarding: false,
                starts_at: Utc::now(),
                ends_at: None,
                schedule: None,
                active: true,
                created_by: Some("tests".to_string()),
            },
            Some("tests".to_string()),
        )
        .expect("create policy")
    }

    pub fn stay(
        conn: &mut PgConnection,
        person_id: i32,
        policy_id: i32,
        backend_id: i32,
        proxy_ip: &str,
    ) -> Stay {
        StayRepo::open(
            conn,
            NewStay {
                person_id,
                policy_id,
                backend_id,
                protocol: Protocol::Ssh,
                source_ip: "100.64.0.20/32".parse().expect("cidr"),
                proxy_ip: proxy_ip.parse().expect("cidr"),
                ssh_login: Some("postgres".to_string()),
                agent_used: false,
            },
        )
        .expect("open stay")
    }
}
