//! Policy writes and the engine's policy reads.

use diesel::prelude::*;

use crate::error::{StoreError, StoreResult};
use crate::models::{NewAuditEvent, NewPolicy, Policy};
use crate::repo::audit::AuditRepo;
use crate::schema::policies;

pub struct PolicyRepo;

impl PolicyRepo {
    /// Create a policy; evaluable immediately. The audit row commits in the
    /// same transaction.
    pub fn create(
        conn: &mut PgConnection,
        new: NewPolicy,
        actor: Option<String>,
    ) -> StoreResult<Policy> {
        if let Some(ends_at) = new.ends_at {
            if ends_at <= new.starts_at {
                return Err(StoreError::Constraint(
                    "policy ends_at must be after starts_at".to_string(),
                ));
            }
        }

        conn.transaction::<_, StoreError, _>(|conn| {
            let policy = diesel::insert_into(policies::table)
                .values(&new)
                .get_result::<Policy>(conn)?;

            AuditRepo::append(
                conn,
                NewAuditEvent::control(
                    actor,
                    "policy_created",
                    "granted",
                    Some(format!(
                        "policy {} {}:{} -> {}:{}",
                        policy.id,
                        policy.subject_kind.as_str(),
                        policy.subject_id,
                        policy.scope_kind.as_str(),
                        policy.scope_id
                    )),
                ),
            )?;
            Ok(policy)
        })
    }

    /// Deactivate a policy. The expiry ticker picks the change up and tears
    /// down any stay admitted under it.
    pub fn revoke(conn: &mut PgConnection, policy_id: i32, actor: Option<String>) -> StoreResult<()> {
        conn.transaction::<_, StoreError, _>(|conn| {
            let updated = diesel::update(
                policies::table
                    .filter(policies::id.eq(policy_id))
                    .filter(policies::active.eq(true)),
            )
            .set(policies::active.eq(false))
            .execute(conn)?;

            if updated == 0 {
                return Err(StoreError::NotFound {
                    entity: "policy",
                    id: policy_id.to_string(),
                });
            }

            AuditRepo::append(
                conn,
                NewAuditEvent::control(actor, "policy_revoked", "revoked", Some(policy_id.to_string())),
            )?;
            Ok(())
        })
    }

    pub fn get(conn: &mut PgConnection, policy_id: i32) -> StoreResult<Policy> {
        policies::table
            .find(policy_id)
            .first::<Policy>(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "policy",
                id: policy_id.to_string(),
            })
    }

    /// Active policies in deterministic evaluation order:
    /// open-ended policies first, then by creation time.
    pub fn active_ordered(conn: &mut PgConnection) -> StoreResult<Vec<Policy>> {
        Ok(policies::table
            .filter(policies::active.eq(true))
            .order((policies::ends_at.is_null().desc(), policies::created_at.asc()))
            .load::<Policy>(conn)?)
    }
}
