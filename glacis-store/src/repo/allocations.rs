//! Proxy-IP allocation writes. Both mutations audit in the same
//! transaction and enforce the unique-active-allocation invariant.

use diesel::prelude::*;
use ipnetwork::IpNetwork;

use crate::error::{StoreError, StoreResult};
use crate::models::{Allocation, NewAllocation, NewAuditEvent};
use crate::repo::audit::AuditRepo;
use crate::repo::stays::StayRepo;
use crate::schema::allocations;

pub struct AllocationRepo;

impl AllocationRepo {
    /// Bind a proxy IP to a backend. Fails with `Conflict` if the IP
    /// already has an active allocation.
    pub fn bind(
        conn: &mut PgConnection,
        proxy_ip: IpNetwork,
        backend_id: i32,
        actor: Option<String>,
    ) -> StoreResult<Allocation> {
        conn.build_transaction()
            .serializable()
            .run::<_, StoreError, _>(|conn| {
                let active: i64 = allocations::table
                    .filter(allocations::proxy_ip.eq(proxy_ip))
                    .filter(allocations::released_at.is_null())
                    .count()
                    .get_result(conn)?;
                if active > 0 {
                    return Err(StoreError::Conflict(format!(
                        "proxy IP {proxy_ip} already has an active allocation"
                    )));
                }

                let row = diesel::insert_into(allocations::table)
                    .values(&NewAllocation { proxy_ip, backend_id })
                    .get_result::<Allocation>(conn)?;

                AuditRepo::append(
                    conn,
                    NewAuditEvent::control(
                        actor,
                        "allocation_bound",
                        "bound",
                        Some(format!("{proxy_ip} -> backend {backend_id}")),
                    ),
                )?;
                Ok(row)
            })
    }

    /// Release a proxy IP. Refused while any stay is still active on it.
    pub fn release(
        conn: &mut PgConnection,
        proxy_ip: IpNetwork,
        actor: Option<String>,
    ) -> StoreResult<()> {
        conn.build_transaction()
            .serializable()
            .run::<_, StoreError, _>(|conn| {
                let live = StayRepo::active_count_on_proxy_ip(conn, proxy_ip)?;
                if live > 0 {
                    return Err(StoreError::Conflict(format!(
                        "proxy IP {proxy_ip} has {live} active stay(s)"
                    )));
                }

                let released = diesel::update(
                    allocations::table
                        .filter(allocations::proxy_ip.eq(proxy_ip))
                        .filter(allocations::released_at.is_null()),
                )
                .set(allocations::released_at.eq(chrono::Utc::now()))
                .execute(conn)?;

                if released == 0 {
                    return Err(StoreError::NotFound {
                        entity: "allocation",
                        id: proxy_ip.to_string(),
                    });
                }

                AuditRepo::append(
                    conn,
                    NewAuditEvent::control(actor, "allocation_released", "released", Some(proxy_ip.to_string())),
                )?;
                Ok(())
            })
    }

    /// The current routing table: every allocation with `released_at IS NULL`.
    pub fn active(conn: &mut PgConnection) -> StoreResult<Vec<Allocation>> {
        Ok(allocations::table
            .filter(allocations::released_at.is_null())
            .load::<Allocation>(conn)?)
    }

    /// Active allocation for one proxy IP. More than one row is an
    /// invariant violation surfaced to the caller, who must stop the
    /// listener for that IP.
    pub fn active_for_ip(
        conn: &mut PgConnection,
        proxy_ip: IpNetwork,
    ) -> StoreResult<Option<Allocation>> {
        let mut rows = allocations::table
            .filter(allocations::proxy_ip.eq(proxy_ip))
            .filter(allocations::released_at.is_null())
            .load::<Allocation>(conn)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(StoreError::Invariant(format!(
                "{n} active allocations for proxy IP {proxy_ip}"
            ))),
        }
    }
}
