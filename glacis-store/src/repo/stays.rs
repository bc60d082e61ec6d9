//! Stay and session lifecycle writes.

use chrono::Utc;
use diesel::prelude::*;
use ipnetwork::IpNetwork;

use crate::error::{StoreError, StoreResult};
use crate::models::{NewStay, NewStaySession, Stay, StaySession, TerminationReason};
use crate::schema::{stay_sessions, stays};

pub struct StayRepo;

impl StayRepo {
    pub fn open(conn: &mut PgConnection, new: NewStay) -> StoreResult<Stay> {
        let stay = diesel::insert_into(stays::table)
            .values(&new)
            .get_result::<Stay>(conn)?;
        Ok(stay)
    }

    /// Close a stay. Idempotent: returns `false` if it was already closed.
    pub fn close(
        conn: &mut PgConnection,
        stay_id: i64,
        reason: TerminationReason,
        recording_bytes: i64,
    ) -> StoreResult<bool> {
        let updated = diesel::update(
            stays::table
                .filter(stays::id.eq(stay_id))
                .filter(stays::ends_at.is_null()),
        )
        .set((
            stays::ends_at.eq(Utc::now()),
            stays::termination_reason.eq(reason),
            stays::recording_bytes.eq(recording_bytes),
        ))
        .execute(conn)?;
        Ok(updated > 0)
    }

    /// Fold periodic byte-counter deltas into the stay row.
    pub fn add_traffic(
        conn: &mut PgConnection,
        stay_id: i64,
        delta_in: i64,
        delta_out: i64,
    ) -> StoreResult<()> {
        diesel::update(stays::table.find(stay_id))
            .set((
                stays::bytes_in.eq(stays::bytes_in + delta_in),
                stays::bytes_out.eq(stays::bytes_out + delta_out),
            ))
            .execute(conn)?;
        Ok(())
    }

    /// Attach the recording file path once the first byte is written.
    pub fn attach_recording(conn: &mut PgConnection, stay_id: i64, path: &str) -> StoreResult<()> {
        diesel::update(stays::table.find(stay_id))
            .set(stays::recording_path.eq(path))
            .execute(conn)?;
        Ok(())
    }

    pub fn get(conn: &mut PgConnection, stay_id: i64) -> StoreResult<Stay> {
        stays::table
            .find(stay_id)
            .first::<Stay>(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "stay",
                id: stay_id.to_string(),
            })
    }

    pub fn active(conn: &mut PgConnection) -> StoreResult<Vec<Stay>> {
        Ok(stays::table
            .filter(stays::ends_at.is_null())
            .order(stays::started_at.asc())
            .load::<Stay>(conn)?)
    }

    pub fn list(conn: &mut PgConnection, active_only: bool) -> StoreResult<Vec<Stay>> {
        let mut query = stays::table.order(stays::started_at.desc()).into_boxed();
        if active_only {
            query = query.filter(stays::ends_at.is_null());
        }
        Ok(query.load::<Stay>(conn)?)
    }

    pub fn active_count_on_proxy_ip(
        conn: &mut PgConnection,
        proxy_ip: IpNetwork,
    ) -> StoreResult<i64> {
        Ok(stays::table
            .filter(stays::proxy_ip.eq(proxy_ip))
            .filter(stays::ends_at.is_null())
            .count()
            .get_result(conn)?)
    }

    /// Close every stay left open by a previous process. Run once at boot,
    /// before listeners start: a restart must find no stay active that
    /// predates it.
    pub fn close_stranded(conn: &mut PgConnection) -> StoreResult<usize> {
        let now = Utc::now();
        let updated = diesel::update(stays::table.filter(stays::ends_at.is_null()))
            .set((
                stays::ends_at.eq(now),
                stays::termination_reason.eq(TerminationReason::Error),
            ))
            .execute(conn)?;
        diesel::update(
            stay_sessions::table.filter(stay_sessions::ended_at.is_null()),
        )
        .set(stay_sessions::ended_at.eq(now))
        .execute(conn)?;
        Ok(updated)
    }

    pub fn add_session(conn: &mut PgConnection, new: NewStaySession) -> StoreResult<StaySession> {
        let session = diesel::insert_into(stay_sessions::table)
            .values(&new)
            .get_result::<StaySession>(conn)?;
        Ok(session)
    }

    pub fn end_session(conn: &mut PgConnection, session_id: i64) -> StoreResult<()> {
        diesel::update(
            stay_sessions::table
                .filter(stay_sessions::id.eq(session_id))
                .filter(stay_sessions::ended_at.is_null()),
        )
        .set(stay_sessions::ended_at.eq(Utc::now()))
        .execute(conn)?;
        Ok(())
    }
}
