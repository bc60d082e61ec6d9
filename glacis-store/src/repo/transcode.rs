//! Transcode job queue. Workers (possibly separate OS processes) coordinate
//! exclusively through this interface: claim, heartbeat, complete, fail.

use chrono::Utc;
use diesel::prelude::*;

use crate::error::{StoreError, StoreResult};
use crate::models::{JobStatus, NewTranscodeJob, TranscodeJob};
use crate::schema::transcode_jobs;

pub struct TranscodeRepo;

impl TranscodeRepo {
    /// Enqueue a job for a stay. Fails with `Conflict` if a non-terminal
    /// job already exists for that stay, and with `ResourceExhausted` when
    /// the pending queue is at capacity.
    pub fn enqueue(
        conn: &mut PgConnection,
        stay_id: i64,
        pending_cap: i64,
    ) -> StoreResult<TranscodeJob> {
        conn.build_transaction()
            .serializable()
            .run::<_, StoreError, _>(|conn| {
                let open: i64 = transcode_jobs::table
                    .filter(transcode_jobs::stay_id.eq(stay_id))
                    .filter(transcode_jobs::status.eq_any(vec![JobStatus::Pending, JobStatus::Running]))
                    .count()
                    .get_result(conn)?;
                if open > 0 {
                    return Err(StoreError::Conflict(format!(
                        "stay {stay_id} already has a queued transcode job"
                    )));
                }

                let pending: i64 = transcode_jobs::table
                    .filter(transcode_jobs::status.eq(JobStatus::Pending))
                    .count()
                    .get_result(conn)?;
                if pending >= pending_cap {
                    return Err(StoreError::ResourceExhausted(format!(
                        "transcode queue full ({pending_cap} pending)"
                    )));
                }

                let job = diesel::insert_into(transcode_jobs::table)
                    .values(&NewTranscodeJob::pending(stay_id))
                    .get_result::<TranscodeJob>(conn)?;
                Ok(job)
            })
    }

    /// Claim the next pending job: rushed jobs first (higher priority
    /// wins), ties broken oldest-first. `SKIP LOCKED` keeps concurrent
    /// workers from claiming the same row.
    pub fn claim(conn: &mut PgConnection) -> StoreResult<Option<TranscodeJob>> {
        conn.transaction::<_, StoreError, _>(|conn| {
            let candidate = transcode_jobs::table
                .filter(transcode_jobs::status.eq(JobStatus::Pending))
                .order((transcode_jobs::priority.desc(), transcode_jobs::created_at.asc()))
                .for_update()
                .skip_locked()
                .first::<TranscodeJob>(conn)
                .optional()?;

            let Some(job) = candidate else {
                return Ok(None);
            };

            let job = diesel::update(transcode_jobs::table.find(job.id))
                .set((
                    transcode_jobs::status.eq(JobStatus::Running),
                    transcode_jobs::started_at.eq(Utc::now()),
                ))
                .get_result::<TranscodeJob>(conn)?;
            Ok(Some(job))
        })
    }

    /// Progress heartbeat from a worker: frame counter, total, ETA.
    pub fn heartbeat(
        conn: &mut PgConnection,
        job_id: i32,
        progress: i32,
        total: i32,
        eta_seconds: Option<i32>,
    ) -> StoreResult<()> {
        diesel::update(transcode_jobs::table.find(job_id))
            .set((
                transcode_jobs::progress.eq(progress),
                transcode_jobs::total.eq(total),
                transcode_jobs::eta_seconds.eq(eta_seconds),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn complete(conn: &mut PgConnection, job_id: i32, output_path: &str) -> StoreResult<()> {
        diesel::update(transcode_jobs::table.find(job_id))
            .set((
                transcode_jobs::status.eq(JobStatus::Done),
                transcode_jobs::output_path.eq(output_path),
                transcode_jobs::finished_at.eq(Utc::now()),
                transcode_jobs::eta_seconds.eq(Some(0)),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn fail(conn: &mut PgConnection, job_id: i32, error: &str) -> StoreResult<()> {
        diesel::update(transcode_jobs::table.find(job_id))
            .set((
                transcode_jobs::status.eq(JobStatus::Failed),
                transcode_jobs::error.eq(error),
                transcode_jobs::finished_at.eq(Utc::now()),
            ))
            .execute(conn)?;
        Ok(())
    }

    /// Move a pending job ahead of everything else: current max priority
    /// plus one.
    pub fn rush(conn: &mut PgConnection, job_id: i32) -> StoreResult<i32> {
        conn.transaction::<_, StoreError, _>(|conn| {
            let max: Option<i32> = transcode_jobs::table
                .select(diesel::dsl::max(transcode_jobs::priority))
                .get_result(conn)?;
            let new_priority = max.unwrap_or(0) + 1;

            let updated = diesel::update(
                transcode_jobs::table
                    .filter(transcode_jobs::id.eq(job_id))
                    .filter(transcode_jobs::status.eq(JobStatus::Pending)),
            )
            .set(transcode_jobs::priority.eq(new_priority))
            .execute(conn)?;

            if updated == 0 {
                return Err(StoreError::NotFound {
                    entity: "pending transcode job",
                    id: job_id.to_string(),
                });
            }
            Ok(new_priority)
        })
    }

    /// `(pending, running)` counts, for cap enforcement checks and the
    /// operations surface.
    pub fn counts(conn: &mut PgConnection) -> StoreResult<(i64, i64)> {
        let pending: i64 = transcode_jobs::table
            .filter(transcode_jobs::status.eq(JobStatus::Pending))
            .count()
            .get_result(conn)?;
        let running: i64 = transcode_jobs::table
            .filter(transcode_jobs::status.eq(JobStatus::Running))
            .count()
            .get_result(conn)?;
        Ok((pending, running))
    }

    pub fn get(conn: &mut PgConnection, job_id: i32) -> StoreResult<TranscodeJob> {
        transcode_jobs::table
            .find(job_id)
            .first::<TranscodeJob>(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "transcode job",
                id: job_id.to_string(),
            })
    }

    /// Zero-based position of a pending job in claim order, for the
    /// status surface.
    pub fn queue_position(conn: &mut PgConnection, job_id: i32) -> StoreResult<Option<i64>> {
        let job = Self::get(conn, job_id)?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        let ahead: i64 = transcode_jobs::table
            .filter(transcode_jobs::status.eq(JobStatus::Pending))
            .filter(
                transcode_jobs::priority
                    .gt(job.priority)
                    .or(transcode_jobs::priority
                        .eq(job.priority)
                        .and(transcode_jobs::created_at.lt(job.created_at))),
            )
            .count()
            .get_result(conn)?;
        Ok(Some(ahead))
    }

    /// Requeue jobs stuck in `running` from a dead worker or process
    /// restart.
    pub fn requeue_running(conn: &mut PgConnection) -> StoreResult<usize> {
        let updated = diesel::update(
            transcode_jobs::table.filter(transcode_jobs::status.eq(JobStatus::Running)),
        )
        .set((
            transcode_jobs::status.eq(JobStatus::Pending),
            transcode_jobs::started_at.eq(None::<chrono::DateTime<Utc>>),
        ))
        .execute(conn)?;
        Ok(updated)
    }
}
