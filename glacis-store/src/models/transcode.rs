//! Replay-to-MP4 transcode jobs.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::models::enums::JobStatus;
use crate::schema::transcode_jobs;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = transcode_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TranscodeJob {
    pub id: i32,
    pub stay_id: i64,
    pub status: JobStatus,
    pub priority: i32,
    pub progress: i32,
    pub total: i32,
    pub eta_seconds: Option<i32>,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TranscodeJob {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Done | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = transcode_jobs)]
pub struct NewTranscodeJob {
    pub stay_id: i64,
    pub status: JobStatus,
    pub priority: i32,
}

impl NewTranscodeJob {
    pub fn pending(stay_id: i64) -> Self {
        Self {
            stay_id,
            status: JobStatus::Pending,
            priority: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending() {
        let job = NewTranscodeJob::pending(42);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 0);
    }
}
