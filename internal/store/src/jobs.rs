//! The durable job ledger.
//!
//! Jobs are claimed under a lease: a worker that dies mid-job never records an
//! outcome, and once the lease expires the job becomes claimable again. Every
//! outcome is recorded conditionally on the job still being held by the same
//! attempt, so a worker that outlived its lease cannot overwrite the outcome of
//! the attempt that replaced it.

use std::time::{Duration, SystemTime};

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::{
    connection::job_by_id, sql, ArchiveID, Connection, Error, Job, JobID, JobState,
};

impl Connection {
    pub fn enqueue_job(
        &mut self,
        repository_url: &str,
        payload: &[u8],
        now: SystemTime,
    ) -> Result<JobID, Error> {
        let id = self
            .conn
            .prepare_cached(
                "
                INSERT INTO
                    jobs
                (repository_url, state, payload, not_before, created_at, updated_at)
                VALUES
                (?, ?, ?, ?, ?, ?)
                ",
            )?
            .insert(params![
                repository_url,
                JobState::Queued,
                payload,
                sql::from_time(&now),
                sql::from_time(&now),
                sql::from_time(&now),
            ])?;

        log::debug!("enqueued job {} for {}", id, repository_url);
        Ok(JobID::from(id))
    }

    /// Returns the job as a caller polling for status should see it.
    ///
    /// A running job whose lease has expired belongs to a worker that has gone
    /// away, and is reported as queued: it will be picked up again.
    pub fn job(&mut self, id: JobID, now: SystemTime) -> Result<Option<Job>, Error> {
        Ok(job_by_id(&self.conn, id)?.map(|mut job| {
            if job.state == JobState::Running && lease_expired(&job, &now) {
                job.state = JobState::Queued;
            }
            job
        }))
    }

    /// Claims the next runnable job, if any.
    ///
    /// A job is runnable if it is queued, if it failed transiently and its
    /// backoff has elapsed, or if it is running under an expired lease. Jobs
    /// for a repository that already has a live running job are skipped, so
    /// two workers never share a repository's working directory.
    pub fn claim_next_job(
        &mut self,
        now: SystemTime,
        lease: Duration,
    ) -> Result<Option<Job>, Error> {
        let txn = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_ts = sql::from_time(&now);

        let id = txn
            .prepare_cached(
                "
                SELECT
                    candidate.id
                FROM
                    jobs AS candidate
                WHERE
                    (
                        (candidate.state IN ('queued', 'failed') AND candidate.not_before <= ?1)
                        OR (candidate.state = 'running' AND candidate.lease_expires_at <= ?1)
                    )
                    AND NOT EXISTS (
                        SELECT
                            1
                        FROM
                            jobs AS other
                        WHERE
                            other.repository_url = candidate.repository_url
                            AND other.id != candidate.id
                            AND other.state = 'running'
                            AND other.lease_expires_at > ?1
                    )
                ORDER BY
                    candidate.not_before,
                    candidate.id
                LIMIT 1
                ",
            )?
            .query_row(params![now_ts], |row| row.get::<_, i64>(0))
            .optional()?;

        let id = match id {
            Some(id) => JobID::from(id),
            None => return Ok(None),
        };

        txn.prepare_cached(
            "
            UPDATE
                jobs
            SET
                state = ?,
                attempts = attempts + 1,
                lease_expires_at = ?,
                updated_at = ?
            WHERE
                id = ?
            ",
        )?
        .execute(params![
            JobState::Running,
            sql::from_time(&(now + lease)),
            now_ts,
            i64::from(id),
        ])?;
        let job = job_by_id(&txn, id)?;
        txn.commit()?;

        if let Some(job) = &job {
            log::debug!("claimed job {} (attempt {})", job.id, job.attempts);
        }
        Ok(job)
    }

    /// Extends the lease of a running job. Workers call this periodically so a
    /// job that is still making progress is never taken for abandoned.
    pub fn renew_lease(
        &mut self,
        id: JobID,
        attempt: u32,
        lease: Duration,
        now: SystemTime,
    ) -> Result<(), Error> {
        let changed = self
            .conn
            .prepare_cached(
                "
                UPDATE
                    jobs
                SET
                    lease_expires_at = ?,
                    updated_at = ?
                WHERE
                    id = ?
                    AND state = 'running'
                    AND attempts = ?
                ",
            )?
            .execute(params![
                sql::from_time(&(now + lease)),
                sql::from_time(&now),
                i64::from(id),
                attempt as i64,
            ])?;

        held(id, changed)
    }

    /// Marks the job as succeeded with the given archive as its result.
    pub fn complete_job(
        &mut self,
        id: JobID,
        attempt: u32,
        archive_id: ArchiveID,
        now: SystemTime,
    ) -> Result<(), Error> {
        let changed = self
            .conn
            .prepare_cached(
                "
                UPDATE
                    jobs
                SET
                    state = ?,
                    lease_expires_at = NULL,
                    result_archive_id = ?,
                    last_error = NULL,
                    updated_at = ?
                WHERE
                    id = ?
                    AND state = 'running'
                    AND attempts = ?
                ",
            )?
            .execute(params![
                JobState::Succeeded,
                i64::from(archive_id),
                sql::from_time(&now),
                i64::from(id),
                attempt as i64,
            ])?;

        held(id, changed)
    }

    /// Records a transient failure; the job becomes claimable again once
    /// `not_before` has passed.
    pub fn retry_job(
        &mut self,
        id: JobID,
        attempt: u32,
        reason: &str,
        not_before: SystemTime,
        now: SystemTime,
    ) -> Result<(), Error> {
        self.fail_job(id, attempt, JobState::Failed, reason, not_before, now)
    }

    /// Records a terminal failure.
    pub fn bury_job(
        &mut self,
        id: JobID,
        attempt: u32,
        reason: &str,
        now: SystemTime,
    ) -> Result<(), Error> {
        self.fail_job(id, attempt, JobState::Dead, reason, now, now)
    }

    fn fail_job(
        &mut self,
        id: JobID,
        attempt: u32,
        state: JobState,
        reason: &str,
        not_before: SystemTime,
        now: SystemTime,
    ) -> Result<(), Error> {
        let changed = self
            .conn
            .prepare_cached(
                "
                UPDATE
                    jobs
                SET
                    state = ?,
                    lease_expires_at = NULL,
                    last_error = ?,
                    not_before = ?,
                    updated_at = ?
                WHERE
                    id = ?
                    AND state = 'running'
                    AND attempts = ?
                ",
            )?
            .execute(params![
                state,
                reason,
                sql::from_time(&not_before),
                sql::from_time(&now),
                i64::from(id),
                attempt as i64,
            ])?;

        held(id, changed)
    }
}

fn lease_expired(job: &Job, now: &SystemTime) -> bool {
    match &job.lease_expires_at {
        Some(expires) => expires <= now,
        None => true,
    }
}

fn held(id: JobID, changed: usize) -> Result<(), Error> {
    if changed == 0 {
        Err(Error::LeaseLost(id))
    } else {
        Ok(())
    }
}
