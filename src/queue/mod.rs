//! The durable job queue: enqueue, status and the retry policy. Jobs are run
//! by the [`Runner`].

use std::time::{Duration, SystemTime};

use git_ipfs_rehost_store::{Archive, JobID, JobState, Store};
use structopt::StructOpt;
use thiserror::Error;
use tokio::task::{self, JoinError};

use crate::job::RehostJob;

mod runner;
pub(crate) use runner::Runner;

// Command line options that are required by the [`Runner`].
//
// These should be injected into the global `StructOpt` implementation using the
// `flatten` attribute.
#[derive(Clone, Debug, StructOpt)]
pub(crate) struct Opt {
    #[structopt(
        long,
        default_value = "5",
        help = "number of attempts a job gets before it is given up on"
    )]
    max_attempts: u32,

    #[structopt(
        long,
        default_value = "5s",
        parse(try_from_str = parse_duration::parse::parse),
        help = "delay before the first retry; doubled on each subsequent retry"
    )]
    backoff: Duration,

    #[structopt(
        long,
        default_value = "5m",
        parse(try_from_str = parse_duration::parse::parse),
        help = "upper bound on the delay between retries"
    )]
    max_backoff: Duration,

    #[structopt(
        long,
        default_value = "30m",
        parse(try_from_str = parse_duration::parse::parse),
        help = "how long a job may run before it's assumed its worker has died"
    )]
    lease: Duration,

    #[structopt(
        long,
        default_value = "1s",
        parse(try_from_str = parse_duration::parse::parse),
        help = "how often to look for new jobs when the queue is empty"
    )]
    poll_interval: Duration,

    #[structopt(
        short,
        long,
        help = "number of jobs to run concurrently; defaults to the number of CPUs"
    )]
    jobs: Option<usize>,
}

impl Opt {
    pub(crate) fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff,
            max_backoff: self.max_backoff,
        }
    }

    pub(crate) fn lease(&self) -> Duration {
        self.lease
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// How often, and how far apart, a transiently failing job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) backoff: Duration,
    pub(crate) max_backoff: Duration,
}

impl RetryPolicy {
    /// Returns true if a job that has failed `attempts` times may run again.
    pub(crate) fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// The delay before the next attempt of a job that has failed `attempts`
    /// times.
    pub(crate) fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.backoff
            .checked_mul(1 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

/// What a caller polling a job gets to see.
#[derive(Debug, Clone)]
pub(crate) struct JobStatus {
    pub(crate) id: JobID,
    pub(crate) state: JobState,
    pub(crate) attempts: u32,
    pub(crate) last_error: Option<String>,

    /// The archive entry the job produced, once it has succeeded.
    pub(crate) result: Option<Archive>,

    /// The job itself, if its payload can still be read.
    pub(crate) job: Option<RehostJob>,
}

#[derive(Debug, Clone)]
pub(crate) struct Queue {
    store: Store,
}

impl Queue {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    pub(crate) async fn enqueue(&self, job: &RehostJob) -> Result<JobID, Error> {
        let payload = job.encode()?;
        let url = job.locator.canonical_url();
        let store = self.store.clone();

        let id = task::spawn_blocking(move || {
            store
                .connection()?
                .enqueue_job(&url, &payload, SystemTime::now())
        })
        .await??;

        log::info!("queued job {} for {} at {}", id, &job.locator, &job.revision);
        Ok(id)
    }

    pub(crate) async fn status(&self, id: JobID) -> Result<Option<JobStatus>, Error> {
        let store = self.store.clone();

        task::spawn_blocking(move || -> Result<Option<JobStatus>, Error> {
            let mut conn = store.connection()?;
            let job = match conn.job(id, SystemTime::now())? {
                Some(job) => job,
                None => return Ok(None),
            };

            let result = match job.result_archive_id {
                Some(archive_id) => conn.get_archive(archive_id)?,
                None => None,
            };

            Ok(Some(JobStatus {
                id: job.id,
                state: job.state,
                attempts: job.attempts,
                last_error: job.last_error,
                result,
                job: RehostJob::decode(&job.payload).ok(),
            }))
        })
        .await?
    }
}

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("cannot encode job: {0}")]
    Payload(#[from] bincode::Error),

    #[error(transparent)]
    Store(#[from] git_ipfs_rehost_store::Error),
}
