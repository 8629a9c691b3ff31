use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use git_ipfs_rehost_store::{Connection, Job, JobID, JobState, Store};
use tokio::{
    sync::watch,
    task,
    time::{self, MissedTickBehavior},
};

use super::{Error, Opt, RetryPolicy};
use crate::{
    collaborator::{Extractor, Uploader},
    job::RehostJob,
    pipeline::{Failure, Outcome, Pipeline},
};

/// Claims jobs from the queue and runs them through the pipeline.
pub(crate) struct Runner<E, U> {
    pipeline: Arc<Pipeline<E, U>>,
    store: Store,
    policy: RetryPolicy,
    lease: Duration,
    poll_interval: Duration,
}

impl<E, U> Runner<E, U>
where
    E: Extractor + 'static,
    U: Uploader + 'static,
{
    pub(crate) fn new(
        pipeline: Arc<Pipeline<E, U>>,
        store: Store,
        policy: RetryPolicy,
        lease: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            store,
            policy,
            lease,
            poll_interval,
        }
    }

    pub(crate) fn from_opt(pipeline: Arc<Pipeline<E, U>>, store: Store, opt: &Opt) -> Self {
        Self::new(
            pipeline,
            store,
            opt.policy(),
            opt.lease(),
            opt.poll_interval(),
        )
    }

    /// Claims and runs a single job, returning the state it was left in, or
    /// `None` if nothing was runnable. A job whose lease was lost to another
    /// attempt part way through is reported as still running.
    pub(crate) async fn run_once(&self) -> Result<Option<(JobID, JobState)>, Error> {
        match self.claim().await? {
            Some(job) => Ok(Some((job.id, self.process(job).await?))),
            None => Ok(None),
        }
    }

    /// Runs jobs on `jobs` workers until `shutdown` becomes true. Jobs already
    /// handed to a worker are run to completion first.
    pub(crate) async fn run(
        self: Arc<Self>,
        jobs: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        // Workers announce themselves on `ready` before waiting for a job, and
        // a job is only claimed once a worker is waiting: its lease must not
        // start until someone is running it.
        let (tx, rx) = flume::bounded::<Job>(0);
        let (ready_tx, ready_rx) = flume::unbounded::<()>();

        let mut workers = Vec::with_capacity(jobs);
        for _i in 0..jobs {
            let local_rx = rx.clone();
            let local_ready = ready_tx.clone();
            let local_runner = self.clone();

            workers.push(task::spawn(async move {
                while local_ready.send(()).is_ok() {
                    let job = match local_rx.recv_async().await {
                        Ok(job) => job,
                        Err(_) => break,
                    };

                    let id = job.id;
                    if let Err(e) = local_runner.process(job).await {
                        log::error!("error recording outcome of job {}: {:?}", id, e);
                    }
                }
            }));
        }
        drop(rx);
        drop(ready_tx);
        log::info!("running jobs with {} workers", jobs);

        'dispatch: while !*shutdown.borrow() {
            tokio::select! {
                ready = ready_rx.recv_async() => {
                    if ready.is_err() {
                        break 'dispatch;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        log::warn!("shutdown signal went away; stopping");
                        break 'dispatch;
                    }
                    continue 'dispatch;
                }
            }

            loop {
                match self.claim().await {
                    Ok(Some(job)) => {
                        if tx.send_async(job).await.is_err() {
                            break 'dispatch;
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => log::error!("error claiming a job: {:?}", e),
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            log::warn!("shutdown signal went away; stopping");
                        }
                        if changed.is_err() || *shutdown.borrow() {
                            break 'dispatch;
                        }
                    }
                    _ = time::sleep(self.poll_interval) => {}
                }
            }
        }

        log::info!("waiting for running jobs to finish");
        drop(tx);
        for worker in workers {
            worker.await?;
        }

        Ok(())
    }

    async fn claim(&self) -> Result<Option<Job>, Error> {
        let store = self.store.clone();
        let lease = self.lease;

        Ok(task::spawn_blocking(move || {
            store
                .connection()?
                .claim_next_job(SystemTime::now(), lease)
        })
        .await??)
    }

    async fn process(&self, job: Job) -> Result<JobState, Error> {
        let (id, attempt) = (job.id, job.attempts);
        let rehost = match RehostJob::decode(&job.payload) {
            Ok(rehost) => rehost,
            Err(e) => {
                log::error!("job {} has an unreadable payload: {}", id, e);
                let reason = format!("unreadable payload: {}", e);
                self.record(&job, move |conn, now| conn.bury_job(id, attempt, &reason, now))
                    .await?;
                return Ok(JobState::Dead);
            }
        };

        log::debug!("job {}: attempt {}", id, attempt);
        match self.execute_holding_lease(&job, &rehost).await {
            Some(result) => self.finish(&job, result).await,
            None => Ok(JobState::Running),
        }
    }

    /// Runs the pipeline, renewing the job's lease as it goes. If the lease is
    /// lost to another attempt the pipeline is dropped, and `None` returned.
    async fn execute_holding_lease(
        &self,
        job: &Job,
        rehost: &RehostJob,
    ) -> Option<Result<Outcome, Failure>> {
        let execute = self.pipeline.execute(rehost);
        tokio::pin!(execute);

        let mut heartbeat = time::interval(self.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately, and the lease is fresh.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut execute => return Some(result),
                _ = heartbeat.tick() => match self.renew(job).await {
                    Ok(()) => {}
                    Err(Error::Store(git_ipfs_rehost_store::Error::LeaseLost(_))) => {
                        log::warn!(
                            "job {} attempt {} lost its lease; abandoning it",
                            job.id,
                            job.attempts
                        );
                        return None;
                    }
                    Err(e) => log::warn!("cannot renew lease of job {}: {:?}", job.id, e),
                },
            }
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }

    async fn renew(&self, job: &Job) -> Result<(), Error> {
        let store = self.store.clone();
        let (id, attempt, lease) = (job.id, job.attempts, self.lease);

        Ok(task::spawn_blocking(move || {
            store
                .connection()?
                .renew_lease(id, attempt, lease, SystemTime::now())
        })
        .await??)
    }

    async fn finish(&self, job: &Job, result: Result<Outcome, Failure>) -> Result<JobState, Error> {
        let (id, attempt) = (job.id, job.attempts);

        match result {
            Ok(outcome) => {
                let archive_id = outcome.archive.id;
                self.record(job, move |conn, now| {
                    conn.complete_job(id, attempt, archive_id, now)
                })
                .await?;
                log::info!("job {} succeeded: {}", id, &outcome.archive.content_id);

                Ok(JobState::Succeeded)
            }
            Err(failure) if failure.is_transient() && self.policy.should_retry(attempt) => {
                let delay = self.policy.delay(attempt);
                let reason = failure.to_string();
                log::warn!(
                    "job {} failed on attempt {}, retrying in {:?}: {}",
                    id,
                    attempt,
                    delay,
                    &reason
                );
                self.record(job, move |conn, now| {
                    conn.retry_job(id, attempt, &reason, now + delay, now)
                })
                .await?;

                Ok(JobState::Failed)
            }
            Err(failure) => {
                let reason = failure.to_string();
                log::error!("job {} failed on attempt {}: {}", id, attempt, &reason);
                self.record(job, move |conn, now| conn.bury_job(id, attempt, &reason, now))
                    .await?;

                Ok(JobState::Dead)
            }
        }
    }

    async fn record<F>(&self, job: &Job, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Connection, SystemTime) -> Result<(), git_ipfs_rehost_store::Error>
            + Send
            + 'static,
    {
        let store = self.store.clone();
        let result = task::spawn_blocking(move || f(&mut store.connection()?, SystemTime::now()))
            .await?;

        match result {
            // Our lease ran out and another attempt has taken over; its
            // outcome is the one that counts.
            Err(git_ipfs_rehost_store::Error::LeaseLost(_)) => {
                log::warn!(
                    "job {} attempt {} outlived its lease; outcome discarded",
                    job.id,
                    job.attempts
                );
                Ok(())
            }
            other => Ok(other?),
        }
    }
}
