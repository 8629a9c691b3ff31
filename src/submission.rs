//! Accepts rehost requests: decides what each needs and queues the work.

use git_ipfs_rehost_store::{Archive, JobID};
use thiserror::Error;

use crate::{
    collaborator::Resolver,
    decision::{self, Action, DecisionEngine, Request},
    queue::{self, Queue},
};

#[derive(Debug, Clone)]
pub(crate) enum Submission {
    /// The resolved revision is already archived.
    Skipped { archive: Archive },

    Queued {
        job_id: JobID,
        action: Action,

        /// Forks are rehosted like anything else, but re-extracting one may
        /// not reproduce an identical archive.
        is_fork: bool,
    },
}

pub(crate) struct Submitter<R> {
    engine: DecisionEngine<R>,
    queue: Queue,
}

impl<R> Submitter<R>
where
    R: Resolver,
{
    pub(crate) fn new(engine: DecisionEngine<R>, queue: Queue) -> Self {
        Self { engine, queue }
    }

    /// Decides what the request needs and, unless the revision is already
    /// archived, queues a job for it. A request that can't be resolved queues
    /// nothing.
    pub(crate) async fn submit(&self, request: &Request) -> Result<Submission, Error> {
        let decision = self.engine.decide(request).await?;

        if decision.action == Action::Skip {
            if let Some(archive) = decision.existing_archive() {
                log::info!(
                    "{} at {} is already archived as {}",
                    &request.locator,
                    &decision.resolution.revision,
                    &archive.content_id
                );
                return Ok(Submission::Skipped {
                    archive: archive.clone(),
                });
            }
        }

        if decision.is_new_repository() {
            log::info!("{} has not been archived before", &request.locator);
        }
        if decision.resolution.is_fork {
            log::warn!(
                "{} is a fork; archives of forks may not be reproducible byte for byte",
                &request.locator
            );
        }

        let job_id = self.queue.enqueue(&decision.job(request)).await?;
        Ok(Submission::Queued {
            job_id,
            action: decision.action,
            is_fork: decision.resolution.is_fork,
        })
    }
}

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Decision(#[from] decision::Error),

    #[error(transparent)]
    Queue(#[from] queue::Error),
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use git_ipfs_rehost_store::JobState;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::{
        collaborator::ResolveError,
        queue::RetryPolicy,
        testing::{locator, Harness},
    };

    fn queued(submission: Submission) -> (JobID, Action, bool) {
        match submission {
            Submission::Queued {
                job_id,
                action,
                is_fork,
            } => (job_id, action, is_fork),
            other => panic!("unexpected submission: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_lifecycle() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let submitter = harness.submitter();
        let runner = harness.runner(RetryPolicy::default());
        let tool = locator("alice", "tool");
        harness.resolver.push(&tool, "aaaa");
        harness.resolver.tag(&tool, "v1.0", "aaaa");

        let (id, action, is_fork) = queued(submitter.submit(&Request::new(tool.clone())).await?);
        assert_eq!(action, Action::CreateNew);
        assert!(!is_fork);
        assert_eq!(runner.run_once().await?, Some((id, JobState::Succeeded)));

        let first = harness.queue().status(id).await?.unwrap().result.unwrap();
        assert_eq!(first.revision, "aaaa");
        assert_eq!(first.tag.as_deref(), Some("v1.0"));
        assert!(first.committed_date.is_some());

        // Resubmitting the same revision is a no-op.
        match submitter.submit(&Request::new(tool.clone())).await? {
            Submission::Skipped { archive } => assert_eq!(archive, first),
            other => panic!("unexpected submission: {:?}", other),
        }
        assert_eq!(runner.run_once().await?, None);

        // A new commit upstream is appended.
        harness.resolver.push(&tool, "bbbb");
        let (id, action, _) = queued(submitter.submit(&Request::new(tool.clone())).await?);
        assert_eq!(action, Action::Append);
        assert_eq!(runner.run_once().await?, Some((id, JobState::Succeeded)));

        let repository = harness.repository(&tool)?.unwrap();
        assert_eq!(repository.archives.len(), 2);
        assert_eq!(repository.archives[0], first);
        assert_eq!(repository.archives[1].revision, "bbbb");
        assert_eq!(repository.archives[1].tag, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_submit_force_update() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let submitter = harness.submitter();
        let runner = harness.runner(RetryPolicy::default());
        let tool = locator("alice", "tool");
        harness.resolver.push(&tool, "aaaa");

        let (id, _, _) = queued(submitter.submit(&Request::new(tool.clone())).await?);
        runner.run_once().await?;
        let original = harness.queue().status(id).await?.unwrap().result.unwrap();

        harness.extractor.rewrite(&tool);
        let forced = Request {
            force_update: true,
            ..Request::new(tool.clone())
        };
        let (id, action, _) = queued(submitter.submit(&forced).await?);
        assert_eq!(action, Action::Replace);
        assert_eq!(runner.run_once().await?, Some((id, JobState::Succeeded)));

        let replaced = harness.queue().status(id).await?.unwrap().result.unwrap();
        assert_eq!(replaced.id, original.id);
        assert_ne!(replaced.content_id, original.content_id);
        assert_eq!(harness.repository(&tool)?.unwrap().archives, vec![replaced]);

        Ok(())
    }

    #[tokio::test]
    async fn test_submit_fork() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let submitter = harness.submitter();
        let runner = harness.runner(RetryPolicy::default());
        let fork = locator("bob", "tool");
        harness.resolver.push(&fork, "aaaa");
        harness.resolver.fork(&fork);

        let (id, action, is_fork) = queued(submitter.submit(&Request::new(fork.clone())).await?);
        assert_eq!(action, Action::CreateNew);
        assert!(is_fork);
        assert_eq!(runner.run_once().await?, Some((id, JobState::Succeeded)));
        assert!(harness.repository(&fork)?.unwrap().is_fork);

        Ok(())
    }

    #[tokio::test]
    async fn test_submit_unresolvable() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let submitter = harness.submitter();
        let tool = locator("alice", "tool");

        let err = assert_err!(submitter.submit(&Request::new(tool.clone())).await);
        assert!(matches!(
            err,
            Error::Decision(decision::Error::ResolutionFailed(ResolveError::NotFound(_)))
        ));

        // Nothing was queued.
        assert!(harness
            .store
            .connection()?
            .claim_next_job(SystemTime::now(), Duration::from_secs(60))?
            .is_none());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_submissions() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let submitter = harness.submitter();
        let runner = harness.runner(RetryPolicy::default());
        let tool = locator("alice", "tool");
        harness.resolver.push(&tool, "aaaa");

        // Both submissions see an empty catalog, so both queue a job.
        let request = Request::new(tool.clone());
        let (a, b) = tokio::join!(submitter.submit(&request), submitter.submit(&request));
        let (a, _, _) = queued(assert_ok!(a));
        let (b, _, _) = queued(assert_ok!(b));
        assert_ne!(a, b);

        let mut finished = Vec::new();
        while let Some((id, state)) = runner.run_once().await? {
            assert_eq!(state, JobState::Succeeded);
            finished.push(id);
        }
        assert_eq!(finished.len(), 2);

        // The second job resolves to the first job's archive.
        let queue = harness.queue();
        let a = queue.status(a).await?.unwrap().result.unwrap();
        let b = queue.status(b).await?.unwrap().result.unwrap();
        assert_eq!(a, b);
        assert_eq!(harness.repository(&tool)?.unwrap().archives, vec![a]);

        Ok(())
    }
}
