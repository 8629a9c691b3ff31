//! Decides what, if anything, a rehost request should do to the catalog.

use std::{fmt::Display, sync::Arc};

use git_ipfs_rehost_store::{Archive, Repository, Store};
use thiserror::Error;
use tokio::task::{self, JoinError};

use crate::{
    collaborator::{Resolution, ResolveError, Resolver},
    job::RehostJob,
    locator::RepoLocator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// The repository has never been archived.
    CreateNew,

    /// The repository is known, but not at this revision.
    Append,

    /// The revision is already archived; nothing to do.
    Skip,

    /// The revision is already archived, but the caller wants it redone.
    Replace,
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CreateNew => "create-new",
            Self::Append => "append",
            Self::Skip => "skip",
            Self::Replace => "replace",
        })
    }
}

/// A request to rehost a repository.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) locator: RepoLocator,

    /// An explicit commit. Takes precedence over `tag` when both are given.
    pub(crate) revision: Option<String>,
    pub(crate) tag: Option<String>,
    pub(crate) branch: Option<String>,
    pub(crate) force_update: bool,
}

impl Request {
    pub(crate) fn new(locator: RepoLocator) -> Self {
        Self {
            locator,
            revision: None,
            tag: None,
            branch: None,
            force_update: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Decision {
    pub(crate) action: Action,
    pub(crate) resolution: Resolution,

    /// The catalog record for the repository, if there is one.
    pub(crate) repository: Option<Repository>,
}

impl Decision {
    pub(crate) fn is_new_repository(&self) -> bool {
        self.repository.is_none()
    }

    /// The archive entry already recorded for the resolved revision.
    pub(crate) fn existing_archive(&self) -> Option<&Archive> {
        self.repository
            .as_ref()
            .and_then(|repository| repository.archive_for_revision(&self.resolution.revision))
    }

    /// Builds the job that carries the decision out. There's no point in
    /// running it if the action is [`Action::Skip`].
    pub(crate) fn job(&self, request: &Request) -> RehostJob {
        RehostJob {
            locator: request.locator.clone(),
            revision: self.resolution.revision.clone(),
            tag: self.resolution.tag.clone(),
            branch: request.branch.clone(),
            committed_date: self.resolution.committed_date,
            is_fork: self.resolution.is_fork,
            is_replace: self.action == Action::Replace,
        }
    }
}

pub(crate) struct DecisionEngine<R> {
    resolver: Arc<R>,
    store: Store,
}

impl<R> DecisionEngine<R>
where
    R: Resolver,
{
    pub(crate) fn new(resolver: Arc<R>, store: Store) -> Self {
        Self { resolver, store }
    }

    /// Resolves the request to a concrete revision and compares it with the
    /// catalog. Nothing is written.
    pub(crate) async fn decide(&self, request: &Request) -> Result<Decision, Error> {
        let resolution = self.resolve(request).await?;

        let store = self.store.clone();
        let url = request.locator.canonical_url();
        let repository =
            task::spawn_blocking(move || store.connection()?.find_repository_by_url(&url))
                .await??;

        let action = match &repository {
            None => Action::CreateNew,
            Some(repository) => match repository.archive_for_revision(&resolution.revision) {
                None => Action::Append,
                Some(_) if request.force_update => Action::Replace,
                Some(_) => Action::Skip,
            },
        };
        log::debug!(
            "{} at {}: {}",
            &request.locator,
            &resolution.revision,
            action
        );

        Ok(Decision {
            action,
            resolution,
            repository,
        })
    }

    async fn resolve(&self, request: &Request) -> Result<Resolution, Error> {
        let revision = match &request.revision {
            Some(revision) => revision,
            None => {
                return Ok(self
                    .resolver
                    .resolve(&request.locator, request.tag.as_deref())
                    .await?)
            }
        };

        // The repository still has to exist upstream, and we still want to
        // know if it's a fork, but the caller's revision is used as is. The
        // commit date is only known if the revision happens to be HEAD.
        let upstream = self.resolver.resolve(&request.locator, None).await?;
        Ok(Resolution {
            committed_date: if &upstream.revision == revision {
                upstream.committed_date
            } else {
                None
            },
            revision: revision.clone(),
            tag: request.tag.clone(),
            is_fork: upstream.is_fork,
        })
    }
}

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("cannot resolve revision: {0}")]
    ResolutionFailed(#[from] ResolveError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Store(#[from] git_ipfs_rehost_store::Error),
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_err;

    use super::*;
    use crate::testing::{locator, Harness, COMMITTED};

    #[tokio::test]
    async fn test_decide_new_repository() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let tool = locator("alice", "tool");
        harness.resolver.push(&tool, "aaaa");

        let decision = harness.engine().decide(&Request::new(tool.clone())).await?;
        assert_eq!(decision.action, Action::CreateNew);
        assert!(decision.is_new_repository());
        assert!(decision.existing_archive().is_none());
        assert_eq!(decision.resolution.revision, "aaaa");
        assert_eq!(decision.resolution.committed_date, Some(COMMITTED));

        let job = decision.job(&Request::new(tool.clone()));
        assert_eq!(job.locator, tool);
        assert_eq!(job.revision, "aaaa");
        assert!(!job.is_replace);

        // Nothing has been written.
        assert!(harness.repository(&tool)?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_decide_existing_repository() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let tool = locator("alice", "tool");
        harness.resolver.push(&tool, "aaaa");
        harness.catalog(&tool, "aaaa")?;

        let engine = harness.engine();
        let decision = engine.decide(&Request::new(tool.clone())).await?;
        assert_eq!(decision.action, Action::Skip);
        assert!(!decision.is_new_repository());
        assert_eq!(decision.existing_archive().unwrap().revision, "aaaa");

        let forced = Request {
            force_update: true,
            ..Request::new(tool.clone())
        };
        let decision = engine.decide(&forced).await?;
        assert_eq!(decision.action, Action::Replace);
        assert!(decision.job(&forced).is_replace);

        harness.resolver.push(&tool, "bbbb");
        let decision = engine.decide(&Request::new(tool.clone())).await?;
        assert_eq!(decision.action, Action::Append);
        assert!(decision.existing_archive().is_none());

        // Forcing a revision that isn't archived is just an append.
        let decision = engine.decide(&forced).await?;
        assert_eq!(decision.action, Action::Append);
        assert!(!decision.job(&forced).is_replace);

        Ok(())
    }

    #[tokio::test]
    async fn test_decide_revision_over_tag() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let tool = locator("alice", "tool");
        harness.resolver.push(&tool, "aaaa");
        harness.resolver.tag(&tool, "v1.0", "bbbb");

        let engine = harness.engine();

        let tagged = Request {
            tag: Some("v1.0".into()),
            ..Request::new(tool.clone())
        };
        let decision = engine.decide(&tagged).await?;
        assert_eq!(decision.resolution.revision, "bbbb");
        assert_eq!(decision.resolution.tag.as_deref(), Some("v1.0"));

        let pinned = Request {
            revision: Some("cccc".into()),
            ..tagged
        };
        let decision = engine.decide(&pinned).await?;
        assert_eq!(decision.resolution.revision, "cccc");
        assert_eq!(decision.resolution.tag.as_deref(), Some("v1.0"));
        assert_eq!(decision.resolution.committed_date, None);

        let head = Request {
            revision: Some("aaaa".into()),
            ..Request::new(tool)
        };
        let decision = engine.decide(&head).await?;
        assert_eq!(decision.resolution.committed_date, Some(COMMITTED));

        Ok(())
    }

    #[tokio::test]
    async fn test_decide_fork() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let tool = locator("alice", "tool");
        harness.resolver.push(&tool, "aaaa");
        harness.resolver.fork(&tool);

        let decision = harness.engine().decide(&Request::new(tool)).await?;
        assert!(decision.resolution.is_fork);
        assert_eq!(decision.action, Action::CreateNew);

        Ok(())
    }

    #[tokio::test]
    async fn test_decide_resolution_failed() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let tool = locator("alice", "tool");
        let engine = harness.engine();

        let err = assert_err!(engine.decide(&Request::new(tool.clone())).await);
        assert!(matches!(
            err,
            Error::ResolutionFailed(ResolveError::NotFound(_))
        ));

        harness.resolver.push(&tool, "aaaa");
        let missing_tag = Request {
            tag: Some("v9".into()),
            ..Request::new(tool.clone())
        };
        assert!(matches!(
            engine.decide(&missing_tag).await,
            Err(Error::ResolutionFailed(ResolveError::NotFound(_)))
        ));

        harness.resolver.set_unavailable(true);
        assert!(matches!(
            engine.decide(&Request::new(tool)).await,
            Err(Error::ResolutionFailed(ResolveError::Upstream(_)))
        ));

        Ok(())
    }
}
