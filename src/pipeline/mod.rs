//! Carries a rehost job out: extract, archive, then record the result in the
//! catalog.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use git_ipfs_rehost_archive::Archived;
use git_ipfs_rehost_store::{Archive, NewArchive, NewRepository, Store};
use structopt::StructOpt;
use tokio::{task, time::timeout};

use crate::{
    collaborator::{ExtractError, ExtractRequest, Extractor, Uploader},
    job::RehostJob,
};

mod error;
pub(crate) use error::Failure;

// Command line options that are required by the [`Pipeline`].
//
// These should be injected into the global `StructOpt` implementation using the
// `flatten` attribute.
#[derive(Clone, Debug, StructOpt)]
pub(crate) struct Opt {
    #[structopt(
        long,
        default_value = "30m",
        parse(try_from_str = parse_duration::parse::parse),
        help = "time limit for extracting a repository"
    )]
    extract_timeout: Duration,

    #[structopt(
        long,
        default_value = "30m",
        parse(try_from_str = parse_duration::parse::parse),
        help = "time limit for archiving an extracted repository"
    )]
    archive_timeout: Duration,

    #[structopt(
        long,
        default_value = "1m",
        parse(try_from_str = parse_duration::parse::parse),
        help = "time limit for recording an archive in the catalog"
    )]
    persist_timeout: Duration,
}

impl Default for Opt {
    fn default() -> Self {
        Self {
            extract_timeout: Duration::from_secs(30 * 60),
            archive_timeout: Duration::from_secs(30 * 60),
            persist_timeout: Duration::from_secs(60),
        }
    }
}

/// How the archive ended up in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Persisted {
    Created,
    Appended,
    Replaced,

    /// Another job recorded the same revision first.
    AlreadyArchived,

    /// The content was already catalogued under another entry, which is
    /// returned in its place.
    DuplicateContent,
}

#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub(crate) archive: Archive,
    pub(crate) persisted: Persisted,
}

pub(crate) struct Pipeline<E, U> {
    extractor: Arc<E>,
    uploader: Arc<U>,
    store: Store,
    opt: Opt,
}

impl<E, U> Pipeline<E, U>
where
    E: Extractor,
    U: Uploader,
{
    pub(crate) fn new(extractor: Arc<E>, uploader: Arc<U>, store: Store, opt: Opt) -> Self {
        Self {
            extractor,
            uploader,
            store,
            opt,
        }
    }

    /// Runs the job. Either the catalog ends up with an entry for the job's
    /// revision, or it is left exactly as it was.
    pub(crate) async fn execute(&self, job: &RehostJob) -> Result<Outcome, Failure> {
        log::info!("rehosting {} at {}", &job.locator, &job.revision);

        let path = self.extract(job).await?;
        let archived = self.upload(path).await?;
        let outcome = self.persist(job, archived).await?;

        log::info!(
            "{} at {} is archived as {} ({:?})",
            &job.locator,
            &job.revision,
            &outcome.archive.content_id,
            outcome.persisted
        );
        Ok(outcome)
    }

    async fn extract(&self, job: &RehostJob) -> Result<PathBuf, Failure> {
        let request = ExtractRequest {
            locator: &job.locator,
            revision: &job.revision,
            tag: job.tag.as_deref(),
            branch: job.branch.as_deref(),
        };

        match timeout(self.opt.extract_timeout, self.extractor.extract(&request)).await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(ExtractError::NotFound(e))) => Err(Failure::ExtractionPermanent(e)),
            Ok(Err(ExtractError::Transient(e))) => Err(Failure::ExtractionTransient(e)),
            Err(_) => Err(Failure::ExtractionTransient(format!(
                "timed out after {:?}",
                self.opt.extract_timeout
            ))),
        }
    }

    async fn upload(&self, path: PathBuf) -> Result<Archived, Failure> {
        match timeout(self.opt.archive_timeout, self.uploader.archive(&path)).await {
            Ok(Ok(archived)) => Ok(archived),
            Ok(Err(e)) => Err(Failure::ArchivalTransient(e.to_string())),
            Err(_) => Err(Failure::ArchivalTransient(format!(
                "timed out after {:?}",
                self.opt.archive_timeout
            ))),
        }
    }

    async fn persist(&self, job: &RehostJob, archived: Archived) -> Result<Outcome, Failure> {
        let store = self.store.clone();
        let job = job.clone();
        let handle = task::spawn_blocking(move || persist(&store, &job, archived, SystemTime::now()));

        // If we time out the write carries on in the background, but it's a
        // single transaction: it either lands whole or not at all, and a retry
        // converges either way.
        match timeout(self.opt.persist_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Failure::PersistenceTransient(e.to_string())),
            Err(_) => Err(Failure::PersistenceTransient(format!(
                "timed out after {:?}",
                self.opt.persist_timeout
            ))),
        }
    }
}

fn persist(
    store: &Store,
    job: &RehostJob,
    archived: Archived,
    now: SystemTime,
) -> Result<Outcome, Failure> {
    use git_ipfs_rehost_store::Error;

    let mut conn = store.connection().map_err(transient)?;
    let url = job.locator.canonical_url();
    let archive = NewArchive {
        revision: job.revision.clone(),
        tag: job.tag.clone(),
        content_id: archived.content_id,
        retrieval_url: archived.retrieval_url,
        size: archived.size,
        committed_date: job.committed_date,
    };

    // Each branch is a single transaction that re-checks its preconditions,
    // so a concurrent writer shows up as one of the errors handled below.
    let result = match conn.find_repository_by_url(&url).map_err(transient)? {
        None => conn
            .create_repository(
                &NewRepository {
                    host: job.locator.host().to_string(),
                    owner: job.locator.owner().to_string(),
                    name: job.locator.name().to_string(),
                    url: url.clone(),
                    is_fork: job.is_fork,
                },
                &archive,
                now,
            )
            .and_then(|repository| {
                repository
                    .archive_for_revision(&job.revision)
                    .cloned()
                    .ok_or(Error::NoArchive {
                        repository_id: repository.id,
                        revision: job.revision.clone(),
                    })
            })
            .map(|archive| (archive, Persisted::Created)),
        Some(repository)
            if job.is_replace && repository.archive_for_revision(&job.revision).is_some() =>
        {
            conn.replace_archive(repository.id, &job.revision, &archive, now)
                .map(|archive| (archive, Persisted::Replaced))
        }
        Some(repository) => conn
            .append_archive(repository.id, &archive, now)
            .map(|archive| (archive, Persisted::Appended)),
    };

    match result {
        Ok((archive, persisted)) => Ok(Outcome { archive, persisted }),
        Err(Error::DuplicateContent { existing }) => {
            log::warn!(
                "content {} from {} is already archived for repository {} at {}",
                &existing.content_id,
                &url,
                existing.repository_id,
                &existing.revision
            );
            Ok(Outcome {
                archive: existing,
                persisted: Persisted::DuplicateContent,
            })
        }
        Err(Error::DuplicateRevision { existing }) => {
            log::info!("{} at {} was archived concurrently", &url, &existing.revision);
            Ok(Outcome {
                archive: existing,
                persisted: Persisted::AlreadyArchived,
            })
        }
        Err(e) => Err(transient(e)),
    }
}

fn transient(e: git_ipfs_rehost_store::Error) -> Failure {
    Failure::PersistenceTransient(e.to_string())
}
