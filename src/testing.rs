//! Test doubles for the pipeline's collaborators.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use git_ipfs_rehost_archive::{Archived, Archiver};
use git_ipfs_rehost_store::{NewArchive, NewRepository, Repository, Store};
use tempfile::TempDir;

use crate::{
    collaborator::{
        ExtractError, ExtractRequest, Extractor, Resolution, ResolveError, Resolver, UploadError,
        Uploader,
    },
    decision::DecisionEngine,
    job::RehostJob,
    locator::{Host, RepoLocator},
    pipeline::{self, Pipeline},
    queue::{Queue, RetryPolicy, Runner},
    submission::Submitter,
};

pub(crate) const COMMITTED: SystemTime = UNIX_EPOCH;
pub(crate) const GATEWAY: &str = "https://gateway.test/archives";

pub(crate) fn locator(owner: &str, name: &str) -> RepoLocator {
    RepoLocator::new(Host::GitHub, owner, name).unwrap()
}

pub(crate) fn job(locator: &RepoLocator, revision: &str) -> RehostJob {
    RehostJob {
        locator: locator.clone(),
        revision: revision.into(),
        tag: None,
        branch: None,
        committed_date: None,
        is_fork: false,
        is_replace: false,
    }
}

#[derive(Debug, Clone, Default)]
struct Remote {
    head: String,
    tags: BTreeMap<String, String>,
    is_fork: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FakeResolver {
    remotes: Mutex<HashMap<String, Remote>>,
    unavailable: AtomicBool,
}

impl FakeResolver {
    /// Moves the remote's HEAD, creating the remote if needed.
    pub(crate) fn push(&self, locator: &RepoLocator, head: &str) {
        self.remotes
            .lock()
            .unwrap()
            .entry(locator.canonical_url())
            .or_default()
            .head = head.to_string();
    }

    pub(crate) fn tag(&self, locator: &RepoLocator, tag: &str, revision: &str) {
        self.remotes
            .lock()
            .unwrap()
            .entry(locator.canonical_url())
            .or_default()
            .tags
            .insert(tag.to_string(), revision.to_string());
    }

    pub(crate) fn fork(&self, locator: &RepoLocator) {
        self.remotes
            .lock()
            .unwrap()
            .entry(locator.canonical_url())
            .or_default()
            .is_fork = true;
    }

    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve(
        &self,
        locator: &RepoLocator,
        tag: Option<&str>,
    ) -> Result<Resolution, ResolveError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ResolveError::Upstream("503 Service Unavailable".into()));
        }

        let url = locator.canonical_url();
        let remote = match self.remotes.lock().unwrap().get(&url) {
            Some(remote) => remote.clone(),
            None => return Err(ResolveError::NotFound(url)),
        };

        let (revision, tag) = match tag {
            Some(tag) => match remote.tags.get(tag) {
                Some(revision) => (revision.clone(), Some(tag.to_string())),
                None => return Err(ResolveError::NotFound(format!("{} tag {}", url, tag))),
            },
            None => {
                let tag = remote
                    .tags
                    .iter()
                    .filter(|(_tag, revision)| **revision == remote.head)
                    .map(|(tag, _revision)| tag.clone())
                    .last();
                (remote.head.clone(), tag)
            }
        };

        Ok(Resolution {
            committed_date: if revision == remote.head {
                Some(COMMITTED)
            } else {
                None
            },
            revision,
            tag,
            is_fork: remote.is_fork,
        })
    }
}

/// Writes a small tree derived from the requested revision. The repository
/// itself doesn't feed into the content, so two repositories at the same
/// revision produce the same content ID.
#[derive(Debug)]
pub(crate) struct FakeExtractor {
    root: PathBuf,
    failures: Mutex<VecDeque<ExtractError>>,
    generations: Mutex<HashMap<String, u32>>,
    unstable: AtomicBool,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            root,
            failures: Mutex::new(VecDeque::new()),
            generations: Mutex::new(HashMap::new()),
            unstable: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn fail_next(&self, err: ExtractError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Changes what the repository's revisions extract to, as if history had
    /// been rewritten upstream.
    pub(crate) fn rewrite(&self, locator: &RepoLocator) {
        *self
            .generations
            .lock()
            .unwrap()
            .entry(locator.canonical_url())
            .or_default() += 1;
    }

    /// Makes every extraction produce different content, like a remote with
    /// non-reproducible archives.
    pub(crate) fn set_unstable(&self) {
        self.unstable.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<PathBuf, ExtractError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let generation = self
            .generations
            .lock()
            .unwrap()
            .get(&request.locator.canonical_url())
            .copied()
            .unwrap_or_default();

        let path = git_ipfs_rehost_process::prepare_work_dir(
            &self.root,
            &request.locator.work_dir_name(),
        )
        .await
        .map_err(|e| ExtractError::Transient(e.to_string()))?;

        let write = |name: &str, content: String| {
            std::fs::write(path.join(name), content)
                .map_err(|e| ExtractError::Transient(e.to_string()))
        };
        std::fs::create_dir_all(&path).map_err(|e| ExtractError::Transient(e.to_string()))?;
        write("HEAD", format!("{}\n", request.revision))?;
        write("generation", generation.to_string())?;
        if let Some(tag) = request.tag {
            write("TAG", tag.to_string())?;
        }
        if self.unstable.load(Ordering::SeqCst) {
            write("extraction", call.to_string())?;
        }

        Ok(path)
    }
}

/// Archives into a real [`Archiver`], with injectable failures.
#[derive(Debug)]
pub(crate) struct ScriptedUploader {
    archiver: Archiver,
    failures: Mutex<VecDeque<UploadError>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedUploader {
    pub(crate) fn new(archiver: Archiver) -> Self {
        Self {
            archiver,
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
        }
    }

    pub(crate) fn fail_next(&self, err: UploadError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub(crate) fn stall(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Uploader for ScriptedUploader {
    async fn archive(&self, path: &Path) -> Result<Archived, UploadError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(err) => Err(err),
            None => Uploader::archive(&self.archiver, path).await,
        }
    }
}

pub(crate) struct Harness {
    // Held for its Drop.
    _dir: TempDir,
    dir: PathBuf,
    pub(crate) store: Store,
    pub(crate) resolver: Arc<FakeResolver>,
    pub(crate) extractor: Arc<FakeExtractor>,
    pub(crate) uploader: Arc<ScriptedUploader>,
}

impl Harness {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().to_path_buf();

        Ok(Self {
            store: Store::new(dir.join("rehost.db"))?,
            resolver: Arc::new(FakeResolver::default()),
            extractor: Arc::new(FakeExtractor::new(dir.join("work"))),
            uploader: Arc::new(ScriptedUploader::new(Archiver::new(
                dir.join("archives"),
                GATEWAY,
            ))),
            _dir: tmp,
            dir,
        })
    }

    /// An extractor with its own working directory, as another host would
    /// have.
    pub(crate) fn extractor_on(&self, host: &str) -> Arc<FakeExtractor> {
        Arc::new(FakeExtractor::new(self.dir.join(host)))
    }

    pub(crate) fn engine(&self) -> DecisionEngine<FakeResolver> {
        DecisionEngine::new(self.resolver.clone(), self.store.clone())
    }

    pub(crate) fn queue(&self) -> Queue {
        Queue::new(self.store.clone())
    }

    pub(crate) fn submitter(&self) -> Submitter<FakeResolver> {
        Submitter::new(self.engine(), self.queue())
    }

    pub(crate) fn pipeline(&self) -> Pipeline<FakeExtractor, ScriptedUploader> {
        self.pipeline_with(self.extractor.clone(), pipeline::Opt::default())
    }

    pub(crate) fn pipeline_with(
        &self,
        extractor: Arc<FakeExtractor>,
        opt: pipeline::Opt,
    ) -> Pipeline<FakeExtractor, ScriptedUploader> {
        Pipeline::new(extractor, self.uploader.clone(), self.store.clone(), opt)
    }

    pub(crate) fn runner(&self, policy: RetryPolicy) -> Runner<FakeExtractor, ScriptedUploader> {
        self.runner_with(policy, Duration::from_secs(60))
    }

    pub(crate) fn runner_with(
        &self,
        policy: RetryPolicy,
        lease: Duration,
    ) -> Runner<FakeExtractor, ScriptedUploader> {
        Runner::new(
            Arc::new(self.pipeline()),
            self.store.clone(),
            policy,
            lease,
            Duration::from_millis(10),
        )
    }

    pub(crate) fn repository(&self, locator: &RepoLocator) -> anyhow::Result<Option<Repository>> {
        Ok(self
            .store
            .connection()?
            .find_repository_by_url(&locator.canonical_url())?)
    }

    /// Records an archive of the revision directly in the catalog.
    pub(crate) fn catalog(
        &self,
        locator: &RepoLocator,
        revision: &str,
    ) -> anyhow::Result<Repository> {
        let mut conn = self.store.connection()?;
        let content_id = format!("b3{}{}", locator.name(), revision);
        let archive = NewArchive {
            revision: revision.to_string(),
            tag: None,
            retrieval_url: format!("{}/{}", GATEWAY, &content_id),
            content_id,
            size: 1,
            committed_date: None,
        };

        let now = SystemTime::now();
        let repository = match conn.find_repository_by_url(&locator.canonical_url())? {
            Some(repository) => {
                conn.append_archive(repository.id, &archive, now)?;
                repository
            }
            None => conn.create_repository(
                &NewRepository {
                    host: locator.host().to_string(),
                    owner: locator.owner().to_string(),
                    name: locator.name().to_string(),
                    url: locator.canonical_url(),
                    is_fork: false,
                },
                &archive,
                now,
            )?,
        };

        Ok(conn
            .get_repository(repository.id)?
            .unwrap_or(repository))
    }
}
