//! The external collaborators the rehost pipeline depends on, along with the
//! implementations backed by `git` and the local archive.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use git_ipfs_rehost_archive::{Archived, Archiver};
use git_ipfs_rehost_process::{Extract, Git};
use thiserror::Error;
use tokio::task;

use crate::locator::RepoLocator;

/// What a revision request resolves to upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub(crate) revision: String,
    pub(crate) tag: Option<String>,
    pub(crate) committed_date: Option<SystemTime>,
    pub(crate) is_fork: bool,
}

#[derive(Debug, Error)]
pub(crate) enum ResolveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

#[async_trait]
pub(crate) trait Resolver: Send + Sync {
    /// Resolves the requested tag, or the repository's current `HEAD` if no
    /// tag is given.
    async fn resolve(
        &self,
        locator: &RepoLocator,
        tag: Option<&str>,
    ) -> Result<Resolution, ResolveError>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtractRequest<'a> {
    pub(crate) locator: &'a RepoLocator,
    pub(crate) revision: &'a str,
    pub(crate) tag: Option<&'a str>,
    pub(crate) branch: Option<&'a str>,
}

#[derive(Debug, Error)]
pub(crate) enum ExtractError {
    /// The repository or revision does not exist. Retrying won't help.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Transient(String),
}

#[async_trait]
pub(crate) trait Extractor: Send + Sync {
    /// Materialises the requested revision in the repository's working
    /// directory, destroying any previous contents, and returns its path.
    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<PathBuf, ExtractError>;
}

#[derive(Debug, Error)]
#[error("{0}")]
pub(crate) struct UploadError(pub(crate) String);

#[async_trait]
pub(crate) trait Uploader: Send + Sync {
    /// Archives the directory at `path` into content-addressed storage.
    async fn archive(&self, path: &Path) -> Result<Archived, UploadError>;
}

#[async_trait]
impl Resolver for Git {
    // ls-remote can't tell us whether the repository is a fork, or when the
    // commit was made.
    async fn resolve(
        &self,
        locator: &RepoLocator,
        tag: Option<&str>,
    ) -> Result<Resolution, ResolveError> {
        let url = locator.canonical_url();
        match Git::resolve(self, &url, tag).await {
            Ok(resolved) => Ok(Resolution {
                revision: resolved.revision,
                tag: resolved.tag,
                committed_date: None,
                is_fork: false,
            }),
            Err(e) if e.is_not_found() => Err(ResolveError::NotFound(e.to_string())),
            Err(e) => Err(ResolveError::Upstream(e.to_string())),
        }
    }
}

#[async_trait]
impl Extractor for Git {
    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<PathBuf, ExtractError> {
        let url = request.locator.canonical_url();
        let work_dir_name = request.locator.work_dir_name();

        Git::extract(
            self,
            &Extract {
                url: &url,
                work_dir_name: &work_dir_name,
                revision: Some(request.revision),
                tag: request.tag,
                branch: request.branch,
            },
        )
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ExtractError::NotFound(e.to_string())
            } else {
                ExtractError::Transient(e.to_string())
            }
        })
    }
}

#[async_trait]
impl Uploader for Archiver {
    async fn archive(&self, path: &Path) -> Result<Archived, UploadError> {
        let archiver = self.clone();
        let path = path.to_path_buf();

        task::spawn_blocking(move || Archiver::archive(&archiver, &path))
            .await
            .map_err(|e| UploadError(e.to_string()))?
            .map_err(|e| UploadError(e.to_string()))
    }
}
