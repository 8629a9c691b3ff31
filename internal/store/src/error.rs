use rusqlite::ErrorCode;
use thiserror::Error;

use crate::{Archive, ArchiveID, JobID, RepositoryID};

#[derive(Debug, Error)]
pub enum Error {
    #[error("content {} is already archived as archive {}", .existing.content_id, .existing.id)]
    DuplicateContent { existing: Archive },

    #[error("revision {} is already archived for repository {}", .existing.revision, .existing.repository_id)]
    DuplicateRevision { existing: Archive },

    #[error("a repository already exists for {url} with ID {existing}")]
    DuplicateUrl { url: String, existing: RepositoryID },

    #[error("job {0} is no longer held by this attempt")]
    LeaseLost(JobID),

    #[error("repository {repository_id} has no archive for revision {revision}")]
    NoArchive {
        repository_id: RepositoryID,
        revision: String,
    },

    #[error("no archive exists with ID {0}")]
    NoArchiveForID(ArchiveID),

    #[error("no repository exists with ID {0}")]
    NoRepository(RepositoryID),

    #[error(transparent)]
    Refinery(#[from] refinery::Error),

    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),

    #[error("unknown job state {0:?}")]
    UnknownJobState(String),
}

impl Error {
    /// Returns true if the error was caused by another connection holding a
    /// lock on the database for longer than the busy timeout.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Rusqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
        )
    }
}
