//! Types mapping to the database tables.

use std::{fmt::Display, str::FromStr, time::SystemTime};

use derive_more::{Display, From, Into};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;

use crate::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct RepositoryID(i64);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct ArchiveID(i64);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct JobID(i64);

impl FromStr for JobID {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A repository record, along with every archive taken of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: RepositoryID,
    pub host: String,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub is_fork: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Ordered by committed date, then by insertion order.
    pub archives: Vec<Archive>,
}

impl Repository {
    pub fn archive_for_revision(&self, revision: &str) -> Option<&Archive> {
        self.archives
            .iter()
            .find(|archive| archive.revision == revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub id: ArchiveID,
    pub repository_id: RepositoryID,
    pub revision: String,
    pub tag: Option<String>,
    pub content_id: String,
    pub retrieval_url: String,
    pub size: u64,
    pub committed_date: Option<SystemTime>,
    pub archived_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRepository {
    pub host: String,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub is_fork: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArchive {
    pub revision: String,
    pub tag: Option<String>,
    pub content_id: String,
    pub retrieval_url: String,
    pub size: u64,
    pub committed_date: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    /// Failed with a transient error; will be retried once `not_before` has
    /// passed.
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "dead" => Self::Dead,
            other => return Err(Error::UnknownJobState(other.to_string())),
        })
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|_| FromSqlError::InvalidType)
    }
}

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobID,
    pub repository_url: String,
    pub state: JobState,
    pub payload: Vec<u8>,
    /// Number of times the job has been claimed, including the current
    /// attempt if it is running.
    pub attempts: u32,
    pub not_before: SystemTime,
    pub lease_expires_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub result_archive_id: Option<ArchiveID>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}
