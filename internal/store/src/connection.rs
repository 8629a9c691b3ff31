use rusqlite::{OptionalExtension, Row};

use crate::{sql, Archive, ArchiveID, Job, JobID, RepositoryID};

/// A single connection to the store.
///
/// Connections are cheap to open and are not shared between threads: callers
/// are expected to open one per unit of work via [`crate::Store::connection`].
#[derive(Debug)]
pub struct Connection {
    pub(crate) conn: rusqlite::Connection,
}

impl Connection {
    pub(crate) fn new(conn: rusqlite::Connection) -> Self {
        Self { conn }
    }
}

pub(crate) const ARCHIVE_COLUMNS: &str = "
    id,
    repository_id,
    revision,
    tag,
    content_id,
    retrieval_url,
    size,
    committed_date,
    archived_at
";

// Archives are listed oldest first by the time of the commit they capture;
// archives without a committed date fall back to when they were taken.
pub(crate) const ARCHIVE_ORDER: &str = "COALESCE(committed_date, archived_at), id";

pub(crate) fn archive_from_row(row: &Row) -> rusqlite::Result<Archive> {
    Ok(Archive {
        id: ArchiveID::from(row.get::<_, i64>(0)?),
        repository_id: RepositoryID::from(row.get::<_, i64>(1)?),
        revision: row.get(2)?,
        tag: row.get(3)?,
        content_id: row.get(4)?,
        retrieval_url: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
        committed_date: sql::into_opt_time(row.get(7)?),
        archived_at: sql::into_time(row.get(8)?),
    })
}

pub(crate) fn archive_by_id(
    conn: &rusqlite::Connection,
    id: ArchiveID,
) -> rusqlite::Result<Option<Archive>> {
    conn.prepare_cached(&format!(
        "SELECT {} FROM archives WHERE id = ?",
        ARCHIVE_COLUMNS
    ))?
    .query_row([i64::from(id)], archive_from_row)
    .optional()
}

pub(crate) fn archive_by_content_id(
    conn: &rusqlite::Connection,
    content_id: &str,
) -> rusqlite::Result<Option<Archive>> {
    conn.prepare_cached(&format!(
        "SELECT {} FROM archives WHERE content_id = ?",
        ARCHIVE_COLUMNS
    ))?
    .query_row([content_id], archive_from_row)
    .optional()
}

pub(crate) fn archive_by_revision(
    conn: &rusqlite::Connection,
    repository_id: RepositoryID,
    revision: &str,
) -> rusqlite::Result<Option<Archive>> {
    conn.prepare_cached(&format!(
        "SELECT {} FROM archives WHERE repository_id = ? AND revision = ?",
        ARCHIVE_COLUMNS
    ))?
    .query_row(
        rusqlite::params![i64::from(repository_id), revision],
        archive_from_row,
    )
    .optional()
}

pub(crate) const JOB_COLUMNS: &str = "
    id,
    repository_url,
    state,
    payload,
    attempts,
    not_before,
    lease_expires_at,
    last_error,
    result_archive_id,
    created_at,
    updated_at
";

pub(crate) fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get::<_, i64>(0)?.into(),
        repository_url: row.get(1)?,
        state: row.get(2)?,
        payload: row.get(3)?,
        attempts: row.get::<_, i64>(4)? as u32,
        not_before: sql::into_time(row.get(5)?),
        lease_expires_at: sql::into_opt_time(row.get(6)?),
        last_error: row.get(7)?,
        result_archive_id: row.get::<_, Option<i64>>(8)?.map(ArchiveID::from),
        created_at: sql::into_time(row.get(9)?),
        updated_at: sql::into_time(row.get(10)?),
    })
}

pub(crate) fn job_by_id(conn: &rusqlite::Connection, id: JobID) -> rusqlite::Result<Option<Job>> {
    conn.prepare_cached(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))?
        .query_row([i64::from(id)], job_from_row)
        .optional()
}
