//! The repository catalog: one record per canonical repository URL, each with
//! an ordered list of archives.
//!
//! The write operations are conditional inserts and updates. They check the
//! relevant uniqueness invariant inside an immediate transaction and report a
//! violation as a typed error carrying the row that already exists, so callers
//! can converge on it instead of retrying blindly.

use std::time::SystemTime;

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::{
    connection::{
        archive_by_content_id, archive_by_id, archive_by_revision, archive_from_row,
        ARCHIVE_COLUMNS, ARCHIVE_ORDER,
    },
    sql, Archive, ArchiveID, Connection, Error, NewArchive, NewRepository, Repository,
    RepositoryID,
};

impl Connection {
    pub fn find_repository_by_url(&mut self, url: &str) -> Result<Option<Repository>, Error> {
        match repository_id_by_url(&self.conn, url)? {
            Some(id) => self.get_repository(id),
            None => Ok(None),
        }
    }

    pub fn get_repository(&mut self, id: RepositoryID) -> Result<Option<Repository>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "
            SELECT
                id,
                host,
                owner,
                name,
                url,
                is_fork,
                created_at,
                updated_at
            FROM
                repositories
            WHERE
                id = ?
            ",
        )?;

        let repository = stmt
            .query_row([i64::from(id)], |row| {
                Ok(Repository {
                    id: RepositoryID::from(row.get::<_, i64>(0)?),
                    host: row.get(1)?,
                    owner: row.get(2)?,
                    name: row.get(3)?,
                    url: row.get(4)?,
                    is_fork: row.get(5)?,
                    created_at: sql::into_time(row.get(6)?),
                    updated_at: sql::into_time(row.get(7)?),
                    archives: Vec::new(),
                })
            })
            .optional()?;
        drop(stmt);

        match repository {
            Some(mut repository) => {
                repository.archives = self.get_archives(id)?;
                Ok(Some(repository))
            }
            None => Ok(None),
        }
    }

    pub fn get_archives(&mut self, repository_id: RepositoryID) -> Result<Vec<Archive>, Error> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM archives WHERE repository_id = ? ORDER BY {}",
            ARCHIVE_COLUMNS, ARCHIVE_ORDER
        ))?;

        let archives: Result<Vec<Archive>, rusqlite::Error> = stmt
            .query_map([i64::from(repository_id)], archive_from_row)?
            .collect();

        Ok(archives?)
    }

    pub fn get_archive(&mut self, id: ArchiveID) -> Result<Option<Archive>, Error> {
        Ok(archive_by_id(&self.conn, id)?)
    }

    pub fn find_archive_by_content_id(&mut self, content_id: &str) -> Result<Option<Archive>, Error> {
        Ok(archive_by_content_id(&self.conn, content_id)?)
    }

    /// Returns the most recent archive of the repository, by committed date.
    pub fn latest_archive(&mut self, repository_id: RepositoryID) -> Result<Option<Archive>, Error> {
        Ok(self
            .conn
            .prepare_cached(&format!(
                "
                SELECT {} FROM archives
                WHERE repository_id = ?
                ORDER BY COALESCE(committed_date, archived_at) DESC, id DESC
                LIMIT 1
                ",
                ARCHIVE_COLUMNS
            ))?
            .query_row([i64::from(repository_id)], archive_from_row)
            .optional()?)
    }

    /// Creates a repository record whose archive list holds exactly
    /// `archive`.
    ///
    /// Content identity is checked before the URL: if the content is already
    /// archived anywhere, the caller gets [`Error::DuplicateContent`] even if
    /// the repository also exists.
    pub fn create_repository(
        &mut self,
        repository: &NewRepository,
        archive: &NewArchive,
        now: SystemTime,
    ) -> Result<Repository, Error> {
        let txn = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = archive_by_content_id(&txn, &archive.content_id)? {
            return Err(Error::DuplicateContent { existing });
        }
        if let Some(existing) = repository_id_by_url(&txn, &repository.url)? {
            return Err(Error::DuplicateUrl {
                url: repository.url.clone(),
                existing,
            });
        }

        let id = txn
            .prepare_cached(
                "
                INSERT INTO
                    repositories
                (host, owner, name, url, is_fork, created_at, updated_at)
                VALUES
                (?, ?, ?, ?, ?, ?, ?)
                ",
            )?
            .insert(params![
                repository.host,
                repository.owner,
                repository.name,
                repository.url,
                repository.is_fork,
                sql::from_time(&now),
                sql::from_time(&now),
            ])?;
        let id = RepositoryID::from(id);
        insert_archive(&txn, id, archive, &now)?;
        txn.commit()?;

        log::debug!("created repository {} for {}", id, &repository.url);
        self.get_repository(id)?.ok_or(Error::NoRepository(id))
    }

    /// Appends a new archive to an existing repository record.
    pub fn append_archive(
        &mut self,
        repository_id: RepositoryID,
        archive: &NewArchive,
        now: SystemTime,
    ) -> Result<Archive, Error> {
        let txn = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !repository_exists(&txn, repository_id)? {
            return Err(Error::NoRepository(repository_id));
        }
        if let Some(existing) = archive_by_revision(&txn, repository_id, &archive.revision)? {
            return Err(Error::DuplicateRevision { existing });
        }
        if let Some(existing) = archive_by_content_id(&txn, &archive.content_id)? {
            return Err(Error::DuplicateContent { existing });
        }

        let id = insert_archive(&txn, repository_id, archive, &now)?;
        touch_repository(&txn, repository_id, &now)?;
        let archive = archive_by_id(&txn, id)?;
        txn.commit()?;

        log::debug!(
            "appended archive {} to repository {}",
            id,
            repository_id
        );
        archive.ok_or(Error::NoArchiveForID(id))
    }

    /// Replaces the archive of `revision` in place, keeping its ID.
    ///
    /// Re-archiving identical content is a no-op update; content that is
    /// archived under any other entry is reported as
    /// [`Error::DuplicateContent`] and leaves the target untouched.
    pub fn replace_archive(
        &mut self,
        repository_id: RepositoryID,
        revision: &str,
        archive: &NewArchive,
        now: SystemTime,
    ) -> Result<Archive, Error> {
        let txn = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let target = match archive_by_revision(&txn, repository_id, revision)? {
            Some(target) => target,
            None => {
                return Err(Error::NoArchive {
                    repository_id,
                    revision: revision.to_string(),
                })
            }
        };
        if let Some(existing) = archive_by_content_id(&txn, &archive.content_id)? {
            if existing.id != target.id {
                return Err(Error::DuplicateContent { existing });
            }
        }

        txn.prepare_cached(
            "
            UPDATE
                archives
            SET
                tag = ?,
                content_id = ?,
                retrieval_url = ?,
                size = ?,
                committed_date = ?,
                archived_at = ?
            WHERE
                id = ?
            ",
        )?
        .execute(params![
            archive.tag,
            archive.content_id,
            archive.retrieval_url,
            archive.size as i64,
            sql::from_opt_time(archive.committed_date.as_ref()),
            sql::from_time(&now),
            i64::from(target.id),
        ])?;
        touch_repository(&txn, repository_id, &now)?;
        let replaced = archive_by_id(&txn, target.id)?;
        txn.commit()?;

        log::debug!(
            "replaced archive {} of repository {} at {}",
            target.id,
            repository_id,
            revision
        );
        replaced.ok_or(Error::NoArchiveForID(target.id))
    }
}

fn repository_id_by_url(
    conn: &rusqlite::Connection,
    url: &str,
) -> rusqlite::Result<Option<RepositoryID>> {
    conn.prepare_cached("SELECT id FROM repositories WHERE url = ?")?
        .query_row([url], |row| row.get::<_, i64>(0))
        .optional()
        .map(|id| id.map(RepositoryID::from))
}

fn repository_exists(conn: &rusqlite::Connection, id: RepositoryID) -> rusqlite::Result<bool> {
    Ok(conn
        .prepare_cached("SELECT 1 FROM repositories WHERE id = ?")?
        .query_row([i64::from(id)], |_row| Ok(()))
        .optional()?
        .is_some())
}

fn insert_archive(
    conn: &rusqlite::Connection,
    repository_id: RepositoryID,
    archive: &NewArchive,
    now: &SystemTime,
) -> rusqlite::Result<ArchiveID> {
    conn.prepare_cached(
        "
        INSERT INTO
            archives
        (repository_id, revision, tag, content_id, retrieval_url, size, committed_date, archived_at)
        VALUES
        (?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )?
    .insert(params![
        i64::from(repository_id),
        archive.revision,
        archive.tag,
        archive.content_id,
        archive.retrieval_url,
        archive.size as i64,
        sql::from_opt_time(archive.committed_date.as_ref()),
        sql::from_time(now),
    ])
    .map(ArchiveID::from)
}

fn touch_repository(
    conn: &rusqlite::Connection,
    id: RepositoryID,
    now: &SystemTime,
) -> rusqlite::Result<()> {
    conn.prepare_cached("UPDATE repositories SET updated_at = ? WHERE id = ?")?
        .execute(params![sql::from_time(now), i64::from(id)])?;

    Ok(())
}
