//! Durable storage for `git-ipfs-rehost`: the repository catalog and the job
//! ledger, both kept in a single SQLite database.
//!
//! Every write that has to respect a uniqueness invariant is performed inside
//! an immediate transaction, so the check and the insert are atomic even when
//! several processes share the database.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use structopt::StructOpt;

mod embedded {
    refinery::embed_migrations!("./src/migrations");
}

mod catalog;

mod connection;
pub use connection::Connection;

mod error;
pub use error::Error;

mod jobs;

mod sql;

mod types;
pub use types::*;

// Command line options that are required by the [`Store`].
//
// These should be injected into the global `StructOpt` implementation using the
// `flatten` attribute.
#[derive(Clone, Debug, StructOpt)]
pub struct Opt {
    #[structopt(
        long,
        env = "REHOST_DATABASE",
        default_value = "rehost.db",
        parse(from_os_str),
        help = "path to the SQLite database holding the catalog and job queue"
    )]
    database: PathBuf,

    #[structopt(
        long,
        default_value = "10s",
        parse(try_from_str = parse_duration::parse::parse),
        help = "how long to wait for another process to release the database"
    )]
    busy_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Store {
    path: Arc<PathBuf>,
    busy_timeout: Duration,
}

impl Store {
    pub fn new<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::with_busy_timeout(path, Duration::from_secs(10))
    }

    pub fn from_opt(opt: &Opt) -> Result<Self, Error> {
        Self::with_busy_timeout(&opt.database, opt.busy_timeout)
    }

    fn with_busy_timeout<P>(path: P, busy_timeout: Duration) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let store = Self {
            path: Arc::new(path.as_ref().to_path_buf()),
            busy_timeout,
        };

        // Apply the migrations now so we don't have to do it on each new
        // connection.
        embedded::migrations::runner().run(&mut store.open_connection()?)?;
        log::debug!("store ready at {}", store.path.display());

        Ok(store)
    }

    pub fn connection(&self) -> Result<Connection, Error> {
        Ok(Connection::new(self.open_connection()?))
    }

    fn open_connection(&self) -> rusqlite::Result<rusqlite::Connection> {
        let conn = rusqlite::Connection::open(self.path.as_path())?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        Ok(conn)
    }
}
