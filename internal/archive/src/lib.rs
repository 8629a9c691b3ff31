//! A local content-addressed store for extracted repositories.
//!
//! Archiving a directory digests it into a content ID and copies it into the
//! store under that ID. Identical trees share an ID, and therefore a single
//! copy.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use structopt::StructOpt;

mod digest;

mod error;
pub use error::Error;

// Command line options that are required by the [`Archiver`].
//
// These should be injected into the global `StructOpt` implementation using the
// `flatten` attribute.
#[derive(Clone, Debug, StructOpt)]
pub struct Opt {
    #[structopt(
        long,
        env = "REHOST_ARCHIVE_ROOT",
        default_value = "archives",
        parse(from_os_str),
        help = "directory holding archived repositories, one per content ID"
    )]
    archive_root: PathBuf,

    #[structopt(
        long,
        env = "REHOST_GATEWAY",
        default_value = "http://127.0.0.1:8080/archives",
        help = "base URL the archive root is served from"
    )]
    gateway: String,
}

/// The result of archiving a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archived {
    pub content_id: String,
    pub size: u64,
    pub retrieval_url: String,
}

#[derive(Debug, Clone)]
pub struct Archiver {
    root: Arc<PathBuf>,
    gateway: Arc<String>,
}

impl Archiver {
    pub fn new<P>(root: P, gateway: &str) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            root: Arc::new(root.as_ref().to_path_buf()),
            gateway: Arc::new(gateway.trim_end_matches('/').to_string()),
        }
    }

    pub fn from_opt(opt: &Opt) -> Self {
        Self::new(&opt.archive_root, &opt.gateway)
    }

    /// Archives the directory at `path`.
    ///
    /// This is blocking, and should be run on a blocking thread from async
    /// code.
    pub fn archive(&self, path: &Path) -> Result<Archived, Error> {
        if !path.is_dir() {
            return Err(Error::NotADirectory(path.to_path_buf()));
        }

        let digest = digest::digest(path)?;
        log::debug!(
            "{} digests to {} ({} bytes)",
            path.display(),
            &digest.content_id,
            digest.size
        );

        let dest = self.root.join(&digest.content_id);
        if dest.exists() {
            log::info!("content {} is already stored", &digest.content_id);
        } else {
            self.store(path, &dest)?;
            log::info!("stored {} as {}", path.display(), &digest.content_id);
        }

        Ok(Archived {
            retrieval_url: self.retrieval_url(&digest.content_id),
            content_id: digest.content_id,
            size: digest.size,
        })
    }

    pub fn retrieval_url(&self, content_id: &str) -> String {
        format!("{}/{}", self.gateway, content_id)
    }

    // Copies into a temporary directory inside the root first, so the content
    // ID only ever names a complete tree.
    fn store(&self, src: &Path, dest: &Path) -> Result<(), Error> {
        fs::create_dir_all(self.root.as_path())?;
        let incoming = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempdir_in(self.root.as_path())?;

        copy_tree(src, incoming.path())?;

        match fs::rename(incoming.path(), dest) {
            Ok(()) => Ok(()),
            // Somebody else stored the same content first; theirs is as good
            // as ours.
            Err(e) if dest.is_dir() => {
                log::debug!("lost race storing {}: {}", dest.display(), e);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), Error> {
    for entry in digest::walk(src) {
        let entry = entry?;
        let target = dest.join(digest::relative_path(src, entry.path())?);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
