//! Deterministic digests of directory trees.
//!
//! The digest covers the kind, relative path and content of every entry, plus
//! the executable bit of regular files. Timestamps, ownership and the name of
//! the root directory itself do not contribute, so the same tree extracted
//! twice digests identically.

use std::{
    fs::File,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::Error;

/// Prefix identifying the digest algorithm in content IDs.
pub(crate) const CONTENT_ID_PREFIX: &str = "b3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Digest {
    pub(crate) content_id: String,

    /// Total size of the regular files in the tree, in bytes.
    pub(crate) size: u64,
}

pub(crate) fn digest(root: &Path) -> Result<Digest, Error> {
    let mut hasher = blake3::Hasher::new();
    let mut size = 0;

    for entry in walk(root) {
        let entry = entry?;
        let relative = relative_path(root, entry.path())?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            hasher.update(b"dir\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            hasher.update(b"link\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else {
            let executable = entry.metadata()?.permissions().mode() & 0o111 != 0;
            hasher.update(b"file\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update(if executable { b"x" } else { b"-" });

            // Length-prefix the content so that a file's bytes can never be
            // mistaken for the entries that follow it.
            let len = entry.metadata()?.len();
            hasher.update(&len.to_le_bytes());
            let copied = io::copy(&mut File::open(entry.path())?, &mut hasher)?;
            if copied != len {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} changed while it was being read", entry.path().display()),
                )));
            }
            size += copied;
        }
    }

    Ok(Digest {
        content_id: format!("{}{}", CONTENT_ID_PREFIX, hex::encode(hasher.finalize().as_bytes())),
        size,
    })
}

/// Walks everything under `root`, excluding `root` itself, in a stable order.
pub(crate) fn walk(root: &Path) -> walkdir::IntoIter {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
}

pub(crate) fn relative_path(root: &Path, path: &Path) -> Result<String, Error> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::OutsideRoot {
            path: PathBuf::from(path),
            root: PathBuf::from(root),
        })?;

    Ok(relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}
