use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("{path} is outside of {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
}
