use thiserror::Error;

/// Possible errors from running git.
#[derive(Debug, Error)]
pub enum Error {
    #[error("running {command} failed with {status}:\n{stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{url} has no commits")]
    EmptyRepository { url: String },

    #[error("invalid working directory name {0:?}")]
    InvalidWorkDirName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cannot parse git output line {0:?}")]
    Parse(String),

    #[error("{0}")]
    Preflight(crate::preflight::Error),

    #[error("revision {revision} does not exist in {url}")]
    NoRevision { url: String, revision: String },

    #[error("tag {tag} does not exist in {url}")]
    NoTag { url: String, tag: String },

    #[error("error spawning git: {0:?}")]
    Spawn(std::io::Error),
}

// Fragments of git's stderr that mean the thing we asked for isn't there,
// rather than that we failed to reach it. Anything requiring credentials is
// treated as absent, since we only ever clone anonymously.
const NOT_FOUND_MARKERS: &[&str] = &[
    "repository not found",
    "does not appear to be a git repository",
    "could not find remote branch",
    "couldn't find remote ref",
    "unknown revision",
    "could not read username",
];

// Pairs of fragments that only mean "absent" when they appear together, as in
// "repository 'https://...' not found".
const NOT_FOUND_PAIRS: &[(&str, &str)] = &[
    ("repository '", "' not found"),
    ("remote branch ", " not found in upstream"),
];

impl Error {
    /// Returns true if the error means the repository, revision or tag does
    /// not exist upstream. Retrying won't help.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::EmptyRepository { .. } | Self::NoRevision { .. } | Self::NoTag { .. } => true,
            Self::Command { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                NOT_FOUND_MARKERS
                    .iter()
                    .any(|marker| stderr.contains(marker))
                    || NOT_FOUND_PAIRS
                        .iter()
                        .any(|(start, end)| match stderr.find(start) {
                            Some(at) => stderr[at + start.len()..].contains(end),
                            None => false,
                        })
            }
            _ => false,
        }
    }
}
