//! `process` manages the `git` processes used to resolve and extract
//! repositories.

use std::{ffi::OsString, path::PathBuf, sync::Arc};

use structopt::StructOpt;

mod error;
mod extract;
mod preflight;
mod process;
mod remote;

pub use self::error::Error;
pub use self::extract::{prepare_work_dir, Extract};
pub use self::preflight::preflight;
pub use self::remote::{RemoteRefs, Resolved};

// Command line options that are required by [`Git`].
//
// These should be injected into the global `StructOpt` implementation using the
// `flatten` attribute.
#[derive(Clone, Debug, StructOpt)]
pub struct Opt {
    #[structopt(
        long = "git",
        default_value = "git",
        parse(from_os_str),
        help = "path to the git command"
    )]
    git_command: OsString,

    #[structopt(long, help = "a global Git option to add when invoking git")]
    git_global_option: Vec<String>,

    #[structopt(
        long,
        env = "REHOST_WORK_DIR",
        parse(from_os_str),
        help = "directory to extract repositories into; defaults to the system temporary directory"
    )]
    work_dir: Option<PathBuf>,
}

impl Opt {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// `Git` runs git on behalf of the rehost pipeline.
#[derive(Debug, Clone)]
pub struct Git {
    opt: Arc<Opt>,
}

impl Git {
    pub fn new(opt: Opt) -> Self {
        Self { opt: Arc::new(opt) }
    }
}
