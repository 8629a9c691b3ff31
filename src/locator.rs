use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The hosts we know how to rehost from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub(crate) enum Host {
    GitHub,
    GitLab,
}

impl Host {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github.com",
            Self::GitLab => "gitlab.com",
        }
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Host {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github.com" => Ok(Self::GitHub),
            "gitlab.com" => Ok(Self::GitLab),
            _ => Err(Error::UnsupportedHost(s.to_string())),
        }
    }
}

/// Identifies a source repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub(crate) struct RepoLocator {
    host: Host,
    owner: String,
    name: String,
}

impl RepoLocator {
    pub(crate) fn new(host: Host, owner: &str, name: &str) -> Result<Self, Error> {
        if !is_valid_component(owner) {
            return Err(Error::InvalidOwner(owner.to_string()));
        }
        if !is_valid_component(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        if name.ends_with(".git") {
            return Err(Error::GitSuffix(name.to_string()));
        }

        Ok(Self {
            host,
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub(crate) fn host(&self) -> Host {
        self.host
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The normalised URL that uniquely identifies the repository in the
    /// catalog.
    pub(crate) fn canonical_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.owner, self.name)
    }

    /// The name of the directory this repository is extracted into. `+`
    /// never appears in an owner or a name, so no two repositories share
    /// one.
    pub(crate) fn work_dir_name(&self) -> String {
        format!("{}+{}+{}.git", self.host, self.owner, self.name)
    }
}

impl Display for RepoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.host, self.owner, self.name)
    }
}

fn is_valid_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("repository name cannot end with .git: {0}")]
    GitSuffix(String),

    #[error("invalid repository name {0:?}")]
    InvalidName(String),

    #[error("invalid repository owner {0:?}")]
    InvalidOwner(String),

    #[error("unsupported host {0:?}; supported hosts are github.com and gitlab.com")]
    UnsupportedHost(String),
}
