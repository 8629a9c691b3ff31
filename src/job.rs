use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::locator::RepoLocator;

/// A unit of rehost work, as persisted in the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct RehostJob {
    pub(crate) locator: RepoLocator,
    pub(crate) revision: String,
    pub(crate) tag: Option<String>,
    pub(crate) branch: Option<String>,
    pub(crate) committed_date: Option<SystemTime>,
    pub(crate) is_fork: bool,

    /// Overwrite the archive entry for this revision instead of adding one.
    pub(crate) is_replace: bool,
}

impl RehostJob {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::Host;

    #[test]
    fn test_decode_garbage() {
        assert!(RehostJob::decode(b"").is_err());
        assert!(RehostJob::decode(b"\xff\xff\xff").is_err());
    }

    #[test]
    fn test_payload() -> anyhow::Result<()> {
        let job = RehostJob {
            locator: RepoLocator::new(Host::GitLab, "alice", "tool")?,
            revision: "abc123".into(),
            tag: Some("v1.0".into()),
            branch: None,
            committed_date: Some(SystemTime::UNIX_EPOCH),
            is_fork: true,
            is_replace: false,
        };

        assert_eq!(RehostJob::decode(&job.encode()?)?, job);
        Ok(())
    }
}
