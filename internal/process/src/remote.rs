use std::collections::BTreeMap;

use crate::{process::Invocation, Error, Git};

/// The refs a remote advertises that matter for resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRefs {
    pub head: Option<String>,

    /// Tag names mapped to the commit they point at, with annotated tags
    /// peeled.
    pub tags: BTreeMap<String, String>,
}

/// The concrete revision to archive for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub revision: String,
    pub tag: Option<String>,
}

impl RemoteRefs {
    /// Parses `git ls-remote` output.
    pub fn parse(output: &[u8]) -> Result<Self, Error> {
        let mut refs = Self::default();

        for line in String::from_utf8_lossy(output).lines() {
            if line.is_empty() {
                continue;
            }

            let (oid, name) = match line.split_once('\t') {
                Some((oid, name)) if !oid.is_empty() => (oid, name),
                _ => return Err(Error::Parse(line.to_string())),
            };

            if name == "HEAD" {
                refs.head = Some(oid.to_string());
            } else if let Some(tag) = name.strip_prefix("refs/tags/") {
                match tag.strip_suffix("^{}") {
                    // The peeled line always wins over the tag object.
                    Some(tag) => {
                        refs.tags.insert(tag.to_string(), oid.to_string());
                    }
                    None => {
                        refs.tags
                            .entry(tag.to_string())
                            .or_insert_with(|| oid.to_string());
                    }
                }
            }
        }

        Ok(refs)
    }

    /// Returns the tag pointing at `commit`. If several do, the one that sorts
    /// last is taken to be the latest.
    pub fn tag_for_commit(&self, commit: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|(_tag, oid)| oid.as_str() == commit)
            .map(|(tag, _oid)| tag.as_str())
            .last()
    }

    /// Resolves an optional requested tag against the advertised refs.
    pub fn resolve(&self, url: &str, tag: Option<&str>) -> Result<Resolved, Error> {
        match tag {
            Some(tag) => match self.tags.get(tag) {
                Some(revision) => Ok(Resolved {
                    revision: revision.clone(),
                    tag: Some(tag.to_string()),
                }),
                None => Err(Error::NoTag {
                    url: url.to_string(),
                    tag: tag.to_string(),
                }),
            },
            None => match &self.head {
                Some(head) => Ok(Resolved {
                    revision: head.clone(),
                    tag: self.tag_for_commit(head).map(String::from),
                }),
                None => Err(Error::EmptyRepository {
                    url: url.to_string(),
                }),
            },
        }
    }
}

impl Git {
    pub async fn ls_remote(&self, url: &str) -> Result<RemoteRefs, Error> {
        let output = Invocation::new(&self.opt)
            .args(["ls-remote", url, "HEAD", "refs/tags/*"])
            .run()
            .await?;

        RemoteRefs::parse(&output)
    }

    /// Resolves the revision to archive: the requested tag's commit, or the
    /// remote's `HEAD` along with any tag pointing at it.
    pub async fn resolve(&self, url: &str, tag: Option<&str>) -> Result<Resolved, Error> {
        self.ls_remote(url).await?.resolve(url, tag)
    }
}
