use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{process::Invocation, Error, Git};

/// What to extract, and where.
#[derive(Debug, Clone, Copy)]
pub struct Extract<'a> {
    pub url: &'a str,

    /// Name of the repository's directory under the working directory. Each
    /// repository must have its own name.
    pub work_dir_name: &'a str,

    pub revision: Option<&'a str>,
    pub tag: Option<&'a str>,
    pub branch: Option<&'a str>,
}

impl Git {
    /// Materialises a bare clone of the repository with `HEAD` detached at
    /// the requested revision, ready to be served over dumb HTTP.
    ///
    /// Any existing directory for the repository is destroyed first:
    /// extraction always starts from nothing.
    pub async fn extract(&self, request: &Extract<'_>) -> Result<PathBuf, Error> {
        let path = prepare_work_dir(&self.opt.work_dir(), request.work_dir_name).await?;

        log::info!("cloning {} into {}", request.url, path.display());
        let mut clone = Invocation::new(&self.opt);
        clone.arg("clone").arg("--bare").arg("--quiet");
        if let Some(reference) = request.branch.or(request.tag) {
            clone.arg("--branch").arg(reference);
        }
        clone.arg(request.url).arg(&path).run().await?;

        if let Some(revision) = request.revision {
            let commit = format!("{}^{{commit}}", revision);
            if !Invocation::in_dir(&self.opt, &path)
                .args(["rev-parse", "--verify", "--quiet", commit.as_str()])
                .succeeds()
                .await?
            {
                return Err(Error::NoRevision {
                    url: request.url.to_string(),
                    revision: revision.to_string(),
                });
            }

            Invocation::in_dir(&self.opt, &path)
                .args(["update-ref", "--no-deref", "HEAD", commit.as_str()])
                .run()
                .await?;
        }

        Invocation::in_dir(&self.opt, &path)
            .arg("update-server-info")
            .run()
            .await?;

        log::debug!("extracted {} to {}", request.url, path.display());
        Ok(path)
    }
}

/// Returns the path for `name` under `root`, destroying anything already
/// there.
pub async fn prepare_work_dir(root: &Path, name: &str) -> Result<PathBuf, Error> {
    if name.is_empty() || name == "." || name == ".." || name.contains(std::path::is_separator) {
        return Err(Error::InvalidWorkDirName(name.to_string()));
    }

    tokio::fs::create_dir_all(root).await?;
    let path = root.join(name);

    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => log::warn!("removed stale working directory {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_work_dir() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;

        // A fresh directory is simply named.
        let path = prepare_work_dir(root.path(), "github.com+alice+tool.git").await?;
        assert_eq!(path, root.path().join("github.com+alice+tool.git"));
        assert!(!path.exists());

        // Leftovers from a crashed attempt are removed.
        std::fs::create_dir_all(path.join("objects/pack"))?;
        std::fs::write(path.join("objects/pack/partial.pack"), b"half a pack")?;
        let again = prepare_work_dir(root.path(), "github.com+alice+tool.git").await?;
        assert_eq!(again, path);
        assert!(!path.exists());

        // Other repositories are untouched.
        std::fs::create_dir_all(root.path().join("github.com_bob_other.git"))?;
        prepare_work_dir(root.path(), "github.com+alice+tool.git").await?;
        assert!(root.path().join("github.com_bob_other.git").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_prepare_work_dir_invalid_name() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;

        for name in ["", ".", "..", "alice/tool"] {
            assert!(matches!(
                prepare_work_dir(root.path(), name).await,
                Err(Error::InvalidWorkDirName(_))
            ));
        }

        Ok(())
    }
}
