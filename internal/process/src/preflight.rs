use std::{fmt::Display, path::Path};

use crate::Opt;

/// Checks that git can be run with the given options, and that repositories
/// can be extracted into the working directory.
pub fn preflight(opt: &Opt) -> Result<(), crate::Error> {
    let output = std::process::Command::new(&opt.git_command)
        .args(&opt.git_global_option)
        .arg("--version")
        .output()
        .map_err(crate::Error::Spawn)?;

    if !output.status.success() {
        return Err(crate::Error::Preflight(Error {
            command: format!("{} --version", opt.git_command.to_string_lossy()),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }));
    }
    log::debug!("{}", String::from_utf8_lossy(&output.stdout).trim());

    let work_dir = opt.work_dir();
    std::fs::create_dir_all(&work_dir)?;
    check_writable(&work_dir)?;
    log::debug!("extracting into {}", work_dir.display());

    Ok(())
}

fn check_writable(dir: &Path) -> Result<(), crate::Error> {
    let marker = dir.join(".rehost-preflight");
    std::fs::write(&marker, b"")?;
    std::fs::remove_file(&marker)?;

    Ok(())
}

#[derive(Debug)]
pub struct Error {
    command: String,
    status: String,
    stderr: String,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({})", self.command, self.status)?;
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }

        Ok(())
    }
}
