use std::{
    ffi::OsStr,
    path::Path,
    process::Stdio,
};

use tokio::process::Command;

use crate::{error::Error, Opt};

/// A single git invocation.
///
/// The child is killed if the future running it is dropped, so callers can
/// bound a git command with a timeout without leaking the process.
#[derive(Debug)]
pub(crate) struct Invocation {
    command: Command,
    display: String,
}

impl Invocation {
    pub(crate) fn new(opt: &Opt) -> Self {
        let mut command = Command::new(&opt.git_command);
        command
            .args(opt.git_global_option.iter())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Self {
            command,
            display: opt.git_command.to_string_lossy().into_owned(),
        }
    }

    /// Runs git inside the given directory.
    pub(crate) fn in_dir(opt: &Opt, dir: &Path) -> Self {
        let mut invocation = Self::new(opt);
        invocation.arg("-C").arg(dir);
        invocation
    }

    pub(crate) fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.display.push(' ');
        self.display.push_str(&arg.as_ref().to_string_lossy());
        self.command.arg(arg);
        self
    }

    pub(crate) fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Runs the command to completion, returning its stdout.
    pub(crate) async fn run(&mut self) -> Result<Vec<u8>, Error> {
        log::debug!("running {}", &self.display);
        let output = self.command.output().await.map_err(Error::Spawn)?;

        log_output(&output.stdout, log::Level::Trace);
        log_output(&output.stderr, log::Level::Debug);

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Command {
                command: self.display.clone(),
                status: match output.status.code() {
                    Some(code) => format!("exit code {}", code),
                    None => "signal".into(),
                },
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Runs the command, returning whether it exited successfully. Only a
    /// failure to spawn git is an error.
    pub(crate) async fn succeeds(&mut self) -> Result<bool, Error> {
        log::debug!("running {}", &self.display);
        let output = self.command.output().await.map_err(Error::Spawn)?;
        log_output(&output.stderr, log::Level::Debug);

        Ok(output.status.success())
    }
}

fn log_output(buf: &[u8], level: log::Level) {
    for line in buf.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
        log::log!(level, "{}", String::from_utf8_lossy(line));
    }
}
