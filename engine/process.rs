//! Bounded invocations of the external `git` binary.

use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
    time::Duration,
};

use bstr::ByteSlice;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use super::HistoryError;

pub(super) struct Output {
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
}

impl Output {
    /// Last non-empty stderr line, which is where git puts the reason.
    pub fn reason(&self) -> String {
        self.stderr
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .last()
            .map(|line| line.to_str_lossy().into_owned())
            .unwrap_or_else(|| format!("exited with {}", self.status))
    }
}

#[derive(Debug, Clone)]
pub(super) struct GitProcess {
    program: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
}

impl GitProcess {
    pub fn new(program: impl Into<PathBuf>, workdir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.as_ref().to_owned(),
            timeout,
        }
    }

    /// Run `git <args>`, killing it once the timeout expires.
    ///
    /// Spawn failures and timeouts are errors; a non-zero exit is reported
    /// through the returned status so callers can decide what it means.
    #[instrument(skip(self), fields(timeout_secs = self.timeout.as_secs()))]
    pub fn run(&self, args: &[String]) -> Result<Output, HistoryError> {
        let command = args.first().cloned().unwrap_or_default();
        let mut child = Command::new(&self.program)
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| HistoryError::Command {
                command: command.clone(),
                message: format!("could not run {:?}: {error}", self.program),
            })?;

        // Drain stderr on the side so a chatty git cannot block on a full pipe.
        let stderr = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = stderr.read_to_end(&mut buffer);
                buffer
            })
        });

        let waited = child
            .wait_timeout(self.timeout)
            .map_err(|error| HistoryError::Command {
                command: command.clone(),
                message: error.to_string(),
            })?;
        let status = match waited {
            Some(status) => status,
            None => {
                warn!(command, "git timed out, killing");
                let _ = child.kill();
                let _ = child.wait();
                return Err(HistoryError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        debug!(command, exit_code = ?status.code(), "git finished");
        Ok(Output { status, stderr })
    }
}
