//! Loading the built archive into a local Docker daemon
//!
//! The daemon sink streams the `docker load` archive into the daemon
//! through the CLI. The archive is staged to a temporary file first; the
//! load transport itself cannot be restarted mid-stream.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;

use crate::error::{BuildError, Result};
use crate::progress::EventDispatcher;

/// Handle on a local Docker (or Podman) CLI able to run `load`.
#[derive(Debug, Clone)]
pub struct DockerClient {
    executable: PathBuf,
}

impl DockerClient {
    pub fn new() -> Self {
        Self {
            executable: PathBuf::from("docker"),
        }
    }

    pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Stream an archive into `docker load`, returning the daemon's output.
    pub async fn load(&self, archive: &Path, events: &EventDispatcher) -> Result<String> {
        events.step_started("load into daemon");
        let mut child = tokio::process::Command::new(&self.executable)
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BuildError::InvalidConfiguration(format!(
                    "cannot run '{} load': {}",
                    self.executable.display(),
                    e
                ))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            BuildError::Io(std::io::Error::other("daemon process has no stdin"))
        })?;
        let mut file = tokio::fs::File::open(archive).await?;
        tokio::io::copy(&mut file, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BuildError::Io(std::io::Error::other(format!(
                "'{} load' failed: {}",
                self.executable.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !stdout.is_empty() {
            events.info(stdout.clone());
        }
        events.step_completed("load into daemon");
        Ok(stdout)
    }
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}
