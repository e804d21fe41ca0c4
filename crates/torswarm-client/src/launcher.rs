//! Launches one `tor` process per pool slot.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use torswarm_core::config::secs;
use torswarm_core::error::AppError;

const BOOTSTRAP_DONE: &str = "Bootstrapped 100%";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Path to the `tor` binary.
    pub tor_cmd: PathBuf,

    /// Parent directory; slot `n` keeps its state in `<data_directory>/n`.
    pub data_directory: PathBuf,

    #[serde(with = "secs")]
    pub bootstrap_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            tor_cmd: PathBuf::from("tor"),
            data_directory: PathBuf::from("tor_data"),
            bootstrap_timeout: Duration::from_secs(120),
        }
    }
}

impl LaunchConfig {
    pub fn data_directory_for(&self, slot: usize) -> PathBuf {
        self.data_directory.join(slot.to_string())
    }

    fn command(&self, slot: usize, socks_port: u16, control_port: u16) -> Command {
        let mut command = Command::new(&self.tor_cmd);
        command
            .arg("--SocksPort")
            .arg(socks_port.to_string())
            .arg("--ControlPort")
            .arg(control_port.to_string())
            .arg("--DataDirectory")
            .arg(self.data_directory_for(slot))
            .arg("--CookieAuthentication")
            .arg("1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// A running `tor` process. Killed when dropped.
#[derive(Debug)]
pub struct TorProcess {
    slot: usize,
    data_directory: PathBuf,
    child: Child,
}

impl TorProcess {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn shutdown(mut self) -> Result<(), AppError> {
        self.child.kill().await?;
        tracing::debug!(slot = self.slot, "Tor process stopped");
        Ok(())
    }
}

/// Start `tor` for `slot` and wait until it reports a full bootstrap.
pub async fn launch(
    config: &LaunchConfig,
    slot: usize,
    socks_port: u16,
    control_port: u16,
) -> Result<TorProcess, AppError> {
    let data_directory = config.data_directory_for(slot);
    tokio::fs::create_dir_all(&data_directory).await?;

    let mut child = config
        .command(slot, socks_port, control_port)
        .spawn()
        .map_err(|e| {
            AppError::Control(format!(
                "failed to start {}: {e}",
                config.tor_cmd.display()
            ))
        })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Control("tor stdout not captured".into()))?;

    tracing::info!(slot, socks_port, control_port, pid = ?child.id(), "Launching tor");

    let mut lines = BufReader::new(stdout).lines();
    let bootstrap = wait_for_bootstrap(slot, &mut lines);
    match tokio::time::timeout(config.bootstrap_timeout, bootstrap).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(AppError::Control(format!(
                "tor for slot {slot} did not bootstrap within {} s",
                config.bootstrap_timeout.as_secs()
            )));
        }
    }

    // Keep draining stdout so tor never blocks on a full pipe.
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(slot, "tor: {line}");
        }
    });

    Ok(TorProcess {
        slot,
        data_directory,
        child,
    })
}

async fn wait_for_bootstrap(
    slot: usize,
    lines: &mut tokio::io::Lines<BufReader<ChildStdout>>,
) -> Result<(), AppError> {
    while let Some(line) = lines.next_line().await? {
        if let Some(progress) = bootstrap_progress(&line) {
            tracing::info!(slot, "{progress}");
            if progress.starts_with(BOOTSTRAP_DONE) {
                return Ok(());
            }
        } else {
            tracing::debug!(slot, "tor: {line}");
        }
    }
    Err(AppError::Control(format!(
        "tor for slot {slot} exited before bootstrapping"
    )))
}

/// The `Bootstrapped NN% ...` part of a tor log line, if it has one.
fn bootstrap_progress(line: &str) -> Option<&str> {
    line.find("Bootstrapped ").map(|idx| &line[idx..])
}
