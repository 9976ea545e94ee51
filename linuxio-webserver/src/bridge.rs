//! Spawning and supervising the per-session bridge process.

use std::os::fd::AsRawFd as _;
use std::process::Stdio;

use anyhow::Context as _;
use linuxio_task::ChildTask;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument as _, Span};

use crate::auth::Identity;
use crate::config::Conf;
use crate::pinning::{self, PinError};

/// File descriptor the bridge key pipe lands on in the child.
const KEY_FD: i32 = 3;

/// Open-files ceiling granted to the bridge for its bulk-stream fan-out.
const BRIDGE_NOFILE_LIMIT: u64 = 65_536;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("bridge binary failed its hash check")]
    Tampered,
    #[error("bridge did not report READY in time")]
    StartTimeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug)]
enum BridgeCommand {
    Terminate,
    Kill,
}

/// Supervision handle for one bridge process. Cloneable; the watcher task
/// lives exactly as long as the last clone.
#[derive(Clone)]
pub struct BridgeHandle {
    pid: u32,
    exited_rx: watch::Receiver<bool>,
    control_tx: mpsc::UnboundedSender<BridgeCommand>,
    _watcher: Arc<ChildTask<()>>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl BridgeHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !*self.exited_rx.borrow()
    }

    /// Asks the bridge to drain (SIGTERM).
    pub fn signal_terminate(&self) {
        let _ = self.control_tx.send(BridgeCommand::Terminate);
    }

    /// Forcibly kills the bridge (SIGKILL).
    pub fn signal_kill(&self) {
        let _ = self.control_tx.send(BridgeCommand::Kill);
    }

    /// Resolves once the process has exited and been reaped.
    pub async fn exited(&self) {
        let mut rx = self.exited_rx.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

/// Verifies the pinned hash, spawns the bridge and waits for its `READY`
/// line. The bridge key travels over an inherited pipe, never `argv`.
pub async fn spawn_bridge(
    conf: &Conf,
    session_id: &str,
    identity: &Identity,
    key: &[u8; linuxio_proto::BRIDGE_KEY_SIZE],
) -> Result<BridgeHandle, SpawnError> {
    let expected: Option<&str> = conf.bridge_sha256.as_deref().or_else(|| pinning::embedded_bridge_sha256());
    match pinning::verify_binary(&conf.bridge_binary, expected) {
        Ok(()) => {}
        Err(PinError::Mismatch { .. } | PinError::NoPin { .. }) => return Err(SpawnError::Tampered),
        Err(PinError::Other(error)) => return Err(SpawnError::Other(error)),
    }

    let (key_read, key_write) = crate::auth::create_pipe().map_err(SpawnError::Other)?;
    let key_read_fd = key_read.as_raw_fd();

    let mut command = tokio::process::Command::new(conf.bridge_binary.as_std_path());
    command
        .arg("--session")
        .arg(session_id)
        .arg("--uid")
        .arg(identity.uid.to_string())
        .arg("--gid")
        .arg(identity.gid.to_string())
        .arg("--home")
        .arg(identity.home.as_str())
        .arg("--key-fd")
        .arg(KEY_FD.to_string())
        .env("LINUXIO_RUNTIME_DIR", conf.runtime_dir.as_str())
        .env("LINUXIO_LOG_LEVEL", &conf.log_filter)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let set_up_child = move || {
        // SAFETY: dup2 is async-signal-safe; the source fd stays open in
        // the parent until after spawn. dup2 clears O_CLOEXEC on the
        // duplicate so it survives the exec.
        if unsafe { libc::dup2(key_read_fd, KEY_FD) } == -1 {
            return Err(std::io::Error::last_os_error());
        }

        let limit = libc::rlimit {
            rlim_cur: BRIDGE_NOFILE_LIMIT,
            rlim_max: BRIDGE_NOFILE_LIMIT,
        };
        // SAFETY: setrlimit is a plain syscall on a stack value; a refusal
        // (already lower hard limit) is not fatal for the child.
        let _ = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };

        Ok(())
    };

    // SAFETY: the hook only performs async-signal-safe calls.
    unsafe {
        command.pre_exec(set_up_child);
    }

    let mut child = command.spawn().context("couldn't spawn bridge").map_err(SpawnError::Other)?;
    drop(key_read);

    let pid = child.id().context("bridge has no pid").map_err(SpawnError::Other)?;

    // Hand over the key and close our end so the bridge sees EOF.
    {
        use std::io::Write as _;
        let mut key_pipe = std::fs::File::from(key_write);
        key_pipe
            .write_all(key)
            .context("couldn't write bridge key")
            .map_err(SpawnError::Other)?;
    }

    let stdout = child.stdout.take().context("bridge stdout not piped").map_err(SpawnError::Other)?;
    let stderr = child.stderr.take().context("bridge stderr not piped").map_err(SpawnError::Other)?;
    let mut stdout_lines = BufReader::new(stdout).lines();

    let ready = tokio::time::timeout(conf.ready_timeout, stdout_lines.next_line()).await;

    match ready {
        Ok(Ok(Some(line))) if parse_ready_line(&line) == Some(pid) => {
            debug!(pid, "Bridge reported READY");
        }
        Ok(Ok(Some(line))) => {
            warn!(pid, line, "Unexpected first line from bridge");
            let _ = child.start_kill();
            return Err(SpawnError::StartTimeout);
        }
        Ok(Ok(None)) | Ok(Err(_)) => {
            let _ = child.start_kill();
            return Err(SpawnError::StartTimeout);
        }
        Err(_elapsed) => {
            warn!(pid, "Bridge did not report READY in time");
            let _ = child.start_kill();
            return Err(SpawnError::StartTimeout);
        }
    }

    let span = Span::current();

    // Remaining child output is re-emitted into our own structured log.
    ChildTask::spawn(
        async move {
            let mut lines = stdout_lines;
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "bridge", "{line}");
            }
        }
        .instrument(span.clone()),
    )
    .detach();

    ChildTask::spawn(
        async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "bridge", "{line}");
            }
        }
        .instrument(span.clone()),
    )
    .detach();

    let (exited_tx, exited_rx) = watch::channel(false);
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let watcher = ChildTask::spawn(watch_bridge(child, pid, exited_tx, control_rx, control_tx.clone()).instrument(span));

    Ok(BridgeHandle {
        pid,
        exited_rx,
        control_tx,
        _watcher: Arc::new(watcher),
    })
}

fn parse_ready_line(line: &str) -> Option<u32> {
    line.strip_prefix("READY ")?.trim().parse().ok()
}

async fn watch_bridge(
    mut child: tokio::process::Child,
    pid: u32,
    exited_tx: watch::Sender<bool>,
    mut control_rx: mpsc::UnboundedReceiver<BridgeCommand>,
    _keep_open: mpsc::UnboundedSender<BridgeCommand>,
) {
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(pid, %status, "Bridge exited"),
                    Err(error) => warn!(pid, %error, "Couldn't reap bridge"),
                }
                let _ = exited_tx.send_replace(true);
                break;
            }
            Some(command) = control_rx.recv() => {
                match command {
                    BridgeCommand::Terminate => {
                        debug!(pid, "Sending SIGTERM to bridge");
                        // SAFETY: plain kill syscall on a pid we spawned.
                        let _ = unsafe { libc::kill(i32::try_from(pid).unwrap_or(-1), libc::SIGTERM) };
                    }
                    BridgeCommand::Kill => {
                        debug!(pid, "Sending SIGKILL to bridge");
                        let _ = child.start_kill();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
impl BridgeHandle {
    /// Detached handle with a controllable liveness flag; no process.
    pub(crate) fn fake(pid: u32, alive: bool) -> Self {
        let (exited_tx, exited_rx) = watch::channel(!alive);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let watcher = ChildTask::spawn(async move {
            while let Some(command) = control_rx.recv().await {
                if matches!(command, BridgeCommand::Kill | BridgeCommand::Terminate) {
                    let _ = exited_tx.send_replace(true);
                }
            }
        });

        Self {
            pid,
            exited_rx,
            control_tx,
            _watcher: Arc::new(watcher),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_line_parsing() {
        assert_eq!(parse_ready_line("READY 4242"), Some(4242));
        assert_eq!(parse_ready_line("READY  17 "), Some(17));
        assert_eq!(parse_ready_line("ready 1"), None);
        assert_eq!(parse_ready_line("READY x"), None);
        assert_eq!(parse_ready_line(""), None);
    }
}
