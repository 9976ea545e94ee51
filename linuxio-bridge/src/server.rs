//! Accept loop of the bridge: HELLO validation first, then each connection
//! is handed to the multiplexer and served by the dispatcher.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use linuxio_mux::{read_envelope, MuxConfig, MuxConnection, Multiplexer};
use linuxio_proto::{HelloPayload, Kind, BRIDGE_KEY_SIZE};
use linuxio_task::ChildTask;
use smol_str::SmolStr;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::dispatch::{Dispatcher, HandlerRegistry};

/// Repeated unauthorized HELLOs within this window terminate the bridge.
const STRIKE_WINDOW: Duration = Duration::from_secs(60);
const MAX_STRIKES: usize = 3;

/// Binds the session socket with the required ownership and mode: the
/// owning user and nobody else, before the listener ever accepts.
pub fn bind_session_socket(path: &camino::Utf8Path, uid: u32, gid: u32) -> anyhow::Result<std::os::unix::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt as _;

    // A leftover socket from a crashed predecessor would fail the bind.
    let _ = std::fs::remove_file(path);

    let listener = std::os::unix::net::UnixListener::bind(path).with_context(|| format!("couldn't bind {path}"))?;

    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        std::os::unix::fs::chown(path.as_std_path(), Some(uid), Some(gid)).context("couldn't chown session socket")?;
    }

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).context("couldn't chmod session socket")?;

    Ok(listener)
}

/// Per-session shared secret; compared in constant time, zeroed on drop.
pub struct BridgeKey(Zeroizing<[u8; BRIDGE_KEY_SIZE]>);

impl BridgeKey {
    pub fn new(key: [u8; BRIDGE_KEY_SIZE]) -> Self {
        Self(Zeroizing::new(key))
    }

    fn matches(&self, candidate: &[u8; BRIDGE_KEY_SIZE]) -> bool {
        self.0
            .iter()
            .zip(candidate.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for BridgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BridgeKey(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub hello_timeout: Duration,
    pub drain_grace: Duration,
    pub max_handlers: usize,
    pub mux: MuxConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(30),
            max_handlers: crate::dispatch::DEFAULT_MAX_CONCURRENT_HANDLERS,
            mux: MuxConfig::default(),
        }
    }
}

enum HelloOutcome {
    Accepted,
    Rejected { reason: &'static str },
}

pub struct BridgeServer {
    pub session_id: SmolStr,
    pub bridge_key: BridgeKey,
    pub registry: Arc<HandlerRegistry>,
    pub cfg: BridgeConfig,
}

impl BridgeServer {
    pub async fn run(self, listener: UnixListener) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("couldn't install SIGTERM handler")?;

        let dispatcher = Dispatcher::new(Arc::clone(&self.registry), self.cfg.max_handlers);
        let drain = dispatcher.drain_control();

        let mut strikes: VecDeque<Instant> = VecDeque::new();
        let mut connections: Vec<ChildTask<()>> = Vec::new();

        info!(session.id = %self.session_id, "Serving");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (mut stream, _) = accepted.context("accept failed")?;

                    match self.validate_hello(&mut stream).await {
                        Ok(HelloOutcome::Accepted) => {
                            debug!("Connection authenticated");
                            connections.push(self.serve_connection(stream, &dispatcher));
                        }
                        Ok(HelloOutcome::Rejected { reason }) => {
                            warn!(reason, "UnauthorizedHello");
                            drop(stream);

                            let now = Instant::now();
                            strikes.push_back(now);
                            while let Some(front) = strikes.front() {
                                if now.duration_since(*front) > STRIKE_WINDOW {
                                    strikes.pop_front();
                                } else {
                                    break;
                                }
                            }

                            if strikes.len() >= MAX_STRIKES {
                                anyhow::bail!("too many unauthorized HELLO attempts, terminating");
                            }
                        }
                        Err(error) => {
                            // Plain connect-and-vanish; no strike.
                            debug!(error = format!("{error:#}"), "Connection dropped before HELLO");
                        }
                    }
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, draining");
                    break;
                }
            }
        }

        drain.start_drain();

        if tokio::time::timeout(self.cfg.drain_grace, drain.wait_idle()).await.is_err() {
            warn!("Drain grace expired with handlers still running");
        }

        // Aborts the per-connection tasks and their mux drivers.
        drop(connections);

        info!("Bridge drained");

        Ok(())
    }

    async fn validate_hello(&self, stream: &mut UnixStream) -> anyhow::Result<HelloOutcome> {
        let envelope = tokio::time::timeout(
            self.cfg.hello_timeout,
            read_envelope(stream, self.cfg.mux.max_frame_size),
        )
        .await
        .context("timed out waiting for HELLO")?
        .context("couldn't read HELLO")?;

        if envelope.kind != Kind::Hello {
            return Ok(HelloOutcome::Rejected {
                reason: "first envelope is not HELLO",
            });
        }

        let hello = match envelope.expect_record().and_then(HelloPayload::from_record) {
            Ok(hello) => hello,
            Err(_) => {
                return Ok(HelloOutcome::Rejected {
                    reason: "malformed HELLO payload",
                })
            }
        };

        if hello.session_id != self.session_id {
            return Ok(HelloOutcome::Rejected {
                reason: "session id mismatch",
            });
        }

        if !self.bridge_key.matches(&hello.bridge_key) {
            return Ok(HelloOutcome::Rejected {
                reason: "bridge key mismatch",
            });
        }

        Ok(HelloOutcome::Accepted)
    }

    fn serve_connection(&self, stream: UnixStream, dispatcher: &Dispatcher) -> ChildTask<()> {
        let (read_half, write_half) = stream.into_split();

        let MuxConnection {
            handle: _handle,
            incoming,
            driver,
        } = Multiplexer::new(Box::new(read_half), Box::new(write_half))
            .with_config(self.cfg.mux.clone())
            .spawn();

        let dispatcher = dispatcher.clone();

        ChildTask::spawn(async move {
            dispatcher.serve(incoming).await;

            match driver.join().await {
                Ok(Ok(())) => debug!("Connection closed"),
                Ok(Err(error)) => debug!(error = format!("{error:#}"), "Connection failed"),
                Err(error) => debug!(%error, "Connection driver join failed"),
            }
        })
    }
}
