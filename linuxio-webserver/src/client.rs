//! Session-scoped RPC surface: at most one multiplexed connection per
//! session, lazily established, reused for every call, torn down with the
//! session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use linuxio_mux::{
    write_envelope, MuxConnection, MuxHandle, Multiplexer, Reply, StreamError, StreamHandle,
};
use linuxio_proto::{CallPayload, Envelope, ErrorKind, HelloPayload, Kind, Record, ReplyErrPayload, StreamMode};
use linuxio_task::ChildTask;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::net::UnixStream;

use crate::config::ConfHandle;
use crate::session::{LookupResult, SessionId, SessionManager, SessionSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("couldn't reach the bridge")]
    BridgeUnreachable,
    #[error("connection reset mid-call")]
    TransportReset,
    #[error("bridge stopped answering keepalives")]
    PeerUnreachable,
    #[error("call deadline exceeded")]
    DeadlineExceeded,
    /// Error reply from the bridge, kind preserved verbatim.
    #[error("{kind}: {message}")]
    Bridge {
        kind: ErrorKind,
        message: String,
        detail: Option<Record>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::SessionNotFound | CallError::SessionExpired => ErrorKind::BridgeUnreachable,
            CallError::BridgeUnreachable => ErrorKind::BridgeUnreachable,
            CallError::TransportReset => ErrorKind::TransportReset,
            CallError::PeerUnreachable => ErrorKind::PeerUnreachable,
            CallError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            CallError::Bridge { kind, .. } => kind.clone(),
            CallError::Other(_) => ErrorKind::Internal,
        }
    }
}

fn map_stream_error(error: StreamError) -> CallError {
    match error {
        StreamError::ConnectionDown => CallError::BridgeUnreachable,
        StreamError::StreamClosed | StreamError::TransportReset => CallError::TransportReset,
        StreamError::PeerUnreachable => CallError::PeerUnreachable,
    }
}

fn map_reply(reply: Reply) -> Result<Record, CallError> {
    match reply {
        Reply::Ok(response) => Ok(response),
        Reply::Err(ReplyErrPayload { kind, message, detail }) => Err(CallError::Bridge { kind, message, detail }),
    }
}

struct ConnEntry {
    handle: MuxHandle,
    _driver: ChildTask<anyhow::Result<()>>,
}

/// Webserver-side RPC runtime. One per process; cheap to share behind an
/// `Arc`.
pub struct ClientRuntime {
    conf: ConfHandle,
    sessions: SessionManager,
    conns: Mutex<HashMap<SessionId, ConnEntry>>,
    next_correlation: AtomicU64,
}

impl ClientRuntime {
    pub fn new(conf: ConfHandle, sessions: SessionManager) -> Self {
        Self {
            conf,
            sessions,
            conns: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
        }
    }

    /// Unary call with the default deadline.
    pub async fn call(&self, session_id: &SessionId, verb: &str, request: Record) -> Result<Record, CallError> {
        let deadline = self.conf.get_conf().default_call_deadline;
        self.call_with_deadline(session_id, verb, request, deadline).await
    }

    pub async fn call_with_deadline(
        &self,
        session_id: &SessionId,
        verb: &str,
        request: Record,
        deadline: Duration,
    ) -> Result<Record, CallError> {
        let mut stream = self.open(session_id, verb, StreamMode::Unary, request, deadline).await?;

        match tokio::time::timeout(deadline, stream.await_reply()).await {
            Ok(Ok(reply)) => map_reply(reply),
            Ok(Err(error)) => Err(map_stream_error(error)),
            Err(_elapsed) => {
                stream.cancel();
                Err(CallError::DeadlineExceeded)
            }
        }
    }

    /// Progress-emitting call; `on_progress` must not block.
    pub async fn call_progress(
        &self,
        session_id: &SessionId,
        verb: &str,
        request: Record,
        mut on_progress: impl FnMut(Record) + Send,
    ) -> Result<Record, CallError> {
        let deadline = self.conf.get_conf().default_call_deadline;
        let mut stream = self
            .open(session_id, verb, StreamMode::ProgressPush, request, deadline)
            .await?;

        let progress_rx = stream.progress_receiver();
        let deadline_sleep = tokio::time::sleep(deadline);
        tokio::pin!(deadline_sleep);

        let mut reply_fut = Box::pin(stream.await_reply());
        let mut progress_open = true;

        let outcome = loop {
            tokio::select! {
                reply = &mut reply_fut => break reply,
                maybe_record = progress_rx.recv(), if progress_open => {
                    match maybe_record {
                        Some(record) => on_progress(record),
                        None => progress_open = false,
                    }
                }
                () = &mut deadline_sleep => {
                    drop(reply_fut);
                    stream.cancel();
                    return Err(CallError::DeadlineExceeded);
                }
            }
        };
        drop(reply_fut);

        // Records that raced the reply are still delivered, in order.
        while let Some(record) = progress_rx.try_recv() {
            on_progress(record);
        }

        match outcome {
            Ok(reply) => map_reply(reply),
            Err(error) => Err(map_stream_error(error)),
        }
    }

    /// Opens a bidirectional byte stream; the caller drives reads, writes
    /// and the terminal reply through the returned handle.
    pub async fn call_stream(
        &self,
        session_id: &SessionId,
        verb: &str,
        request: Record,
        deadline: Duration,
    ) -> Result<StreamHandle, CallError> {
        self.open(session_id, verb, StreamMode::Bidirectional, request, deadline)
            .await
    }

    /// Drops the cached connection for a session, if any.
    pub fn disconnect(&self, session_id: &SessionId) {
        self.conns.lock().remove(session_id);
    }

    async fn open(
        &self,
        session_id: &SessionId,
        verb: &str,
        mode: StreamMode,
        request: Record,
        deadline: Duration,
    ) -> Result<StreamHandle, CallError> {
        let snapshot = self.session(session_id).await?;

        match self.try_open(&snapshot, verb, mode, request.clone(), deadline).await {
            Ok(stream) => Ok(stream),
            Err(CallError::BridgeUnreachable | CallError::TransportReset | CallError::PeerUnreachable) => {
                // The cached connection may simply have been stale; one
                // plain reconnect comes before any respawn policy.
                match self.try_open(&snapshot, verb, mode, request.clone(), deadline).await {
                    Ok(stream) => Ok(stream),
                    Err(CallError::BridgeUnreachable | CallError::TransportReset | CallError::PeerUnreachable) => {
                        let snapshot = self.recover(snapshot).await?;
                        self.try_open(&snapshot, verb, mode, request, deadline).await
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn try_open(
        &self,
        snapshot: &SessionSnapshot,
        verb: &str,
        mode: StreamMode,
        request: Record,
        deadline: Duration,
    ) -> Result<StreamHandle, CallError> {
        let conn = self.connection_for(snapshot).await?;

        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let deadline_ms = u32::try_from(deadline.as_millis()).unwrap_or(u32::MAX);

        let call = CallPayload {
            verb: SmolStr::new(verb),
            mode,
            deadline_ms,
            request,
        };

        match conn.open_stream(call, correlation_id).await {
            Ok(stream) => Ok(stream),
            Err(error) => {
                // The cached connection was stale; forget it so the next
                // attempt reconnects.
                self.disconnect(&snapshot.id);
                Err(map_stream_error(error))
            }
        }
    }

    /// One-shot respawn, only when the bridge PID is confirmed dead.
    async fn recover(&self, snapshot: SessionSnapshot) -> Result<SessionSnapshot, CallError> {
        self.disconnect(&snapshot.id);

        if snapshot.bridge.is_alive() {
            // The process is there but the link failed; no respawn policy
            // applies, surface the failure.
            return Err(CallError::TransportReset);
        }

        info!(session.id = %snapshot.id, "Bridge is gone, attempting a one-shot respawn");

        self.sessions
            .respawn_bridge(&snapshot.id)
            .await
            .map_err(|_| CallError::BridgeUnreachable)
    }

    async fn session(&self, session_id: &SessionId) -> Result<SessionSnapshot, CallError> {
        match self.sessions.touch(session_id).await? {
            LookupResult::Found(snapshot) => Ok(snapshot),
            LookupResult::Expired => Err(CallError::SessionExpired),
            LookupResult::NotFound => Err(CallError::SessionNotFound),
        }
    }

    async fn connection_for(&self, snapshot: &SessionSnapshot) -> Result<MuxHandle, CallError> {
        if let Some(handle) = {
            let conns = self.conns.lock();
            conns
                .get(&snapshot.id)
                .filter(|entry| !entry.handle.is_dead())
                .map(|entry| entry.handle.clone())
        } {
            return Ok(handle);
        }

        let conf = self.conf.get_conf();

        let mut stream = self.connect_with_backoff(&snapshot.socket_path).await?;

        let hello = HelloPayload {
            bridge_key: *snapshot.key.bytes(),
            session_id: snapshot.id.clone(),
        };
        write_envelope(
            &mut stream,
            &Envelope::record(Kind::Hello, 0, 0, hello.to_record()),
            conf.mux.max_frame_size,
        )
        .await
        .context("couldn't send HELLO")
        .map_err(|_| CallError::BridgeUnreachable)?;

        let (read_half, write_half) = stream.into_split();

        let span = info_span!("bridge-conn", session.id = %snapshot.id);
        let MuxConnection {
            handle,
            incoming,
            driver,
        } = span.in_scope(|| {
            Multiplexer::new(Box::new(read_half), Box::new(write_half))
                .with_config(conf.mux.clone())
                .spawn()
        });

        // The bridge never opens streams towards us.
        drop(incoming);

        self.conns.lock().insert(
            snapshot.id.clone(),
            ConnEntry {
                handle: handle.clone(),
                _driver: driver,
            },
        );

        Ok(handle)
    }

    async fn connect_with_backoff(&self, socket_path: &camino::Utf8Path) -> Result<UnixStream, CallError> {
        let conf = self.conf.get_conf();

        let mut backoff = ExponentialBackoff {
            initial_interval: conf.connect_initial_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        for attempt in 1..=conf.connect_attempts {
            match UnixStream::connect(socket_path.as_std_path()).await {
                Ok(stream) => return Ok(stream),
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    debug!(attempt, %error, path = %socket_path, "Bridge socket not reachable yet");
                    if attempt < conf.connect_attempts {
                        let delay = backoff.next_backoff().unwrap_or(conf.connect_initial_backoff);
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => {
                    return Err(CallError::Other(
                        anyhow::Error::new(error).context("couldn't connect to bridge socket"),
                    ))
                }
            }
        }

        Err(CallError::BridgeUnreachable)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::config::Conf;
    use crate::session::{insert_test_session, session_store_channel, KeyMaterial, SessionStoreTask};
    use camino::Utf8PathBuf;
    use linuxio_bridge::server::{BridgeConfig, BridgeKey, BridgeServer};
    use linuxio_proto::Value;
    use linuxio_task::ShutdownHandle;
    use std::sync::Arc;

    struct Fixture {
        client: ClientRuntime,
        _shutdown: ShutdownHandle,
        _dir: tempfile::TempDir,
    }

    async fn fixture(with_bridge: bool) -> (Fixture, SessionId) {
        let dir = tempfile::tempdir().unwrap();

        let mut conf = Conf::defaults();
        conf.runtime_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        conf.connect_attempts = 3;
        let conf_handle = ConfHandle::from_conf(conf.clone());

        let (store, rx) = session_store_channel();
        let (shutdown, signal) = ShutdownHandle::new();
        linuxio_task::spawn_task(SessionStoreTask::new(rx, &conf), signal).detach();

        let key = KeyMaterial::generate();
        let session_id = SmolStr::new("test-session-000000000000000000000000000000");

        std::fs::create_dir_all(conf.socket_dir().as_std_path()).unwrap();
        let snapshot = insert_test_session(&store, &conf, &session_id, Arc::clone(&key), true).await;

        if with_bridge {
            let listener = tokio::net::UnixListener::bind(snapshot.socket_path.as_std_path()).unwrap();
            let server = BridgeServer {
                session_id: session_id.clone(),
                bridge_key: BridgeKey::new(*key.bytes()),
                registry: linuxio_bridge::handlers::default_registry(),
                cfg: BridgeConfig::default(),
            };
            tokio::spawn(server.run(listener));
        }

        let manager = SessionManager::new(conf_handle.clone(), store);
        let client = ClientRuntime::new(conf_handle, manager);

        (
            Fixture {
                client,
                _shutdown: shutdown,
                _dir: dir,
            },
            session_id,
        )
    }

    #[tokio::test]
    async fn unary_call_reaches_the_bridge() {
        let (fixture, session_id) = fixture(true).await;

        let response = fixture
            .client
            .call(&session_id, "system.hostname", Record::new())
            .await
            .unwrap();

        assert!(!response.get_str("hostname").unwrap().is_empty());
    }

    #[tokio::test]
    async fn connection_is_reused_across_calls() {
        let (fixture, session_id) = fixture(true).await;

        for _ in 0..3 {
            fixture
                .client
                .call(&session_id, "system.echo", Record::new().with("x", Value::U64(1)))
                .await
                .unwrap();
        }

        assert_eq!(fixture.client.conns.lock().len(), 1);
    }

    #[tokio::test]
    async fn progress_records_are_delivered() {
        let (fixture, session_id) = fixture(true).await;

        let request = Record::new()
            .with("duration_ms", Value::U64(200))
            .with("steps", Value::U64(4));

        let mut seen = Vec::new();
        let response = fixture
            .client
            .call_progress(&session_id, "system.sleep", request, |record| {
                seen.push(record.get_u64("step").unwrap());
            })
            .await
            .unwrap();

        assert_eq!(response.get_u64("slept_ms"), Some(200));
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "progress out of order");
    }

    #[tokio::test]
    async fn bridge_error_kind_is_preserved() {
        let (fixture, session_id) = fixture(true).await;

        let error = fixture
            .client
            .call(&session_id, "wireguard.peers", Record::new())
            .await
            .unwrap_err();

        match error {
            CallError::Bridge { kind, .. } => assert_eq!(kind, ErrorKind::UnknownVerb),
            other => panic!("expected a bridge error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_listener_yields_bridge_unreachable() {
        let (fixture, session_id) = fixture(false).await;

        let error = fixture
            .client
            .call(&session_id, "system.hostname", Record::new())
            .await
            .unwrap_err();

        // The bridge "process" is still alive, so no respawn applies and
        // the connect budget decides.
        assert!(matches!(
            error,
            CallError::BridgeUnreachable | CallError::TransportReset
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let (fixture, _session_id) = fixture(false).await;

        let error = fixture
            .client
            .call(&SmolStr::new("who-is-this"), "system.hostname", Record::new())
            .await
            .unwrap_err();

        assert!(matches!(error, CallError::SessionNotFound));
    }
}
