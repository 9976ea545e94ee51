//! Authoritative session registry and its garbage collector.
//!
//! The map is owned by a single actor task; every other component talks to
//! it through [`SessionStoreHandle`], which gives the single-writer
//! discipline without a lock held across suspension points. Slow work
//! (killing bridges, waiting out the drain grace) happens outside the
//! actor, on entries already removed from the map.

use std::collections::HashMap;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use camino::Utf8PathBuf;
use futures::future::Either;
use linuxio_task::{ShutdownSignal, Task};
use rand::RngCore as _;
use serde::Serialize;
use smol_str::SmolStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::auth::{self, AuthError};
use crate::bridge::{self, BridgeHandle, SpawnError};
use crate::config::ConfHandle;

pub type SessionId = SmolStr;

/// Tombstones are kept this long so lookups can still answer `Expired`.
const TOMBSTONE_RETENTION: Duration = Duration::from_secs(60 * 60);

/// 256 bits of entropy, URL-safe.
pub fn new_session_id() -> SessionId {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    SmolStr::new(URL_SAFE_NO_PAD.encode(raw))
}

/// Per-session shared secret; zeroed on drop, never printed.
pub struct KeyMaterial(Zeroizing<[u8; linuxio_proto::BRIDGE_KEY_SIZE]>);

impl KeyMaterial {
    pub fn generate() -> Arc<Self> {
        let mut raw = Zeroizing::new([0u8; linuxio_proto::BRIDGE_KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(&mut *raw);
        Arc::new(Self(raw))
    }

    pub fn bytes(&self) -> &[u8; linuxio_proto::BRIDGE_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Logout,
    IdleExpired,
    AbsoluteExpired,
    BridgeLost,
    SocketVanished,
    Shutdown,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DestroyReason::Logout => "logout",
            DestroyReason::IdleExpired => "idle expiry",
            DestroyReason::AbsoluteExpired => "absolute expiry",
            DestroyReason::BridgeLost => "bridge lost",
            DestroyReason::SocketVanished => "socket vanished",
            DestroyReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

struct SessionEntry {
    id: SessionId,
    username: String,
    uid: u32,
    gid: u32,
    home: Utf8PathBuf,
    primary_group: String,
    created_at: OffsetDateTime,
    last_seen: Instant,
    absolute_deadline: Instant,
    socket_path: Utf8PathBuf,
    bridge: BridgeHandle,
    key: Arc<KeyMaterial>,
}

impl SessionEntry {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            username: self.username.clone(),
            uid: self.uid,
            gid: self.gid,
            home: self.home.clone(),
            primary_group: self.primary_group.clone(),
            created_at: self.created_at,
            socket_path: self.socket_path.clone(),
            bridge: self.bridge.clone(),
            key: Arc::clone(&self.key),
        }
    }
}

/// Read-only view of a live session, safe to pass around.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: Utf8PathBuf,
    pub primary_group: String,
    pub created_at: OffsetDateTime,
    pub socket_path: Utf8PathBuf,
    pub bridge: BridgeHandle,
    pub key: Arc<KeyMaterial>,
}

/// Operator-facing list entry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub username: String,
    pub uid: u32,
    pub bridge_pid: u32,
    pub created_at: String,
    pub idle_secs: u64,
}

#[derive(Debug)]
pub enum LookupResult {
    Found(SessionSnapshot),
    Expired,
    NotFound,
}

/// A session pulled out of the map; the caller finishes the teardown.
pub struct RemovedSession {
    pub id: SessionId,
    pub reason: DestroyReason,
    pub username: String,
    pub socket_path: Utf8PathBuf,
    pub bridge: BridgeHandle,
}

enum StoreMessage {
    Insert {
        entry: Box<SessionEntry>,
        reply: oneshot::Sender<()>,
    },
    Lookup {
        id: SessionId,
        touch: bool,
        reply: oneshot::Sender<LookupResult>,
    },
    Remove {
        id: SessionId,
        reason: DestroyReason,
        reply: oneshot::Sender<Option<RemovedSession>>,
    },
    ReplaceBridge {
        id: SessionId,
        bridge: BridgeHandle,
        key: Arc<KeyMaterial>,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    List {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    CollectGarbage {
        reply: oneshot::Sender<Vec<RemovedSession>>,
    },
}

impl fmt::Debug for StoreMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreMessage::Insert { entry, .. } => f
                .debug_struct("Insert")
                .field("id", &entry.id)
                .field("user", &entry.username)
                .finish_non_exhaustive(),
            StoreMessage::Lookup { id, touch, .. } => f
                .debug_struct("Lookup")
                .field("id", id)
                .field("touch", touch)
                .finish_non_exhaustive(),
            StoreMessage::Remove { id, reason, .. } => f
                .debug_struct("Remove")
                .field("id", id)
                .field("reason", reason)
                .finish_non_exhaustive(),
            StoreMessage::ReplaceBridge { id, .. } => {
                f.debug_struct("ReplaceBridge").field("id", id).finish_non_exhaustive()
            }
            StoreMessage::List { .. } => f.debug_struct("List").finish_non_exhaustive(),
            StoreMessage::Count { .. } => f.debug_struct("Count").finish_non_exhaustive(),
            StoreMessage::CollectGarbage { .. } => f.debug_struct("CollectGarbage").finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
pub struct SessionStoreHandle(mpsc::Sender<StoreMessage>);

impl SessionStoreHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StoreMessage,
        what: &'static str,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(build(tx))
            .await
            .ok()
            .with_context(|| format!("couldn't send {what} message"))?;
        rx.await.with_context(|| format!("couldn't receive {what} reply"))
    }

    pub async fn lookup(&self, id: &SessionId, touch: bool) -> anyhow::Result<LookupResult> {
        self.request(
            |reply| StoreMessage::Lookup {
                id: id.clone(),
                touch,
                reply,
            },
            "Lookup",
        )
        .await
    }

    pub async fn remove(&self, id: &SessionId, reason: DestroyReason) -> anyhow::Result<Option<RemovedSession>> {
        self.request(
            |reply| StoreMessage::Remove {
                id: id.clone(),
                reason,
                reply,
            },
            "Remove",
        )
        .await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<SessionInfo>> {
        self.request(|reply| StoreMessage::List { reply }, "List").await
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        self.request(|reply| StoreMessage::Count { reply }, "Count").await
    }

    pub async fn collect_garbage(&self) -> anyhow::Result<Vec<RemovedSession>> {
        self.request(|reply| StoreMessage::CollectGarbage { reply }, "CollectGarbage")
            .await
    }

    async fn insert(&self, entry: SessionEntry) -> anyhow::Result<()> {
        self.request(
            |reply| StoreMessage::Insert {
                entry: Box::new(entry),
                reply,
            },
            "Insert",
        )
        .await
    }

    async fn replace_bridge(
        &self,
        id: &SessionId,
        bridge: BridgeHandle,
        key: Arc<KeyMaterial>,
    ) -> anyhow::Result<Option<SessionSnapshot>> {
        self.request(
            |reply| StoreMessage::ReplaceBridge {
                id: id.clone(),
                bridge,
                key,
                reply,
            },
            "ReplaceBridge",
        )
        .await
    }
}

pub struct SessionStoreReceiver(mpsc::Receiver<StoreMessage>);

pub fn session_store_channel() -> (SessionStoreHandle, SessionStoreReceiver) {
    let (tx, rx) = mpsc::channel(64);
    (SessionStoreHandle(tx), SessionStoreReceiver(rx))
}

pub struct SessionStoreTask {
    rx: SessionStoreReceiver,
    idle_limit: Duration,
    sessions: HashMap<SessionId, SessionEntry>,
    tombstones: HashMap<SessionId, (DestroyReason, Instant)>,
}

impl SessionStoreTask {
    pub fn new(rx: SessionStoreReceiver, conf: &crate::config::Conf) -> Self {
        Self {
            rx,
            idle_limit: conf.idle_session_limit,
            sessions: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    fn handle_message(&mut self, msg: StoreMessage) {
        trace!(?msg, "Received message");

        match msg {
            StoreMessage::Insert { entry, reply } => {
                let id = entry.id.clone();
                self.sessions.insert(id.clone(), *entry);
                debug!(session.id = %id, "Session registered");
                let _ = reply.send(());
            }
            StoreMessage::Lookup { id, touch, reply } => {
                let result = match self.sessions.get_mut(&id) {
                    Some(entry) => {
                        if touch {
                            entry.last_seen = Instant::now();
                        }
                        LookupResult::Found(entry.snapshot())
                    }
                    None => match self.tombstones.get(&id) {
                        Some((DestroyReason::IdleExpired | DestroyReason::AbsoluteExpired, _)) => LookupResult::Expired,
                        _ => LookupResult::NotFound,
                    },
                };
                let _ = reply.send(result);
            }
            StoreMessage::Remove { id, reason, reply } => {
                let removed = self.remove_entry(&id, reason);
                let _ = reply.send(removed);
            }
            StoreMessage::ReplaceBridge { id, bridge, key, reply } => {
                let snapshot = self.sessions.get_mut(&id).map(|entry| {
                    entry.bridge = bridge;
                    entry.key = key;
                    entry.last_seen = Instant::now();
                    entry.snapshot()
                });
                let _ = reply.send(snapshot);
            }
            StoreMessage::List { reply } => {
                let now = Instant::now();
                let infos = self
                    .sessions
                    .values()
                    .map(|entry| SessionInfo {
                        id: entry.id.clone(),
                        username: entry.username.clone(),
                        uid: entry.uid,
                        bridge_pid: entry.bridge.pid(),
                        created_at: entry
                            .created_at
                            .format(&Rfc3339)
                            .unwrap_or_else(|_| entry.created_at.to_string()),
                        idle_secs: now.duration_since(entry.last_seen).as_secs(),
                    })
                    .collect();
                let _ = reply.send(infos);
            }
            StoreMessage::Count { reply } => {
                let _ = reply.send(self.sessions.len());
            }
            StoreMessage::CollectGarbage { reply } => {
                let _ = reply.send(self.sweep());
            }
        }
    }

    fn remove_entry(&mut self, id: &SessionId, reason: DestroyReason) -> Option<RemovedSession> {
        let entry = self.sessions.remove(id)?;
        self.tombstones.insert(id.clone(), (reason, Instant::now()));

        Some(RemovedSession {
            id: entry.id,
            reason,
            username: entry.username,
            socket_path: entry.socket_path,
            bridge: entry.bridge,
        })
    }

    fn sweep(&mut self) -> Vec<RemovedSession> {
        let now = Instant::now();

        let due: Vec<(SessionId, DestroyReason)> = self
            .sessions
            .values()
            .filter_map(|entry| {
                let reason = if now >= entry.absolute_deadline {
                    DestroyReason::AbsoluteExpired
                } else if now.duration_since(entry.last_seen) >= self.idle_limit {
                    DestroyReason::IdleExpired
                } else if !entry.bridge.is_alive() {
                    DestroyReason::BridgeLost
                } else if !entry.socket_path.as_std_path().exists() {
                    DestroyReason::SocketVanished
                } else {
                    return None;
                };
                Some((entry.id.clone(), reason))
            })
            .collect();

        self.tombstones
            .retain(|_, (_, when)| now.duration_since(*when) < TOMBSTONE_RETENTION);

        due.into_iter()
            .filter_map(|(id, reason)| self.remove_entry(&id, reason))
            .collect()
    }
}

#[async_trait]
impl Task for SessionStoreTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session store";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        session_store_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn session_store_task(mut store: SessionStoreTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("Task started");

    loop {
        tokio::select! {
            msg = store.rx.0.recv() => {
                let Some(msg) = msg else {
                    warn!("All senders are dead");
                    break;
                };
                store.handle_message(msg);
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    debug!("Task is stopping; serving leftover messages");

    // Shutdown teardown still needs Remove/List answered; assume no more
    // work after a second of inactivity.
    loop {
        let msg = match futures::future::select(
            pin!(store.rx.0.recv()),
            pin!(tokio::time::sleep(Duration::from_secs(1))),
        )
        .await
        {
            Either::Left((Some(msg), _)) => msg,
            Either::Left((None, _)) => break,
            Either::Right(_) => break,
        };

        store.handle_message(msg);
    }

    debug!("Task terminated");

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Auth(AuthError),
    #[error("bridge binary failed its hash check")]
    BridgeTampered,
    #[error("bridge did not report READY in time")]
    BridgeStartTimeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CreateError {
    pub fn kind(&self) -> linuxio_proto::ErrorKind {
        match self {
            CreateError::Auth(error) => error.kind(),
            CreateError::BridgeTampered => linuxio_proto::ErrorKind::BridgeTampered,
            CreateError::BridgeStartTimeout => linuxio_proto::ErrorKind::BridgeStartTimeout,
            CreateError::Other(_) => linuxio_proto::ErrorKind::Internal,
        }
    }
}

/// Front door for session lifecycle: authenticates, spawns bridges, and
/// owns the teardown dance. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    conf: ConfHandle,
    store: SessionStoreHandle,
}

impl SessionManager {
    pub fn new(conf: ConfHandle, store: SessionStoreHandle) -> Self {
        Self { conf, store }
    }

    pub fn store(&self) -> &SessionStoreHandle {
        &self.store
    }

    /// Authenticates and brings up a bridge for the new session.
    pub async fn create(&self, username: &str, password: &str) -> Result<SessionSnapshot, CreateError> {
        let conf = self.conf.get_conf();

        let identity = auth::authenticate(&conf.auth_helper_binary, username, password)
            .await
            .map_err(CreateError::Auth)?;

        let id = new_session_id();
        let key = KeyMaterial::generate();
        let socket_path = conf.socket_dir().join(format!("{id}.sock"));

        let span = info_span!("session", session.id = %id, user = %identity.username);

        let bridge = tracing::Instrument::instrument(bridge::spawn_bridge(&conf, &id, &identity, key.bytes()), span);
        let bridge = bridge.await.map_err(|error| match error {
            SpawnError::Tampered => CreateError::BridgeTampered,
            SpawnError::StartTimeout => CreateError::BridgeStartTimeout,
            SpawnError::Other(error) => CreateError::Other(error),
        })?;

        let now = Instant::now();
        let entry = SessionEntry {
            id: id.clone(),
            username: identity.username.clone(),
            uid: identity.uid,
            gid: identity.gid,
            home: identity.home.clone(),
            primary_group: identity.primary_group.clone(),
            created_at: OffsetDateTime::now_utc(),
            last_seen: now,
            absolute_deadline: now + conf.absolute_session_limit,
            socket_path,
            bridge,
            key,
        };
        let snapshot = entry.snapshot();

        self.store.insert(entry).await?;

        info!(session.id = %id, user = %identity.username, pid = snapshot.bridge.pid(), "Session created");

        Ok(snapshot)
    }

    pub async fn lookup(&self, id: &SessionId) -> anyhow::Result<LookupResult> {
        self.store.lookup(id, false).await
    }

    /// Lookup that also refreshes the idle clock.
    pub async fn touch(&self, id: &SessionId) -> anyhow::Result<LookupResult> {
        self.store.lookup(id, true).await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<SessionInfo>> {
        self.store.list().await
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        self.store.count().await
    }

    /// Idempotent; returns whether a session was actually destroyed.
    pub async fn destroy(&self, id: &SessionId, reason: DestroyReason) -> anyhow::Result<bool> {
        match self.store.remove(id, reason).await? {
            Some(removed) => {
                finish_destroy(removed, self.conf.get_conf().drain_grace).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One-shot bridge replacement after a confirmed crash. A fresh key is
    /// generated; the old one died with the old process.
    pub async fn respawn_bridge(&self, id: &SessionId) -> Result<SessionSnapshot, CreateError> {
        let conf = self.conf.get_conf();

        let snapshot = match self.store.lookup(id, false).await? {
            LookupResult::Found(snapshot) => snapshot,
            LookupResult::Expired | LookupResult::NotFound => {
                return Err(CreateError::Other(anyhow::anyhow!("session is gone")))
            }
        };

        if snapshot.bridge.is_alive() {
            return Err(CreateError::Other(anyhow::anyhow!("bridge is still alive")));
        }

        let identity = auth::Identity {
            username: snapshot.username.clone(),
            uid: snapshot.uid,
            gid: snapshot.gid,
            home: snapshot.home.clone(),
            primary_group: snapshot.primary_group.clone(),
        };

        let key = KeyMaterial::generate();

        let respawned = bridge::spawn_bridge(&conf, id, &identity, key.bytes()).await;

        let bridge = match respawned {
            Ok(bridge) => bridge,
            Err(error) => {
                warn!(session.id = %id, error = %error, "Bridge respawn failed, destroying session");
                let _ = self.destroy(id, DestroyReason::BridgeLost).await;
                return Err(match error {
                    SpawnError::Tampered => CreateError::BridgeTampered,
                    SpawnError::StartTimeout => CreateError::BridgeStartTimeout,
                    SpawnError::Other(error) => CreateError::Other(error),
                });
            }
        };

        match self.store.replace_bridge(id, bridge, key).await? {
            Some(snapshot) => {
                info!(session.id = %id, pid = snapshot.bridge.pid(), "Bridge respawned");
                Ok(snapshot)
            }
            None => Err(CreateError::Other(anyhow::anyhow!("session vanished during respawn"))),
        }
    }

    /// Destroys every live session in parallel, bounded by `deadline`.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let infos = match self.store.list().await {
            Ok(infos) => infos,
            Err(error) => {
                warn!(error = format!("{error:#}"), "Couldn't list sessions for shutdown");
                return;
            }
        };

        let teardowns = infos.into_iter().map(|info| {
            let manager = self.clone();
            async move {
                if let Err(error) = manager.destroy(&info.id, DestroyReason::Shutdown).await {
                    warn!(session.id = %info.id, error = format!("{error:#}"), "Session teardown failed");
                }
            }
        });

        if tokio::time::timeout(deadline, futures::future::join_all(teardowns))
            .await
            .is_err()
        {
            warn!("Shutdown deadline expired with sessions still tearing down");
        }
    }
}

/// Terminates the bridge (drain, then force) and removes the socket file.
pub async fn finish_destroy(removed: RemovedSession, grace: Duration) {
    info!(
        session.id = %removed.id,
        user = %removed.username,
        reason = %removed.reason,
        "Destroying session"
    );

    removed.bridge.signal_terminate();

    if tokio::time::timeout(grace, removed.bridge.exited()).await.is_err() {
        warn!(session.id = %removed.id, "Bridge ignored SIGTERM past the grace period, killing");
        removed.bridge.signal_kill();
        let _ = tokio::time::timeout(Duration::from_secs(5), removed.bridge.exited()).await;
    }

    // The bridge unlinks its socket on clean exit; SIGKILL leaves it.
    if removed.socket_path.as_std_path().exists() {
        if let Err(error) = std::fs::remove_file(removed.socket_path.as_std_path()) {
            warn!(%error, path = %removed.socket_path, "Couldn't remove session socket");
        }
    }
}

/// Background sweeper: destroys expired, idle and orphaned sessions.
pub struct GcTask {
    pub conf: ConfHandle,
    pub store: SessionStoreHandle,
}

#[async_trait]
impl Task for GcTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session gc";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let conf = self.conf.get_conf();
        let mut tick = tokio::time::interval(conf.gc_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Task started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let removed = match self.store.collect_garbage().await {
                        Ok(removed) => removed,
                        Err(error) => {
                            // The store went away; nothing left to sweep.
                            debug!(error = format!("{error:#}"), "Couldn't sweep sessions");
                            break;
                        }
                    };

                    if removed.is_empty() {
                        continue;
                    }

                    let grace = conf.drain_grace;
                    let teardowns = removed.into_iter().map(|session| finish_destroy(session, grace));
                    futures::future::join_all(teardowns).await;
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

/// Registers a synthetic session whose "bridge" is a detached handle; for
/// exercising the client runtime without spawning processes.
#[cfg(test)]
pub(crate) async fn insert_test_session(
    store: &SessionStoreHandle,
    conf: &crate::config::Conf,
    id: &str,
    key: Arc<KeyMaterial>,
    bridge_alive: bool,
) -> SessionSnapshot {
    let now = Instant::now();
    let entry = SessionEntry {
        id: SmolStr::new(id),
        username: "alice".to_owned(),
        uid: 1000,
        gid: 1000,
        home: Utf8PathBuf::from("/home/alice"),
        primary_group: "alice".to_owned(),
        created_at: OffsetDateTime::now_utc(),
        last_seen: now,
        absolute_deadline: now + conf.absolute_session_limit,
        socket_path: conf.socket_dir().join(format!("{id}.sock")),
        bridge: BridgeHandle::fake(4242, bridge_alive),
        key,
    };
    let snapshot = entry.snapshot();
    store.insert(entry).await.expect("insert test session");
    snapshot
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::config::Conf;
    use linuxio_task::ShutdownHandle;

    fn test_conf(dir: &std::path::Path) -> Conf {
        let mut conf = Conf::defaults();
        conf.runtime_dir = Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
        conf
    }

    fn spawn_store(conf: &Conf) -> (SessionStoreHandle, ShutdownHandle) {
        let (handle, rx) = session_store_channel();
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let task = SessionStoreTask::new(rx, conf);
        linuxio_task::spawn_task(task, shutdown_signal).detach();
        (handle, shutdown_handle)
    }

    async fn insert_fake_session(handle: &SessionStoreHandle, conf: &Conf, id: &str, alive: bool) -> Utf8PathBuf {
        let socket_path = conf.socket_dir().join(format!("{id}.sock"));
        std::fs::create_dir_all(conf.socket_dir().as_std_path()).unwrap();
        std::fs::write(socket_path.as_std_path(), b"").unwrap();

        let now = Instant::now();
        let entry = SessionEntry {
            id: SmolStr::new(id),
            username: "alice".to_owned(),
            uid: 1000,
            gid: 1000,
            home: Utf8PathBuf::from("/home/alice"),
            primary_group: "alice".to_owned(),
            created_at: OffsetDateTime::now_utc(),
            last_seen: now,
            absolute_deadline: now + conf.absolute_session_limit,
            socket_path: socket_path.clone(),
            bridge: BridgeHandle::fake(4242, alive),
            key: KeyMaterial::generate(),
        };

        handle.insert(entry).await.unwrap();
        socket_path
    }

    #[tokio::test]
    async fn lookup_and_touch() {
        let dir = tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        let (store, _shutdown) = spawn_store(&conf);

        insert_fake_session(&store, &conf, "sid-1", true).await;

        assert!(matches!(store.lookup(&SmolStr::new("sid-1"), true).await.unwrap(), LookupResult::Found(_)));
        assert!(matches!(store.lookup(&SmolStr::new("nope"), false).await.unwrap(), LookupResult::NotFound));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_collected_and_lookup_reports_expired() {
        let dir = tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        let (store, _shutdown) = spawn_store(&conf);

        insert_fake_session(&store, &conf, "sid-idle", true).await;

        // Not yet idle: nothing to collect.
        assert!(store.collect_garbage().await.unwrap().is_empty());

        tokio::time::advance(conf.idle_session_limit + Duration::from_secs(1)).await;

        let removed = store.collect_garbage().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].reason, DestroyReason::IdleExpired);

        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.lookup(&SmolStr::new("sid-idle"), false).await.unwrap(),
            LookupResult::Expired
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn touched_sessions_survive_the_idle_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        let (store, _shutdown) = spawn_store(&conf);

        insert_fake_session(&store, &conf, "sid-active", true).await;

        tokio::time::advance(conf.idle_session_limit / 2).await;
        let _ = store.lookup(&SmolStr::new("sid-active"), true).await.unwrap();
        tokio::time::advance(conf.idle_session_limit / 2 + Duration::from_secs(1)).await;

        assert!(store.collect_garbage().await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn absolute_expiry_wins_over_touch() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.absolute_session_limit = Duration::from_secs(60);
        let (store, _shutdown) = spawn_store(&conf);

        insert_fake_session(&store, &conf, "sid-old", true).await;

        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(10)).await;
            let _ = store.lookup(&SmolStr::new("sid-old"), true).await.unwrap();
        }

        let removed = store.collect_garbage().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].reason, DestroyReason::AbsoluteExpired);
    }

    #[tokio::test]
    async fn dead_bridge_is_collected_as_bridge_lost() {
        let dir = tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        let (store, _shutdown) = spawn_store(&conf);

        insert_fake_session(&store, &conf, "sid-dead", false).await;

        let removed = store.collect_garbage().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].reason, DestroyReason::BridgeLost);
    }

    #[tokio::test]
    async fn missing_socket_is_collected() {
        let dir = tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        let (store, _shutdown) = spawn_store(&conf);

        let socket_path = insert_fake_session(&store, &conf, "sid-nosock", true).await;
        std::fs::remove_file(socket_path.as_std_path()).unwrap();

        let removed = store.collect_garbage().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].reason, DestroyReason::SocketVanished);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        let (store, _shutdown) = spawn_store(&conf);

        insert_fake_session(&store, &conf, "sid-gone", true).await;

        let id = SmolStr::new("sid-gone");
        assert!(store.remove(&id, DestroyReason::Logout).await.unwrap().is_some());
        assert!(store.remove(&id, DestroyReason::Logout).await.unwrap().is_none());
        assert!(matches!(store.lookup(&id, false).await.unwrap(), LookupResult::NotFound));
    }

    #[test]
    fn session_ids_are_long_and_url_safe() {
        let id = new_session_id();
        assert!(id.len() >= 43);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(id, new_session_id());
    }
}
