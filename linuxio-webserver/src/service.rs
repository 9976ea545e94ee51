//! Service bootstrap and teardown ordering: logger first, helper binary
//! pins before anything can spawn, the store before the GC, and on the way
//! down the GC first, then every session, then the runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use linuxio_log::{LogDeleterTask, LoggerGuard};
use linuxio_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use tokio::runtime::{self, Runtime};

use crate::client::ClientRuntime;
use crate::config::ConfHandle;
use crate::log::WebserverLog;
use crate::pinning;
use crate::session::{session_store_channel, GcTask, SessionManager, SessionStoreTask};

pub const SERVICE_NAME: &str = "linuxio-webserver";

/// Everything the (out-of-scope) HTTP layer mounts on.
#[derive(Clone)]
pub struct WebserverState {
    pub conf_handle: ConfHandle,
    pub sessions: SessionManager,
    pub client: Arc<ClientRuntime>,
    pub shutdown_signal: ShutdownSignal,
}

#[allow(clippy::large_enum_variant, reason = "`Running` is bigger than `Stopped` but there is only one")]
enum ServiceState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
        sessions: SessionManager,
    },
}

pub struct WebserverService {
    conf_handle: ConfHandle,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl WebserverService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard = linuxio_log::init::<WebserverLog>(&conf.log_file, &conf.log_filter)
            .context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        // A tampered helper must be caught before any session can exist.
        let expected_auth: Option<&str> = conf
            .auth_helper_sha256
            .as_deref()
            .or_else(|| pinning::embedded_auth_helper_sha256());
        if let Err(error) = pinning::verify_binary(&conf.auth_helper_binary, expected_auth) {
            error!(%error, "AuthHelperTampered");
            anyhow::bail!("auth helper failed verification: {error}");
        }

        let expected_bridge: Option<&str> =
            conf.bridge_sha256.as_deref().or_else(|| pinning::embedded_bridge_sha256());
        if let Err(error) = pinning::verify_binary(&conf.bridge_binary, expected_bridge) {
            error!(%error, "BridgeTampered");
            anyhow::bail!("bridge binary failed verification: {error}");
        }

        prepare_runtime_dir(&conf)?;

        Ok(WebserverService {
            conf_handle,
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<WebserverState> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        let (state, tasks) = runtime.block_on(async move { spawn_tasks(conf_handle) })?;

        trace!("Tasks created");

        let sessions = state.sessions.clone();

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ServiceState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
            sessions,
        };

        Ok(state)
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("Attempted to stop the service, but it's already stopped");
            }
            ServiceState::Running {
                shutdown_handle,
                runtime,
                sessions,
            } => {
                info!("Stopping service");

                let conf = self.conf_handle.get_conf();

                // Stops the GC first so it cannot race the teardown.
                shutdown_handle.signal();

                runtime.block_on(async {
                    sessions.shutdown_all(conf.shutdown_deadline).await;

                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn't terminate at all");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));
            }
        }
    }
}

fn prepare_runtime_dir(conf: &crate::config::Conf) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let dir = conf.socket_dir();
    std::fs::create_dir_all(dir.as_std_path()).with_context(|| format!("couldn't create {dir}"))?;
    std::fs::set_permissions(dir.as_std_path(), std::fs::Permissions::from_mode(0o750))
        .with_context(|| format!("couldn't set permissions on {dir}"))?;

    Ok(())
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: linuxio_task::Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = linuxio_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<(WebserverState, Tasks)> {
    let conf = conf_handle.get_conf();

    let (store_handle, store_rx) = session_store_channel();
    let mut tasks = Tasks::new();

    let sessions = SessionManager::new(conf_handle.clone(), store_handle.clone());
    let client = Arc::new(ClientRuntime::new(conf_handle.clone(), sessions.clone()));

    let state = WebserverState {
        conf_handle: conf_handle.clone(),
        sessions: sessions.clone(),
        client,
        shutdown_signal: tasks.shutdown_signal.clone(),
    };

    tasks.register(SessionStoreTask::new(store_rx, &conf));

    tasks.register(GcTask {
        conf: conf_handle,
        store: store_handle,
    });

    tasks.register(LogDeleterTask::<WebserverLog>::new(conf.log_file.clone()));

    Ok((state, tasks))
}
