//! Configuration: a JSON file merged with environment overrides, exposed
//! as an immutable snapshot behind a cloneable handle.
//!
//! Only operational knobs are read from the environment; secrets never
//! are.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use linuxio_mux::MuxConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CONF_PATH: &str = "/etc/linuxio/webserver.json";

#[derive(Debug, Clone)]
pub struct Conf {
    /// Base state directory; sockets live in `<runtime_dir>/linuxio/`.
    pub runtime_dir: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub log_filter: String,

    pub bridge_binary: Utf8PathBuf,
    pub auth_helper_binary: Utf8PathBuf,
    /// Hex SHA-256 overrides for development; release builds normally rely
    /// on the values embedded at build time.
    pub bridge_sha256: Option<String>,
    pub auth_helper_sha256: Option<String>,

    pub idle_session_limit: Duration,
    pub absolute_session_limit: Duration,
    pub gc_tick: Duration,
    pub ready_timeout: Duration,
    pub drain_grace: Duration,
    pub shutdown_deadline: Duration,

    pub connect_attempts: u32,
    pub connect_initial_backoff: Duration,
    pub default_call_deadline: Duration,

    pub mux: MuxConfig,
}

impl Conf {
    pub fn socket_dir(&self) -> Utf8PathBuf {
        self.runtime_dir.join("linuxio")
    }

    pub(crate) fn defaults() -> Self {
        Self {
            runtime_dir: Utf8PathBuf::from("/run"),
            log_file: Utf8PathBuf::from("/var/log/linuxio/webserver"),
            log_filter: "info".to_owned(),
            bridge_binary: Utf8PathBuf::from("/usr/libexec/linuxio/linuxio-bridge"),
            auth_helper_binary: Utf8PathBuf::from("/usr/libexec/linuxio/linuxio-auth-helper"),
            bridge_sha256: None,
            auth_helper_sha256: None,
            idle_session_limit: Duration::from_secs(30 * 60),
            absolute_session_limit: Duration::from_secs(12 * 60 * 60),
            gc_tick: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(40),
            connect_attempts: 5,
            connect_initial_backoff: Duration::from_millis(50),
            default_call_deadline: Duration::from_secs(30),
            mux: MuxConfig::default(),
        }
    }
}

/// On-disk representation; every field optional so partial files work.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfFile {
    pub runtime_dir: Option<Utf8PathBuf>,
    pub log_file: Option<Utf8PathBuf>,
    pub log_filter: Option<String>,
    pub bridge_binary: Option<Utf8PathBuf>,
    pub auth_helper_binary: Option<Utf8PathBuf>,
    pub bridge_sha256: Option<String>,
    pub auth_helper_sha256: Option<String>,
    pub idle_session_limit_secs: Option<u64>,
    pub absolute_session_limit_secs: Option<u64>,
    pub gc_tick_secs: Option<u64>,
    pub ready_timeout_secs: Option<u64>,
    pub drain_grace_secs: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub connect_initial_backoff_ms: Option<u64>,
    pub default_call_deadline_secs: Option<u64>,
}

#[derive(Clone)]
pub struct ConfHandle(Arc<Conf>);

impl ConfHandle {
    pub fn init() -> anyhow::Result<Self> {
        let conf_path = std::env::var("LINUXIO_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONF_PATH.to_owned());

        let file = if std::path::Path::new(&conf_path).exists() {
            let raw = std::fs::read_to_string(&conf_path).with_context(|| format!("couldn't read {conf_path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("invalid configuration in {conf_path}"))?
        } else {
            ConfFile::default()
        };

        Ok(Self(Arc::new(merge(file))))
    }

    /// Bypasses disk and environment; for tests.
    pub fn from_conf(conf: Conf) -> Self {
        Self(Arc::new(conf))
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.0)
    }
}

fn merge(file: ConfFile) -> Conf {
    let mut conf = Conf::defaults();

    if let Some(v) = file.runtime_dir {
        conf.runtime_dir = v;
    }
    if let Some(v) = file.log_file {
        conf.log_file = v;
    }
    if let Some(v) = file.log_filter {
        conf.log_filter = v;
    }
    if let Some(v) = file.bridge_binary {
        conf.bridge_binary = v;
    }
    if let Some(v) = file.auth_helper_binary {
        conf.auth_helper_binary = v;
    }
    conf.bridge_sha256 = file.bridge_sha256;
    conf.auth_helper_sha256 = file.auth_helper_sha256;
    if let Some(v) = file.idle_session_limit_secs {
        conf.idle_session_limit = Duration::from_secs(v);
    }
    if let Some(v) = file.absolute_session_limit_secs {
        conf.absolute_session_limit = Duration::from_secs(v);
    }
    if let Some(v) = file.gc_tick_secs {
        conf.gc_tick = Duration::from_secs(v);
    }
    if let Some(v) = file.ready_timeout_secs {
        conf.ready_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file.drain_grace_secs {
        conf.drain_grace = Duration::from_secs(v);
    }
    if let Some(v) = file.connect_attempts {
        conf.connect_attempts = v;
    }
    if let Some(v) = file.connect_initial_backoff_ms {
        conf.connect_initial_backoff = Duration::from_millis(v);
    }
    if let Some(v) = file.default_call_deadline_secs {
        conf.default_call_deadline = Duration::from_secs(v);
    }

    // Environment overrides, operational knobs only.
    if let Ok(v) = std::env::var("LINUXIO_RUNTIME_DIR") {
        conf.runtime_dir = Utf8PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("LINUXIO_LOG_LEVEL") {
        conf.log_filter = v;
    }
    if let Ok(v) = std::env::var("LINUXIO_IDLE_LIMIT_SECS") {
        if let Ok(secs) = v.parse() {
            conf.idle_session_limit = Duration::from_secs(secs);
        }
    }
    if let Ok(v) = std::env::var("LINUXIO_ABSOLUTE_LIMIT_SECS") {
        if let Ok(secs) = v.parse() {
            conf.absolute_session_limit = Duration::from_secs(secs);
        }
    }

    conf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let file: ConfFile = serde_json::from_str(r#"{ "log_filter": "debug", "gc_tick_secs": 5 }"#).expect("parses");
        let conf = merge(file);

        assert_eq!(conf.log_filter, "debug");
        assert_eq!(conf.gc_tick, Duration::from_secs(5));
        assert_eq!(conf.connect_attempts, 5);
        assert_eq!(conf.socket_dir(), Utf8PathBuf::from("/run/linuxio"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<ConfFile, _> = serde_json::from_str(r#"{ "no_such_knob": 1 }"#);
        assert!(parsed.is_err());
    }
}
