use std::io::Read as _;
use std::os::fd::{FromRawFd as _, RawFd};

use anyhow::Context as _;
use camino::Utf8PathBuf;
use linuxio_bridge::server::{BridgeConfig, BridgeKey, BridgeServer};
use linuxio_bridge::{handlers, privileges, server};
use linuxio_proto::BRIDGE_KEY_SIZE;
use smol_str::SmolStr;
use tracing::info;
use zeroize::Zeroizing;

struct Args {
    session_id: SmolStr,
    uid: u32,
    gid: u32,
    home: Utf8PathBuf,
    key_fd: RawFd,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut session_id = None;
    let mut uid = None;
    let mut gid = None;
    let mut home = None;
    let mut key_fd = None;

    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let mut next = |name: &str| {
            args.next()
                .with_context(|| format!("missing value for {name}"))
        };

        match arg.as_str() {
            "--session" => session_id = Some(SmolStr::new(next("--session")?)),
            "--uid" => uid = Some(next("--uid")?.parse().context("bad --uid")?),
            "--gid" => gid = Some(next("--gid")?.parse().context("bad --gid")?),
            "--home" => home = Some(Utf8PathBuf::from(next("--home")?)),
            "--key-fd" => key_fd = Some(next("--key-fd")?.parse().context("bad --key-fd")?),
            unknown => anyhow::bail!("unknown argument `{unknown}`"),
        }
    }

    Ok(Args {
        session_id: session_id.context("--session is required")?,
        uid: uid.context("--uid is required")?,
        gid: gid.context("--gid is required")?,
        home: home.context("--home is required")?,
        key_fd: key_fd.context("--key-fd is required")?,
    })
}

/// The key rides on an inherited pipe so it never appears in `argv`.
fn read_bridge_key(fd: RawFd) -> anyhow::Result<BridgeKey> {
    anyhow::ensure!(fd > 2, "key fd must not be a standard stream");

    // SAFETY: per the spawn contract, this fd is inherited for our
    // exclusive use; nothing else in the process touches it.
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };

    let mut key = Zeroizing::new([0u8; BRIDGE_KEY_SIZE]);
    file.read_exact(&mut *key).context("couldn't read bridge key")?;

    Ok(BridgeKey::new(*key))
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let bridge_key = read_bridge_key(args.key_fd)?;

    let log_filter = std::env::var("LINUXIO_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    let _logger_guard = linuxio_log::init_stderr_only(&log_filter).context("failed to setup logger")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        session.id = %args.session_id,
        uid = args.uid,
        gid = args.gid,
        "Bridge starting"
    );

    let runtime_dir = std::env::var("LINUXIO_RUNTIME_DIR").unwrap_or_else(|_| "/run".to_owned());
    let socket_dir = Utf8PathBuf::from(runtime_dir).join("linuxio");
    std::fs::create_dir_all(&socket_dir).with_context(|| format!("couldn't create {socket_dir}"))?;

    let socket_path = socket_dir.join(format!("{}.sock", args.session_id));
    let listener = server::bind_session_socket(&socket_path, args.uid, args.gid)?;

    privileges::drop_privileges(args.uid, args.gid).context("privilege drop failed")?;

    if let Err(error) = std::env::set_current_dir(&args.home) {
        info!(%error, home = %args.home, "Couldn't enter home directory, staying put");
    }

    // Parent is waiting on this line before considering us started.
    {
        use std::io::Write as _;
        let mut stdout = std::io::stdout();
        writeln!(stdout, "READY {}", std::process::id())?;
        stdout.flush()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    let result = runtime.block_on(async {
        listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(listener)?;

        let server = BridgeServer {
            session_id: args.session_id.clone(),
            bridge_key,
            registry: handlers::default_registry(),
            cfg: BridgeConfig::default(),
        };

        server.run(listener).await
    });

    let _ = std::fs::remove_file(&socket_path);

    info!("Bridge stopped");

    result
}
