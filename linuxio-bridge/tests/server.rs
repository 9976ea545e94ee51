#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use std::time::Duration;

use linuxio_bridge::handlers;
use linuxio_bridge::server::{BridgeConfig, BridgeKey, BridgeServer};
use linuxio_mux::{write_envelope, Multiplexer, Reply};
use linuxio_proto::{CallPayload, Envelope, HelloPayload, Kind, Record, StreamMode, DEFAULT_MAX_FRAME_SIZE};
use smol_str::SmolStr;
use tokio::io::AsyncReadExt as _;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

const SESSION_ID: &str = "mJ2pQ7vXr4sTn9bLw0cEyAzKd5fGh8iU";

fn spawn_server(dir: &std::path::Path, key: [u8; 32]) -> (std::path::PathBuf, JoinHandle<anyhow::Result<()>>) {
    let socket_path = dir.join("bridge.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = BridgeServer {
        session_id: SmolStr::new(SESSION_ID),
        bridge_key: BridgeKey::new(key),
        registry: handlers::default_registry(),
        cfg: BridgeConfig {
            hello_timeout: Duration::from_secs(1),
            ..BridgeConfig::default()
        },
    };

    let task = tokio::spawn(server.run(listener));
    (socket_path, task)
}

fn hello(key: [u8; 32], session_id: &str) -> Envelope {
    let payload = HelloPayload {
        bridge_key: key,
        session_id: SmolStr::new(session_id),
    };
    Envelope::record(Kind::Hello, 0, 0, payload.to_record())
}

#[tokio::test]
async fn wrong_bridge_key_closes_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = spawn_server(dir.path(), [0x11; 32]);

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    write_envelope(&mut stream, &hello([0x22; 32], SESSION_ID), DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap();

    // The bridge closes without answering anything; no handler runs.
    let mut buffer = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer))
        .await
        .expect("connection was not closed")
        .unwrap();
    assert_eq!(read, 0, "bridge must not speak to an unauthenticated peer");
}

#[tokio::test]
async fn wrong_session_id_closes_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = spawn_server(dir.path(), [0x11; 32]);

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    write_envelope(&mut stream, &hello([0x11; 32], "some-other-session"), DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap();

    let mut buffer = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer))
        .await
        .expect("connection was not closed")
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn three_strikes_terminate_the_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, server) = spawn_server(dir.path(), [0x11; 32]);

    for _ in 0..3 {
        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        write_envelope(&mut stream, &hello([0x99; 32], SESSION_ID), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        let mut buffer = [0u8; 16];
        let _ = stream.read(&mut buffer).await;
    }

    let outcome = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("bridge kept running after three unauthorized HELLOs")
        .unwrap();
    assert!(outcome.is_err());
}

#[test]
fn session_socket_is_private_to_its_owner() {
    use std::os::unix::fs::MetadataExt as _;

    let dir = tempfile::tempdir().unwrap();
    let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("session.sock")).unwrap();

    // SAFETY: getuid has no preconditions.
    let uid = unsafe { libc::getuid() };
    // SAFETY: getgid has no preconditions.
    let gid = unsafe { libc::getgid() };

    let _listener = linuxio_bridge::server::bind_session_socket(&path, uid, gid).unwrap();

    let metadata = std::fs::metadata(path.as_std_path()).unwrap();
    assert_eq!(metadata.mode() & 0o777, 0o600);
    assert_eq!(metadata.uid(), uid);
}

#[tokio::test]
async fn authenticated_connection_serves_calls() {
    let dir = tempfile::tempdir().unwrap();
    let key = [0x3c; 32];
    let (socket_path, _server) = spawn_server(dir.path(), key);

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    write_envelope(&mut stream, &hello(key, SESSION_ID), DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap();

    let (read_half, write_half) = stream.into_split();
    let client = Multiplexer::new(Box::new(read_half), Box::new(write_half)).spawn();

    let call = CallPayload {
        verb: SmolStr::new("system.hostname"),
        mode: StreamMode::Unary,
        deadline_ms: 5_000,
        request: Record::new(),
    };

    let mut stream = client.handle.open_stream(call, 1).await.unwrap();
    match stream.await_reply().await.unwrap() {
        Reply::Ok(response) => assert!(!response.get_str("hostname").unwrap().is_empty()),
        Reply::Err(error) => panic!("unexpected error: {error:?}"),
    }
}
