use std::os::unix::fs::MetadataExt as _;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use linuxio_mux::DataEvent;
use linuxio_proto::{ErrorKind, Record, Value};
use smol_str::SmolStr;
use tokio::fs;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::dispatch::{ByteStreamHandler, CallContext, HandlerError, HandlerResult, StreamIo, UnaryHandler};

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

fn io_error(context: &str, error: std::io::Error) -> HandlerError {
    let kind = match error.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::Other(SmolStr::new("NotFound")),
        std::io::ErrorKind::PermissionDenied => ErrorKind::Other(SmolStr::new("PermissionDenied")),
        _ => ErrorKind::Other(SmolStr::new("Io")),
    };
    HandlerError::new(kind, format!("{context}: {error}"))
}

fn request_path(request: &Record) -> Result<&str, HandlerError> {
    request
        .get_str("path")
        .ok_or_else(|| HandlerError::invalid_request("missing `path` field"))
}

pub(crate) struct StatHandler;

#[async_trait]
impl UnaryHandler for StatHandler {
    async fn handle(&self, _ctx: CallContext, request: Record) -> HandlerResult {
        let path = request_path(&request)?;

        let metadata = fs::symlink_metadata(path)
            .await
            .map_err(|error| io_error("stat", error))?;

        let modified_unix = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |duration| duration.as_secs());

        Ok(Record::new()
            .with("size", Value::U64(metadata.len()))
            .with("mode", Value::U64(u64::from(metadata.mode())))
            .with("uid", Value::U64(u64::from(metadata.uid())))
            .with("gid", Value::U64(u64::from(metadata.gid())))
            .with("is_dir", Value::Bool(metadata.is_dir()))
            .with("is_symlink", Value::Bool(metadata.file_type().is_symlink()))
            .with("modified_unix", Value::U64(modified_unix)))
    }
}

/// Receives a byte stream into a file. A cancelled upload leaves nothing
/// behind.
pub(crate) struct UploadHandler;

#[async_trait]
impl ByteStreamHandler for UploadHandler {
    async fn handle(&self, _ctx: CallContext, request: Record, mut io: StreamIo) -> HandlerResult {
        let path = request_path(&request)?.to_owned();

        let mut file = fs::File::create(&path)
            .await
            .map_err(|error| io_error("create", error))?;

        let mut bytes_written: u64 = 0;

        loop {
            match io.reader.read_data().await {
                Ok(DataEvent::Data(chunk)) => {
                    file.write_all(&chunk)
                        .await
                        .map_err(|error| io_error("write", error))?;
                    bytes_written += chunk.len() as u64;

                    let _ = io
                        .progress
                        .send(Record::new().with("bytes_written", Value::U64(bytes_written)));
                }
                Ok(DataEvent::End) => break,
                Ok(DataEvent::Cancelled) | Err(_) => {
                    drop(file);
                    if let Err(error) = fs::remove_file(&path).await {
                        warn!(%error, path, "Couldn't remove partial upload");
                    }
                    return Err(HandlerError::cancelled());
                }
            }
        }

        file.flush().await.map_err(|error| io_error("flush", error))?;

        Ok(Record::new().with("bytes_written", Value::U64(bytes_written)))
    }
}

/// Streams a file out in chunks, with byte-count progress.
pub(crate) struct DownloadHandler;

#[async_trait]
impl ByteStreamHandler for DownloadHandler {
    async fn handle(&self, ctx: CallContext, request: Record, io: StreamIo) -> HandlerResult {
        let path = request_path(&request)?;

        let mut file = fs::File::open(path).await.map_err(|error| io_error("open", error))?;
        let size = file
            .metadata()
            .await
            .map_err(|error| io_error("stat", error))?
            .len();

        let mut bytes_sent: u64 = 0;
        let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE];

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::cancelled());
            }

            let read = file
                .read(&mut buffer)
                .await
                .map_err(|error| io_error("read", error))?;
            if read == 0 {
                break;
            }

            io.writer
                .write_data(Bytes::copy_from_slice(&buffer[..read]))
                .await
                .map_err(|error| HandlerError::internal(format!("stream write: {error}")))?;
            bytes_sent += read as u64;

            let _ = io.progress.send(
                Record::new()
                    .with("bytes_sent", Value::U64(bytes_sent))
                    .with("size", Value::U64(size)),
            );
        }

        io.writer
            .finish_data()
            .map_err(|error| HandlerError::internal(format!("stream end: {error}")))?;

        Ok(Record::new()
            .with("bytes_sent", Value::U64(bytes_sent))
            .with("size", Value::U64(size)))
    }
}
