use std::time::Duration;

use async_trait::async_trait;
use linuxio_mux::ProgressSink;
use linuxio_proto::{Record, Value};
use smol_str::SmolStr;

use crate::dispatch::{CallContext, HandlerError, HandlerResult, ProgressHandler, UnaryHandler};

pub(crate) struct HostnameHandler;

#[async_trait]
impl UnaryHandler for HostnameHandler {
    async fn handle(&self, _ctx: CallContext, _request: Record) -> HandlerResult {
        let hostname = hostname::get().map_err(|error| HandlerError::internal(format!("gethostname: {error}")))?;

        Ok(Record::new().with("hostname", Value::Str(SmolStr::new(hostname.to_string_lossy()))))
    }
}

pub(crate) struct EchoHandler;

#[async_trait]
impl UnaryHandler for EchoHandler {
    async fn handle(&self, _ctx: CallContext, request: Record) -> HandlerResult {
        Ok(request)
    }
}

/// Sleeps in slices, reporting each one. Mostly useful to exercise
/// progress delivery and cancellation from the outside.
pub(crate) struct SleepHandler;

#[async_trait]
impl ProgressHandler for SleepHandler {
    async fn handle(&self, ctx: CallContext, request: Record, progress: ProgressSink) -> HandlerResult {
        let duration_ms = request.get_u64("duration_ms").unwrap_or(1_000);
        let steps = request.get_u64("steps").unwrap_or(10).max(1);
        let slice = Duration::from_millis(duration_ms / steps);

        for step in 1..=steps {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::cancelled());
            }

            tokio::time::sleep(slice).await;

            let _ = progress.send(
                Record::new()
                    .with("step", Value::U64(step))
                    .with("total", Value::U64(steps)),
            );
        }

        Ok(Record::new().with("slept_ms", Value::U64(duration_ms)))
    }
}
