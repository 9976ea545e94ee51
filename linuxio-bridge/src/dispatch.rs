//! Routes accepted `CALL` streams to registered handlers and drives each
//! stream in the mode its handler declares.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linuxio_mux::{CancelToken, IncomingCall, IncomingCalls, ProgressSink, StreamHandle, StreamReader, StreamWriter};
use linuxio_proto::{CallPayload, ErrorKind, Record, ReplyErrPayload, StreamMode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Handler slots per bridge; `CALL`s beyond this are refused with
/// `Overloaded`.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 64;

/// Applied when the caller did not set a deadline.
const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(30);

/// How long a handler gets to observe its cancellation flag after the
/// deadline fires, before it is aborted outright.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Failure a handler reports; `kind` rides the wire verbatim.
#[derive(Debug)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<Record>,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "call was cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other("InvalidRequest".into()), message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{error:#}"))
    }
}

pub type HandlerResult = Result<Record, HandlerError>;

/// Per-call context handed to every handler.
#[derive(Clone)]
pub struct CallContext {
    /// Cooperative cancellation flag; long handlers must poll it.
    pub cancel: CancelToken,
    /// Effective deadline for this call.
    pub deadline: Duration,
}

/// Readable and writable halves of a bidirectional stream, plus the
/// progress emitter.
pub struct StreamIo {
    pub reader: StreamReader,
    pub writer: StreamWriter,
    pub progress: ProgressSink,
}

#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn handle(&self, ctx: CallContext, request: Record) -> HandlerResult;
}

#[async_trait]
pub trait ProgressHandler: Send + Sync {
    async fn handle(&self, ctx: CallContext, request: Record, progress: ProgressSink) -> HandlerResult;
}

#[async_trait]
pub trait ByteStreamHandler: Send + Sync {
    async fn handle(&self, ctx: CallContext, request: Record, io: StreamIo) -> HandlerResult;
}

#[derive(Clone)]
enum HandlerKind {
    Unary(Arc<dyn UnaryHandler>),
    Progress(Arc<dyn ProgressHandler>),
    ByteStream(Arc<dyn ByteStreamHandler>),
}

impl HandlerKind {
    fn mode(&self) -> StreamMode {
        match self {
            HandlerKind::Unary(_) => StreamMode::Unary,
            HandlerKind::Progress(_) => StreamMode::ProgressPush,
            HandlerKind::ByteStream(_) => StreamMode::Bidirectional,
        }
    }
}

/// Immutable verb table, built once at bridge start.
pub struct HandlerRegistry {
    map: HashMap<&'static str, HandlerKind>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { map: HashMap::new() }
    }

    fn get(&self, verb: &str) -> Option<&HandlerKind> {
        self.map.get(verb)
    }

    pub fn verbs(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.map.keys().copied()
    }
}

pub struct RegistryBuilder {
    map: HashMap<&'static str, HandlerKind>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn unary(mut self, verb: &'static str, handler: impl UnaryHandler + 'static) -> Self {
        self.map.insert(verb, HandlerKind::Unary(Arc::new(handler)));
        self
    }

    #[must_use]
    pub fn progress(mut self, verb: &'static str, handler: impl ProgressHandler + 'static) -> Self {
        self.map.insert(verb, HandlerKind::Progress(Arc::new(handler)));
        self
    }

    #[must_use]
    pub fn byte_stream(mut self, verb: &'static str, handler: impl ByteStreamHandler + 'static) -> Self {
        self.map.insert(verb, HandlerKind::ByteStream(Arc::new(handler)));
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { map: self.map }
    }
}

/// Drives incoming calls of one bridge. Cloneable; clones share the
/// handler slots and the drain flag, so the per-bridge ceiling holds
/// across connections.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    slots: Arc<Semaphore>,
    draining: Arc<AtomicBool>,
    max_handlers: usize,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, max_handlers: usize) -> Self {
        Self {
            registry,
            slots: Arc::new(Semaphore::new(max_handlers)),
            draining: Arc::new(AtomicBool::new(false)),
            max_handlers,
        }
    }

    pub fn drain_control(&self) -> DrainControl {
        DrainControl {
            draining: Arc::clone(&self.draining),
            slots: Arc::clone(&self.slots),
            max_handlers: self.max_handlers,
        }
    }

    /// Serves one connection's calls until it closes.
    pub async fn serve(&self, mut incoming: IncomingCalls) {
        while let Some(incoming_call) = incoming.recv().await {
            self.dispatch(incoming_call);
        }

        debug!("Connection stopped producing calls");
    }

    fn dispatch(&self, incoming: IncomingCall) {
        let IncomingCall { call, stream, .. } = incoming;
        let mut stream = stream;

        if self.draining.load(Ordering::SeqCst) {
            debug!(verb = %call.verb, "Refusing call while draining");
            let _ = stream.reply_err(ReplyErrPayload::new(ErrorKind::ShuttingDown, "bridge is shutting down"));
            return;
        }

        let Some(handler) = self.registry.get(&call.verb) else {
            debug!(verb = %call.verb, "No handler registered");
            let _ = stream.reply_err(ReplyErrPayload::new(
                ErrorKind::UnknownVerb,
                format!("no handler for verb `{}`", call.verb),
            ));
            return;
        };

        if handler.mode() != call.mode {
            debug!(verb = %call.verb, requested = %call.mode, expected = %handler.mode(), "Stream mode mismatch");
            let _ = stream.reply_err(ReplyErrPayload::new(
                ErrorKind::BadStreamMode,
                format!("verb `{}` expects a {} stream", call.verb, handler.mode()),
            ));
            return;
        }

        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(verb = %call.verb, "Handler slots exhausted");
                let _ = stream.reply_err(ReplyErrPayload::new(ErrorKind::Overloaded, "too many concurrent calls"));
                return;
            }
        };

        let handler = handler.clone();
        tokio::spawn(run_handler(handler, call, stream, permit));
    }
}

/// Drain-side view of a [`Dispatcher`].
pub struct DrainControl {
    draining: Arc<AtomicBool>,
    slots: Arc<Semaphore>,
    max_handlers: usize,
}

impl DrainControl {
    /// New calls are refused with `ShuttingDown` from now on.
    pub fn start_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Resolves once every in-flight handler has released its slot.
    /// Callers bound this with the drain grace period.
    pub async fn wait_idle(&self) {
        let permits = u32::try_from(self.max_handlers).unwrap_or(u32::MAX);
        let _all = self.slots.acquire_many(permits).await;
    }
}

async fn run_handler(handler: HandlerKind, call: CallPayload, mut stream: StreamHandle, _permit: OwnedSemaphorePermit) {
    let verb = call.verb.clone();
    let cancel = stream.cancel_token();
    let deadline = if call.deadline_ms == 0 {
        DEFAULT_CALL_DEADLINE
    } else {
        Duration::from_millis(u64::from(call.deadline_ms))
    };

    let ctx = CallContext {
        cancel: cancel.clone(),
        deadline,
    };

    let mut join: JoinHandle<HandlerResult> = match handler {
        HandlerKind::Unary(handler) => {
            let request = call.request;
            tokio::spawn(async move { handler.handle(ctx, request).await })
        }
        HandlerKind::Progress(handler) => {
            let request = call.request;
            let progress = stream.progress_sink();
            tokio::spawn(async move { handler.handle(ctx, request, progress).await })
        }
        HandlerKind::ByteStream(handler) => {
            let request = call.request;
            let io = StreamIo {
                reader: stream.take_reader().expect("reader is present until taken"),
                writer: stream.writer(),
                progress: stream.progress_sink(),
            };
            tokio::spawn(async move { handler.handle(ctx, request, io).await })
        }
    };

    let outcome = tokio::select! {
        joined = &mut join => joined,
        () = tokio::time::sleep(deadline) => {
            debug!(%verb, "Call deadline expired, cancelling handler");
            cancel.cancel_local();

            // The flag is cooperative; a handler that ignores it past the
            // grace gets aborted.
            if tokio::time::timeout(CANCEL_GRACE, &mut join).await.is_err() {
                join.abort();
                let _ = (&mut join).await;
            }

            let _ = stream.reply_err(ReplyErrPayload::new(ErrorKind::DeadlineExceeded, "call deadline exceeded"));
            return;
        }
    };

    match outcome {
        Ok(Ok(response)) => {
            let _ = stream.reply_ok(response);
        }
        Ok(Err(error)) => {
            debug!(%verb, kind = %error.kind, "Handler returned an error");
            let mut reply = ReplyErrPayload::new(error.kind, error.message);
            reply.detail = error.detail;
            let _ = stream.reply_err(reply);
        }
        Err(join_error) if join_error.is_panic() => {
            let panic_message = panic_message(join_error.into_panic());
            error!(%verb, panic = %panic_message, "Handler panicked");
            let _ = stream.reply_err(ReplyErrPayload::new(ErrorKind::Internal, "handler fault"));
        }
        Err(_) => {
            let _ = stream.reply_err(ReplyErrPayload::new(ErrorKind::Internal, "handler task vanished"));
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
