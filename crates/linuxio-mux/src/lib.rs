//! Many-streams-over-one-socket transport for the webserver/bridge link.
//!
//! All socket writes are serialized through a single sender task per
//! connection; a scheduler task owns the stream table and reacts to wire
//! envelopes, API requests and keepalive ticks. Handler and caller code
//! above this layer only ever touches [`StreamHandle`]s.
//!
//! Fairness across streams falls out of flow control: each stream can have
//! at most one window's worth of DATA queued, so no single transfer can
//! monopolize the shared sender queue.

#[macro_use]
extern crate tracing;

mod codec;
mod config;
mod stream;

pub use self::codec::{read_envelope, write_envelope};
pub use self::config::MuxConfig;
pub use self::stream::{
    CancelToken, DataEvent, ProgressReceiver, ProgressSink, Reply, StreamError, StreamHandle, StreamReader,
    StreamWriter,
};

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::{SinkExt as _, StreamExt as _};
use linuxio_proto::{
    CallPayload, CreditPayload, Envelope, ErrorKind, Kind, Payload, ReplyErrPayload, ReplyOkPayload, StreamMode,
};
use linuxio_task::ChildTask;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Instrument as _, Span};

use self::codec::FrameCodec;
use self::stream::{
    ConnShared, InternalMessage, MessageReceiver, MessageSender, ProgressQueue, Role, SharedStreamState,
};

/// A stream accepted from the peer, carrying the opening `CALL`.
pub struct IncomingCall {
    pub call: CallPayload,
    pub correlation_id: u64,
    pub stream: StreamHandle,
}

pub type IncomingCalls = mpsc::UnboundedReceiver<IncomingCall>;

#[derive(Debug)]
enum ApiRequest {
    OpenStream {
        call: CallPayload,
        correlation_id: u64,
        response_tx: oneshot::Sender<Result<StreamHandle, StreamError>>,
    },
    Shutdown,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Session-scoped handle for opening streams and observing connection
/// death. Cheap to clone.
#[derive(Clone)]
pub struct MuxHandle {
    api_tx: mpsc::UnboundedSender<ApiRequest>,
    conn: Arc<ConnShared>,
}

impl MuxHandle {
    /// Opens an outbound stream by sending the given `CALL`.
    pub async fn open_stream(&self, call: CallPayload, correlation_id: u64) -> Result<StreamHandle, StreamError> {
        if self.conn.is_dead() {
            return Err(StreamError::ConnectionDown);
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.api_tx
            .send(ApiRequest::OpenStream {
                call,
                correlation_id,
                response_tx,
            })
            .map_err(|_| StreamError::ConnectionDown)?;

        response_rx.await.map_err(|_| StreamError::ConnectionDown)?
    }

    pub fn is_dead(&self) -> bool {
        self.conn.is_dead()
    }

    /// Resolves with the failure reason once the connection dies.
    pub async fn closed(&self) -> StreamError {
        self.conn.dead().await
    }

    /// Stops the connection; every open stream resolves with
    /// `TransportReset`.
    pub fn shutdown(&self) {
        let _ = self.api_tx.send(ApiRequest::Shutdown);
    }
}

/// A spawned multiplexed connection.
pub struct MuxConnection {
    pub handle: MuxHandle,
    pub incoming: IncomingCalls,
    pub driver: ChildTask<anyhow::Result<()>>,
}

pub struct Multiplexer {
    cfg: MuxConfig,
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
}

impl Multiplexer {
    pub fn new(reader: Box<dyn AsyncRead + Unpin + Send>, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            cfg: MuxConfig::default(),
            reader,
            writer,
        }
    }

    #[must_use]
    pub fn with_config(mut self, cfg: MuxConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn spawn(self) -> MuxConnection {
        let (api_tx, api_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let conn = ConnShared::new();

        let handle = MuxHandle {
            api_tx,
            conn: Arc::clone(&conn),
        };

        let span = Span::current();
        let driver = ChildTask::spawn(run_connection(self, api_rx, incoming_tx, conn).instrument(span));

        MuxConnection {
            handle,
            incoming: incoming_rx,
            driver,
        }
    }
}

async fn run_connection(
    mux: Multiplexer,
    api_rx: mpsc::UnboundedReceiver<ApiRequest>,
    incoming_tx: mpsc::UnboundedSender<IncomingCall>,
    conn: Arc<ConnShared>,
) -> anyhow::Result<()> {
    let Multiplexer { cfg, reader, writer } = mux;

    let span = Span::current();

    let (msg_to_send_tx, msg_to_send_rx) = mpsc::unbounded_channel::<Envelope>();
    let tx_clock = Arc::new(TxClock::new());

    let frame_sink = FramedWrite::new(
        writer,
        FrameCodec {
            max_frame_size: cfg.max_frame_size,
        },
    );
    let frame_stream = FramedRead::new(
        reader,
        FrameCodec {
            max_frame_size: cfg.max_frame_size,
        },
    );

    let sender_task_handle = SenderTask {
        frame_sink,
        msg_to_send_rx,
        tx_clock: Arc::clone(&tx_clock),
        conn: Arc::clone(&conn),
    }
    .spawn(span.clone());

    let scheduler_task_handle = SchedulerTask {
        cfg,
        frame_stream,
        msg_to_send_tx,
        api_rx,
        incoming_tx,
        conn: Arc::clone(&conn),
        tx_clock,
        parent_span: span,
    }
    .spawn();

    match tokio::try_join!(scheduler_task_handle.join(), sender_task_handle.join()).context("task join failed")? {
        (Ok(()), Err(e)) => debug!("Sender task failed: {e}"),
        (Err(e), Ok(())) => debug!("Scheduler task failed: {e}"),
        (Err(scheduler_e), Err(sender_e)) => {
            // Usually, it's only of interest when both tasks are failed.
            anyhow::bail!("both scheduler and sender tasks failed: {scheduler_e} & {sender_e}")
        }
        (Ok(()), Ok(())) => {}
    }

    // Whatever the exit path, nothing is flowing anymore.
    conn.mark_dead(StreamError::TransportReset);

    Ok(())
}

// === implementation details === //

/// Millisecond clock of the last outbound frame, fed by the sender task
/// and read by the scheduler's keepalive logic.
struct TxClock {
    start: Instant,
    last_tx_millis: AtomicU64,
}

impl TxClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_tx_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_tx_millis.store(now, Ordering::Relaxed);
    }

    fn idle_time(&self) -> Duration {
        let now = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(now.saturating_sub(self.last_tx_millis.load(Ordering::Relaxed)))
    }
}

// ---------------------- //

struct SenderTask<W: AsyncWrite + Unpin + Send + 'static> {
    frame_sink: FramedWrite<W, FrameCodec>,
    msg_to_send_rx: MessageReceiver,
    tx_clock: Arc<TxClock>,
    conn: Arc<ConnShared>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> SenderTask<W> {
    fn spawn(self, span: Span) -> ChildTask<anyhow::Result<()>> {
        ChildTask::spawn(self.run().instrument(span))
    }

    #[instrument("sender", skip_all)]
    async fn run(self) -> anyhow::Result<()> {
        let Self {
            mut frame_sink,
            mut msg_to_send_rx,
            tx_clock,
            conn,
        } = self;

        loop {
            let envelope = tokio::select! {
                envelope = msg_to_send_rx.recv() => envelope,
                _ = conn.dead() => break,
            };

            let Some(envelope) = envelope else {
                break;
            };

            trace!(?envelope, "Send envelope");

            let write_result = async {
                frame_sink.feed(envelope).await?;
                frame_sink.flush().await
            }
            .await;

            if let Err(error) = write_result {
                conn.mark_dead(StreamError::TransportReset);
                return Err(anyhow::Error::new(error).context("couldn't write frame"));
            }

            tx_clock.touch();
        }

        debug!("Closing sender task...");

        Ok(())
    }
}

// ---------------------- //

struct SchedulerTask<R: AsyncRead + Unpin + Send + 'static> {
    cfg: MuxConfig,
    frame_stream: FramedRead<R, FrameCodec>,
    msg_to_send_tx: MessageSender,
    api_rx: mpsc::UnboundedReceiver<ApiRequest>,
    incoming_tx: mpsc::UnboundedSender<IncomingCall>,
    conn: Arc<ConnShared>,
    tx_clock: Arc<TxClock>,
    parent_span: Span,
}

impl<R: AsyncRead + Unpin + Send + 'static> SchedulerTask<R> {
    fn spawn(self) -> ChildTask<anyhow::Result<()>> {
        let parent_span = self.parent_span.clone();
        ChildTask::spawn(scheduler_task_impl(self).instrument(parent_span))
    }
}

struct StreamCtx {
    data_tx: Option<mpsc::UnboundedSender<DataEvent>>,
    progress: Arc<ProgressQueue>,
    reply_tx: Option<oneshot::Sender<Reply>>,
    shared: Arc<SharedStreamState>,
    span: Span,
    local_data_done: bool,
    local_resolved: bool,
    remote_data_done: bool,
    remote_resolved: bool,
}

impl StreamCtx {
    fn is_finished(&self) -> bool {
        self.local_data_done && self.local_resolved && self.remote_data_done && self.remote_resolved
    }

    fn resolve(&mut self) {
        self.progress.close();
        self.shared.close_data();
        self.data_tx = None;
        self.reply_tx = None;
    }
}

struct MuxCtx {
    next_stream_id: u32,
    streams: HashMap<u32, StreamCtx>,
}

impl MuxCtx {
    fn new() -> Self {
        Self {
            // Stream id 0 is reserved for connection-level envelopes.
            next_stream_id: 1,
            streams: HashMap::new(),
        }
    }

    /// Stream ids are never reused on a connection, so allocation is a
    /// plain monotonic counter.
    fn allocate_id(&mut self) -> Option<u32> {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.checked_add(1)?;
        Some(id)
    }
}

#[instrument("scheduler", skip_all)]
async fn scheduler_task_impl<R: AsyncRead + Unpin + Send + 'static>(task: SchedulerTask<R>) -> anyhow::Result<()> {
    let SchedulerTask {
        cfg,
        mut frame_stream,
        msg_to_send_tx,
        mut api_rx,
        incoming_tx,
        conn,
        tx_clock,
        parent_span,
    } = task;

    let mut mux_ctx = MuxCtx::new();
    let (internal_msg_tx, mut internal_msg_rx) = mpsc::unbounded_channel::<InternalMessage>();

    let keepalive_period = (cfg.keepalive_deadline.min(cfg.keepalive_idle) / 2)
        .clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut keepalive_tick = tokio::time::interval(keepalive_period);
    keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut outstanding_ping: Option<Instant> = None;
    let mut missed_pongs: u8 = 0;
    let mut ping_correlation: u64 = 0;

    // Safety net against poor AsyncRead trait implementations.
    const MAX_CONSECUTIVE_PIPE_FAILURES: u8 = 5;
    let mut nb_consecutive_pipe_failures = 0;

    let exit_reason = loop {
        // NOTE: this task handles the stream table and communicates with
        // the other tasks. It should process messages continuously and
        // never wait during processing: no `await` inside this select
        // block. `?` is reserved for unrecoverable failures.

        tokio::select! {
            request = api_rx.recv() => {
                let Some(request) = request else {
                    // Every handle is gone; nobody can open streams or
                    // observe anything anymore.
                    break StreamError::TransportReset;
                };

                match request {
                    ApiRequest::OpenStream { call, correlation_id, response_tx } => {
                        let Some(id) = mux_ctx.allocate_id() else {
                            warn!("Out of stream ids for this connection");
                            let _ = response_tx.send(Err(StreamError::ConnectionDown));
                            continue;
                        };

                        let span = info_span!(parent: parent_span.clone(), "stream", id, verb = %call.verb);

                        let envelope = Envelope::record(Kind::Call, id, correlation_id, call.to_record());
                        if msg_to_send_tx.send(envelope).is_err() {
                            let _ = response_tx.send(Err(StreamError::ConnectionDown));
                            continue;
                        }

                        let (handle, ctx) = make_stream_pair(
                            &cfg,
                            id,
                            correlation_id,
                            call.mode,
                            Role::Opener,
                            &msg_to_send_tx,
                            &internal_msg_tx,
                            &conn,
                            span,
                        );

                        mux_ctx.streams.insert(id, ctx);
                        let _ = response_tx.send(Ok(handle));
                    }
                    ApiRequest::Shutdown => {
                        debug!("Shutdown requested");
                        break StreamError::TransportReset;
                    }
                }
            }
            Some(internal_msg) = internal_msg_rx.recv() => {
                match internal_msg {
                    InternalMessage::LocalEnd { id } => {
                        if let Some(ctx) = mux_ctx.streams.get_mut(&id) {
                            ctx.local_data_done = true;
                            if ctx.is_finished() {
                                unregister(&mut mux_ctx, id);
                            }
                        }
                    }
                    InternalMessage::LocalResolved { id } => {
                        if let Some(ctx) = mux_ctx.streams.get_mut(&id) {
                            ctx.local_resolved = true;
                            ctx.local_data_done = true;
                            if ctx.is_finished() {
                                unregister(&mut mux_ctx, id);
                            }
                        }
                    }
                    InternalMessage::LocalCancel { id } => {
                        if let Some(mut ctx) = mux_ctx.streams.remove(&id) {
                            ctx.span.in_scope(|| debug!("Stream cancelled locally"));
                            ctx.resolve();
                        }
                    }
                }
            }
            envelope = frame_stream.next() => {
                let envelope = match envelope {
                    Some(envelope) => envelope,
                    None => {
                        info!("Connection closed by peer");
                        break StreamError::TransportReset;
                    }
                };

                let envelope = match envelope {
                    Ok(envelope) => {
                        nb_consecutive_pipe_failures = 0;
                        envelope
                    }
                    Err(error) => {
                        let really_an_error = is_really_an_error(&error);
                        let error = anyhow::Error::new(error);

                        if really_an_error {
                            error!(error = format!("{error:#}"), "Connection pipe error");
                        } else {
                            info!(reason = format!("{error:#}"), "Connection closed abruptly");
                        }

                        nb_consecutive_pipe_failures += 1;
                        if nb_consecutive_pipe_failures > MAX_CONSECUTIVE_PIPE_FAILURES {
                            // Some underlying `AsyncRead` implementations might handle errors
                            // poorly and cause infinite polling on errors such as broken pipe.
                            // Hence, this safety net to escape from such infinite loops.
                            break StreamError::TransportReset;
                        } else {
                            continue;
                        }
                    }
                };

                trace!(?envelope, "Received envelope");

                match envelope.kind {
                    Kind::Call => {
                        match handle_incoming_call(
                            &cfg,
                            &mut mux_ctx,
                            &envelope,
                            &msg_to_send_tx,
                            &internal_msg_tx,
                            &incoming_tx,
                            &conn,
                            &parent_span,
                        ) {
                            Ok(()) => {}
                            Err(error) => {
                                error!(error = format!("{error:#}"), "Bad incoming CALL");
                                break StreamError::TransportReset;
                            }
                        }
                    }
                    Kind::ReplyOk | Kind::ReplyErr => {
                        let Some(ctx) = mux_ctx.streams.get_mut(&envelope.stream_id) else {
                            debug!(stream_id = envelope.stream_id, "Reply for unknown stream");
                            continue;
                        };

                        let reply = match parse_reply(&envelope) {
                            Ok(reply) => reply,
                            Err(error) => {
                                error!(error = format!("{error:#}"), "Malformed reply payload");
                                break StreamError::TransportReset;
                            }
                        };

                        ctx.remote_resolved = true;
                        // A terminal reply resolves the opener side outright;
                        // whatever it did not send anymore is moot.
                        ctx.local_resolved = true;
                        ctx.local_data_done = true;
                        ctx.progress.close();
                        if let Some(reply_tx) = ctx.reply_tx.take() {
                            let _ = reply_tx.send(reply);
                        }
                        if ctx.is_finished() {
                            unregister(&mut mux_ctx, envelope.stream_id);
                        }
                    }
                    Kind::Progress => {
                        let Some(ctx) = mux_ctx.streams.get_mut(&envelope.stream_id) else {
                            debug!(stream_id = envelope.stream_id, "Progress for unknown stream");
                            continue;
                        };
                        if let Payload::Record(record) = envelope.payload {
                            let dropped = ctx.progress.push(record);
                            if dropped > 0 {
                                ctx.span.in_scope(|| trace!(dropped, "Coalesced progress records"));
                            }
                        }
                    }
                    Kind::Data => {
                        let Some(ctx) = mux_ctx.streams.get_mut(&envelope.stream_id) else {
                            debug!(stream_id = envelope.stream_id, "Data for unknown stream");
                            continue;
                        };
                        let Payload::Data(bytes) = envelope.payload else {
                            continue;
                        };
                        match &ctx.data_tx {
                            Some(data_tx) => {
                                let _ = data_tx.send(DataEvent::Data(bytes));
                            }
                            None => {
                                ctx.span.in_scope(|| debug!("Data after end of stream, ignored"));
                            }
                        }
                    }
                    Kind::End => {
                        let Some(ctx) = mux_ctx.streams.get_mut(&envelope.stream_id) else {
                            debug!(stream_id = envelope.stream_id, "End for unknown stream");
                            continue;
                        };
                        ctx.remote_data_done = true;
                        if let Some(data_tx) = ctx.data_tx.take() {
                            let _ = data_tx.send(DataEvent::End);
                        }
                        if ctx.is_finished() {
                            unregister(&mut mux_ctx, envelope.stream_id);
                        }
                    }
                    Kind::Cancel => {
                        let Some(ctx) = mux_ctx.streams.get_mut(&envelope.stream_id) else {
                            debug!(stream_id = envelope.stream_id, "Cancel for unknown stream");
                            continue;
                        };

                        ctx.span.in_scope(|| debug!("Stream cancelled by peer"));

                        ctx.shared.set_cancelled();
                        ctx.remote_data_done = true;
                        ctx.remote_resolved = true;
                        ctx.progress.close();
                        if let Some(data_tx) = ctx.data_tx.take() {
                            let _ = data_tx.send(DataEvent::Cancelled);
                        }
                        if let Some(reply_tx) = ctx.reply_tx.take() {
                            let _ = reply_tx.send(Reply::Err(ReplyErrPayload::new(
                                ErrorKind::Cancelled,
                                "stream cancelled by peer",
                            )));
                        }
                        // The local side (typically a handler observing its
                        // cancellation flag) still resolves the stream.
                        if ctx.is_finished() {
                            unregister(&mut mux_ctx, envelope.stream_id);
                        }
                    }
                    Kind::Ping => {
                        let _ = msg_to_send_tx.send(Envelope::empty(Kind::Pong, 0, envelope.correlation_id));
                    }
                    Kind::Pong => {
                        if let Some(sent_at) = outstanding_ping.take() {
                            debug!(rtt = ?sent_at.elapsed(), "Keepalive answered");
                        }
                        missed_pongs = 0;
                    }
                    Kind::Credit => {
                        let Some(ctx) = mux_ctx.streams.get_mut(&envelope.stream_id) else {
                            debug!(stream_id = envelope.stream_id, "Credit for unknown stream");
                            continue;
                        };
                        match envelope.expect_record().and_then(CreditPayload::from_record) {
                            Ok(credit) => ctx.shared.add_credit(credit.bytes_acked),
                            Err(error) => {
                                error!(error = format!("{error:#}"), "Malformed CREDIT payload");
                                break StreamError::TransportReset;
                            }
                        }
                    }
                    Kind::Hello => {
                        debug!("Unexpected HELLO after handshake, ignored");
                    }
                }
            }
            _ = keepalive_tick.tick() => {
                let now = Instant::now();

                if let Some(sent_at) = outstanding_ping {
                    if now.duration_since(sent_at) >= cfg.keepalive_deadline {
                        missed_pongs += 1;
                        if missed_pongs >= 2 {
                            warn!("Peer missed two consecutive keepalives");
                            break StreamError::PeerUnreachable;
                        }
                        ping_correlation += 1;
                        let _ = msg_to_send_tx.send(Envelope::empty(Kind::Ping, 0, ping_correlation));
                        outstanding_ping = Some(now);
                    }
                } else if tx_clock.idle_time() >= cfg.keepalive_idle {
                    ping_correlation += 1;
                    let _ = msg_to_send_tx.send(Envelope::empty(Kind::Ping, 0, ping_correlation));
                    outstanding_ping = Some(now);
                }
            }
        }
    };

    debug!(?exit_reason, "Closing scheduler task...");

    conn.mark_dead(exit_reason);

    for (_, mut ctx) in mux_ctx.streams.drain() {
        ctx.resolve();
    }

    Ok(())
}

#[allow(clippy::too_many_arguments, reason = "plumbing shared by both stream directions")]
fn make_stream_pair(
    cfg: &MuxConfig,
    stream_id: u32,
    correlation_id: u64,
    mode: StreamMode,
    role: Role,
    msg_to_send_tx: &MessageSender,
    internal_msg_tx: &mpsc::UnboundedSender<InternalMessage>,
    conn: &Arc<ConnShared>,
    span: Span,
) -> (StreamHandle, StreamCtx) {
    let shared = SharedStreamState::new(cfg.initial_window_size);
    let progress = ProgressQueue::new(cfg.progress_queue_depth);
    let (data_tx, data_rx) = mpsc::unbounded_channel();

    // Only the opener gets a terminal reply.
    let (reply_tx, reply_rx) = match role {
        Role::Opener => {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        }
        Role::Acceptor => (None, None),
    };

    let handle = StreamHandle::assemble(
        stream_id,
        correlation_id,
        mode,
        role,
        cfg.max_data_chunk,
        msg_to_send_tx.clone(),
        internal_msg_tx.clone(),
        Arc::clone(&shared),
        Arc::clone(conn),
        data_rx,
        Arc::clone(&progress),
        reply_rx,
    );

    // The DATA direction a given end never uses is born closed, so stream
    // teardown does not wait for an END that will never come.
    let (local_data_done, remote_data_done) = match (role, mode) {
        (_, StreamMode::Bidirectional) => (false, false),
        (Role::Opener, _) => (true, false),
        (Role::Acceptor, _) => (false, true),
    };

    let ctx = StreamCtx {
        data_tx: Some(data_tx),
        progress,
        reply_tx,
        shared,
        span,
        local_data_done,
        local_resolved: matches!(role, Role::Opener),
        remote_data_done,
        remote_resolved: matches!(role, Role::Acceptor),
    };

    (handle, ctx)
}

#[allow(clippy::too_many_arguments, reason = "scheduler plumbing")]
fn handle_incoming_call(
    cfg: &MuxConfig,
    mux_ctx: &mut MuxCtx,
    envelope: &Envelope,
    msg_to_send_tx: &MessageSender,
    internal_msg_tx: &mpsc::UnboundedSender<InternalMessage>,
    incoming_tx: &mpsc::UnboundedSender<IncomingCall>,
    conn: &Arc<ConnShared>,
    parent_span: &Span,
) -> anyhow::Result<()> {
    let record = envelope.expect_record().context("CALL payload")?;
    let call = CallPayload::from_record(record).context("CALL payload")?;
    let id = envelope.stream_id;

    if mux_ctx.streams.contains_key(&id) {
        anyhow::bail!("peer reused live stream id {id}");
    }
    if id >= mux_ctx.next_stream_id {
        // Track the opener's allocations so our own never collide.
        mux_ctx.next_stream_id = id.saturating_add(1);
    }

    let span = info_span!(parent: parent_span.clone(), "stream", id, verb = %call.verb);
    span.in_scope(|| debug!(mode = %call.mode, "Accepted stream"));

    let (handle, ctx) = make_stream_pair(
        cfg,
        id,
        envelope.correlation_id,
        call.mode,
        Role::Acceptor,
        msg_to_send_tx,
        internal_msg_tx,
        conn,
        span,
    );

    mux_ctx.streams.insert(id, ctx);

    let incoming = IncomingCall {
        call,
        correlation_id: envelope.correlation_id,
        stream: handle,
    };

    if let Err(rejected) = incoming_tx.send(incoming) {
        // Nobody is accepting anymore; resolve the call with a structured
        // refusal instead of leaving the opener hanging.
        let mut stream = rejected.0.stream;
        let _ = stream.reply_err(ReplyErrPayload::new(ErrorKind::ShuttingDown, "not accepting new calls"));
    }

    Ok(())
}

fn parse_reply(envelope: &Envelope) -> Result<Reply, linuxio_proto::Error> {
    let record = envelope.expect_record()?;
    match envelope.kind {
        Kind::ReplyOk => Ok(Reply::Ok(ReplyOkPayload::from_record(record)?.response)),
        Kind::ReplyErr => Ok(Reply::Err(ReplyErrPayload::from_record(record)?)),
        _ => unreachable!("only called for reply envelopes"),
    }
}

fn unregister(mux_ctx: &mut MuxCtx, id: u32) {
    if let Some(mut ctx) = mux_ctx.streams.remove(&id) {
        ctx.span.in_scope(|| trace!("Stream closed"));
        ctx.resolve();
    }
}

/// Walks the source chain and checks for status codes like ECONNRESET or
/// ECONNABORTED that we don't consider to be actual errors.
fn is_really_an_error(original_error: &(dyn std::error::Error + 'static)) -> bool {
    let mut dyn_error: Option<&dyn std::error::Error> = Some(original_error);

    while let Some(source_error) = dyn_error.take() {
        if let Some(io_error) = source_error.downcast_ref::<io::Error>() {
            match io_error.kind() {
                io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted => {
                    return false;
                }
                _ => {}
            }
        }

        dyn_error = source_error.source();
    }

    true
}
