use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use linuxio_proto::{Bytes, CreditPayload, Envelope, ErrorKind, Kind, Record, ReplyErrPayload, StreamMode};
use tokio::sync::{mpsc, oneshot, watch, Notify};

/// Why a stream (or the whole connection) stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("connection is not established")]
    ConnectionDown,
    #[error("stream has been ended or cancelled")]
    StreamClosed,
    #[error("connection died mid-stream")]
    TransportReset,
    #[error("peer stopped answering keepalives")]
    PeerUnreachable,
}

/// One step of [`StreamReader::read_data`].
#[derive(Debug, PartialEq, Eq)]
pub enum DataEvent {
    Data(Bytes),
    End,
    Cancelled,
}

/// Terminal outcome of a call as seen by the opener.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Ok(Record),
    Err(ReplyErrPayload),
}

/// Which end of the stream this handle belongs to. Governs what dropping
/// an unresolved handle puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Opener,
    Acceptor,
}

pub(crate) type MessageSender = mpsc::UnboundedSender<Envelope>;
pub(crate) type MessageReceiver = mpsc::UnboundedReceiver<Envelope>;

#[derive(Debug)]
pub(crate) enum InternalMessage {
    /// Local side half-closed its DATA direction (END sent).
    LocalEnd { id: u32 },
    /// Local side sent its final reply (acceptor side).
    LocalResolved { id: u32 },
    /// Local side cancelled the stream.
    LocalCancel { id: u32 },
}

pub(crate) type InternalSender = mpsc::UnboundedSender<InternalMessage>;

/// Connection-wide liveness, shared by every handle of one connection.
pub(crate) struct ConnShared {
    dead_tx: watch::Sender<bool>,
    reason: OnceLock<StreamError>,
}

impl ConnShared {
    pub(crate) fn new() -> Arc<Self> {
        let (dead_tx, _) = watch::channel(false);
        Arc::new(Self {
            dead_tx,
            reason: OnceLock::new(),
        })
    }

    pub(crate) fn is_dead(&self) -> bool {
        *self.dead_tx.borrow()
    }

    pub(crate) fn mark_dead(&self, reason: StreamError) {
        let _ = self.reason.set(reason);
        // send_replace updates the value even when no receiver is
        // currently subscribed.
        let _ = self.dead_tx.send_replace(true);
    }

    pub(crate) fn death_reason(&self) -> StreamError {
        self.reason.get().cloned().unwrap_or(StreamError::TransportReset)
    }

    pub(crate) async fn dead(&self) -> StreamError {
        let mut rx = self.dead_tx.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail here.
        let _ = rx.wait_for(|dead| *dead).await;
        self.death_reason()
    }
}

/// Per-stream state shared between the handles and the scheduler.
pub(crate) struct SharedStreamState {
    pub(crate) send_window: AtomicUsize,
    pub(crate) window_updated: Notify,
    pub(crate) cancelled: AtomicBool,
    pub(crate) cancel_notify: Notify,
    /// No further local DATA/PROGRESS may be emitted.
    pub(crate) data_closed: AtomicBool,
}

impl SharedStreamState {
    pub(crate) fn new(initial_window: u32) -> Arc<Self> {
        Arc::new(Self {
            send_window: AtomicUsize::new(initial_window as usize),
            window_updated: Notify::new(),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            data_closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.data_closed.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
        // Wake a writer blocked on credit so it observes the cancellation.
        self.window_updated.notify_one();
    }

    pub(crate) fn close_data(&self) {
        self.data_closed.store(true, Ordering::SeqCst);
        self.window_updated.notify_one();
    }

    pub(crate) fn add_credit(&self, bytes: u32) {
        self.send_window.fetch_add(bytes as usize, Ordering::SeqCst);
        self.window_updated.notify_one();
    }
}

/// Bounded PROGRESS buffer, drop-oldest on overflow.
///
/// Single consumer; `Notify::notify_one` permits make the wakeup race-free
/// without holding the lock across awaits.
pub(crate) struct ProgressQueue {
    inner: Mutex<VecDeque<Record>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl ProgressQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the number of records dropped to make room.
    pub(crate) fn push(&self, record: Record) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }

        let mut dropped = 0;
        {
            let mut queue = self.inner.lock().expect("progress queue lock");
            while queue.len() >= self.capacity {
                queue.pop_front();
                dropped += 1;
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
        dropped
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<Record> {
        self.inner.lock().expect("progress queue lock").pop_front()
    }

    pub(crate) async fn pop(&self) -> Option<Record> {
        loop {
            if let Some(record) = self.try_pop() {
                return Some(record);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// Receive side of a stream's PROGRESS queue, detached from the handle so
/// it can be polled concurrently with the terminal reply.
pub struct ProgressReceiver(Arc<ProgressQueue>);

impl ProgressReceiver {
    /// Next record; `None` once the stream has resolved and the queue is
    /// drained.
    pub async fn recv(&self) -> Option<Record> {
        self.0.pop().await
    }

    pub fn try_recv(&self) -> Option<Record> {
        self.0.try_pop()
    }
}

/// Cooperative cancellation flag of one stream, cloneable into handler
/// code that must not own the stream itself.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<SharedStreamState>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the stream is cancelled (by the peer or locally).
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.shared.cancel_notify.notified().await;
        }
    }

    /// Raises the flag locally, e.g. when the call deadline expires on the
    /// serving side. Nothing is put on the wire.
    pub fn cancel_local(&self) {
        self.shared.set_cancelled();
    }
}

/// Best-effort PROGRESS emitter, cloneable into handler code.
#[derive(Clone)]
pub struct ProgressSink {
    stream_id: u32,
    correlation_id: u64,
    msg_tx: MessageSender,
    shared: Arc<SharedStreamState>,
    conn: Arc<ConnShared>,
}

impl ProgressSink {
    pub fn send(&self, record: Record) -> Result<(), StreamError> {
        // After cancellation or the terminal reply, nothing may follow.
        if self.shared.cancelled.load(Ordering::SeqCst) || self.shared.data_closed.load(Ordering::SeqCst) {
            return Err(StreamError::StreamClosed);
        }
        if self.conn.is_dead() {
            return Err(self.conn.death_reason());
        }
        self.msg_tx
            .send(Envelope::record(
                Kind::Progress,
                self.stream_id,
                self.correlation_id,
                record,
            ))
            .map_err(|_| self.conn.death_reason())
    }
}

/// Send half of a stream, detachable so a byte-streaming handler can write
/// while the dispatch runtime retains the reply rights.
#[derive(Clone)]
pub struct StreamWriter {
    stream_id: u32,
    correlation_id: u64,
    max_data_chunk: usize,
    msg_tx: MessageSender,
    internal_tx: InternalSender,
    shared: Arc<SharedStreamState>,
    conn: Arc<ConnShared>,
}

impl StreamWriter {
    /// Enqueues DATA, blocking while the peer's credit for this stream is
    /// exhausted. Chunks large payloads.
    pub async fn write_data(&self, bytes: Bytes) -> Result<(), StreamError> {
        let mut offset = 0;

        while offset < bytes.len() {
            if self.shared.data_closed.load(Ordering::SeqCst) {
                return Err(StreamError::StreamClosed);
            }
            if self.conn.is_dead() {
                return Err(self.conn.death_reason());
            }

            let available = self.shared.send_window.load(Ordering::SeqCst);
            if available == 0 {
                self.shared.window_updated.notified().await;
                continue;
            }

            let take = available.min(self.max_data_chunk).min(bytes.len() - offset);
            self.shared.send_window.fetch_sub(take, Ordering::SeqCst);

            if self.conn.is_dead() {
                return Err(self.conn.death_reason());
            }
            self.msg_tx
                .send(Envelope::data(
                    self.stream_id,
                    self.correlation_id,
                    bytes.slice(offset..offset + take),
                ))
                .map_err(|_| self.conn.death_reason())?;

            offset += take;
        }

        Ok(())
    }

    /// Half-closes the DATA direction.
    pub fn finish_data(&self) -> Result<(), StreamError> {
        if self.shared.data_closed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::StreamClosed);
        }
        if self.conn.is_dead() {
            return Err(self.conn.death_reason());
        }
        self.msg_tx
            .send(Envelope::empty(Kind::End, self.stream_id, self.correlation_id))
            .map_err(|_| self.conn.death_reason())?;
        let _ = self.internal_tx.send(InternalMessage::LocalEnd { id: self.stream_id });
        Ok(())
    }
}

/// Receive half of a stream. Detachable from the [`StreamHandle`] so a
/// byte-streaming handler can read in one task while another writes.
pub struct StreamReader {
    stream_id: u32,
    correlation_id: u64,
    msg_tx: MessageSender,
    conn: Arc<ConnShared>,
    data_rx: mpsc::UnboundedReceiver<DataEvent>,
}

impl StreamReader {
    /// Next inbound DATA chunk, or the way the peer finished its direction.
    /// Consuming a chunk replenishes the peer's credit.
    pub async fn read_data(&mut self) -> Result<DataEvent, StreamError> {
        match self.data_rx.recv().await {
            Some(DataEvent::Data(bytes)) => {
                let bytes_acked = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
                let credit = CreditPayload {
                    stream_id: self.stream_id,
                    bytes_acked,
                };
                // Best effort: when the connection is gone the peer no
                // longer cares about its window.
                let _ = self.msg_tx.send(Envelope::record(
                    Kind::Credit,
                    self.stream_id,
                    self.correlation_id,
                    credit.to_record(),
                ));
                Ok(DataEvent::Data(bytes))
            }
            Some(event) => Ok(event),
            None => {
                if self.conn.is_dead() {
                    Err(self.conn.death_reason())
                } else {
                    Err(StreamError::StreamClosed)
                }
            }
        }
    }
}

/// One logical stream over a multiplexed connection.
///
/// Writes go straight to the connection's sender task; the receive half is
/// owned here until [`StreamHandle::take_reader`] detaches it. Dropping an
/// unresolved handle cancels the call (opener) or resolves it with an
/// `Internal` error (acceptor, e.g. after a handler panic unwound).
pub struct StreamHandle {
    pub(crate) stream_id: u32,
    pub(crate) correlation_id: u64,
    pub(crate) mode: StreamMode,
    pub(crate) role: Role,
    pub(crate) max_data_chunk: usize,
    pub(crate) msg_tx: MessageSender,
    pub(crate) internal_tx: InternalSender,
    pub(crate) shared: Arc<SharedStreamState>,
    pub(crate) conn: Arc<ConnShared>,
    pub(crate) reader: Option<StreamReader>,
    pub(crate) progress: Arc<ProgressQueue>,
    pub(crate) reply_rx: Option<oneshot::Receiver<Reply>>,
    pub(crate) got_reply: bool,
    pub(crate) resolved_local: bool,
}

impl StreamHandle {
    #[allow(clippy::too_many_arguments, reason = "assembled in one place by the scheduler")]
    pub(crate) fn assemble(
        stream_id: u32,
        correlation_id: u64,
        mode: StreamMode,
        role: Role,
        max_data_chunk: usize,
        msg_tx: MessageSender,
        internal_tx: InternalSender,
        shared: Arc<SharedStreamState>,
        conn: Arc<ConnShared>,
        data_rx: mpsc::UnboundedReceiver<DataEvent>,
        progress: Arc<ProgressQueue>,
        reply_rx: Option<oneshot::Receiver<Reply>>,
    ) -> Self {
        let reader = StreamReader {
            stream_id,
            correlation_id,
            msg_tx: msg_tx.clone(),
            conn: Arc::clone(&conn),
            data_rx,
        };

        Self {
            stream_id,
            correlation_id,
            mode,
            role,
            max_data_chunk,
            msg_tx,
            internal_tx,
            shared,
            conn,
            reader: Some(reader),
            progress,
            reply_rx,
            got_reply: false,
            resolved_local: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<(), StreamError> {
        if self.conn.is_dead() {
            return Err(self.conn.death_reason());
        }
        self.msg_tx.send(envelope).map_err(|_| self.conn.death_reason())
    }

    /// Enqueues DATA, blocking while the peer's credit for this stream is
    /// exhausted. Chunks large payloads.
    pub async fn write_data(&self, bytes: Bytes) -> Result<(), StreamError> {
        let mut offset = 0;

        while offset < bytes.len() {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(StreamError::StreamClosed);
            }
            if self.shared.data_closed.load(Ordering::SeqCst) {
                return Err(StreamError::StreamClosed);
            }
            if self.conn.is_dead() {
                return Err(self.conn.death_reason());
            }

            let available = self.shared.send_window.load(Ordering::SeqCst);
            if available == 0 {
                self.shared.window_updated.notified().await;
                continue;
            }

            let take = available.min(self.max_data_chunk).min(bytes.len() - offset);
            self.shared.send_window.fetch_sub(take, Ordering::SeqCst);

            self.send_envelope(Envelope::data(
                self.stream_id,
                self.correlation_id,
                bytes.slice(offset..offset + take),
            ))?;

            offset += take;
        }

        Ok(())
    }

    /// Convenience for callers that never split the stream.
    pub async fn read_data(&mut self) -> Result<DataEvent, StreamError> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_data().await,
            None => Err(StreamError::StreamClosed),
        }
    }

    /// Detaches the receive half; subsequent `read_data` on the handle
    /// fails with `StreamClosed`.
    pub fn take_reader(&mut self) -> Option<StreamReader> {
        self.reader.take()
    }

    /// Detached send half sharing this stream's window and states.
    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            stream_id: self.stream_id,
            correlation_id: self.correlation_id,
            max_data_chunk: self.max_data_chunk,
            msg_tx: self.msg_tx.clone(),
            internal_tx: self.internal_tx.clone(),
            shared: Arc::clone(&self.shared),
            conn: Arc::clone(&self.conn),
        }
    }

    /// Cloneable cancellation flag for handler code.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Detached receive side of the PROGRESS queue.
    pub fn progress_receiver(&self) -> ProgressReceiver {
        ProgressReceiver(Arc::clone(&self.progress))
    }

    /// Cloneable best-effort PROGRESS emitter for handler code.
    pub fn progress_sink(&self) -> ProgressSink {
        ProgressSink {
            stream_id: self.stream_id,
            correlation_id: self.correlation_id,
            msg_tx: self.msg_tx.clone(),
            shared: Arc::clone(&self.shared),
            conn: Arc::clone(&self.conn),
        }
    }

    /// Best-effort server push; the receiver may coalesce.
    pub fn send_progress(&self, record: Record) -> Result<(), StreamError> {
        if self.mode == StreamMode::Unary {
            return Err(StreamError::StreamClosed);
        }
        if self.shared.cancelled.load(Ordering::SeqCst) || self.resolved_local {
            return Err(StreamError::StreamClosed);
        }

        self.send_envelope(Envelope::record(
            Kind::Progress,
            self.stream_id,
            self.correlation_id,
            record,
        ))
    }

    /// Next PROGRESS record pushed by the peer; `None` once the stream has
    /// resolved.
    pub async fn recv_progress(&self) -> Option<Record> {
        self.progress.pop().await
    }

    /// Half-closes the local DATA direction.
    pub fn finish_data(&self) -> Result<(), StreamError> {
        if self.shared.data_closed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::StreamClosed);
        }
        self.send_envelope(Envelope::empty(Kind::End, self.stream_id, self.correlation_id))?;
        let _ = self.internal_tx.send(InternalMessage::LocalEnd { id: self.stream_id });
        Ok(())
    }

    /// Resolves the stream with a success reply (acceptor side).
    pub fn reply_ok(&mut self, response: Record) -> Result<(), StreamError> {
        self.send_reply(Envelope::record(
            Kind::ReplyOk,
            self.stream_id,
            self.correlation_id,
            linuxio_proto::ReplyOkPayload { response }.to_record(),
        ))
    }

    /// Resolves the stream with an error reply (acceptor side).
    pub fn reply_err(&mut self, error: ReplyErrPayload) -> Result<(), StreamError> {
        self.send_reply(Envelope::record(
            Kind::ReplyErr,
            self.stream_id,
            self.correlation_id,
            error.to_record(),
        ))
    }

    fn send_reply(&mut self, envelope: Envelope) -> Result<(), StreamError> {
        if self.resolved_local {
            return Err(StreamError::StreamClosed);
        }
        self.resolved_local = true;
        let end_already_sent = self.shared.data_closed.swap(true, Ordering::SeqCst);
        self.shared.window_updated.notify_one();

        self.send_envelope(envelope)?;
        if !end_already_sent {
            self.send_envelope(Envelope::empty(Kind::End, self.stream_id, self.correlation_id))?;
        }
        let _ = self
            .internal_tx
            .send(InternalMessage::LocalResolved { id: self.stream_id });
        Ok(())
    }

    /// Abandons the call: CANCEL on the wire, stream resolved locally.
    pub fn cancel(&mut self) {
        if self.resolved_local {
            return;
        }
        self.resolved_local = true;
        self.shared.close_data();

        let _ = self.send_envelope(Envelope::empty(Kind::Cancel, self.stream_id, self.correlation_id));
        let _ = self.internal_tx.send(InternalMessage::LocalCancel { id: self.stream_id });
    }

    /// Awaits the peer's terminal reply (opener side).
    pub async fn await_reply(&mut self) -> Result<Reply, StreamError> {
        let reply_rx = self.reply_rx.take().ok_or(StreamError::StreamClosed)?;
        match reply_rx.await {
            Ok(reply) => {
                self.got_reply = true;
                Ok(reply)
            }
            Err(_) => Err(self.conn.death_reason()),
        }
    }

    /// Cooperative cancellation flag, set when the peer sends CANCEL.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the peer cancels the stream.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.shared.cancel_notify.notified().await;
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.resolved_local || self.got_reply || self.conn.is_dead() {
            return;
        }

        match self.role {
            // Closing an opener handle without a resolution cancels the call.
            Role::Opener => {
                let _ = self
                    .msg_tx
                    .send(Envelope::empty(Kind::Cancel, self.stream_id, self.correlation_id));
                let _ = self.internal_tx.send(InternalMessage::LocalCancel { id: self.stream_id });
            }
            // An acceptor handle dropped without a reply means the handler
            // unwound; the opener still gets a structured resolution.
            Role::Acceptor => {
                let error = ReplyErrPayload::new(ErrorKind::Internal, "handler terminated without a reply");
                let _ = self.msg_tx.send(Envelope::record(
                    Kind::ReplyErr,
                    self.stream_id,
                    self.correlation_id,
                    error.to_record(),
                ));
                let _ = self
                    .msg_tx
                    .send(Envelope::empty(Kind::End, self.stream_id, self.correlation_id));
                let _ = self
                    .internal_tx
                    .send(InternalMessage::LocalResolved { id: self.stream_id });
            }
        }
    }
}
