//! Framed wire protocol spoken between the LinuxIO webserver and its
//! per-session bridge processes.
//!
//! A frame is a `u32` big-endian length prefix (excluding the prefix
//! itself) followed by an envelope: kind, stream id, correlation id and a
//! payload. Structured payloads use the tagged record format from
//! [`record`]; `DATA` payloads carry raw bytes.

use core::fmt;

use bytes::{Buf as _, BufMut as _};
use smol_str::SmolStr;

mod record;

pub use self::record::{Record, Value};

// We re-export these types, because they are used in the public API.
#[rustfmt::skip]
pub use bytes::{Bytes, BytesMut};

/// Ceiling for control frames. `DATA` transfers of arbitrary size are
/// chunked by the multiplexer and never approach this.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the frame length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Size of the fixed envelope header following the length prefix.
pub const ENVELOPE_HEADER_SIZE: usize = 1 /* kind */ + 4 /* streamId */ + 8 /* correlationId */;

/// Bridge keys are raw 256-bit secrets.
pub const BRIDGE_KEY_SIZE: usize = 32;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The envelope would exceed the maximum frame size once serialized.
    EncodeTooLarge { size: usize, max: usize },
    /// The announced frame length exceeds the per-connection ceiling.
    FrameTooLarge { announced: usize, max: usize },
    /// The buffer ended before a complete item could be read.
    ShortRead {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    /// The payload does not parse.
    Malformed {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EncodeTooLarge { size, max } => {
                write!(f, "envelope too large to encode: max is {max}, got {size}")
            }
            Error::FrameTooLarge { announced, max } => {
                write!(f, "announced frame length {announced} exceeds ceiling {max}")
            }
            Error::ShortRead {
                name,
                received,
                expected,
            } => write!(
                f,
                "not enough bytes to decode {name}: received {received} bytes, expected {expected} bytes"
            ),
            Error::Malformed { name, field, reason } => {
                write!(f, "invalid `{field}` in {name}: {reason}")
            }
        }
    }
}

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if received < expected {
            return Err(Error::ShortRead {
                name: $name,
                received,
                expected,
            });
        }
    }};
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Call = 1,
    ReplyOk = 2,
    ReplyErr = 3,
    Progress = 4,
    Data = 5,
    End = 6,
    Cancel = 7,
    Ping = 8,
    Pong = 9,
    Hello = 10,
    Credit = 11,
}

impl TryFrom<u8> for Kind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Kind, Error> {
        match v {
            1 => Ok(Kind::Call),
            2 => Ok(Kind::ReplyOk),
            3 => Ok(Kind::ReplyErr),
            4 => Ok(Kind::Progress),
            5 => Ok(Kind::Data),
            6 => Ok(Kind::End),
            7 => Ok(Kind::Cancel),
            8 => Ok(Kind::Ping),
            9 => Ok(Kind::Pong),
            10 => Ok(Kind::Hello),
            11 => Ok(Kind::Credit),
            _ => Err(Error::Malformed {
                name: Envelope::NAME,
                field: "kind",
                reason: "unknown value",
            }),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Call => "CALL",
            Kind::ReplyOk => "REPLY_OK",
            Kind::ReplyErr => "REPLY_ERR",
            Kind::Progress => "PROGRESS",
            Kind::Data => "DATA",
            Kind::End => "END",
            Kind::Cancel => "CANCEL",
            Kind::Ping => "PING",
            Kind::Pong => "PONG",
            Kind::Hello => "HELLO",
            Kind::Credit => "CREDIT",
        };
        f.write_str(s)
    }
}

/// How a stream is driven once opened.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    Unary = 0,
    ProgressPush = 1,
    Bidirectional = 2,
}

impl TryFrom<u8> for StreamMode {
    type Error = Error;

    fn try_from(v: u8) -> Result<StreamMode, Error> {
        match v {
            0 => Ok(StreamMode::Unary),
            1 => Ok(StreamMode::ProgressPush),
            2 => Ok(StreamMode::Bidirectional),
            _ => Err(Error::Malformed {
                name: CallPayload::NAME,
                field: "mode",
                reason: "unknown value",
            }),
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamMode::Unary => "unary",
            StreamMode::ProgressPush => "progress-push",
            StreamMode::Bidirectional => "bidirectional",
        };
        f.write_str(s)
    }
}

/// Stable error kinds carried on the wire.
///
/// Kinds surfaced at the bridge boundary are preserved end-to-end; handler
/// specific kinds ride in [`ErrorKind::Other`] verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadCredentials,
    AccountLocked,
    PamError,
    AuthHelperTampered,
    BridgeTampered,
    BridgeStartTimeout,
    BridgeUnreachable,
    BridgeLost,
    PeerUnreachable,
    TransportReset,
    UnknownVerb,
    BadStreamMode,
    Overloaded,
    ShuttingDown,
    DeadlineExceeded,
    Cancelled,
    Internal,
    Other(SmolStr),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::BadCredentials => "BadCredentials",
            ErrorKind::AccountLocked => "AccountLocked",
            ErrorKind::PamError => "PamError",
            ErrorKind::AuthHelperTampered => "AuthHelperTampered",
            ErrorKind::BridgeTampered => "BridgeTampered",
            ErrorKind::BridgeStartTimeout => "BridgeStartTimeout",
            ErrorKind::BridgeUnreachable => "BridgeUnreachable",
            ErrorKind::BridgeLost => "BridgeLost",
            ErrorKind::PeerUnreachable => "PeerUnreachable",
            ErrorKind::TransportReset => "TransportReset",
            ErrorKind::UnknownVerb => "UnknownVerb",
            ErrorKind::BadStreamMode => "BadStreamMode",
            ErrorKind::Overloaded => "Overloaded",
            ErrorKind::ShuttingDown => "ShuttingDown",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
            ErrorKind::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for ErrorKind {
    fn from(s: &str) -> Self {
        match s {
            "BadCredentials" => ErrorKind::BadCredentials,
            "AccountLocked" => ErrorKind::AccountLocked,
            "PamError" => ErrorKind::PamError,
            "AuthHelperTampered" => ErrorKind::AuthHelperTampered,
            "BridgeTampered" => ErrorKind::BridgeTampered,
            "BridgeStartTimeout" => ErrorKind::BridgeStartTimeout,
            "BridgeUnreachable" => ErrorKind::BridgeUnreachable,
            "BridgeLost" => ErrorKind::BridgeLost,
            "PeerUnreachable" => ErrorKind::PeerUnreachable,
            "TransportReset" => ErrorKind::TransportReset,
            "UnknownVerb" => ErrorKind::UnknownVerb,
            "BadStreamMode" => ErrorKind::BadStreamMode,
            "Overloaded" => ErrorKind::Overloaded,
            "ShuttingDown" => ErrorKind::ShuttingDown,
            "DeadlineExceeded" => ErrorKind::DeadlineExceeded,
            "Cancelled" => ErrorKind::Cancelled,
            "Internal" => ErrorKind::Internal,
            other => ErrorKind::Other(SmolStr::new(other)),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Payload {
    Empty,
    Record(Record),
    Data(Bytes),
}

impl Payload {
    pub fn size(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Record(r) => r.size(),
            Payload::Data(b) => b.len(),
        }
    }
}

#[derive(PartialEq, Eq, Clone)]
pub struct Envelope {
    pub kind: Kind,
    pub stream_id: u32,
    pub correlation_id: u64,
    pub payload: Payload,
}

// We don't want to print `DATA` payload content (usually too big).
impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Envelope");
        s.field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("correlation_id", &self.correlation_id);
        match &self.payload {
            Payload::Data(bytes) => s.field("payload.len()", &bytes.len()).finish_non_exhaustive(),
            payload => s.field("payload", payload).finish(),
        }
    }
}

impl Envelope {
    pub const NAME: &'static str = "ENVELOPE";

    pub fn new(kind: Kind, stream_id: u32, correlation_id: u64, payload: Payload) -> Self {
        Self {
            kind,
            stream_id,
            correlation_id,
            payload,
        }
    }

    pub fn empty(kind: Kind, stream_id: u32, correlation_id: u64) -> Self {
        Self::new(kind, stream_id, correlation_id, Payload::Empty)
    }

    pub fn data(stream_id: u32, correlation_id: u64, bytes: Bytes) -> Self {
        Self::new(Kind::Data, stream_id, correlation_id, Payload::Data(bytes))
    }

    pub fn record(kind: Kind, stream_id: u32, correlation_id: u64, record: Record) -> Self {
        Self::new(kind, stream_id, correlation_id, Payload::Record(record))
    }

    /// Envelope size excluding the length prefix.
    pub fn body_size(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.payload.size()
    }

    fn check_payload_shape(&self) -> Result<(), Error> {
        let ok = match self.kind {
            Kind::Data => matches!(self.payload, Payload::Data(_)),
            Kind::Ping | Kind::Pong | Kind::End | Kind::Cancel => matches!(self.payload, Payload::Empty),
            Kind::Call | Kind::ReplyOk | Kind::ReplyErr | Kind::Progress | Kind::Hello | Kind::Credit => {
                matches!(self.payload, Payload::Record(_))
            }
        };

        if ok {
            Ok(())
        } else {
            Err(Error::Malformed {
                name: Self::NAME,
                field: "payload",
                reason: "payload shape does not match kind",
            })
        }
    }

    /// Produces a single frame: length prefix followed by the envelope.
    pub fn encode(&self, buf: &mut BytesMut, max_frame_size: usize) -> Result<(), Error> {
        self.check_payload_shape()?;

        let body_size = self.body_size();
        if body_size > max_frame_size {
            return Err(Error::EncodeTooLarge {
                size: body_size,
                max: max_frame_size,
            });
        }

        buf.reserve(LEN_PREFIX_SIZE + body_size);
        buf.put_u32(u32::try_from(body_size).map_err(|_| Error::EncodeTooLarge {
            size: body_size,
            max: u32::MAX as usize,
        })?);
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.put_u64(self.correlation_id);

        match &self.payload {
            Payload::Empty => {}
            Payload::Record(record) => record.encode(buf)?,
            Payload::Data(bytes) => buf.put(bytes.slice(..)),
        }

        Ok(())
    }

    /// Decodes one envelope from a frame body (length prefix already
    /// consumed). The whole buffer must belong to this envelope.
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[ENVELOPE_HEADER_SIZE] for Self::NAME);

        let kind = Kind::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();
        let correlation_id = buf.get_u64();

        let payload = match kind {
            Kind::Data => Payload::Data(buf),
            Kind::Ping | Kind::Pong | Kind::End | Kind::Cancel => {
                if !buf.is_empty() {
                    return Err(Error::Malformed {
                        name: Self::NAME,
                        field: "payload",
                        reason: "unexpected payload bytes",
                    });
                }
                Payload::Empty
            }
            Kind::Call | Kind::ReplyOk | Kind::ReplyErr | Kind::Progress | Kind::Hello | Kind::Credit => {
                let record = Record::decode(&mut buf)?;
                if !buf.is_empty() {
                    return Err(Error::Malformed {
                        name: Self::NAME,
                        field: "payload",
                        reason: "trailing bytes after record",
                    });
                }
                Payload::Record(record)
            }
        };

        Ok(Self {
            kind,
            stream_id,
            correlation_id,
            payload,
        })
    }

    /// Borrows the structured payload, or fails for `DATA`/empty kinds.
    pub fn expect_record(&self) -> Result<&Record, Error> {
        match &self.payload {
            Payload::Record(record) => Ok(record),
            _ => Err(Error::Malformed {
                name: Self::NAME,
                field: "payload",
                reason: "expected a structured record",
            }),
        }
    }
}

/// Payload of the `CALL` envelope opening a stream.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CallPayload {
    pub verb: SmolStr,
    pub mode: StreamMode,
    pub deadline_ms: u32,
    pub request: Record,
}

impl CallPayload {
    pub const NAME: &'static str = "CALL";

    pub fn to_record(&self) -> Record {
        Record::new()
            .with("verb", Value::Str(self.verb.clone()))
            .with("mode", Value::U64(u64::from(self.mode as u8)))
            .with("deadline_ms", Value::U64(u64::from(self.deadline_ms)))
            .with("request", Value::Record(self.request.clone()))
    }

    pub fn from_record(record: &Record) -> Result<Self, Error> {
        let verb = record.get_str("verb").ok_or(Error::Malformed {
            name: Self::NAME,
            field: "verb",
            reason: "missing or not a string",
        })?;
        let mode = record.get_u64("mode").ok_or(Error::Malformed {
            name: Self::NAME,
            field: "mode",
            reason: "missing or not an integer",
        })?;
        let mode = u8::try_from(mode)
            .map_err(|_| Error::Malformed {
                name: Self::NAME,
                field: "mode",
                reason: "out of range",
            })
            .and_then(StreamMode::try_from)?;
        let deadline_ms = record.get_u64("deadline_ms").ok_or(Error::Malformed {
            name: Self::NAME,
            field: "deadline_ms",
            reason: "missing or not an integer",
        })?;
        let deadline_ms = u32::try_from(deadline_ms).map_err(|_| Error::Malformed {
            name: Self::NAME,
            field: "deadline_ms",
            reason: "out of range",
        })?;
        let request = record
            .get_record("request")
            .ok_or(Error::Malformed {
                name: Self::NAME,
                field: "request",
                reason: "missing or not a record",
            })?
            .clone();

        Ok(Self {
            verb: SmolStr::new(verb),
            mode,
            deadline_ms,
            request,
        })
    }
}

/// Payload of `REPLY_OK`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplyOkPayload {
    pub response: Record,
}

impl ReplyOkPayload {
    pub const NAME: &'static str = "REPLY_OK";

    pub fn to_record(&self) -> Record {
        Record::new().with("response", Value::Record(self.response.clone()))
    }

    pub fn from_record(record: &Record) -> Result<Self, Error> {
        let response = record
            .get_record("response")
            .ok_or(Error::Malformed {
                name: Self::NAME,
                field: "response",
                reason: "missing or not a record",
            })?
            .clone();
        Ok(Self { response })
    }
}

/// Payload of `REPLY_ERR`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplyErrPayload {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<Record>,
}

impl ReplyErrPayload {
    pub const NAME: &'static str = "REPLY_ERR";

    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new()
            .with("kind", Value::Str(SmolStr::new(self.kind.as_str())))
            .with("message", Value::Str(SmolStr::new(&self.message)));
        if let Some(detail) = &self.detail {
            record.insert("detail", Value::Record(detail.clone()));
        }
        record
    }

    pub fn from_record(record: &Record) -> Result<Self, Error> {
        let kind = record.get_str("kind").ok_or(Error::Malformed {
            name: Self::NAME,
            field: "kind",
            reason: "missing or not a string",
        })?;
        let message = record.get_str("message").ok_or(Error::Malformed {
            name: Self::NAME,
            field: "message",
            reason: "missing or not a string",
        })?;
        let detail = record.get_record("detail").cloned();

        Ok(Self {
            kind: ErrorKind::from(kind),
            message: message.to_owned(),
            detail,
        })
    }
}

/// Payload of the connection-opening `HELLO`.
#[derive(PartialEq, Eq, Clone)]
pub struct HelloPayload {
    pub bridge_key: [u8; BRIDGE_KEY_SIZE],
    pub session_id: SmolStr,
}

// The bridge key must never reach logs.
impl fmt::Debug for HelloPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloPayload")
            .field("bridge_key", &"<redacted>")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl HelloPayload {
    pub const NAME: &'static str = "HELLO";

    pub fn to_record(&self) -> Record {
        Record::new()
            .with("bridge_key", Value::Bytes(Bytes::copy_from_slice(&self.bridge_key)))
            .with("session_id", Value::Str(self.session_id.clone()))
    }

    pub fn from_record(record: &Record) -> Result<Self, Error> {
        let key_bytes = record.get_bytes("bridge_key").ok_or(Error::Malformed {
            name: Self::NAME,
            field: "bridge_key",
            reason: "missing or not bytes",
        })?;
        let bridge_key: [u8; BRIDGE_KEY_SIZE] = key_bytes.as_ref().try_into().map_err(|_| Error::Malformed {
            name: Self::NAME,
            field: "bridge_key",
            reason: "wrong length",
        })?;
        let session_id = record.get_str("session_id").ok_or(Error::Malformed {
            name: Self::NAME,
            field: "session_id",
            reason: "missing or not a string",
        })?;

        Ok(Self {
            bridge_key,
            session_id: SmolStr::new(session_id),
        })
    }
}

/// Payload of the out-of-band `CREDIT` envelope replenishing a window.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CreditPayload {
    pub stream_id: u32,
    pub bytes_acked: u32,
}

impl CreditPayload {
    pub const NAME: &'static str = "CREDIT";

    pub fn to_record(self) -> Record {
        Record::new()
            .with("stream_id", Value::U64(u64::from(self.stream_id)))
            .with("bytes_acked", Value::U64(u64::from(self.bytes_acked)))
    }

    pub fn from_record(record: &Record) -> Result<Self, Error> {
        let stream_id = record
            .get_u64("stream_id")
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(Error::Malformed {
                name: Self::NAME,
                field: "stream_id",
                reason: "missing or out of range",
            })?;
        let bytes_acked = record
            .get_u64("bytes_acked")
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(Error::Malformed {
                name: Self::NAME,
                field: "bytes_acked",
                reason: "missing or out of range",
            })?;

        Ok(Self { stream_id, bytes_acked })
    }
}
