#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use bytes::{Bytes, BytesMut};
use linuxio_proto::*;
use smol_str::SmolStr;

fn encode_frame(envelope: &Envelope) -> Bytes {
    let mut buf = BytesMut::new();
    envelope.encode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
    buf.freeze()
}

fn split_frame(mut frame: Bytes) -> Bytes {
    use bytes::Buf as _;
    let announced = frame.get_u32() as usize;
    assert_eq!(announced, frame.len());
    frame
}

fn check_encode_decode(envelope: Envelope, raw: &[u8]) {
    let encoded = encode_frame(&envelope);
    assert_eq!(raw.to_vec(), encoded.to_vec());

    let decoded = Envelope::decode(split_frame(encoded)).unwrap();
    assert_eq!(envelope, decoded);
}

#[test]
fn kind_try_from() {
    assert_eq!(Kind::Call, Kind::try_from(1).unwrap());
    assert_eq!(Kind::Pong, Kind::try_from(9).unwrap());
    assert_eq!(Kind::Credit, Kind::try_from(11).unwrap());

    assert!(Kind::try_from(0).is_err());
    assert!(Kind::try_from(12).is_err());
}

#[test]
fn end_envelope() {
    let raw = &[
        0, 0, 0, 13, // frame length
        6, // kind: END
        0, 0, 0, 1, // stream id
        0, 0, 0, 0, 0, 0, 0, 2, // correlation id
    ];

    check_encode_decode(Envelope::empty(Kind::End, 1, 2), raw);
}

#[test]
fn ping_pong_envelopes() {
    let raw_ping = &[
        0, 0, 0, 13, // frame length
        8, // kind: PING
        0, 0, 0, 0, // stream id
        0, 0, 0, 0, 0, 0, 0, 7, // correlation id
    ];
    check_encode_decode(Envelope::empty(Kind::Ping, 0, 7), raw_ping);

    let raw_pong = &[
        0, 0, 0, 13, // frame length
        9, // kind: PONG
        0, 0, 0, 0, // stream id
        0, 0, 0, 0, 0, 0, 0, 7, // correlation id
    ];
    check_encode_decode(Envelope::empty(Kind::Pong, 0, 7), raw_pong);
}

#[test]
fn data_envelope() {
    let raw = &[
        0, 0, 0, 17, // frame length
        5, // kind: DATA
        0, 0, 0, 9, // stream id
        0, 0, 0, 0, 0, 0, 0, 4, // correlation id
        0xde, 0xad, 0xbe, 0xef, // raw payload
    ];

    check_encode_decode(
        Envelope::data(9, 4, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])),
        raw,
    );
}

#[test]
fn credit_envelope() {
    let payload = CreditPayload {
        stream_id: 3,
        bytes_acked: 65536,
    };
    let envelope = Envelope::record(Kind::Credit, 3, 9, payload.to_record());

    let raw = &[
        0, 0, 0, 57, // frame length
        11, // kind: CREDIT
        0, 0, 0, 3, // stream id
        0, 0, 0, 0, 0, 0, 0, 9, // correlation id
        0, 2, // field count
        0, 9, // field name length
        115, 116, 114, 101, 97, 109, 95, 105, 100, // "stream_id"
        2, // tag: u64
        0, 0, 0, 0, 0, 0, 0, 3, // value
        0, 11, // field name length
        98, 121, 116, 101, 115, 95, 97, 99, 107, 101, 100, // "bytes_acked"
        2, // tag: u64
        0, 0, 0, 0, 0, 1, 0, 0, // value
    ];

    check_encode_decode(envelope.clone(), raw);

    let reparsed = CreditPayload::from_record(envelope.expect_record().unwrap()).unwrap();
    assert_eq!(payload, reparsed);
}

#[test]
fn call_payload_round_trip() {
    let payload = CallPayload {
        verb: SmolStr::new("filebrowser.upload"),
        mode: StreamMode::Bidirectional,
        deadline_ms: 30_000,
        request: Record::new()
            .with("path", Value::Str(SmolStr::new("/home/alice/out.bin")))
            .with("size", Value::U64(4 * 1024 * 1024)),
    };

    let envelope = Envelope::record(Kind::Call, 5, 77, payload.to_record());
    let decoded = Envelope::decode(split_frame(encode_frame(&envelope))).unwrap();
    let reparsed = CallPayload::from_record(decoded.expect_record().unwrap()).unwrap();
    assert_eq!(payload, reparsed);
}

#[test]
fn reply_err_preserves_custom_kind() {
    let payload = ReplyErrPayload {
        kind: ErrorKind::from("DockerDaemonDown"),
        message: "cannot connect to dockerd".to_owned(),
        detail: Some(Record::new().with("socket", Value::Str(SmolStr::new("/var/run/docker.sock")))),
    };

    let envelope = Envelope::record(Kind::ReplyErr, 2, 1, payload.to_record());
    let decoded = Envelope::decode(split_frame(encode_frame(&envelope))).unwrap();
    let reparsed = ReplyErrPayload::from_record(decoded.expect_record().unwrap()).unwrap();

    assert_eq!(reparsed.kind.as_str(), "DockerDaemonDown");
    assert_eq!(payload, reparsed);
}

#[test]
fn hello_payload_round_trip() {
    let payload = HelloPayload {
        bridge_key: [0xab; BRIDGE_KEY_SIZE],
        session_id: SmolStr::new("c2Vzc2lvbi1pZC1mb3ItdGVzdHM"),
    };

    let envelope = Envelope::record(Kind::Hello, 0, 0, payload.to_record());
    let decoded = Envelope::decode(split_frame(encode_frame(&envelope))).unwrap();
    let reparsed = HelloPayload::from_record(decoded.expect_record().unwrap()).unwrap();
    assert_eq!(payload, reparsed);
}

#[test]
fn hello_debug_redacts_key() {
    let payload = HelloPayload {
        bridge_key: [0x42; BRIDGE_KEY_SIZE],
        session_id: SmolStr::new("sid"),
    };
    let debug = format!("{payload:?}");
    assert!(debug.contains("<redacted>"));
    assert!(!debug.contains("66")); // 0x42
}

#[test]
fn encode_too_large() {
    let envelope = Envelope::record(
        Kind::Progress,
        1,
        1,
        Record::new().with("blob", Value::Bytes(Bytes::from(vec![0u8; 256]))),
    );

    let mut buf = BytesMut::new();
    let err = envelope.encode(&mut buf, 64).unwrap_err();
    assert!(matches!(err, Error::EncodeTooLarge { .. }));
}

#[test]
fn truncated_header_is_short_read() {
    let err = Envelope::decode(Bytes::from_static(&[1, 0, 0])).unwrap_err();
    assert!(matches!(err, Error::ShortRead { .. }));
}

#[test]
fn unknown_kind_is_malformed() {
    let raw = &[
        200, // unknown kind
        0, 0, 0, 1, // stream id
        0, 0, 0, 0, 0, 0, 0, 1, // correlation id
    ];
    let err = Envelope::decode(Bytes::copy_from_slice(raw)).unwrap_err();
    assert!(matches!(err, Error::Malformed { field: "kind", .. }));
}

#[test]
fn payload_on_empty_kind_is_malformed() {
    let raw = &[
        8, // kind: PING
        0, 0, 0, 0, // stream id
        0, 0, 0, 0, 0, 0, 0, 0, // correlation id
        1, 2, 3, // stray payload bytes
    ];
    let err = Envelope::decode(Bytes::copy_from_slice(raw)).unwrap_err();
    assert!(matches!(err, Error::Malformed { field: "payload", .. }));
}

#[test]
fn wrong_payload_shape_rejected_on_encode() {
    let envelope = Envelope::new(Kind::Ping, 0, 0, Payload::Data(Bytes::from_static(b"x")));
    let mut buf = BytesMut::new();
    let err = envelope.encode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
    assert!(matches!(err, Error::Malformed { field: "payload", .. }));
}
