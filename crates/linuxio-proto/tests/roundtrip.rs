#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use bytes::{Buf as _, Bytes, BytesMut};
use linuxio_proto::*;
use proptest::prelude::*;
use smol_str::SmolStr;

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        "[a-zA-Z0-9 ._/-]{0,40}".prop_map(|s| Value::Str(SmolStr::new(s))),
        any::<u64>().prop_map(Value::U64),
        any::<i64>().prop_map(Value::I64),
        any::<bool>().prop_map(Value::Bool),
        proptest::collection::vec(any::<u8>(), 0..256).prop_map(|v| Value::Bytes(Bytes::from(v))),
    ];

    leaf.prop_recursive(3, 24, 6, |inner| {
        record_strategy_with(inner).prop_map(Value::Record)
    })
}

fn record_strategy_with(value: impl Strategy<Value = Value> + 'static) -> impl Strategy<Value = Record> {
    proptest::collection::vec(("[a-z_]{1,16}", value), 0..6).prop_map(|fields| {
        fields
            .into_iter()
            .map(|(name, value)| (SmolStr::new(name), value))
            .collect::<Record>()
    })
}

fn record_strategy() -> impl Strategy<Value = Record> {
    record_strategy_with(value_strategy())
}

fn kind_and_payload_strategy() -> impl Strategy<Value = (Kind, Payload)> {
    prop_oneof![
        Just(Kind::End).prop_map(|k| (k, Payload::Empty)),
        Just(Kind::Cancel).prop_map(|k| (k, Payload::Empty)),
        Just(Kind::Ping).prop_map(|k| (k, Payload::Empty)),
        Just(Kind::Pong).prop_map(|k| (k, Payload::Empty)),
        proptest::collection::vec(any::<u8>(), 0..2048)
            .prop_map(|v| (Kind::Data, Payload::Data(Bytes::from(v)))),
        (
            prop_oneof![
                Just(Kind::Call),
                Just(Kind::ReplyOk),
                Just(Kind::ReplyErr),
                Just(Kind::Progress),
                Just(Kind::Hello),
                Just(Kind::Credit),
            ],
            record_strategy()
        )
            .prop_map(|(k, r)| (k, Payload::Record(r))),
    ]
}

proptest! {
    #[test]
    fn record_round_trip(record in record_strategy()) {
        let mut buf = BytesMut::new();
        record.encode(&mut buf).unwrap();
        prop_assert_eq!(buf.len(), record.size());

        let mut bytes = buf.freeze();
        let decoded = Record::decode(&mut bytes).unwrap();
        prop_assert!(bytes.is_empty());
        prop_assert_eq!(record, decoded);
    }

    #[test]
    fn envelope_round_trip(
        (kind, payload) in kind_and_payload_strategy(),
        stream_id in any::<u32>(),
        correlation_id in any::<u64>(),
    ) {
        let envelope = Envelope::new(kind, stream_id, correlation_id, payload);

        let mut buf = BytesMut::new();
        envelope.encode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut frame = buf.freeze();
        let announced = frame.get_u32() as usize;
        prop_assert_eq!(announced, frame.len());
        prop_assert_eq!(announced, envelope.body_size());

        let decoded = Envelope::decode(frame).unwrap();
        prop_assert_eq!(envelope, decoded);
    }
}
