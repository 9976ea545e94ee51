#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use std::time::Duration;

use linuxio_mux::{DataEvent, MuxConfig, MuxConnection, Multiplexer, Reply, StreamError};
use linuxio_proto::{Bytes, CallPayload, ErrorKind, Record, ReplyErrPayload, StreamMode, Value};
use smol_str::SmolStr;

fn connected_pair(cfg: MuxConfig) -> (MuxConnection, MuxConnection) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);

    let a = Multiplexer::new(Box::new(left_read), Box::new(left_write))
        .with_config(cfg.clone())
        .spawn();
    let b = Multiplexer::new(Box::new(right_read), Box::new(right_write))
        .with_config(cfg)
        .spawn();

    (a, b)
}

fn call(verb: &str, mode: StreamMode) -> CallPayload {
    CallPayload {
        verb: SmolStr::new(verb),
        mode,
        deadline_ms: 30_000,
        request: Record::new(),
    }
}

#[tokio::test]
async fn unary_call_round_trip() {
    let (client, mut server) = connected_pair(MuxConfig::default());

    let server_task = tokio::spawn(async move {
        let mut incoming = server.incoming.recv().await.unwrap();
        assert_eq!(incoming.call.verb, "system.hostname");
        assert_eq!(incoming.call.mode, StreamMode::Unary);
        incoming
            .stream
            .reply_ok(Record::new().with("hostname", Value::Str(SmolStr::new("testhost"))))
            .unwrap();
        server
    });

    let mut stream = client
        .handle
        .open_stream(call("system.hostname", StreamMode::Unary), 1)
        .await
        .unwrap();

    match stream.await_reply().await.unwrap() {
        Reply::Ok(response) => assert_eq!(response.get_str("hostname"), Some("testhost")),
        Reply::Err(error) => panic!("unexpected error reply: {error:?}"),
    }

    drop(server_task.await.unwrap());
}

#[tokio::test]
async fn per_stream_fifo_across_interleaved_streams() {
    let (client, mut server) = connected_pair(MuxConfig::default());

    const CHUNKS: usize = 32;

    let server_task = tokio::spawn(async move {
        let mut orders = Vec::new();
        for _ in 0..2 {
            let mut incoming = server.incoming.recv().await.unwrap();
            let mut reader = incoming.stream.take_reader().unwrap();
            orders.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match reader.read_data().await.unwrap() {
                        DataEvent::Data(bytes) => seen.push(bytes[0]),
                        DataEvent::End => break,
                        DataEvent::Cancelled => panic!("unexpected cancel"),
                    }
                }
                incoming.stream.reply_ok(Record::new()).unwrap();
                seen
            }));
        }

        let mut result = Vec::new();
        for order in orders {
            result.push(order.await.unwrap());
        }
        (server, result)
    });

    let first = client
        .handle
        .open_stream(call("upload.first", StreamMode::Bidirectional), 1)
        .await
        .unwrap();
    let second = client
        .handle
        .open_stream(call("upload.second", StreamMode::Bidirectional), 2)
        .await
        .unwrap();

    // Interleave writes on both streams from the same task.
    for i in 0..CHUNKS {
        let value = u8::try_from(i).unwrap();
        first.write_data(Bytes::from(vec![value; 16])).await.unwrap();
        second.write_data(Bytes::from(vec![value; 16])).await.unwrap();
    }
    first.finish_data().unwrap();
    second.finish_data().unwrap();

    let (_server, orders) = server_task.await.unwrap();
    let expected: Vec<u8> = (0..CHUNKS).map(|i| u8::try_from(i).unwrap()).collect();
    for seen in orders {
        // Chunks may be split in flight, so dedup consecutive values
        // before comparing the per-stream order.
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(expected, deduped);
    }

    drop(first);
    drop(second);
}

#[tokio::test]
async fn write_blocks_until_credit_replenished() {
    let cfg = MuxConfig {
        initial_window_size: 8,
        max_data_chunk: 4,
        ..MuxConfig::default()
    };
    let (client, mut server) = connected_pair(cfg);

    let stream = client
        .handle
        .open_stream(call("upload.blocked", StreamMode::Bidirectional), 1)
        .await
        .unwrap();

    let mut incoming = server.incoming.recv().await.unwrap();
    let mut reader = incoming.stream.take_reader().unwrap();

    // 24 bytes against an 8-byte window: must stall until drained.
    let payload = Bytes::from(vec![7u8; 24]);
    let mut write_fut = Box::pin(stream.write_data(payload));

    let early = tokio::time::timeout(Duration::from_millis(100), &mut write_fut).await;
    assert!(early.is_err(), "write completed without the receiver draining");

    let mut received = 0;
    while received < 24 {
        match reader.read_data().await.unwrap() {
            DataEvent::Data(bytes) => received += bytes.len(),
            event => panic!("unexpected event: {event:?}"),
        }
    }

    tokio::time::timeout(Duration::from_secs(5), write_fut)
        .await
        .expect("write stalled after credit came back")
        .unwrap();
}

#[tokio::test]
async fn progress_is_coalesced_but_reply_is_not() {
    let cfg = MuxConfig {
        progress_queue_depth: 2,
        ..MuxConfig::default()
    };
    let (client, mut server) = connected_pair(cfg);

    let server_task = tokio::spawn(async move {
        let mut incoming = server.incoming.recv().await.unwrap();
        for i in 0..5u64 {
            incoming
                .stream
                .send_progress(Record::new().with("step", Value::U64(i)))
                .unwrap();
        }
        incoming.stream.reply_ok(Record::new()).unwrap();
        server
    });

    let mut stream = client
        .handle
        .open_stream(call("update.apply", StreamMode::ProgressPush), 1)
        .await
        .unwrap();

    // The reply arrives after every PROGRESS envelope; once it is here the
    // queue has seen (and coalesced) all five records.
    let reply = stream.await_reply().await.unwrap();
    assert!(matches!(reply, Reply::Ok(_)));

    let mut steps = Vec::new();
    while let Some(record) = stream.recv_progress().await {
        steps.push(record.get_u64("step").unwrap());
    }

    assert_eq!(steps, vec![3, 4], "oldest records must be dropped first");

    drop(server_task.await.unwrap());
}

#[tokio::test]
async fn cancel_reaches_the_acceptor_flag() {
    let (client, mut server) = connected_pair(MuxConfig::default());

    let server_task = tokio::spawn(async move {
        let mut incoming = server.incoming.recv().await.unwrap();
        incoming.stream.cancelled().await;
        assert!(incoming.stream.is_cancelled());
        incoming
            .stream
            .reply_err(ReplyErrPayload::new(ErrorKind::Cancelled, "cancelled"))
            .unwrap();
        server
    });

    let mut stream = client
        .handle
        .open_stream(call("filebrowser.upload", StreamMode::Bidirectional), 1)
        .await
        .unwrap();

    stream.write_data(Bytes::from_static(b"partial")).await.unwrap();
    stream.cancel();

    drop(server_task.await.unwrap());
}

#[tokio::test]
async fn dropped_acceptor_handle_resolves_with_internal() {
    let (client, mut server) = connected_pair(MuxConfig::default());

    let server_task = tokio::spawn(async move {
        let incoming = server.incoming.recv().await.unwrap();
        // Simulates a handler that unwound without replying.
        drop(incoming.stream);
        server
    });

    let mut stream = client
        .handle
        .open_stream(call("system.echo", StreamMode::Unary), 1)
        .await
        .unwrap();

    match stream.await_reply().await.unwrap() {
        Reply::Err(error) => assert_eq!(error.kind, ErrorKind::Internal),
        Reply::Ok(_) => panic!("expected an Internal error reply"),
    }

    drop(server_task.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_declared_unreachable() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);

    // The peer end stays open but never answers anything.
    let _parked = right;

    let client = Multiplexer::new(Box::new(left_read), Box::new(left_write)).spawn();

    let mut stream = client
        .handle
        .open_stream(call("system.hostname", StreamMode::Unary), 1)
        .await
        .unwrap();

    let reason = client.handle.closed().await;
    assert_eq!(reason, StreamError::PeerUnreachable);

    let reply_error = stream.await_reply().await.unwrap_err();
    assert_eq!(reply_error, StreamError::PeerUnreachable);
}

#[tokio::test]
async fn peer_disconnect_resolves_streams_with_transport_reset() {
    let (client, server) = connected_pair(MuxConfig::default());

    let mut stream = client
        .handle
        .open_stream(call("system.hostname", StreamMode::Unary), 1)
        .await
        .unwrap();

    // Tear the whole peer connection down mid-call.
    drop(server);

    let error = stream.await_reply().await.unwrap_err();
    assert_eq!(error, StreamError::TransportReset);

    let open_error = client
        .handle
        .open_stream(call("system.hostname", StreamMode::Unary), 2)
        .await
        .unwrap_err();
    assert_eq!(open_error, StreamError::ConnectionDown);
}
