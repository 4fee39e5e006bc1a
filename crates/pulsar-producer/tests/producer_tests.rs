//! End-to-end producer tests against an in-process mock broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use pulsar_proto::{base_command::Type, frame, BaseCommand};
use pulsar_producer::{Error, Message, Producer, ProducerOpts};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

async fn read_frame(sock: &mut TcpStream, buf: &mut BytesMut) -> Option<frame::Frame> {
    loop {
        match frame::decode(buf) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => match sock.read_buf(buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            },
            // Malformed frame consumed; keep scanning.
            Err(_) => {}
        }
    }
}

async fn write_frame(sock: &mut TcpStream, command: &BaseCommand) {
    let bytes = frame::encode_simple(command).unwrap();
    sock.write_all(&bytes).await.unwrap();
}

/// Serve the Connect/Producer handshake on a fresh connection.
async fn handshake(sock: &mut TcpStream, buf: &mut BytesMut) {
    let connect = read_frame(sock, buf).await.unwrap();
    assert_eq!(connect.command.command_type(), Some(Type::Connect));
    write_frame(sock, &BaseCommand::connected("mock-broker")).await;

    let register = read_frame(sock, buf).await.unwrap();
    assert_eq!(register.command.command_type(), Some(Type::Producer));
    let producer = register.command.producer.unwrap();
    write_frame(
        sock,
        &BaseCommand::producer_success(producer.request_id, "mock-producer"),
    )
    .await;
}

#[tokio::test]
async fn sync_publish_batch_of_one() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        handshake(&mut sock, &mut buf).await;
        while let Some(frame) = read_frame(&mut sock, &mut buf).await {
            match frame.command.command_type() {
                Some(Type::Send) => {
                    let send = frame.command.send.unwrap();
                    seen_tx
                        .send((send.sequence_id, send.num_messages.unwrap_or(1)))
                        .unwrap();
                    write_frame(
                        &mut sock,
                        &BaseCommand::send_receipt(send.producer_id, send.sequence_id),
                    )
                    .await;
                }
                Some(Type::Ping) => write_frame(&mut sock, &BaseCommand::pong()).await,
                _ => {}
            }
        }
    });

    let producer = Producer::spawn(
        "persistent://public/default/t1-partition-0",
        format!("pulsar://{}", addr),
        ProducerOpts::default(),
    )
    .unwrap();

    let receipt = producer
        .send_sync(vec![Message::with_key("a", "1")])
        .await
        .unwrap();
    assert_eq!(receipt.sequence_id, 1);

    let (sequence_id, num_messages) = seen_rx.recv().await.unwrap();
    assert_eq!((sequence_id, num_messages), (1, 1));

    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn casts_coalesce_into_one_batch_with_one_callback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();

        let connect = read_frame(&mut sock, &mut buf).await.unwrap();
        assert_eq!(connect.command.command_type(), Some(Type::Connect));
        write_frame(&mut sock, &BaseCommand::connected("mock-broker")).await;

        let register = read_frame(&mut sock, &mut buf).await.unwrap();
        let producer = register.command.producer.unwrap();
        // Hold the registration open until the casts are spooled, so the
        // drain on connect forms one batch from all of them.
        release_rx.await.unwrap();
        write_frame(
            &mut sock,
            &BaseCommand::producer_success(producer.request_id, "mock-producer"),
        )
        .await;

        while let Some(frame) = read_frame(&mut sock, &mut buf).await {
            match frame.command.command_type() {
                Some(Type::Send) => {
                    let send = frame.command.send.unwrap();
                    seen_tx
                        .send((send.sequence_id, send.num_messages.unwrap_or(1)))
                        .unwrap();
                    write_frame(
                        &mut sock,
                        &BaseCommand::send_receipt(send.producer_id, send.sequence_id),
                    )
                    .await;
                }
                Some(Type::Ping) => write_frame(&mut sock, &BaseCommand::pong()).await,
                _ => {}
            }
        }
    });

    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&callbacks);
    let producer = Producer::spawn(
        "persistent://public/default/t2-partition-0",
        format!("pulsar://{}", addr),
        ProducerOpts::builder()
            .batch_size(100)
            .callback(Arc::new(move |_receipt| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .build(),
    )
    .unwrap();

    for value in ["1", "2", "3"] {
        producer
            .send(vec![Message::with_key("k", value)])
            .await
            .unwrap();
    }
    // Let the actor spool the casts, then finish the handshake.
    sleep(Duration::from_millis(300)).await;
    release_tx.send(()).unwrap();

    let (sequence_id, num_messages) = seen_rx.recv().await.unwrap();
    assert_eq!(
        (sequence_id, num_messages),
        (1, 3),
        "three casts must coalesce into one frame"
    );

    timeout(Duration::from_secs(5), async {
        while callbacks.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("callback never fired");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(callbacks.load(Ordering::SeqCst), 1, "one callback per batch");

    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnect_replays_inflight_with_same_sequence_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First connection: accept the send, then drop it unreceipted.
        {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            handshake(&mut sock, &mut buf).await;
            let frame = read_frame(&mut sock, &mut buf).await.unwrap();
            if let Some(send) = frame.command.send {
                seen_tx.send(send.sequence_id).unwrap();
            }
        }
        // Second connection: receipt whatever is replayed.
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        handshake(&mut sock, &mut buf).await;
        while let Some(frame) = read_frame(&mut sock, &mut buf).await {
            match frame.command.command_type() {
                Some(Type::Send) => {
                    let send = frame.command.send.unwrap();
                    seen_tx.send(send.sequence_id).unwrap();
                    write_frame(
                        &mut sock,
                        &BaseCommand::send_receipt(send.producer_id, send.sequence_id),
                    )
                    .await;
                }
                Some(Type::Ping) => write_frame(&mut sock, &BaseCommand::pong()).await,
                _ => {}
            }
        }
    });

    let producer = Producer::spawn(
        "persistent://public/default/t3-partition-0",
        format!("pulsar://{}", addr),
        ProducerOpts::default(),
    )
    .unwrap();

    // The reconnect happens on the fixed 5 s delay, so wait generously.
    let receipt = producer
        .send_sync_timeout(vec![Message::new("payload")], Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(receipt.sequence_id, 1);

    let first = seen_rx.recv().await.unwrap();
    let replayed = seen_rx.recv().await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(replayed, 1, "replay must reuse the original sequence id");

    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn late_receipt_after_caller_timeout_is_harmless() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        handshake(&mut sock, &mut buf).await;
        let mut first_send = true;
        while let Some(frame) = read_frame(&mut sock, &mut buf).await {
            match frame.command.command_type() {
                Some(Type::Send) => {
                    let send = frame.command.send.unwrap();
                    if first_send {
                        first_send = false;
                        // Outlive the caller's timeout before receipting.
                        sleep(Duration::from_millis(400)).await;
                    }
                    write_frame(
                        &mut sock,
                        &BaseCommand::send_receipt(send.producer_id, send.sequence_id),
                    )
                    .await;
                }
                Some(Type::Ping) => write_frame(&mut sock, &BaseCommand::pong()).await,
                _ => {}
            }
        }
    });

    let producer = Producer::spawn(
        "persistent://public/default/t4-partition-0",
        format!("pulsar://{}", addr),
        ProducerOpts::default(),
    )
    .unwrap();

    let result = producer
        .send_sync_timeout(vec![Message::new("first")], Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(Error::Timeout)));

    // The late receipt lands on a vanished caller; the actor carries on.
    sleep(Duration::from_millis(600)).await;
    let receipt = producer
        .send_sync(vec![Message::new("second")])
        .await
        .unwrap();
    assert_eq!(receipt.sequence_id, 2);

    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn broker_ping_is_answered_with_pong() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (pong_tx, pong_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        handshake(&mut sock, &mut buf).await;
        write_frame(&mut sock, &BaseCommand::ping()).await;
        let mut pong_tx = Some(pong_tx);
        while let Some(frame) = read_frame(&mut sock, &mut buf).await {
            if frame.command.command_type() == Some(Type::Pong) {
                if let Some(tx) = pong_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    });

    let producer = Producer::spawn(
        "persistent://public/default/t5-partition-0",
        format!("pulsar://{}", addr),
        ProducerOpts::default(),
    )
    .unwrap();

    timeout(Duration::from_secs(5), pong_rx)
        .await
        .expect("no pong within deadline")
        .unwrap();

    producer.shutdown().await.unwrap();
}
