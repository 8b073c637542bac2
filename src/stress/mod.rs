//! Internal stress tests for pipelining.
//!
//! These tests verify reply ordering on one session under high concurrency.

use crate::core::command::Cmd;
use crate::core::config::{ConnectOptions, NodeAddr};
use crate::core::session::Session;
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Spawns a server answering `ECHO x` with `x` and anything else with `+OK`.
/// Replies to one read are flushed together, so pipelined requests are
/// answered in batches.
async fn spawn_echo_server() -> NodeAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let mut decoder = Decoder::new();
                let mut encoder = Encoder::new();
                let mut buf = [0u8; 4096];

                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => n,
                        Err(_) => return,
                    };

                    decoder.append(&buf[..n]);

                    while let Ok(Some(frame)) = decoder.decode() {
                        let response = match frame {
                            Frame::Array(ref args) => match args.as_slice() {
                                [Frame::BulkString(Some(cmd)), payload]
                                    if cmd.eq_ignore_ascii_case(b"ECHO") =>
                                {
                                    payload.clone()
                                }
                                _ => Frame::SimpleString(b"OK".to_vec()),
                            },
                            _ => Frame::Error(b"ERR format".to_vec()),
                        };
                        encoder.encode(&response);
                    }

                    let data = encoder.take();
                    if socket.write_all(&data).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    NodeAddr::new("127.0.0.1", addr.port())
}

#[tokio::test]
async fn test_pipelining_stress() {
    let addr = spawn_echo_server().await;
    let mut options = ConnectOptions::default();
    options.queue_size = 10000;
    let session = Session::open(&addr, &options)
        .await
        .expect("Failed to connect");

    let mut handles = Vec::new();

    for i in 0..1000 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            let payload = format!("payload-{}", i);
            let res = session
                .request(Cmd::new("ECHO").arg(payload.clone()))
                .await;
            assert_eq!(res.unwrap(), Frame::bulk(payload));
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(session.pending_count(), 0);
    session.close();
}

#[tokio::test]
async fn test_pipelined_batch_from_one_task() {
    let addr = spawn_echo_server().await;
    let session = Session::open(&addr, &ConnectOptions::default())
        .await
        .expect("Failed to connect");

    let mut pending = Vec::new();
    for i in 0..500 {
        pending.push(
            session
                .send(Cmd::new("ECHO").arg(i.to_string()))
                .await
                .unwrap(),
        );
    }
    for (i, reply) in pending.into_iter().enumerate() {
        assert_eq!(reply.await.unwrap(), Frame::bulk(i.to_string()));
    }
}
