//! VST Protocol Integration Tests
//!
//! A raw tokio TCP listener plays the server side of VST 1.1 using the same
//! framing helpers as the client. These tests verify:
//! - Responses are matched to requests by message id, in any order
//! - Large messages are split into chunks and reassembled
//! - The authentication message is sent once per socket
//! - A broken socket fails every pending request
//! - A caller dropped mid-write leaves the socket framing intact

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fabric_client::{ClientConfig, Connection, Executor, RetryConfig, VstConnection, WireProtocol};
use fabric_common::auth::Credentials;
use fabric_common::transport::{
    split_message, ChunkAssembler, TcpTransport, VstCodec, VST_HANDSHAKE,
};
use fabric_common::{FabricError, HostDescription, Request, RequestMethod, Response};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut preamble = [0u8; VST_HANDSHAKE.len()];
    stream.read_exact(&mut preamble).await.unwrap();
    assert_eq!(&preamble[..], VST_HANDSHAKE);
    stream
}

/// Reads one complete message; returns its id, payload and chunk count
async fn read_message(stream: &mut TcpStream, assembler: &mut ChunkAssembler) -> (u64, Bytes, usize) {
    let mut chunks = 0;
    loop {
        let chunk = TcpTransport::read_chunk(stream).await.unwrap();
        chunks += 1;
        if let Some((id, payload)) = assembler.push(chunk).unwrap() {
            return (id, payload, chunks);
        }
    }
}

async fn respond(stream: &mut TcpStream, id: u64, response: &Response) {
    let payload = VstCodec::encode_response(response).unwrap();
    TcpTransport::write_chunks(stream, &split_message(id, &payload, 700))
        .await
        .unwrap();
}

/// JSON header of a message payload
fn message_header(payload: &Bytes) -> serde_json::Value {
    let len = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    serde_json::from_slice(&payload[4..4 + len]).unwrap()
}

fn vst_config(addr: &str) -> ClientConfig {
    ClientConfig::default()
        .with_hosts([addr])
        .with_protocol(WireProtocol::Vst)
        .with_retry(RetryConfig::disabled())
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (listener, addr) = listen().await;

    tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let mut assembler = ChunkAssembler::new();

        let mut requests = Vec::new();
        for _ in 0..4 {
            let (id, payload, _) = read_message(&mut stream, &mut assembler).await;
            requests.push((id, VstCodec::decode_request(payload).unwrap()));
        }
        for (id, request) in requests.into_iter().rev() {
            let response = Response::new(200).with_body(request.path.clone());
            respond(&mut stream, id, &response).await;
        }
    });

    let executor = Executor::builder(vst_config(&addr)).build().unwrap();
    assert_eq!(executor.config().effective_max_connections(), 1);

    let calls: Vec<_> = (0..4)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let path = format!("/_api/document/{}", i);
                let response = executor
                    .execute_raw(Request::new(RequestMethod::Get, path.clone()))
                    .await
                    .unwrap();
                (path, response)
            })
        })
        .collect();

    for call in calls {
        let (path, response) = call.await.unwrap();
        assert_eq!(response.body.as_deref(), Some(path.as_bytes()));
    }
}

#[tokio::test]
async fn test_large_message_is_chunked() {
    let (listener, addr) = listen().await;
    let (chunks_tx, chunks_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let mut assembler = ChunkAssembler::new();
        let (id, payload, chunks) = read_message(&mut stream, &mut assembler).await;
        let request = VstCodec::decode_request(payload).unwrap();

        let body = request.body.unwrap_or_default();
        respond(&mut stream, id, &Response::new(200).with_body(body)).await;
        let _ = chunks_tx.send(chunks);
    });

    let mut config = vst_config(&addr);
    config.chunk_size = 1000;
    let executor = Executor::builder(config).build().unwrap();

    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let response = executor
        .execute_raw(
            Request::new(RequestMethod::Post, "/_api/import")
                .with_database("shop")
                .with_body(body.clone()),
        )
        .await
        .unwrap();

    assert_eq!(response.body.as_deref(), Some(&body[..]));
    // Header plus body spill over ten 1000-byte chunks
    assert_eq!(chunks_rx.await.unwrap(), 11);
}

#[tokio::test]
async fn test_socket_is_authenticated_once() {
    let (listener, addr) = listen().await;
    let (headers_tx, headers_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let mut assembler = ChunkAssembler::new();
        let mut headers = Vec::new();

        for _ in 0..3 {
            let (id, payload, _) = read_message(&mut stream, &mut assembler).await;
            headers.push(message_header(&payload));
            respond(&mut stream, id, &Response::new(200)).await;
        }
        let _ = headers_tx.send(headers);
    });

    let config = vst_config(&addr).with_credentials(Credentials::with_api_key("k-123"));
    let executor = Executor::builder(config).build().unwrap();
    for _ in 0..2 {
        executor
            .execute_raw(Request::new(RequestMethod::Get, "/_api/version").with_tenant("acme"))
            .await
            .unwrap();
    }

    let headers = headers_rx.await.unwrap();
    assert_eq!(headers[0], json!([1, 1000, "apikey", "k-123"]));
    assert_eq!(headers[1], json!([1, 1, "", 1, "/_api/version", {}, {}, "acme"]));
    assert_eq!(headers[1], headers[2]);
}

#[tokio::test]
async fn test_rejected_authentication_is_retried_once() {
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut attempts = 0;
        for _ in 0..2 {
            let mut stream = accept(&listener).await;
            let mut assembler = ChunkAssembler::new();
            let (id, payload, _) = read_message(&mut stream, &mut assembler).await;
            assert!(VstCodec::is_auth_message(&payload));
            attempts += 1;
            let rejection = Response::new(401).with_body(
                r#"{"error":true,"errorNum":11,"errorMessage":"not authorized","code":401}"#,
            );
            respond(&mut stream, id, &rejection).await;
        }
        attempts
    });

    let config = vst_config(&addr).with_credentials(Credentials::with_api_key("wrong"));
    let executor = Executor::builder(config).build().unwrap();

    let result = executor
        .execute_raw(Request::new(RequestMethod::Get, "/_api/version"))
        .await;
    match result {
        Err(FabricError::Server { status, message, .. }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "not authorized");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(server.await.unwrap(), 2);
}

#[tokio::test]
async fn test_read_failure_fails_all_pending() {
    let (listener, addr) = listen().await;

    tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let mut assembler = ChunkAssembler::new();
        for _ in 0..3 {
            read_message(&mut stream, &mut assembler).await;
        }
        // Hang up without answering
        drop(stream);
    });

    let host = HostDescription::parse(&addr).unwrap();
    let connection = Arc::new(
        VstConnection::connect(&host, &TcpTransport::default(), 30_000, None, None)
            .await
            .unwrap(),
    );

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .execute(&Request::new(RequestMethod::Get, format!("/_api/wait/{}", i)))
                    .await
            })
        })
        .collect();

    for call in calls {
        let result = call.await.unwrap();
        assert!(matches!(result, Err(FabricError::NoResponse(_))), "got {:?}", result);
    }
    assert!(connection.is_closed());
    assert_eq!(connection.pending(), 0);

    // New requests fail fast on the dead socket
    let result = connection
        .execute(&Request::new(RequestMethod::Get, "/"))
        .await;
    assert!(matches!(result, Err(FabricError::ConnectionReset(_))));
}

#[tokio::test]
async fn test_response_timeout_frees_slot() {
    let (listener, addr) = listen().await;

    tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let mut assembler = ChunkAssembler::new();
        read_message(&mut stream, &mut assembler).await;
        // Never answer, keep the socket open
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let host = HostDescription::parse(&addr).unwrap();
    let connection = VstConnection::connect(
        &host,
        &TcpTransport::default(),
        30_000,
        Some(Duration::from_millis(50)),
        None,
    )
    .await
    .unwrap();

    let result = connection.execute(&Request::new(RequestMethod::Get, "/")).await;
    assert!(matches!(result, Err(FabricError::Timeout(50))));
    assert_eq!(connection.pending(), 0);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_dropped_caller_does_not_tear_frame() {
    let (listener, addr) = listen().await;
    let (ids_tx, ids_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        // Let the socket buffers fill before reading anything
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut assembler = ChunkAssembler::new();
        let (abandoned, _, _) = read_message(&mut stream, &mut assembler).await;
        let (id, payload, _) = read_message(&mut stream, &mut assembler).await;
        let request = VstCodec::decode_request(payload).unwrap();
        respond(&mut stream, id, &Response::new(200).with_body(request.path.clone())).await;
        let _ = ids_tx.send((abandoned, id));
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let host = HostDescription::parse(&addr).unwrap();
    let connection = VstConnection::connect(
        &host,
        &TcpTransport::default(),
        30_000,
        Some(Duration::from_secs(5)),
        None,
    )
    .await
    .unwrap();

    let bulk = Request::new(RequestMethod::Post, "/_api/import").with_body(vec![7u8; 32 * 1024 * 1024]);
    let gave_up = tokio::time::timeout(Duration::from_millis(20), connection.execute(&bulk)).await;
    assert!(gave_up.is_err());
    assert_eq!(connection.pending(), 0);

    let response = connection
        .execute(&Request::new(RequestMethod::Get, "/_api/version"))
        .await
        .unwrap();
    assert_eq!(response.body.as_deref(), Some(&b"/_api/version"[..]));
    assert!(!connection.is_closed());

    let (abandoned, answered) = ids_rx.await.unwrap();
    assert!(abandoned < answered);
}
