// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "This is a test module")]

use std::net::SocketAddr;
use std::time::Duration;

use ferry::{ClientConfig, RequestBinder, RequestTemplate, RetryOrchestrator, ServerInstance, TransportErrorKind, TransportExecutor};
use ferry_reqwest::ReqwestTransport;
use http::Method;
use tick::Clock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk).await.unwrap();
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    String::from_utf8(buffer).unwrap()
}

/// Answers one connection per canned response and returns the request heads it saw.
async fn serve(responses: Vec<&'static str>) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut heads = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            heads.push(read_head(&mut stream).await);
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        heads
    });

    (address, handle)
}

fn server(address: SocketAddr) -> ServerInstance {
    ServerInstance::new(address.ip().to_string(), address.port())
}

#[tokio::test]
async fn response_passes_through() {
    let (address, handle) = serve(vec![
        "HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\nretry-after: 1\r\ncontent-length: 4\r\n\r\nbusy",
    ])
    .await;
    let config = ClientConfig::default();
    let template = RequestTemplate::builder("inventory")
        .method(Method::DELETE)
        .uri("/items/9")
        .header("x-trace", "abc")
        .build()
        .unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let response = ReqwestTransport::new().execute(request, &config).await.unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["retry-after"], "1");
    assert_eq!(response.body().as_ref(), b"busy");

    let heads = handle.await.unwrap();
    assert!(heads[0].starts_with("DELETE /items/9 HTTP/1.1\r\n"), "{}", heads[0]);
    assert!(heads[0].contains("x-trace: abc\r\n"), "{}", heads[0]);
}

#[tokio::test]
async fn refused_connection_is_connect_failure() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ClientConfig::default();
    let template = RequestTemplate::builder("inventory").build().unwrap();
    let request = RequestBinder::bind(&template, &ServerInstance::new("127.0.0.1", port), &config).unwrap();

    let error = ReqwestTransport::new().execute(request, &config).await.unwrap_err();

    assert_eq!(error.kind(), TransportErrorKind::Connect);
    assert!(error.is_circuit_tripping());
}

#[tokio::test]
async fn silent_server_is_read_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _head = read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let config = ClientConfig::default().read_timeout(Duration::from_millis(50));
    let template = RequestTemplate::builder("inventory").build().unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let error = ReqwestTransport::new().execute(request, &config).await.unwrap_err();

    assert_eq!(error.kind(), TransportErrorKind::ReadTimeout);
}

#[tokio::test]
async fn redirects_follow_configuration() {
    let (address, handle) = serve(vec![
        "HTTP/1.1 302 Found\r\nconnection: close\r\nlocation: /landing\r\ncontent-length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 4\r\n\r\ndone",
        "HTTP/1.1 302 Found\r\nconnection: close\r\nlocation: /landing\r\ncontent-length: 0\r\n\r\n",
    ])
    .await;
    let transport = ReqwestTransport::new();
    let template = RequestTemplate::builder("inventory").uri("/start").build().unwrap();

    let following = ClientConfig::default().follow_redirects(true);
    let request = RequestBinder::bind(&template, &server(address), &following).unwrap();
    let response = transport.execute(request, &following).await.unwrap();
    assert_eq!(response.body().as_ref(), b"done");

    let stopping = ClientConfig::default().follow_redirects(false);
    let request = RequestBinder::bind(&template, &server(address), &stopping).unwrap();
    let response = transport.execute(request, &stopping).await.unwrap();
    assert_eq!(response.status(), 302);

    let heads = handle.await.unwrap();
    assert!(heads[1].starts_with("GET /landing HTTP/1.1\r\n"));
}

#[tokio::test]
async fn orchestrator_retries_unavailable_status() {
    let (address, handle) = serve(vec![
        "HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok",
    ])
    .await;
    let live = server(address);
    let orchestrator = RetryOrchestrator::builder(
        &Clock::new_tokio(),
        move |_service: &str, _key: Option<&str>| Some(live.clone()),
        ReqwestTransport::new(),
    )
    .config(ClientConfig::default().max_retries_same_server(1).retryable_status_codes([503]))
    .build();
    let template = RequestTemplate::builder("inventory").uri("/health").build().unwrap();

    let response = orchestrator.execute(&template).await.unwrap();

    assert_eq!(response.body().as_ref(), b"ok");
    assert_eq!(handle.await.unwrap().len(), 2);
}
