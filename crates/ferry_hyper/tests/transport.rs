// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "This is a test module")]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ferry::{
    ClientConfig, RequestBinder, RequestTemplate, RetryOrchestrator, ServerInstance, TransportErrorKind, TransportExecutor,
};
use ferry_hyper::HyperTransport;
use http::Method;
use tick::Clock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Reads one HTTP/1.1 request, head and body, and returns it as text.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];

    loop {
        let read = stream.read(&mut chunk).await.unwrap();
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);

        let text = String::from_utf8_lossy(&buffer);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            if buffer.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }

    String::from_utf8(buffer).unwrap()
}

/// Answers one connection per canned response and returns the requests it saw.
async fn serve(responses: Vec<&'static str>) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut stream).await);
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        requests
    });

    (address, handle)
}

fn server(address: SocketAddr) -> ServerInstance {
    ServerInstance::new(address.ip().to_string(), address.port())
}

async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn status_and_body_pass_through() {
    let (address, handle) = serve(vec!["HTTP/1.1 404 Not Found\r\ncontent-length: 4\r\n\r\nnope"]).await;
    let config = ClientConfig::default();
    let template = RequestTemplate::builder("inventory")
        .uri("http://inventory/items")
        .query_param("q", "a b")
        .build()
        .unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let response = HyperTransport::new().execute(request, &config).await.unwrap();

    assert_eq!(response.status(), 404);
    assert_eq!(response.body().as_ref(), b"nope");

    let requests = handle.await.unwrap();
    assert!(requests[0].starts_with("GET /items?q=a%20b HTTP/1.1\r\n"), "{}", requests[0]);
    assert!(requests[0].contains(&format!("host: {address}\r\n")), "{}", requests[0]);
}

#[tokio::test]
async fn request_body_is_sent() {
    let (address, handle) = serve(vec!["HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n"]).await;
    let config = ClientConfig::default();
    let template = RequestTemplate::builder("inventory")
        .method(Method::PUT)
        .uri("/items/1")
        .body("payload")
        .build()
        .unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let response = HyperTransport::new().execute(request, &config).await.unwrap();

    assert_eq!(response.status(), 201);
    let requests = handle.await.unwrap();
    assert!(requests[0].starts_with("PUT /items/1 HTTP/1.1\r\n"));
    assert!(requests[0].ends_with("\r\n\r\npayload"));
}

#[tokio::test]
async fn refused_connection_is_connect_failure() {
    let port = refused_port().await;
    let config = ClientConfig::default();
    let template = RequestTemplate::builder("inventory").build().unwrap();
    let request = RequestBinder::bind(&template, &ServerInstance::new("127.0.0.1", port), &config).unwrap();

    let error = HyperTransport::new().execute(request, &config).await.unwrap_err();

    assert_eq!(error.kind(), TransportErrorKind::Connect);
    assert!(!error.is_request_sent());
}

#[tokio::test]
async fn silent_server_is_read_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _request = read_request(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let config = ClientConfig::default().read_timeout(Duration::from_millis(50));
    let template = RequestTemplate::builder("inventory").build().unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let error = HyperTransport::new().execute(request, &config).await.unwrap_err();

    assert_eq!(error.kind(), TransportErrorKind::ReadTimeout);
    assert!(error.is_request_sent());
}

#[tokio::test]
async fn secure_requests_are_rejected() {
    let config = ClientConfig::default();
    let template = RequestTemplate::builder("inventory").build().unwrap();
    let request = RequestBinder::bind(&template, &ServerInstance::new("127.0.0.1", 443).secure(true), &config).unwrap();

    let error = HyperTransport::new().execute(request, &config).await.unwrap_err();

    assert_eq!(error.kind(), TransportErrorKind::InvalidRequest);
}

#[tokio::test]
async fn redirects_are_followed_when_enabled() {
    let (address, handle) = serve(vec![
        "HTTP/1.1 302 Found\r\nlocation: /landing\r\ncontent-length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\ndone",
    ])
    .await;
    let config = ClientConfig::default().follow_redirects(true);
    let template = RequestTemplate::builder("inventory")
        .method(Method::POST)
        .uri("/form")
        .body("a=1")
        .build()
        .unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let response = HyperTransport::new().execute(request, &config).await.unwrap();

    assert_eq!(response.body().as_ref(), b"done");
    let requests = handle.await.unwrap();
    assert!(requests[0].starts_with("POST /form HTTP/1.1\r\n"));
    assert!(requests[1].starts_with("GET /landing HTTP/1.1\r\n"));
}

#[tokio::test]
async fn redirects_are_returned_when_disabled() {
    let (address, handle) = serve(vec!["HTTP/1.1 301 Moved Permanently\r\nlocation: /new\r\ncontent-length: 0\r\n\r\n"]).await;
    let config = ClientConfig::default().follow_redirects(false);
    let template = RequestTemplate::builder("inventory").uri("/old").build().unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let response = HyperTransport::new().execute(request, &config).await.unwrap();

    assert_eq!(response.status(), 301);
    assert_eq!(handle.await.unwrap().len(), 1);
}

#[tokio::test]
async fn redirect_limit_fails_attempt() {
    let (address, _handle) = serve(vec![
        "HTTP/1.1 307 Temporary Redirect\r\nlocation: /a\r\ncontent-length: 0\r\n\r\n",
        "HTTP/1.1 307 Temporary Redirect\r\nlocation: /b\r\ncontent-length: 0\r\n\r\n",
    ])
    .await;
    let config = ClientConfig::default().follow_redirects(true);
    let template = RequestTemplate::builder("inventory").build().unwrap();
    let request = RequestBinder::bind(&template, &server(address), &config).unwrap();

    let error = HyperTransport::new().max_redirects(1).execute(request, &config).await.unwrap_err();

    assert_eq!(error.kind(), TransportErrorKind::Io);
}

#[tokio::test]
async fn orchestrator_moves_past_dead_server() {
    let dead = refused_port().await;
    let (address, handle) = serve(vec!["HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok"]).await;
    let live = server(address);

    let selections = AtomicUsize::new(0);
    let orchestrator = RetryOrchestrator::builder(
        &Clock::new_tokio(),
        move |_service: &str, _key: Option<&str>| {
            if selections.fetch_add(1, Ordering::SeqCst) == 0 {
                Some(ServerInstance::new("127.0.0.1", dead))
            } else {
                Some(live.clone())
            }
        },
        HyperTransport::new(),
    )
    .build();
    let template = RequestTemplate::builder("inventory").uri("/health").build().unwrap();

    let response = orchestrator.execute(&template).await.unwrap();

    assert_eq!(response.body().as_ref(), b"ok");
    assert_eq!(handle.await.unwrap().len(), 1);
}
