// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end exercises of the real proxy accept loop: a plain forward with
//! header rewriting, and a CONNECT tunnel splicing raw bytes both ways.

use std::time::Duration;

use p0p_suite::{cfg::config::ProxyConfig, httpproxy::forwarder};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

fn fast_config() -> ProxyConfig {
    ProxyConfig { buf_size: 4096, socket_timeout: Duration::from_secs(5), backlog: 5 }
}

async fn read_all_available(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    buf
}

#[tokio::test]
async fn forwards_request_and_rewrites_connection_headers_both_ways() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin_listener.local_addr().expect("origin addr");

    let origin_task = tokio::spawn(async move {
        let (mut conn, _) = origin_listener.accept().await.expect("accept");
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            conn.read_exact(&mut byte).await.expect("read origin request");
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&head).contains("Connection: close"));
        assert!(!String::from_utf8_lossy(&head).contains("keep-alive"));

        conn.write_all(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\nhello").await.expect("write response");
        conn.shutdown().await.ok();
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let proxy_addr = proxy_listener.local_addr().expect("proxy addr");
    drop(proxy_listener);

    let cancel = CancellationToken::new();
    let proxy_cancel = cancel.clone();
    let proxy_task = tokio::spawn(forwarder::run(proxy_addr, fast_config(), proxy_cancel));

    // Give the accept loop a moment to bind before dialing it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect to proxy");
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n\r\n",
        origin_addr
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let response = read_all_available(&mut client).await;
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.0 200 OK"));
    assert!(response_text.contains("Connection: close"));
    assert!(!response_text.contains("keep-alive"));
    assert!(response_text.ends_with("hello"));

    origin_task.await.expect("origin task joins");
    cancel.cancel();
    proxy_task.abort();
}

#[tokio::test]
async fn connect_tunnel_splices_raw_bytes_both_directions() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin_listener.local_addr().expect("origin addr");

    let origin_task = tokio::spawn(async move {
        let (mut conn, _) = origin_listener.accept().await.expect("accept");
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.expect("read from tunnel");
        assert_eq!(&buf, b"ping!");
        conn.write_all(b"pong!").await.expect("write into tunnel");
        conn.shutdown().await.ok();
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let proxy_addr = proxy_listener.local_addr().expect("proxy addr");
    drop(proxy_listener);

    let cancel = CancellationToken::new();
    let proxy_cancel = cancel.clone();
    let proxy_task = tokio::spawn(forwarder::run(proxy_addr, fast_config(), proxy_cancel));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect to proxy");
    let connect_req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin_addr, origin_addr);
    client.write_all(connect_req.as_bytes()).await.expect("write CONNECT");

    let mut status_line = [0u8; 19];
    client.read_exact(&mut status_line).await.expect("read CONNECT reply");
    assert_eq!(&status_line, b"HTTP/1.1 200 OK\r\n\r\n");

    client.write_all(b"ping!").await.expect("write tunnel payload");
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.expect("read tunnel reply");
    assert_eq!(&reply, b"pong!");

    origin_task.await.expect("origin task joins");
    cancel.cancel();
    proxy_task.abort();
}
