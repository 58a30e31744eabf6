// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end exercises of the real `Server` driver against a bare UDP
//! socket standing in for a client, covering the scenarios named in the
//! wire-level contract: happy path, duplicate, gap, protocol violation, and
//! a liveness timeout.

use std::time::Duration;

use p0p_suite::{
    cfg::{cli::DriverMode, config::P0PConfig},
    p0p::{
        client::{self, Session},
        message::{self, Command},
        server::Server,
    },
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

fn fast_config() -> P0PConfig {
    P0PConfig { timeout_interval: Duration::from_millis(80), max_message_length: 4096 }
}

async fn recv_msg(sock: &UdpSocket) -> message::Message {
    let mut buf = [0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
        .await
        .expect("reply within deadline")
        .expect("recv succeeds");
    message::decode(&buf[..n]).expect("valid P0P datagram")
}

#[tokio::test]
async fn threaded_driver_happy_path_duplicate_gap_and_violation() {
    let server = Server::bind(0, fast_config()).await.expect("bind");
    let server_addr = std::net::SocketAddr::from(([127, 0, 0, 1], server.local_addr().expect("local addr").port()));
    let cancel = CancellationToken::new();
    let driver_cancel = cancel.clone();
    let driver = tokio::spawn(async move { server.run_threaded(driver_cancel).await });

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client.connect(server_addr).await.expect("connect");
    let session_id = 0x1234_5678u32;

    client.send(&message::encode(Command::Hello, 0, session_id, b"")).await.expect("send hello");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Hello);

    // HELLO establishes the session with next_expected = 1, so the first
    // legitimate DATA carries sequence 1.
    client.send(&message::encode(Command::Data, 1, session_id, b"first")).await.expect("send data 1");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Alive);

    // Duplicate of sequence 1: still gets ALIVE, expected stays at 2.
    client.send(&message::encode(Command::Data, 1, session_id, b"first")).await.expect("send dup");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Alive);

    // Gap: jump to sequence 5, server resynchronizes to 6.
    client.send(&message::encode(Command::Data, 5, session_id, b"skip")).await.expect("send gap");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Alive);

    // Protocol violation: sequence far behind now-expected 6.
    client.send(&message::encode(Command::Data, 1, session_id, b"stale")).await.expect("send violation");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Goodbye);

    // Session is gone: the next datagram under the same id starts a fresh
    // HELLO_AWAIT session rather than being rejected outright.
    client.send(&message::encode(Command::Hello, 0, session_id, b"")).await.expect("send hello again");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Hello);

    cancel.cancel();
    driver.await.expect("driver task joins").expect("driver exits cleanly");
}

/// Spec §4.2: the server's transition table only defines `(HELLO, seq=0)`
/// in HELLO_AWAIT. A HELLO with any other sequence number must be treated
/// like any other unexpected message in that state and terminate the
/// fresh session with a GOODBYE rather than establishing it.
#[tokio::test]
async fn threaded_driver_rejects_hello_with_nonzero_sequence() {
    let server = Server::bind(0, fast_config()).await.expect("bind");
    let server_addr = std::net::SocketAddr::from(([127, 0, 0, 1], server.local_addr().expect("local addr").port()));
    let cancel = CancellationToken::new();
    let driver_cancel = cancel.clone();
    let driver = tokio::spawn(async move { server.run_threaded(driver_cancel).await });

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client.connect(server_addr).await.expect("connect");
    let session_id = 0x0BAD_0BADu32;

    client.send(&message::encode(Command::Hello, 1, session_id, b"")).await.expect("send bad hello");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Goodbye);

    cancel.cancel();
    driver.await.expect("driver task joins").expect("driver exits cleanly");
}

#[tokio::test]
async fn async_driver_established_session_times_out_and_sends_goodbye() {
    let server = Server::bind(0, fast_config()).await.expect("bind");
    let server_addr = std::net::SocketAddr::from(([127, 0, 0, 1], server.local_addr().expect("local addr").port()));
    let cancel = CancellationToken::new();
    let driver_cancel = cancel.clone();
    let driver = tokio::spawn(async move { server.run_async(driver_cancel).await });

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client.connect(server_addr).await.expect("connect");
    let session_id = 0xAAAA_BBBBu32;

    client.send(&message::encode(Command::Hello, 0, session_id, b"")).await.expect("send hello");
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Hello);

    // Silence past the timeout: the server's liveness timer fires and
    // terminates the session with exactly one GOODBYE.
    let reply = recv_msg(&client).await;
    assert_eq!(reply.command, Command::Goodbye);

    cancel.cancel();
    driver.await.expect("driver task joins").expect("driver exits cleanly");
}

/// Scenario 4 (spec §8): a server that never replies to HELLO. The client
/// must arm its HELLO-wait timer on entering HELLO_WAIT, so the timeout
/// fires and the client gives up with its own GOODBYE rather than hanging
/// forever.
#[tokio::test]
async fn threaded_client_times_out_waiting_for_hello_reply() {
    let fake_server = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake server");
    let fake_server_port = fake_server.local_addr().expect("fake server addr").port();

    let session = Session::connect("127.0.0.1", fake_server_port, fast_config()).await.expect("connect");
    let cancel = CancellationToken::new();
    let driver_cancel = cancel.clone();
    let driver = tokio::spawn(async move { client::run(DriverMode::Threaded, session, driver_cancel).await });

    let mut buf = [0u8; 4096];
    let (n, _) =
        tokio::time::timeout(Duration::from_secs(2), fake_server.recv_from(&mut buf)).await.expect("recv hello").expect("recv succeeds");
    let hello = message::decode(&buf[..n]).expect("valid datagram");
    assert_eq!(hello.command, Command::Hello);

    // The fake server never replies; the client's own HELLO-wait timer must
    // fire and send a GOODBYE instead of hanging forever.
    let (n, _) =
        tokio::time::timeout(Duration::from_secs(2), fake_server.recv_from(&mut buf)).await.expect("recv goodbye").expect("recv succeeds");
    let goodbye = message::decode(&buf[..n]).expect("valid datagram");
    assert_eq!(goodbye.command, Command::Goodbye);
    assert_eq!(goodbye.session_id, hello.session_id);

    cancel.cancel();
    driver.await.expect("driver task joins").expect("driver exits cleanly");
}
