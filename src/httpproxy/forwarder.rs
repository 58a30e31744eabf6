// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Accept loop and per-connection forwarding (spec §4.6): parse the
//! request head, dial the origin, and splice bytes bidirectionally with
//! half-close on each direction's EOF. Grounded in the teacher's
//! `OwnedReadHalf`/`OwnedWriteHalf` split pattern
//! (`client::client::ClientConnection::connect`'s `stream.into_split()`).

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream, tcp::OwnedReadHalf},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{cfg::config::ProxyConfig, httpproxy::head};

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const CONNECT_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Binds the listening socket and runs the accept loop until `cancel` is
/// triggered. A misbehaving peer only ever affects its own connection task
/// (spec §7: "the accept loop... MUST NOT terminate because a single peer
/// misbehaved").
pub async fn run(listen_addr: SocketAddr, config: ProxyConfig, cancel: CancellationToken) -> Result<()> {
    let listener = bind_listener(listen_addr, config.backlog)?;
    info!(%listen_addr, backlog = config.backlog, "proxy listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "incoming connection");
                        let config = config.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, config).await {
                                debug!(%peer, %err, "connection handling failed");
                            }
                        });
                    },
                    Err(err) => warn!(%err, "accept failed"),
                }
            },
        }
    }

    Ok(())
}

/// Binds the listen socket with an explicit TCP backlog (spec §6: "TCP
/// backlog >= 5"), which `tokio::net::TcpListener::bind` has no knob for —
/// `TcpSocket::listen` is tokio's own lower-level builder that takes one.
fn bind_listener(listen_addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if listen_addr.is_ipv6() { TcpSocket::new_v6() } else { TcpSocket::new_v4() }
        .context("failed to create proxy listen socket")?;
    socket.set_reuseaddr(true).context("failed to set SO_REUSEADDR on proxy listen socket")?;
    socket.bind(listen_addr).context("failed to bind proxy listen socket")?;
    socket.listen(backlog).context("failed to listen on proxy socket")
}

async fn handle_client(mut client: TcpStream, config: ProxyConfig) -> Result<()> {
    client.set_nodelay(true).ok();

    let head = head::read_full_head(&mut client).await?;
    let first = head.split(|&b| b == b'\n').next().unwrap_or(&[]);
    info!(first_line = %String::from_utf8_lossy(first).trim(), ">>>");

    let target = match head::parse_target(&head) {
        Ok(target) => target,
        Err(err) => {
            debug!(%err, "failed to parse request head, dropping client");
            return Ok(());
        },
    };

    let origin_addr = format!("{}:{}", target.host, target.port);

    if target.is_tunnel {
        handle_connect(client, &origin_addr, config).await
    } else {
        handle_forward(client, &head, &origin_addr, config).await
    }
}

async fn handle_forward(mut client: TcpStream, head: &[u8], origin_addr: &str, config: ProxyConfig) -> Result<()> {
    let origin = match TcpStream::connect(origin_addr).await {
        Ok(origin) => origin,
        Err(err) => {
            debug!(%err, origin_addr, "origin connect failed");
            return Ok(());
        },
    };
    origin.set_nodelay(true).ok();

    let (mut origin_read, mut origin_write) = origin.into_split();
    origin_write
        .write_all(&head::rewrite_head(head))
        .await
        .context("failed forwarding rewritten request head to origin")?;

    let (client_read, client_write) = client_into_split(&mut client);

    let client_to_origin = splice_raw(client_read, origin_write, config.buf_size, config.socket_timeout);
    let origin_to_client =
        splice_response_head(&mut origin_read, client_write, config.buf_size, config.socket_timeout);

    let (_, _) = tokio::join!(client_to_origin, origin_to_client);
    Ok(())
}

async fn handle_connect(mut client: TcpStream, origin_addr: &str, config: ProxyConfig) -> Result<()> {
    let origin = match TcpStream::connect(origin_addr).await {
        Ok(origin) => origin,
        Err(err) => {
            debug!(%err, origin_addr, "origin connect failed for CONNECT");
            client.write_all(BAD_GATEWAY).await.ok();
            return Ok(());
        },
    };
    origin.set_nodelay(true).ok();
    client.write_all(CONNECT_OK).await.context("failed to reply 200 to CONNECT client")?;

    let (origin_read, origin_write) = origin.into_split();
    let (client_read, client_write) = client_into_split(&mut client);

    let client_to_origin = splice_raw(client_read, origin_write, config.buf_size, config.socket_timeout);
    let origin_to_client = splice_raw(origin_read, client_write, config.buf_size, config.socket_timeout);

    let (_, _) = tokio::join!(client_to_origin, origin_to_client);
    Ok(())
}

fn client_into_split(client: &mut TcpStream) -> (tokio::net::tcp::ReadHalf<'_>, tokio::net::tcp::WriteHalf<'_>) {
    client.split()
}

/// Raw byte splice for one direction: read until EOF or error, write
/// through unmodified, half-close the peer on EOF (spec §4.6). Used for
/// CONNECT tunnels (both directions) and for the client→origin direction of
/// a plain forward (the request body, if any, is not rewritten).
async fn splice_raw<R, W>(mut from: R, mut to: W, buf_size: usize, timeout: std::time::Duration)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size];
    loop {
        let read = tokio::time::timeout(timeout, from.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(%err, "splice read error");
                break;
            },
            Err(_) => {
                debug!("splice read timed out");
                break;
            },
        };
        if n == 0 {
            break;
        }
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown().await;
}

/// The origin→client direction of a non-tunnel forward: reads and rewrites
/// the response head first (same rewrite as the request), then raw
/// pass-through for the rest of the body (spec §4.6).
async fn splice_response_head<W>(origin_read: &mut OwnedReadHalf, mut to: W, buf_size: usize, timeout: std::time::Duration)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let head_bytes = match tokio::time::timeout(timeout, head::read_full_head(origin_read)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            debug!(%err, "failed reading response head");
            let _ = to.shutdown().await;
            return;
        },
        Err(_) => {
            debug!("timed out reading response head");
            let _ = to.shutdown().await;
            return;
        },
    };

    let rewritten = head::rewrite_head(&head_bytes);
    if to.write_all(&rewritten).await.is_err() {
        let _ = to.shutdown().await;
        return;
    }

    splice_raw(origin_read, to, buf_size, timeout).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_gateway_and_connect_ok_are_exact() {
        assert_eq!(BAD_GATEWAY, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
        assert_eq!(CONNECT_OK, b"HTTP/1.1 200 OK\r\n\r\n");
    }
}
