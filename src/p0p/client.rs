// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The P0P client driver: two scheduling shapes over the same FSM (spec
//! §4.3, §5), chosen at startup by `cfg::cli::DriverMode`. Both drivers
//! funnel `fsm::Event`s into `fsm::step` and execute the resulting
//! `fsm::Action`s against a UDP socket, stdin, and a one-shot timer — the
//! same separation of "dumb event source" from "FSM owner" the teacher's
//! `ClientConnection::connect` uses for its per-ITT read loop.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::UdpSocket,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::{cli::DriverMode, config::P0PConfig},
    p0p::{
        fsm::{self, Action, Event, State},
        message,
    },
};

/// Lines equal to this (after trimming trailing whitespace) or EOF both
/// signal graceful shutdown (spec §4.3).
const QUIT_LINE: &str = "q";

/// Everything a driver needs to run one client session.
pub struct Session {
    pub socket: Arc<UdpSocket>,
    pub server_addr: SocketAddr,
    pub session_id: u32,
    pub config: P0PConfig,
}

impl Session {
    pub async fn connect(server_host: &str, server_port: u16, config: P0PConfig) -> Result<Self> {
        let server_addr: SocketAddr = tokio::net::lookup_host((server_host, server_port))
            .await
            .context("failed to resolve server address")?
            .next()
            .context("server address resolved to no candidates")?;

        let local_addr: SocketAddr = if server_addr.is_ipv6() {
            "[::]:0".parse().expect("valid literal")
        } else {
            "0.0.0.0:0".parse().expect("valid literal")
        };
        let socket = UdpSocket::bind(local_addr)
            .await
            .context("failed to bind client UDP socket")?;

        Ok(Self {
            socket: Arc::new(socket),
            server_addr,
            session_id: rand::rng().random(),
            config,
        })
    }
}

/// Internal event source, shared by both drivers.
#[derive(Debug)]
enum RawEvent {
    Datagram(Vec<u8>),
    Line(String),
    Eof,
    /// Tagged with the epoch it was armed under (Design Note "Timer
    /// races", option b) — a fire whose epoch no longer matches the
    /// current one is a stale timer racing a cancel, and is dropped.
    Timeout(u64),
}

fn decode_datagram(bytes: &[u8]) -> Option<Event> {
    match message::decode(bytes) {
        Ok(msg) => match msg.command {
            message::Command::Hello => Some(Event::HelloRx),
            message::Command::Alive => Some(Event::AliveRx),
            message::Command::Goodbye => Some(Event::GoodbyeRx),
            message::Command::Data => Some(Event::DataRx(msg.payload)),
        },
        Err(err) => {
            debug!(%err, "dropping malformed datagram");
            None
        },
    }
}

fn line_to_event(line: &str) -> Event {
    let trimmed = line.trim_end();
    if trimmed == QUIT_LINE {
        Event::Eof
    } else {
        Event::Stdin(trimmed.to_string())
    }
}

/// Arms and cancels the one-shot timer, tagging each arming with a fresh
/// epoch so a fire that arrives after a cancel is silently discarded by the
/// dispatch loop instead of corrupting the FSM.
struct Timer {
    epoch: Arc<AtomicU64>,
    interval: Duration,
    tx: mpsc::Sender<RawEvent>,
}

impl Timer {
    fn new(interval: Duration, tx: mpsc::Sender<RawEvent>) -> Self {
        Self { epoch: Arc::new(AtomicU64::new(0)), interval, tx }
    }

    fn set(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch_handle = self.epoch.clone();
        let tx = self.tx.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if epoch_handle.load(Ordering::SeqCst) == epoch {
                let _ = tx.send(RawEvent::Timeout(epoch)).await;
            }
        });
    }

    /// Safe to call on an unarmed timer (spec §4.3).
    fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

async fn send(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    session_id: u32,
    sequence_number: &mut u32,
    command: message::Command,
    payload: Option<&[u8]>,
) -> Result<()> {
    let wire = message::encode(command, *sequence_number, session_id, payload.unwrap_or(&[]));
    *sequence_number += 1;
    socket.send_to(&wire, server_addr).await.context("failed to send datagram")?;
    Ok(())
}

/// Runs the FSM to completion, executing actions as they are produced.
/// Identical for both driver shapes (spec §5: "both MUST produce identical
/// externally observable behavior") — only how `events_rx` is fed differs.
async fn dispatch(session: &Session, mut events_rx: mpsc::Receiver<RawEvent>, timer: Timer) -> Result<()> {
    let mut state = State::HelloWait;
    let mut sequence_number: u32 = 0;

    send(
        &session.socket,
        session.server_addr,
        session.session_id,
        &mut sequence_number,
        message::Command::Hello,
        None,
    )
    .await?;
    timer.set();

    while !fsm::is_terminal(state) {
        let Some(raw) = events_rx.recv().await else { break };

        let event = match raw {
            RawEvent::Datagram(bytes) => match decode_datagram(&bytes) {
                Some(event) => event,
                None => continue,
            },
            RawEvent::Line(line) => line_to_event(&line),
            RawEvent::Eof => Event::Eof,
            RawEvent::Timeout(epoch) => {
                if epoch != timer.current_epoch() {
                    continue;
                }
                Event::Timeout
            },
        };

        let (next_state, actions) = fsm::step(state, event)?;
        state = next_state;

        for action in actions {
            match action {
                Action::Send { command, payload } => {
                    send(
                        &session.socket,
                        session.server_addr,
                        session.session_id,
                        &mut sequence_number,
                        command,
                        payload.as_deref(),
                    )
                    .await?;
                },
                Action::SetTimer => timer.set(),
                Action::CancelTimer => timer.cancel(),
                Action::Close => {
                    info!(session_id = format!("0x{:08x}", session.session_id), "session closed");
                },
            }
        }
    }

    Ok(())
}

/// Spawns the dedicated stdin-reading task shared by both driver shapes.
fn spawn_stdin_task(tx: mpsc::Sender<RawEvent>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if tx.send(RawEvent::Line(line)).await.is_err() {
                            break;
                        }
                    },
                    Ok(None) => {
                        let _ = tx.send(RawEvent::Eof).await;
                        break;
                    },
                    Err(err) => {
                        warn!(%err, "stdin read error, treating as EOF");
                        let _ = tx.send(RawEvent::Eof).await;
                        break;
                    },
                },
            }
        }
    })
}

/// Spawns the dedicated UDP-recv task shared by the threaded driver shape.
fn spawn_recv_task(
    socket: Arc<UdpSocket>,
    max_len: usize,
    tx: mpsc::Sender<RawEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; max_len];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                recv = socket.recv_from(&mut buf) => match recv {
                    Ok((n, _peer)) => {
                        if tx.send(RawEvent::Datagram(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    },
                    Err(err) => {
                        warn!(%err, "udp recv error");
                        break;
                    },
                },
            }
        }
    })
}

/// Parallel driver (spec §4.3): a UDP-recv task and a stdin-read task, each
/// forwarding decoded events over a channel into the single task running
/// `dispatch`, which alone owns the FSM.
pub async fn run_threaded(session: Session, cancel: CancellationToken) -> Result<()> {
    let (tx, rx) = mpsc::channel(32);
    let timer = Timer::new(session.config.timeout_interval, tx.clone());

    let recv_task = spawn_recv_task(session.socket.clone(), session.config.max_message_length, tx.clone(), cancel.clone());
    let stdin_task = spawn_stdin_task(tx.clone(), cancel.clone());

    let result = tokio::select! {
        res = dispatch(&session, rx, timer) => res,
        _ = cancel.cancelled() => Ok(()),
    };

    recv_task.abort();
    stdin_task.abort();
    result
}

/// Single-threaded event-loop driver (spec §4.3): the same `dispatch` FSM
/// owner, but sources its events from the same kind of dedicated tasks — in
/// `tokio` there is no true single-OS-thread distinction without pinning a
/// current-thread runtime, so this shape is expressed as a cooperative
/// reactor: one `select!` per iteration over the socket, stdin, and timer,
/// with no recv/stdin tasks of their own. It shares `dispatch`'s FSM
/// handling exactly, only the event sourcing differs, as spec §5 requires.
pub async fn run_async(session: Session, cancel: CancellationToken) -> Result<()> {
    let mut state = State::HelloWait;
    let mut sequence_number: u32 = 0;
    let mut timer_deadline: Option<tokio::time::Instant> = None;
    let mut recv_buf = vec![0u8; session.config.max_message_length];
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    send(
        &session.socket,
        session.server_addr,
        session.session_id,
        &mut sequence_number,
        message::Command::Hello,
        None,
    )
    .await?;
    timer_deadline = Some(tokio::time::Instant::now() + session.config.timeout_interval);

    while !fsm::is_terminal(state) {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => Event::Eof,
            recv = session.socket.recv_from(&mut recv_buf) => {
                match recv {
                    Ok((n, _peer)) => match decode_datagram(&recv_buf[..n]) {
                        Some(event) => event,
                        None => continue,
                    },
                    Err(err) => {
                        warn!(%err, "udp recv error");
                        continue;
                    },
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => line_to_event(&line),
                Ok(None) => Event::Eof,
                Err(err) => {
                    warn!(%err, "stdin read error, treating as EOF");
                    Event::Eof
                },
            },
            _ = async {
                match timer_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            }, if timer_deadline.is_some() => Event::Timeout,
        };

        let (next_state, actions) = fsm::step(state, event)?;
        state = next_state;

        for action in actions {
            match action {
                Action::Send { command, payload } => {
                    send(
                        &session.socket,
                        session.server_addr,
                        session.session_id,
                        &mut sequence_number,
                        command,
                        payload.as_deref(),
                    )
                    .await?;
                },
                Action::SetTimer => {
                    timer_deadline = Some(tokio::time::Instant::now() + session.config.timeout_interval);
                },
                Action::CancelTimer => timer_deadline = None,
                Action::Close => {
                    info!(session_id = format!("0x{:08x}", session.session_id), "session closed");
                },
            }
        }
    }

    Ok(())
}

/// Entry point used by the `p0p-client` binary: picks the driver shape
/// named on the command line (spec §6).
pub async fn run(mode: DriverMode, session: Session, cancel: CancellationToken) -> Result<()> {
    match mode {
        DriverMode::Threaded => run_threaded(session, cancel).await,
        DriverMode::Asynchronous => run_async(session, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_line_maps_to_eof() {
        assert_eq!(line_to_event("q  \r\n"), Event::Eof);
    }

    #[test]
    fn ordinary_line_maps_to_stdin_event() {
        assert_eq!(line_to_event("hello"), Event::Stdin("hello".to_string()));
    }

    #[test]
    fn malformed_datagram_is_dropped() {
        assert!(decode_datagram(&[0, 0, 0]).is_none());
    }

    #[test]
    fn valid_hello_decodes_to_hello_rx() {
        let wire = message::encode(message::Command::Hello, 0, 1, b"");
        assert_eq!(decode_datagram(&wire), Some(Event::HelloRx));
    }
}
