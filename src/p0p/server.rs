// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The P0P server driver: one bound UDP socket plus a `session_id`-keyed
//! session table, grounded in the same ID-keyed concurrent map shape the
//! teacher uses for `client::pool_sessions::Pool::sessions:
//! DashMap<u16, Arc<Session>>` — `DashMap` gives per-shard locking so
//! sessions on different shards interleave freely while each individual
//! session's state is still only ever touched by one in-flight `step()` at
//! a time (spec §5: "the sessions map mutation is serialized").

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::UdpSocket,
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::{cli::DriverMode, config::P0PConfig},
    p0p::{
        message,
        server_fsm::{self, Action, Event, LogLine, State},
    },
};

struct SessionEntry {
    peer: SocketAddr,
    state: State,
    next_expected_sequence_number: u32,
    /// Bumped on every `SetTimer`/`CancelTimer`; a timer fire tagged with a
    /// stale epoch is dropped instead of reaching the FSM (Design Note
    /// "Timer races").
    timer_epoch: u64,
}

/// Global outbound sequence counter shared across every session (grounded
/// in `original_source/proj0/p0p_server.py`'s single `self.seq_no`, which
/// the original increments on every outbound message regardless of which
/// peer it is addressed to — distinct from each session's own *inbound*
/// `next_expected_sequence_number`).
struct OutboundSequence(std::sync::atomic::AtomicU32);

impl OutboundSequence {
    fn new() -> Self {
        Self(std::sync::atomic::AtomicU32::new(0))
    }

    fn next(&self) -> u32 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

enum ServerEventSource {
    Datagram { peer: SocketAddr, bytes: Vec<u8> },
    TimerFired { session_id: u32, epoch: u64 },
    Shutdown,
}

/// How `execute` arms a `SetTimer`/`CancelTimer` action, one per driver
/// shape (spec §5). The parallel driver spawns a one-shot task and guards
/// against a stale fire with the session's epoch counter; the single-loop
/// reactor has no concurrency to race against, so it just tracks the next
/// deadline per session directly and checks it itself each iteration.
enum TimerSink<'a> {
    Channel(&'a mpsc::Sender<ServerEventSource>),
    Deadlines(&'a mut HashMap<u32, Instant>),
}

/// Extra context `execute` needs to fill in the wire-mandated stdout
/// formats (spec §6), which need the actual sequence numbers involved, not
/// just the `LogLine` tag the FSM emits.
enum LogContext<'a> {
    None,
    Data { received_seq: u32, old_next_expected: u32, payload: &'a [u8] },
}

pub struct Server {
    socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<u32, SessionEntry>>,
    out_seq: Arc<OutboundSequence>,
    config: P0PConfig,
}

impl Server {
    pub async fn bind(port: u16, config: P0PConfig) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .context("failed to bind server UDP socket")?;
        Ok(Self {
            socket: Arc::new(socket),
            sessions: Arc::new(DashMap::new()),
            out_seq: Arc::new(OutboundSequence::new()),
            config,
        })
    }

    /// The socket's bound local address. Useful when `bind` was given port
    /// `0` and the caller needs to discover which port the OS assigned.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("failed to read local socket address")
    }

    async fn send(&self, peer: SocketAddr, session_id: u32, command: message::Command, payload: &[u8]) -> Result<()> {
        let wire = message::encode(command, self.out_seq.next(), session_id, payload);
        self.socket.send_to(&wire, peer).await.context("failed to send datagram")?;
        Ok(())
    }

    /// Idempotent, race-free by construction: `DashMap::remove` returns
    /// `None` when the entry is already gone, so a concurrent double-call
    /// (e.g. a timeout racing a GOODBYE) sends at most one GOODBYE (spec
    /// §4.2).
    async fn terminate_session(&self, session_id: u32, timer_sink: &mut TimerSink<'_>) -> Result<()> {
        if let Some((_, entry)) = self.sessions.remove(&session_id) {
            self.send(entry.peer, session_id, message::Command::Goodbye, b"").await?;
        }
        if let TimerSink::Deadlines(deadlines) = timer_sink {
            deadlines.remove(&session_id);
        }
        Ok(())
    }

    async fn execute(
        &self,
        session_id: u32,
        peer: SocketAddr,
        actions: Vec<Action>,
        log_ctx: LogContext<'_>,
        timer_sink: &mut TimerSink<'_>,
    ) -> Result<()> {
        for action in actions {
            match action {
                Action::Send { command } => {
                    self.send(peer, session_id, command, b"").await?;
                },
                Action::SetTimer => match timer_sink {
                    TimerSink::Channel(events_tx) => {
                        let epoch = {
                            let mut entry = self.sessions.get_mut(&session_id).context("session vanished mid-step")?;
                            entry.timer_epoch += 1;
                            entry.timer_epoch
                        };
                        let tx = (*events_tx).clone();
                        let interval = self.config.timeout_interval;
                        tokio::spawn(async move {
                            tokio::time::sleep(interval).await;
                            let _ = tx.send(ServerEventSource::TimerFired { session_id, epoch }).await;
                        });
                    },
                    TimerSink::Deadlines(deadlines) => {
                        deadlines.insert(session_id, Instant::now() + self.config.timeout_interval);
                    },
                },
                Action::CancelTimer => match timer_sink {
                    TimerSink::Channel(_) => {
                        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
                            entry.timer_epoch += 1;
                        }
                    },
                    TimerSink::Deadlines(deadlines) => {
                        deadlines.remove(&session_id);
                    },
                },
                Action::Log(line) => self.log(session_id, line, &log_ctx),
                Action::Terminate => {
                    self.sessions.remove(&session_id);
                    if let TimerSink::Deadlines(deadlines) = timer_sink {
                        deadlines.remove(&session_id);
                    }
                },
            }
        }
        Ok(())
    }

    /// Prints the three wire-mandated stdout formats (spec §6). These
    /// bypass `tracing` on purpose — they are part of the protocol's
    /// observable contract, not a log level. Everything else (session
    /// establishment, teardown) goes through `tracing` at debug.
    fn log(&self, session_id: u32, line: LogLine, ctx: &LogContext<'_>) {
        match (line, ctx) {
            (LogLine::DataAccepted, LogContext::Data { received_seq, payload, .. }) => {
                println!("0x{session_id:08x} [{received_seq}] {}", String::from_utf8_lossy(payload));
            },
            (LogLine::DuplicateDropped, LogContext::Data { received_seq, .. }) => {
                println!("0x{session_id:08x} [{received_seq}] Duplicate packet!");
            },
            (LogLine::GapDetected, LogContext::Data { received_seq, old_next_expected, payload }) => {
                for missing in *old_next_expected..*received_seq {
                    println!("0x{session_id:08x} [{missing}] Lost packet!");
                }
                println!("0x{session_id:08x} [{received_seq}] {}", String::from_utf8_lossy(payload));
            },
            (LogLine::SessionEstablished, _) => {
                debug!(session_id = format!("0x{session_id:08x}"), "session established");
            },
            (LogLine::SessionClosed, _) => {
                debug!(session_id = format!("0x{session_id:08x}"), "session closed");
            },
            _ => {},
        }
    }

    async fn handle_datagram(&self, peer: SocketAddr, bytes: &[u8], timer_sink: &mut TimerSink<'_>) -> Result<()> {
        let msg = match message::decode(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "dropping malformed datagram");
                return Ok(());
            },
        };
        let session_id = msg.session_id;

        // Insert before validating (spec §9 Open Question: preserved
        // deliberately — a malformed first message still creates and then
        // immediately terminates a session, emitting one GOODBYE).
        self.sessions.entry(session_id).or_insert_with(|| SessionEntry {
            peer,
            state: State::HelloAwait,
            next_expected_sequence_number: 0,
            timer_epoch: 0,
        });

        let (state, next_expected) = {
            let entry = self.sessions.get(&session_id).context("session vanished mid-handoff")?;
            (entry.state, entry.next_expected_sequence_number)
        };

        // ALIVE has no server-inbound meaning (spec §4.2 lists no
        // transition for it). In HELLO_AWAIT it falls under "anything else
        // -> terminate_session"; ESTABLISHED leaves it unhandled, so it is
        // simply ignored there rather than treated as a protocol violation.
        if msg.command == message::Command::Alive {
            if state == State::HelloAwait {
                self.terminate_session(session_id, timer_sink).await?;
            } else {
                debug!(session_id = format!("0x{session_id:08x}"), "ignoring unexpected ALIVE");
            }
            return Ok(());
        }

        let event = match msg.command {
            message::Command::Hello => Event::HelloRx { sequence_number: msg.sequence_number },
            message::Command::Goodbye => Event::GoodbyeRx,
            message::Command::Data => {
                Event::DataRx { sequence_number: msg.sequence_number, payload: msg.payload.clone() }
            },
            message::Command::Alive => unreachable!("handled above"),
        };

        let (next_state, new_next_expected, actions) = server_fsm::step(state, event, next_expected)?;

        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.state = next_state;
            entry.next_expected_sequence_number = new_next_expected;
        }

        let log_ctx = if msg.command == message::Command::Data {
            LogContext::Data { received_seq: msg.sequence_number, old_next_expected: next_expected, payload: &msg.payload }
        } else {
            LogContext::None
        };

        self.execute(session_id, peer, actions, log_ctx, timer_sink).await
    }

    async fn handle_timer(&self, session_id: u32, epoch: u64, timer_sink: &mut TimerSink<'_>) -> Result<()> {
        let Some(entry) = self.sessions.get(&session_id) else { return Ok(()) };
        if entry.timer_epoch != epoch {
            return Ok(());
        }
        let (peer, state, next_expected) = (entry.peer, entry.state, entry.next_expected_sequence_number);
        drop(entry);

        let (next_state, new_next_expected, actions) = server_fsm::step(state, Event::Timeout, next_expected)?;
        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.state = next_state;
            entry.next_expected_sequence_number = new_next_expected;
        }
        self.execute(session_id, peer, actions, LogContext::None, timer_sink).await
    }

    /// Stdin path (spec §4.4): on `EOF` or `"q"`, terminate every session
    /// (each emits one GOODBYE), then the caller closes the socket.
    async fn shutdown_all_sessions(&self, timer_sink: &mut TimerSink<'_>) -> Result<()> {
        let ids: Vec<u32> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.terminate_session(id, timer_sink).await?;
        }
        Ok(())
    }

    /// Parallel driver (spec §5): a dedicated UDP-recv task and a dedicated
    /// stdin-read task funnel events over a channel into this one loop,
    /// which alone touches `self.sessions` and arms timers by spawning
    /// epoch-tagged one-shot tasks.
    pub async fn run_threaded(self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<ServerEventSource>(256);
        let max_len = self.config.max_message_length;

        let recv_socket = self.socket.clone();
        let recv_tx = tx.clone();
        let recv_cancel = cancel.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; max_len];
            loop {
                tokio::select! {
                    _ = recv_cancel.cancelled() => break,
                    recv = recv_socket.recv_from(&mut buf) => match recv {
                        Ok((n, peer)) => {
                            if recv_tx.send(ServerEventSource::Datagram { peer, bytes: buf[..n].to_vec() }).await.is_err() {
                                break;
                            }
                        },
                        Err(err) => {
                            warn!(%err, "udp recv error");
                        },
                    },
                }
            }
        });

        let stdin_tx = tx.clone();
        let stdin_cancel = cancel.clone();
        let stdin_task = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = stdin_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim_end() == "q" => {
                            let _ = stdin_tx.send(ServerEventSource::Shutdown).await;
                            break;
                        },
                        Ok(Some(_)) => continue,
                        Ok(None) => {
                            let _ = stdin_tx.send(ServerEventSource::Shutdown).await;
                            break;
                        },
                        Err(err) => {
                            warn!(%err, "stdin read error, shutting down");
                            let _ = stdin_tx.send(ServerEventSource::Shutdown).await;
                            break;
                        },
                    },
                }
            }
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let mut sink = TimerSink::Channel(&tx);
                    self.shutdown_all_sessions(&mut sink).await?;
                    break;
                },
                maybe = rx.recv() => {
                    let mut sink = TimerSink::Channel(&tx);
                    match maybe {
                        Some(ServerEventSource::Datagram { peer, bytes }) => {
                            self.handle_datagram(peer, &bytes, &mut sink).await?;
                        },
                        Some(ServerEventSource::TimerFired { session_id, epoch }) => {
                            self.handle_timer(session_id, epoch, &mut sink).await?;
                        },
                        Some(ServerEventSource::Shutdown) => {
                            self.shutdown_all_sessions(&mut sink).await?;
                            break;
                        },
                        None => break,
                    }
                },
            }
        }

        recv_task.abort();
        stdin_task.abort();
        Ok(())
    }

    /// Single-threaded event-loop driver (spec §5): one `select!` per
    /// iteration over the socket, stdin, and the earliest pending
    /// per-session deadline, with no recv/stdin tasks of their own and no
    /// epoch bookkeeping — there is only ever one in-flight step, so a timer
    /// cannot race a cancel.
    pub async fn run_async(self, cancel: CancellationToken) -> Result<()> {
        let mut recv_buf = vec![0u8; self.config.max_message_length];
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut deadlines: HashMap<u32, Instant> = HashMap::new();

        loop {
            let earliest = deadlines.values().min().copied();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let mut sink = TimerSink::Deadlines(&mut deadlines);
                    self.shutdown_all_sessions(&mut sink).await?;
                    break;
                },
                recv = self.socket.recv_from(&mut recv_buf) => {
                    match recv {
                        Ok((n, peer)) => {
                            let bytes = recv_buf[..n].to_vec();
                            let mut sink = TimerSink::Deadlines(&mut deadlines);
                            self.handle_datagram(peer, &bytes, &mut sink).await?;
                        },
                        Err(err) => warn!(%err, "udp recv error"),
                    }
                },
                line = lines.next_line() => {
                    let should_shutdown = match line {
                        Ok(Some(line)) => line.trim_end() == "q",
                        Ok(None) => true,
                        Err(err) => {
                            warn!(%err, "stdin read error, shutting down");
                            true
                        },
                    };
                    if should_shutdown {
                        let mut sink = TimerSink::Deadlines(&mut deadlines);
                        self.shutdown_all_sessions(&mut sink).await?;
                        break;
                    }
                },
                _ = async {
                    match earliest {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                }, if earliest.is_some() => {
                    let now = Instant::now();
                    let fired: Vec<u32> = deadlines.iter().filter(|(_, &d)| d <= now).map(|(&id, _)| id).collect();
                    for session_id in fired {
                        deadlines.remove(&session_id);
                        let mut sink = TimerSink::Deadlines(&mut deadlines);
                        self.handle_timer(session_id, 0, &mut sink).await?;
                    }
                },
            }
        }

        Ok(())
    }
}

/// Entry point used by the `p0p-server` binary: picks the driver shape
/// named on the command line (spec §6).
pub async fn run(mode: DriverMode, server: Server, cancel: CancellationToken) -> Result<()> {
    match mode {
        DriverMode::Threaded => server.run_threaded(cancel).await,
        DriverMode::Asynchronous => server.run_async(cancel).await,
    }
}
