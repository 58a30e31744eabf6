// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::p0p::message::HEADER_LEN;

/// A malformed datagram (spec §4.1): too short, wrong magic/version, or an
/// undefined command byte. Callers are expected to drop the datagram
/// silently; this type exists so the decision to drop is explicit at the
/// call site rather than implicit in an `Option`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram too short: {0} bytes, header is {HEADER_LEN}")]
    TooShort(usize),
    #[error("bad magic bytes {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unsupported version {0:#04x}")]
    BadVersion(u8),
    #[error("unknown command byte {0:#04x}")]
    BadCommand(u8),
}

/// An event delivered to the FSM that the current state has no transition
/// for. Per spec §4.2 this is a programmer error, not a protocol error: the
/// driver is expected never to construct such an event.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unexpected event {event:?} in state {state:?}")]
pub struct UnexpectedEvent<S: std::fmt::Debug, E: std::fmt::Debug> {
    pub state: S,
    pub event: E,
}
