// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client-side P0P finite-state machine (spec §4.2). Pure with respect
//! to I/O: `step` never touches a socket or a timer, it only returns the
//! next state plus a list of action descriptors for the driver to execute.
//! This is the systems-language replacement for the original source's
//! closures-over-driver-methods design (spec §9, "cyclic callbacks").

use bytes::Bytes;

use crate::p0p::{error::UnexpectedEvent, message::Command};

/// Client FSM states (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    HelloWait,
    Ready,
    ReadyTimer,
    Closing,
    Closed,
}

/// Events the driver delivers to the FSM (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HelloRx,
    AliveRx,
    GoodbyeRx,
    DataRx(Bytes),
    Stdin(String),
    Eof,
    Timeout,
}

/// Action descriptors the driver must execute (spec §4.2, §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { command: Command, payload: Option<Bytes> },
    SetTimer,
    CancelTimer,
    Close,
}

pub type StepError = UnexpectedEvent<State, Event>;

/// `step(state, event) -> (state', actions)` (spec §4.2). `GOODBYE_RX`
/// closes the session from any state, matching the "*any*" row of the
/// transition table; everything else follows the table exactly. Any
/// combination not in the table is a programmer error.
pub fn step(state: State, event: Event) -> Result<(State, Vec<Action>), StepError> {
    if let Event::GoodbyeRx = event {
        return Ok((State::Closed, vec![Action::Close]));
    }

    match (state, event) {
        (State::HelloWait, Event::HelloRx) => {
            Ok((State::Ready, vec![Action::CancelTimer]))
        },
        (State::HelloWait, Event::Timeout) | (State::HelloWait, Event::Eof) => {
            Ok((State::Closing, send_goodbye_and_arm()))
        },

        (State::Ready, Event::AliveRx) => Ok((State::Ready, vec![])),
        (State::Ready, Event::Stdin(line)) => Ok((
            State::ReadyTimer,
            vec![
                Action::Send {
                    command: Command::Data,
                    payload: Some(Bytes::from(line.into_bytes())),
                },
                Action::SetTimer,
            ],
        )),
        (State::Ready, Event::Eof) => Ok((State::Closing, send_goodbye_and_arm())),

        (State::ReadyTimer, Event::Stdin(line)) => Ok((
            State::ReadyTimer,
            vec![Action::Send {
                command: Command::Data,
                payload: Some(Bytes::from(line.into_bytes())),
            }],
        )),
        (State::ReadyTimer, Event::AliveRx) => {
            Ok((State::Ready, vec![Action::CancelTimer]))
        },
        (State::ReadyTimer, Event::Timeout) | (State::ReadyTimer, Event::Eof) => {
            Ok((State::Closing, send_goodbye_and_arm()))
        },

        (State::Closing, Event::AliveRx) => Ok((State::Closing, vec![])),
        (State::Closing, Event::Timeout) => Ok((State::Closed, vec![Action::Close])),

        (state, event) => Err(UnexpectedEvent { state, event }),
    }
}

fn send_goodbye_and_arm() -> Vec<Action> {
    vec![
        Action::Send {
            command: Command::Goodbye,
            payload: None,
        },
        Action::SetTimer,
    ]
}

/// True once the FSM will never transition again. Used by drivers to decide
/// when to stop delivering events.
pub fn is_terminal(state: State) -> bool {
    matches!(state, State::Closed)
}
