// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-session server-side P0P finite-state machine (spec §4.2, §4.3).
//! One instance of this state lives per `session_id` in the server's
//! session table; the driver (`p0p::server`) owns the table and the global
//! outbound sequence counter, this module only owns the pure transition
//! logic.

use bytes::Bytes;

use crate::p0p::{error::UnexpectedEvent, message::Command};

/// Server per-session FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    HelloAwait,
    Established,
}

/// Classification of an inbound DATA sequence number against the session's
/// `next_expected_sequence_number = n` (scenarios 2 and 3): `n-1` is a
/// retransmit of the last accepted message, anything further behind is a
/// protocol violation, `n` is in order, and anything ahead implies loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    InOrder,
    Duplicate,
    Gap { expected: u32, got: u32 },
    ProtocolViolation { expected: u32, got: u32 },
}

/// Pure sequence-number check. Never mutates; the driver (via `step`)
/// decides whether to advance `next_expected_sequence_number` based on the
/// outcome. `n = 0` has no valid "duplicate" predecessor, so `got == 0`
/// with `n == 0` is in-order, never a protocol violation.
pub fn sequence_policy(next_expected: u32, got: u32) -> SequenceOutcome {
    if got == next_expected {
        SequenceOutcome::InOrder
    } else if next_expected > 0 && got == next_expected - 1 {
        SequenceOutcome::Duplicate
    } else if got < next_expected {
        SequenceOutcome::ProtocolViolation { expected: next_expected, got }
    } else {
        SequenceOutcome::Gap { expected: next_expected, got }
    }
}

/// Events the driver delivers to a session's FSM. `HelloRx` carries its
/// sequence number so the FSM itself can enforce the "(HELLO, seq=0)" guard
/// (spec §4.2) rather than relying on the driver to pre-filter it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HelloRx { sequence_number: u32 },
    DataRx { sequence_number: u32, payload: Bytes },
    GoodbyeRx,
    Timeout,
}

/// What log line the driver must print for this transition (spec §6). Kept
/// separate from `Action` so the FSM stays free of string formatting; the
/// driver has the session_id and payload already in scope to fill in the
/// `0x%08x [%u] ...` template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLine {
    SessionEstablished,
    DataAccepted,
    DuplicateDropped,
    GapDetected,
    SessionClosed,
}

/// Action descriptors the driver must execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { command: Command },
    SetTimer,
    CancelTimer,
    Log(LogLine),
    Terminate,
}

pub type StepError = UnexpectedEvent<State, Event>;

fn terminate_actions() -> Vec<Action> {
    vec![
        Action::Send { command: Command::Goodbye },
        Action::CancelTimer,
        Action::Log(LogLine::SessionClosed),
        Action::Terminate,
    ]
}

/// `step(state, event, next_expected) -> (state', next_expected', actions)`.
/// `next_expected_sequence_number` is threaded through explicitly rather
/// than mutated in place: the transition and the sequence check are not
/// independent, the FSM needs the *current* value to classify the event and
/// produces the *next* value as part of its output.
///
/// Every `terminate_session` path (HELLO_AWAIT receiving anything but
/// HELLO, ESTABLISHED receiving HELLO or GOODBYE, a protocol violation, or a
/// timer firing) emits exactly one GOODBYE, matching the per-session
/// invariant that exactly one GOODBYE is ever sent.
pub fn step(
    state: State,
    event: Event,
    next_expected: u32,
) -> Result<(State, u32, Vec<Action>), StepError> {
    match (state, event) {
        (State::HelloAwait, Event::HelloRx { sequence_number: 0 }) => Ok((
            State::Established,
            1,
            vec![
                Action::Send { command: Command::Hello },
                Action::SetTimer,
                Action::Log(LogLine::SessionEstablished),
            ],
        )),
        // A HELLO with a non-zero sequence number falls through here along
        // with every other "anything but (HELLO, seq=0)" case (spec §4.2,
        // §9: "anything else -> terminate_session").
        (State::HelloAwait, _) => Ok((State::HelloAwait, next_expected, terminate_actions())),

        (State::Established, Event::HelloRx { .. }) => {
            Ok((State::HelloAwait, next_expected, terminate_actions()))
        },
        (State::Established, Event::GoodbyeRx) => {
            Ok((State::HelloAwait, next_expected, terminate_actions()))
        },
        (State::HelloAwait, Event::Timeout) | (State::Established, Event::Timeout) => {
            Ok((State::HelloAwait, next_expected, terminate_actions()))
        },

        (State::Established, Event::DataRx { sequence_number, .. }) => {
            let mut actions = vec![
                Action::Send { command: Command::Alive },
                Action::CancelTimer,
                Action::SetTimer,
            ];
            match sequence_policy(next_expected, sequence_number) {
                SequenceOutcome::InOrder => {
                    actions.push(Action::Log(LogLine::DataAccepted));
                    Ok((State::Established, next_expected + 1, actions))
                },
                SequenceOutcome::Duplicate => {
                    actions.push(Action::Log(LogLine::DuplicateDropped));
                    Ok((State::Established, next_expected, actions))
                },
                SequenceOutcome::Gap { .. } => {
                    actions.push(Action::Log(LogLine::GapDetected));
                    Ok((State::Established, sequence_number + 1, actions))
                },
                SequenceOutcome::ProtocolViolation { .. } => {
                    Ok((State::HelloAwait, next_expected, terminate_actions()))
                },
            }
        },
    }
}

/// True once the driver should drop the session from its table.
pub fn terminates(actions: &[Action]) -> bool {
    actions.contains(&Action::Terminate)
}
