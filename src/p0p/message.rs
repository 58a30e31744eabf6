// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The P0P wire format (spec §3, §4.1): a fixed 12-byte header followed by
//! an opaque payload.
//!
//! ```text
//!  0       1       2       3
//! +-------+-------+-------+-------+
//! | magic (0xC461)| ver   | cmd   |
//! +-------+-------+-------+-------+
//! |        sequence_number        |
//! +-------+-------+-------+-------+
//! |          session_id           |
//! +-------+-------+-------+-------+
//! |           payload ...
//! +--------------------------------
//! ```
//!
//! `RawHeader` is a zero-copy view over that header, the same technique the
//! teacher uses for the 48-byte iSCSI Basic Header Segment
//! (`models::opcode::RawBhsOpcode`).

use bytes::Bytes;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    byteorder::{BigEndian, U32},
};

use crate::p0p::error::DecodeError;

pub const HEADER_LEN: usize = 12;
pub const MAGIC: [u8; 2] = [0xC4, 0x61];
pub const VERSION: u8 = 0x01;

/// Zero-copy view over the 12-byte P0P header. Field accessors are
/// constant-time slice reads (spec §4.1).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawHeader {
    pub magic: [u8; 2],
    pub version: u8,
    pub command: u8,
    pub sequence_number: U32<BigEndian>,
    pub session_id: U32<BigEndian>,
}

/// The four P0P command verbs (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Hello = 0,
    Data = 1,
    Alive = 2,
    Goodbye = 3,
}

impl Command {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Command::Hello),
            1 => Ok(Command::Data),
            2 => Ok(Command::Alive),
            3 => Ok(Command::Goodbye),
            other => Err(DecodeError::BadCommand(other)),
        }
    }
}

/// A fully decoded P0P datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub sequence_number: u32,
    pub session_id: u32,
    pub payload: Bytes,
}

/// Encodes a message. Never fails — every `Command` has a valid byte
/// representation and the payload is opaque.
pub fn encode(command: Command, sequence_number: u32, session_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    let header = RawHeader {
        magic: MAGIC,
        version: VERSION,
        command: command.as_u8(),
        sequence_number: U32::new(sequence_number),
        session_id: U32::new(session_id),
    };
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes a datagram, validating magic, version, and command byte (spec
/// §4.1). Callers treat `Err` as "silently drop".
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShort(bytes.len()));
    }
    let header = RawHeader::ref_from_bytes(&bytes[..HEADER_LEN])
        .expect("slice is exactly HEADER_LEN bytes");

    if header.magic != MAGIC {
        return Err(DecodeError::BadMagic(header.magic));
    }
    if header.version != VERSION {
        return Err(DecodeError::BadVersion(header.version));
    }
    let command = Command::try_from(header.command)?;

    Ok(Message {
        command,
        sequence_number: header.sequence_number.get(),
        session_id: header.session_id.get(),
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_command() {
        for cmd in [Command::Hello, Command::Data, Command::Alive, Command::Goodbye] {
            let wire = encode(cmd, 7, 0xDEAD_BEEF, b"hi");
            let msg = decode(&wire).expect("valid");
            assert_eq!(msg.command, cmd);
            assert_eq!(msg.sequence_number, 7);
            assert_eq!(msg.session_id, 0xDEAD_BEEF);
            assert_eq!(&msg.payload[..], b"hi");
        }
    }

    #[test]
    fn round_trip_empty_payload() {
        let wire = encode(Command::Alive, 0, 1, b"");
        let msg = decode(&wire).expect("valid");
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn too_short_is_rejected() {
        assert_eq!(decode(&[0xC4, 0x61, 0x01]), Err(DecodeError::TooShort(3)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut wire = encode(Command::Hello, 0, 0, b"");
        wire[0] = 0x00;
        assert_eq!(decode(&wire), Err(DecodeError::BadMagic([0x00, 0x61])));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut wire = encode(Command::Hello, 0, 0, b"");
        wire[2] = 0x02;
        assert_eq!(decode(&wire), Err(DecodeError::BadVersion(0x02)));
    }

    #[test]
    fn bad_command_is_rejected() {
        let mut wire = encode(Command::Hello, 0, 0, b"");
        wire[3] = 0x7F;
        assert_eq!(decode(&wire), Err(DecodeError::BadCommand(0x7F)));
    }

    #[test]
    fn header_length_is_twelve_bytes() {
        assert_eq!(core::mem::size_of::<RawHeader>(), HEADER_LEN);
    }
}
