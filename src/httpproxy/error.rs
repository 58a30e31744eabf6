// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Failure to extract an origin address from a request head (spec §4.5,
/// §7: "HTTP parse failure"). Callers drop the client connection and log at
/// debug; this type exists so that decision is explicit at the call site.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeadError {
    #[error("no Host header found")]
    MissingHost,
    #[error("malformed Host header: {0:?}")]
    MalformedHost(String),
    #[error("request head has no line terminator")]
    NoFirstLine,
}
