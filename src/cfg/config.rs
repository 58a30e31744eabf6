// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::logger::LoggerConfig;

/// Top-level runtime configuration shared by all three binaries.
///
/// Only the section relevant to the running binary is read; the others
/// carry sane defaults so a single config file can describe a whole
/// deployment.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// P0P session-protocol timing and sizing knobs.
    pub p0p: P0PConfig,
    /// HTTP forwarding proxy knobs.
    pub proxy: ProxyConfig,
    /// `tracing` subscriber setup, shared by all three binaries.
    pub logger: LoggerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct P0PConfig {
    /// Single timeout used both for HELLO-wait and inter-DATA liveness
    /// (spec §6, `TIMEOUT_INTERVAL`).
    #[serde(rename = "TimeoutInterval", with = "serde_secs")]
    pub timeout_interval: Duration,

    /// Maximum UDP datagram size accepted on recv (spec §6,
    /// `MAX_MESSAGE_LENGTH`).
    #[serde(rename = "MaxMessageLength")]
    pub max_message_length: usize,
}

impl Default for P0PConfig {
    fn default() -> Self {
        Self {
            timeout_interval: Duration::from_secs(2),
            max_message_length: 4096,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// Read/write chunk size used while splicing (spec §6, `BUFSIZE`).
    #[serde(rename = "BufSize")]
    pub buf_size: usize,

    /// Idle read timeout applied to both the client and origin sockets.
    #[serde(rename = "SocketTimeout", with = "serde_secs")]
    pub socket_timeout: Duration,

    /// TCP listen backlog (spec §6: "TCP backlog >= 5").
    #[serde(rename = "Backlog")]
    pub backlog: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            buf_size: 1024,
            socket_timeout: Duration::from_secs(60),
            backlog: 5,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads configuration from `path` if it exists, otherwise falls back to
    /// the built-in defaults. Binaries use this so a config file is optional.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            let cfg = Self::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Validates invariants that the YAML deserializer cannot express.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.p0p.timeout_interval.is_zero(),
            "p0p.TimeoutInterval must be > 0"
        );
        ensure!(
            self.p0p.max_message_length >= 12,
            "p0p.MaxMessageLength must be >= the 12-byte header"
        );
        ensure!(self.proxy.buf_size > 0, "proxy.BufSize must be > 0");
        ensure!(self.proxy.backlog >= 5, "proxy.Backlog must be >= 5");
        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
