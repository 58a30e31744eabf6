// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::{non_blocking::WorkerGuard, rolling::RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Where diagnostic logs go. The wire-mandated P0P server stdout lines
/// (spec.md §6) never go through this — they are printed directly with
/// `println!` since they are part of the protocol's observable contract,
/// not a log level.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggerConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "debug".
    pub level: String,
    pub output: LogOutput,
    /// Required when `output = file`.
    pub file_path: Option<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stderr,
            file_path: None,
        }
    }
}

/// Initializes the global `tracing` subscriber. Returns a guard that must be
/// kept alive for the duration of the process (dropping it flushes and stops
/// the non-blocking writer).
pub fn init_logger(cfg: &LoggerConfig) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level")?;

    let (writer, guard) = match cfg.output {
        LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogOutput::File => {
            let path = cfg
                .file_path
                .as_deref()
                .context("logger.file_path is required for output=file")?;
            let path = PathBuf::from(path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name =
                path.file_name().context("logger.file_path has no file name")?;
            let appender = RollingFileAppender::new(
                tracing_appender::rolling::Rotation::NEVER,
                dir,
                file_name,
            );
            tracing_appender::non_blocking(appender)
        },
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false));

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default tracing subscriber")?;

    Ok(guard)
}
