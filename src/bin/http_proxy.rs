// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use p0p_suite::{
    cfg::{cli::parse_proxy_args, config::Config, logger::init_logger},
    httpproxy::forwarder,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_proxy_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        },
    };

    let cfg = Config::load_or_default("config.yaml")?;
    let _logger_guard = init_logger(&cfg.logger)?;

    info!(listen_addr = %args.listen_addr, "starting HTTP forwarding proxy");

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_signal.cancel();
    });

    forwarder::run(args.listen_addr, cfg.proxy, cancel).await
}
