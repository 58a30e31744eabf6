// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Resolves a (possibly relative) config path against the current working
/// directory. Does not require the file to exist.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    Ok(abs)
}

/// The two scheduling shapes spec.md §5 permits: parallel tasks funneling
/// events through a channel into a single FSM owner, or one task driving a
/// `select!` reactor. Selected by the CLI's first positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    Threaded,
    Asynchronous,
}

impl fmt::Display for DriverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverMode::Threaded => "threaded",
            DriverMode::Asynchronous => "asynchronous",
        })
    }
}

impl std::str::FromStr for DriverMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threaded" => Ok(DriverMode::Threaded),
            "asynchronous" => Ok(DriverMode::Asynchronous),
            _ => Err(()),
        }
    }
}

/// Parsed arguments for `p0p-client [threaded|asynchronous] <host> <port>`.
#[derive(Debug, Clone)]
pub struct ClientArgs {
    pub mode: DriverMode,
    pub server_host: String,
    pub server_port: u16,
}

/// Parses client argv (excluding argv[0]). Returns `Err` on bad usage; the
/// caller is responsible for printing the usage string and exiting with 1.
pub fn parse_client_args<I: IntoIterator<Item = String>>(args: I) -> Result<ClientArgs> {
    let args: Vec<String> = args.into_iter().collect();
    if args.len() != 3 {
        anyhow::bail!(
            "Usage:\n\tp0p-client [threaded|asynchronous] <hostname> <portnum>"
        );
    }
    let mode: DriverMode = args[0]
        .parse()
        .map_err(|()| anyhow::anyhow!("mode must be 'threaded' or 'asynchronous'"))?;
    let server_host = args[1].clone();
    let server_port: u16 = args[2].parse().context("portnum must be a u16")?;
    Ok(ClientArgs {
        mode,
        server_host,
        server_port,
    })
}

/// Parsed arguments for `p0p-server [threaded|asynchronous] <port>`.
#[derive(Debug, Clone)]
pub struct ServerArgs {
    pub mode: DriverMode,
    pub port: u16,
}

pub fn parse_server_args<I: IntoIterator<Item = String>>(args: I) -> Result<ServerArgs> {
    let args: Vec<String> = args.into_iter().collect();
    if args.len() != 2 {
        anyhow::bail!("Usage:\n\tp0p-server [threaded|asynchronous] <portnum>");
    }
    let mode: DriverMode = args[0]
        .parse()
        .map_err(|()| anyhow::anyhow!("mode must be 'threaded' or 'asynchronous'"))?;
    let port: u16 = args[1].parse().context("portnum must be a u16")?;
    Ok(ServerArgs { mode, port })
}

/// Parsed arguments for `http-proxy <port>`.
#[derive(Debug, Clone)]
pub struct ProxyArgs {
    pub listen_addr: SocketAddr,
}

pub fn parse_proxy_args<I: IntoIterator<Item = String>>(args: I) -> Result<ProxyArgs> {
    let args: Vec<String> = args.into_iter().collect();
    if args.len() != 1 {
        anyhow::bail!("Usage:\n\thttp-proxy <port number>");
    }
    let port: u16 = args[0].parse().context("port number must be a u16")?;
    Ok(ProxyArgs {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_args_happy_path() {
        let a = parse_client_args(
            ["threaded", "example.com", "9000"].map(str::to_string),
        )
        .expect("valid");
        assert_eq!(a.mode, DriverMode::Threaded);
        assert_eq!(a.server_host, "example.com");
        assert_eq!(a.server_port, 9000);
    }

    #[test]
    fn client_args_bad_mode() {
        assert!(parse_client_args(["bogus", "h", "1"].map(str::to_string)).is_err());
    }

    #[test]
    fn client_args_wrong_arity() {
        assert!(parse_client_args(["threaded", "h"].map(str::to_string)).is_err());
    }

    #[test]
    fn server_args_happy_path() {
        let a =
            parse_server_args(["asynchronous", "9001"].map(str::to_string)).expect("valid");
        assert_eq!(a.mode, DriverMode::Asynchronous);
        assert_eq!(a.port, 9001);
    }

    #[test]
    fn proxy_args_happy_path() {
        let a = parse_proxy_args(["8080"].map(str::to_string)).expect("valid");
        assert_eq!(a.listen_addr.port(), 8080);
    }

    #[test]
    fn proxy_args_bad_arity() {
        assert!(parse_proxy_args(["8080", "extra"].map(str::to_string)).is_err());
    }
}
