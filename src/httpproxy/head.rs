// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal HTTP/1.x header scanning (spec §4.5): just enough to find
//! end-of-headers, the request line, the Host header, and to rewrite
//! connection-management headers. Grounded in
//! `original_source/HTTP_Proxy/http_proxy.py`'s regex-driven
//! `read_full_http_header`/`get_server_address`/`modify_http_header`,
//! re-expressed as `&str`/`&[u8]` scanning — the teacher pulls in no
//! `regex` dependency either, so this matches its minimalism.

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

use crate::httpproxy::error::HeadError;

/// Reads from `conn` into a growing buffer until `\r\n\r\n` or `\n\n`
/// appears. The returned bytes may include the first bytes of the body
/// past the terminator (spec §4.5).
pub async fn read_full_head<R: tokio::io::AsyncRead + Unpin>(conn: &mut R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if find_terminator(&buf).is_some() {
            return Ok(buf);
        }
        let n = conn.read(&mut chunk).await.context("failed reading request head")?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Finds the first `\r\n\r\n` or `\n\n` in `buf`, returning
/// `(terminator_start, terminator_end)`.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
        i += 1;
    }
    None
}

fn split_header_lines(text: &str) -> Vec<&str> {
    text.split("\r\n").flat_map(|s| s.split('\n')).collect()
}

fn first_line(head_text: &str) -> Result<&str, HeadError> {
    split_header_lines(head_text).into_iter().next().filter(|l| !l.is_empty()).ok_or(HeadError::NoFirstLine)
}

fn starts_with_ci(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Everything needed to forward a request (spec §3 "HTTP Request Head").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub is_tunnel: bool,
}

/// Extracts the origin `(host, port, is_tunnel)` from a request head (spec
/// §4.5).
pub fn parse_target(head: &[u8]) -> Result<Target, HeadError> {
    let text = String::from_utf8_lossy(head);
    let first = first_line(&text)?;
    let is_tunnel = first.trim_start().starts_with("CONNECT");

    let host_line = split_header_lines(&text)
        .into_iter()
        .skip(1)
        .find(|line| {
            let trimmed = line.trim_start();
            starts_with_ci(trimmed, "host") && trimmed["host".len()..].trim_start().starts_with(':')
        })
        .ok_or(HeadError::MissingHost)?;

    let trimmed = host_line.trim_start();
    let after_host = &trimmed["host".len()..];
    let value = after_host.trim_start().trim_start_matches(':').trim_start();
    let value: &str = value.split(|c: char| c == ' ' || c == '\r' || c == '\n').next().unwrap_or("");
    if value.is_empty() {
        return Err(HeadError::MalformedHost(host_line.to_string()));
    }

    let mut parts = value.splitn(2, ':');
    let host_part = parts.next().unwrap_or("");
    let port_part = parts.next();

    match port_part {
        Some(p) if !p.is_empty() => {
            let port: u16 = p.parse().map_err(|_| HeadError::MalformedHost(value.to_string()))?;
            Ok(Target { host: host_part.to_string(), port, is_tunnel })
        },
        _ => {
            let port = port_from_first_line(first);
            Ok(Target { host: host_part.to_string(), port, is_tunnel })
        },
    }
}

fn port_from_first_line(first: &str) -> u16 {
    if let Some(idx) = first.find(':') {
        let digits: String = first[idx + 1..].chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(port) = digits.parse() {
            return port;
        }
    }
    if first.to_ascii_lowercase().contains("https://") { 443 } else { 80 }
}

fn is_connection_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    if starts_with_ci(trimmed, "connection") {
        let rest = trimmed["connection".len()..].trim_start();
        return rest.starts_with(':');
    }
    false
}

fn is_proxy_connection_keep_alive(line: &str) -> bool {
    let trimmed = line.trim_start();
    if !starts_with_ci(trimmed, "proxy-connection") {
        return false;
    }
    let rest = trimmed["proxy-connection".len()..].trim_start();
    let Some(rest) = rest.strip_prefix(':') else { return false };
    rest.trim().eq_ignore_ascii_case("keep-alive")
}

/// Rewrites a request or response head (spec §4.5): strips `Connection`
/// headers and re-appends a single `Connection: close`, rewrites
/// `Proxy-connection: keep-alive` to `Proxy-connection: close` in place,
/// and downgrades the first line's HTTP version to 1.0. Idempotent:
/// rewriting twice equals rewriting once (spec §8).
pub fn rewrite_head(head: &[u8]) -> Vec<u8> {
    let (term_start, term_end) = find_terminator(head).unwrap_or((head.len(), head.len()));
    let header_text = String::from_utf8_lossy(&head[..term_start]).into_owned();
    let body = &head[term_end..];

    let mut lines = split_header_lines(&header_text);
    if lines.is_empty() {
        lines.push("");
    }
    let first = lines.remove(0);
    let first_rewritten = replace_once(first, "HTTP/1.1", "HTTP/1.0");

    let mut out = Vec::new();
    out.extend_from_slice(first_rewritten.as_bytes());
    out.extend_from_slice(b"\r\n");

    for line in lines.into_iter().filter(|l| !l.is_empty()) {
        if is_connection_header(&line) {
            continue;
        }
        if is_proxy_connection_keep_alive(&line) {
            out.extend_from_slice(b"Proxy-connection: close\r\n");
            continue;
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"Connection: close\r\n");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn replace_once(s: &str, from: &str, to: &str) -> String {
    match s.find(from) {
        Some(idx) => format!("{}{}{}", &s[..idx], to, &s[idx + from.len()..]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_5_INPUT: &[u8] =
        b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\nProxy-connection: keep-alive\r\n\r\n";

    #[test]
    fn parse_target_reads_host_and_default_port() {
        let target = parse_target(SCENARIO_5_INPUT).expect("valid");
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert!(!target.is_tunnel);
    }

    #[test]
    fn parse_target_detects_connect() {
        let head = b"CONNECT ex.com:443 HTTP/1.1\r\nHost: ex.com:443\r\n\r\n";
        let target = parse_target(head).expect("valid");
        assert!(target.is_tunnel);
        assert_eq!(target.host, "ex.com");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn parse_target_falls_back_to_https_port() {
        let head = b"GET https://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let target = parse_target(head).expect("valid");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn parse_target_missing_host_errors() {
        let head = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(parse_target(head), Err(HeadError::MissingHost));
    }

    #[test]
    fn rewrite_head_matches_scenario_5() {
        let rewritten = rewrite_head(SCENARIO_5_INPUT);
        assert_eq!(
            rewritten,
            b"GET / HTTP/1.0\r\nHost: example.com\r\nProxy-connection: close\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn rewrite_head_is_idempotent() {
        let once = rewrite_head(SCENARIO_5_INPUT);
        let twice = rewrite_head(&once);
        assert_eq!(once, twice);
        assert_eq!(twice.windows(b"Connection: close".len()).filter(|w| *w == b"Connection: close").count(), 1);
    }

    #[test]
    fn find_terminator_accepts_lf_only() {
        let head = b"GET / HTTP/1.1\nHost: x\n\nbody";
        let (start, end) = find_terminator(head).expect("found");
        assert_eq!(&head[end..], b"body");
        assert_eq!(&head[..start], b"GET / HTTP/1.1\nHost: x");
    }
}
