use std::net::IpAddr;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::warn;

/// Ports where TLS is assumed even without an explicit `+tls` marker.
const IMPLICIT_TLS_PORTS: &[u16] = &[443, 465, 636, 853, 993, 995, 8443];

/// One unit of scan work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: String,
    pub ssl_tls: bool,
}

impl Target {
    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

/// Parse one target entry: `ip:port`, `ip:port/tcp`, `ip:port/tcp+tls` or
/// `ip:port+tls`. IPv6 addresses use brackets: `[::1]:80`.
pub fn parse_target_line(line: &str) -> Result<Target> {
    let line = line.trim();

    let (spec, tls_flag) = match line.strip_suffix("+tls") {
        Some(rest) => (rest, true),
        None => (line, false),
    };
    let (addr_part, protocol) = match spec.split_once('/') {
        Some((addr, proto)) if !proto.is_empty() => (addr, proto.to_ascii_lowercase()),
        Some(_) => return Err(anyhow!("empty protocol in target: {line}")),
        None => (spec, "tcp".to_string()),
    };
    if protocol != "tcp" {
        return Err(anyhow!("unsupported protocol {protocol:?} in target: {line}"));
    }

    let (host, port_str) = addr_part
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in target: {line}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host
        .parse()
        .map_err(|_| anyhow!("invalid IP address {host:?} in target: {line}"))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow!("invalid port {port_str:?} in target: {line}"))?;
    if port == 0 {
        return Err(anyhow!("port 0 is not scannable in target: {line}"));
    }

    Ok(Target {
        ip,
        port,
        protocol,
        ssl_tls: tls_flag || IMPLICIT_TLS_PORTS.contains(&port),
    })
}

/// Load the target queue from a file, one target per line. Blank lines and
/// `#` comments are skipped; malformed lines are logged with their line
/// number and dropped rather than aborting the run.
pub fn load_targets(path: &Path) -> Result<Vec<Target>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read target list {}", path.display()))?;

    let mut targets = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_target_line(line) {
            Ok(target) => targets.push(target),
            Err(err) => warn!("{}:{}: {err}", path.display(), number + 1),
        }
    }
    Ok(targets)
}
