use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::catalog::{ProbeCatalog, ProbeSpec};
use crate::targets::Target;

const READ_CHUNK: usize = 4096;

/// Grace window for follow-up reads once a service has started talking.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Connection-level failures. Anything here costs one retry from the
/// target's budget; probe-level silence does not.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("attempt timed out")]
    Timeout,
    #[error("tls handshake failed: {0}")]
    Tls(#[source] native_tls::Error),
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bound for connect, TLS handshake and first read, each.
    pub timeout: Duration,
    /// Connection retry budget per target.
    pub max_tries: u32,
    /// Extended mode runs every applicable probe; short mode stops at the
    /// first probe that yields a non-empty response.
    pub extended: bool,
    /// Cap on captured response bytes per probe.
    pub max_response: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            max_tries: 3,
            extended: true,
            max_response: 16 * 1024,
        }
    }
}

/// What one target attempt produced. `responses` keeps probe order;
/// `tries` counts failed connection attempts, `sent` transmitted probes.
#[derive(Debug, Default)]
pub struct ProbeOutcome {
    pub responses: Vec<(String, Vec<u8>)>,
    pub tries: u32,
    pub sent: u32,
}

/// Drive all applicable probes against one target.
///
/// Probes come from the catalog most-specific-first. A fresh connection is
/// opened per probe; connection failures retry the same probe until the
/// target's retry budget is spent, which ends the whole attempt. A cancelled
/// token abandons the current connection and ends the attempt with whatever
/// was captured so far.
pub async fn probe_target(
    target: &Target,
    catalog: &ProbeCatalog,
    cfg: &WorkerConfig,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let mut outcome = ProbeOutcome::default();

    'probes: for probe in catalog.probes_for(target.port) {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(addr = %target.addr(), "stop requested, abandoning target");
                    break 'probes;
                }
                attempt = attempt_probe(target, probe, cfg) => attempt,
            };
            match attempt {
                Ok(response) => {
                    outcome.sent += 1;
                    trace!(addr = %target.addr(), probe = %probe.name,
                           bytes = response.len(), "probe completed");
                    if !response.is_empty() {
                        outcome.responses.push((probe.name.clone(), response));
                        if !cfg.extended {
                            break 'probes;
                        }
                    }
                    continue 'probes;
                }
                Err(err) => {
                    outcome.tries += 1;
                    debug!(addr = %target.addr(), probe = %probe.name,
                           tries = outcome.tries, "connection failed: {err}");
                    if outcome.tries >= cfg.max_tries {
                        debug!(addr = %target.addr(), "retry budget exhausted");
                        break 'probes;
                    }
                }
            }
        }
    }
    outcome
}

async fn attempt_probe(
    target: &Target,
    probe: &ProbeSpec,
    cfg: &WorkerConfig,
) -> Result<Vec<u8>, ScanError> {
    let stream = timeout(cfg.timeout, TcpStream::connect(target.addr()))
        .await
        .map_err(|_| ScanError::Timeout)?
        .map_err(ScanError::Connect)?;

    if target.ssl_tls {
        // Reconnaissance connects to arbitrary endpoints; certificate
        // validity is not part of what we are measuring.
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(ScanError::Tls)?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let mut tls = timeout(cfg.timeout, connector.connect(&target.ip.to_string(), stream))
            .await
            .map_err(|_| ScanError::Timeout)?
            .map_err(ScanError::Tls)?;
        exchange(&mut tls, &probe.payload, cfg).await
    } else {
        let mut stream = stream;
        exchange(&mut stream, &probe.payload, cfg).await
    }
}

/// Send the probe payload and capture whatever comes back within the
/// timeout. Silence, early close, or a read error all yield an empty
/// response; only write failures count as connection errors.
async fn exchange<S>(
    stream: &mut S,
    payload: &[u8],
    cfg: &WorkerConfig,
) -> Result<Vec<u8>, ScanError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !payload.is_empty() {
        stream.write_all(payload).await.map_err(ScanError::Send)?;
    }

    let mut buf = vec![0u8; READ_CHUNK];
    let mut collected = Vec::new();
    match timeout(cfg.timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
        _ => return Ok(Vec::new()),
    }
    while collected.len() < cfg.max_response {
        match timeout(DRAIN_GRACE, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    collected.truncate(cfg.max_response);
    Ok(collected)
}
