use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::ProbeCatalog;
use crate::fingerprint::fingerprint;
use crate::matcher::SignatureMatcher;
use crate::records::{decode_banner, truncate_response, ProductRecord, ScanRecord};
use crate::sink::{ScanSink, SinkError};
use crate::targets::Target;
use crate::worker::{probe_target, ProbeOutcome, WorkerConfig};
use crate::writer::BatchWriter;

/// Cap on stored `used_probes` values; full payloads remain available
/// through `hex_banners`.
const USED_PROBE_CAP: usize = 2048;

/// Hard ceiling on concurrent connections regardless of configuration.
const CONCURRENCY_CEILING: usize = 1024;

/// Log a progress line every this many completed targets.
const PROGRESS_CHUNK: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub sink_retries: u32,
    pub worker: WorkerConfig,
    pub progress: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 64,
            batch_size: 10_000,
            sink_retries: 3,
            worker: WorkerConfig::default(),
            progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub targets_scanned: u64,
    pub products_matched: u64,
    pub batches_flushed: u64,
}

/// Build the persisted row pair for one completed target attempt: hash and
/// decode every captured banner, run the signature rules, and aggregate the
/// product summary. Failed targets yield a record with empty maps.
pub fn compose_record(
    target: &Target,
    outcome: ProbeOutcome,
    elapsed: Duration,
    matcher: &SignatureMatcher,
) -> (ScanRecord, Vec<ProductRecord>) {
    let ip = target.ip.to_string();
    let timestamp = Utc::now().timestamp();
    let scan_id = ScanRecord::make_scan_id(&ip, target.port, timestamp);

    let mut used_probes = BTreeMap::new();
    let mut banners = BTreeMap::new();
    let mut hex_banners = BTreeMap::new();
    let mut banners_hashes = BTreeMap::new();
    let mut products = Vec::new();

    for (probe, raw) in &outcome.responses {
        used_probes.insert(probe.clone(), truncate_response(raw, USED_PROBE_CAP));
        hex_banners.insert(probe.clone(), hex::encode(raw));
        if let Some(text) = decode_banner(raw) {
            banners.insert(probe.clone(), text);
        }
        banners_hashes.insert(probe.clone(), fingerprint(raw));
        products.extend(matcher.match_response(&scan_id, probe, raw));
    }

    let mut record = ScanRecord {
        scan_id,
        ip,
        port: target.port,
        protocol: target.protocol.clone(),
        ssl_tls: target.ssl_tls,
        used_probes,
        scan_tries: outcome.tries,
        sended_probes: outcome.sent,
        banners,
        timestamp,
        total_time_spent: format!("{:.3}", elapsed.as_secs_f64()),
        hex_banners,
        banners_hashes,
        products_count: 0,
        product_services: Vec::new(),
    };
    record.attach_product_summary(&products);
    (record, products)
}

/// Drain the target queue through a bounded worker pool and feed completed
/// results to the batch writer.
///
/// Workers share nothing mutable: the catalog is read-only and results flow
/// over a channel to the single task that owns the batch buffer. On
/// cancellation no new targets are pulled and in-flight attempts abandon
/// their current connection; buffered rows are flushed before returning.
/// A sink failure that survives its retries cancels the run the same way
/// and is returned as the run's error.
pub async fn run_scan(
    targets: Vec<Target>,
    catalog: Arc<ProbeCatalog>,
    sink: Arc<dyn ScanSink>,
    cfg: ScanConfig,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let matcher = SignatureMatcher::new(catalog.clone());
    let concurrency = cfg.concurrency.clamp(1, CONCURRENCY_CEILING);
    let (tx, rx) = mpsc::channel::<(ScanRecord, Vec<ProductRecord>)>(concurrency * 2);

    let writer = BatchWriter::new(sink, cfg.batch_size, cfg.sink_retries);
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        let result = drain_results(rx, writer).await;
        if result.is_err() {
            // Nothing can be persisted any more; stop pulling targets and
            // abandon in-flight probes.
            writer_cancel.cancel();
        }
        result
    });

    let pb = if cfg.progress {
        let pb = ProgressBar::new(targets.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} targets ({eta})")?,
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = Vec::new();
    for target in targets {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("stop requested, not pulling further targets");
                break;
            }
            permit = semaphore.clone().acquire_owned() => {
                permit.map_err(|_| anyhow!("worker pool closed"))?
            }
        };

        let catalog = catalog.clone();
        let matcher = matcher.clone();
        let worker_cfg = cfg.worker.clone();
        let worker_cancel = cancel.clone();
        let tx = tx.clone();
        let pb = pb.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let outcome = probe_target(&target, &catalog, &worker_cfg, &worker_cancel).await;
            let (record, products) = compose_record(&target, outcome, started.elapsed(), &matcher);
            pb.inc(1);
            // A closed channel means the writer hit a fatal sink error;
            // that error is surfaced below, nothing to do here.
            let _ = tx.send((record, products)).await;
        }));
    }
    drop(tx);

    for joined in join_all(tasks).await {
        if let Err(err) = joined {
            warn!("worker task panicked: {err}");
        }
    }
    pb.finish_and_clear();

    let (targets_scanned, products_matched, batches_flushed) = writer_task
        .await
        .map_err(|err| anyhow!("writer task failed: {err}"))??;

    Ok(RunSummary {
        targets_scanned,
        products_matched,
        batches_flushed,
    })
}

/// Feed the result channel into the batch writer, returning the run totals
/// `(scans_written, products_total, flushes)` once the channel closes.
async fn drain_results(
    mut rx: mpsc::Receiver<(ScanRecord, Vec<ProductRecord>)>,
    mut writer: BatchWriter,
) -> Result<(u64, u64, u64), SinkError> {
    let start_total = Instant::now();
    let mut start_chunk = Instant::now();
    let mut processed = 0u64;
    let mut products_total = 0u64;
    while let Some((scan, products)) = rx.recv().await {
        products_total += products.len() as u64;
        writer.add(scan, products).await?;
        processed += 1;
        if processed % PROGRESS_CHUNK == 0 {
            info!(
                processed,
                chunk_secs = start_chunk.elapsed().as_secs_f64(),
                total_secs = start_total.elapsed().as_secs_f64(),
                "progress"
            );
            start_chunk = Instant::now();
        }
    }
    writer.flush().await?;
    Ok((writer.scans_written(), products_total, writer.flushes()))
}
