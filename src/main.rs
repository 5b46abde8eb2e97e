use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use svcharvest::catalog::ProbeCatalog;
use svcharvest::cli::{Cli, SinkKind};
use svcharvest::config::ClickHouseConfig;
use svcharvest::scheduler::{run_scan, ScanConfig};
use svcharvest::sink::{ClickHouseSink, JsonlSink, ScanSink};
use svcharvest::targets::load_targets;
use svcharvest::worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let targets = load_targets(&cli.input)?;
    if targets.is_empty() {
        eprintln!("{}", "Error: no scannable targets in input.".red());
        std::process::exit(1);
    }

    let catalog = Arc::new(ProbeCatalog::load(cli.probes.as_deref())?);

    let sink: Arc<dyn ScanSink> = match cli.sink {
        SinkKind::ClickHouse => Arc::new(ClickHouseSink::new(&ClickHouseConfig::from_env())?),
        SinkKind::Jsonl => Arc::new(JsonlSink::new(&cli.output_dir)),
    };

    let cfg = ScanConfig {
        concurrency: cli.concurrency,
        batch_size: cli.batch_size,
        sink_retries: 3,
        worker: WorkerConfig {
            timeout: Duration::from_millis(cli.timeout.max(1)),
            max_tries: cli.max_tries.max(1),
            extended: cli.extended_mode(),
            ..WorkerConfig::default()
        },
        progress: true,
    };

    // Ctrl-C stops pulling targets; in-flight work drains and buffered
    // batches are flushed before exit.
    let cancel = CancellationToken::new();
    let ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrlc.cancel();
    });

    tracing::info!(targets = targets.len(), "starting scan");
    let summary = run_scan(targets, catalog, sink, cfg, cancel).await?;

    println!(
        "{} {} targets scanned, {} products matched, {} batches flushed",
        "done:".green().bold(),
        summary.targets_scanned,
        summary.products_matched,
        summary.batches_flushed
    );
    Ok(())
}
