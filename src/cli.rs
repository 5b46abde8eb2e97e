use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "svcharvest")]
#[command(version = "0.1.0")]
#[command(about = "Probes targets, fingerprints banners and matches service signatures", long_about = None)]
pub struct Cli {
    #[arg(help = "Target list file: one ip:port[/tcp][+tls] entry per line")]
    pub input: PathBuf,

    #[arg(long, help = "Try every applicable probe per target (default)", conflicts_with = "short")]
    pub extended: bool,

    #[arg(long, help = "Stop probing a target at the first response")]
    pub short: bool,

    #[arg(long, default_value_t = 10_000, help = "Results buffered before each sink flush")]
    pub batch_size: usize,

    #[arg(long, default_value_t = 64, help = "Concurrent connection workers")]
    pub concurrency: usize,

    #[arg(long, default_value_t = 3000, help = "Per-attempt timeout in milliseconds")]
    pub timeout: u64,

    #[arg(long, default_value_t = 3, help = "Connection retry budget per target")]
    pub max_tries: u32,

    #[arg(long, help = "JSON probe catalog; the built-in corpus is used when omitted")]
    pub probes: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "clickhouse", help = "Persistence sink")]
    pub sink: SinkKind,

    #[arg(long, default_value = ".", help = "Directory for the jsonl sink output")]
    pub output_dir: PathBuf,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

impl Cli {
    /// Extended probing is the default; `--short` switches to
    /// first-response mode.
    pub fn extended_mode(&self) -> bool {
        !self.short
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum SinkKind {
    #[value(name = "clickhouse", help = "Bulk inserts into ClickHouse over HTTP")]
    ClickHouse,
    #[value(name = "jsonl", help = "Append rows to local JSONL files")]
    Jsonl,
}
