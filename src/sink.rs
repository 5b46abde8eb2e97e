use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ClickHouseConfig;
use crate::records::{ProductRecord, ScanRecord};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected batch (status {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for completed batches. One call covers both tables so a
/// result row and its product rows always travel in the same flush.
#[async_trait]
pub trait ScanSink: Send + Sync {
    async fn write_batch(
        &self,
        scans: &[ScanRecord],
        products: &[ProductRecord],
    ) -> Result<(), SinkError>;
}

fn to_ndjson<T: Serialize>(rows: &[T]) -> Result<String, SinkError> {
    let mut body = String::new();
    for row in rows {
        body.push_str(&serde_json::to_string(row)?);
        body.push('\n');
    }
    Ok(body)
}

/// Bulk inserts over the ClickHouse HTTP interface, `JSONEachRow` format,
/// one request per table per flush.
pub struct ClickHouseSink {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    database: String,
}

impl ClickHouseSink {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint(),
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        })
    }

    async fn insert(&self, table: &str, body: String) -> Result<(), SinkError> {
        let query = format!("INSERT INTO {}.{} FORMAT JSONEachRow", self.database, table);
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("query", query.as_str())])
            .basic_auth(&self.user, Some(&self.password))
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ScanSink for ClickHouseSink {
    async fn write_batch(
        &self,
        scans: &[ScanRecord],
        products: &[ProductRecord],
    ) -> Result<(), SinkError> {
        if !scans.is_empty() {
            self.insert("scan_results", to_ndjson(scans)?).await?;
        }
        if !products.is_empty() {
            self.insert("products", to_ndjson(products)?).await?;
        }
        debug!(scans = scans.len(), products = products.len(), "batch inserted");
        Ok(())
    }
}

/// Appends both row streams to local JSONL files. Used for dry runs and
/// offline inspection of what would have been inserted.
pub struct JsonlSink {
    scans_path: PathBuf,
    products_path: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            scans_path: dir.join("scan_results.jsonl"),
            products_path: dir.join("products.jsonl"),
        }
    }

    async fn append(path: &Path, body: String) -> Result<(), SinkError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ScanSink for JsonlSink {
    async fn write_batch(
        &self,
        scans: &[ScanRecord],
        products: &[ProductRecord],
    ) -> Result<(), SinkError> {
        if !scans.is_empty() {
            Self::append(&self.scans_path, to_ndjson(scans)?).await?;
        }
        if !products.is_empty() {
            Self::append(&self.products_path, to_ndjson(products)?).await?;
        }
        Ok(())
    }
}

/// Recording sink with optional failure injection; backs the batch writer
/// tests and doubles as a null sink.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<(Vec<ScanRecord>, Vec<ProductRecord>)>>,
    fail_remaining: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write_batch calls fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<(Vec<ScanRecord>, Vec<ProductRecord>)> {
        self.batches.lock().expect("sink poisoned").clone()
    }
}

#[async_trait]
impl ScanSink for MemorySink {
    async fn write_batch(
        &self,
        scans: &[ScanRecord],
        products: &[ProductRecord],
    ) -> Result<(), SinkError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::Rejected {
                status: 503,
                body: "injected failure".into(),
            });
        }
        self.batches
            .lock()
            .expect("sink poisoned")
            .push((scans.to_vec(), products.to_vec()));
        Ok(())
    }
}
