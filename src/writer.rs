use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::records::{ProductRecord, ScanRecord};
use crate::sink::{ScanSink, SinkError};

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Accumulates completed results and flushes them to the sink in batches.
///
/// Single-writer by construction: exactly one task owns a `BatchWriter`
/// and drains the result channel into it. A batch is all-or-nothing; on
/// rejection the whole batch is retried, and exhausting the retry budget
/// surfaces the error to the caller, which ends the run.
pub struct BatchWriter {
    sink: Arc<dyn ScanSink>,
    batch_size: usize,
    max_retries: u32,
    scans: Vec<ScanRecord>,
    products: Vec<ProductRecord>,
    scans_written: u64,
    products_written: u64,
    flushes: u64,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn ScanSink>, batch_size: usize, max_retries: u32) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            max_retries,
            scans: Vec::new(),
            products: Vec::new(),
            scans_written: 0,
            products_written: 0,
            flushes: 0,
        }
    }

    /// Buffer one result with its product rows; flushes when the buffered
    /// result count reaches the batch size.
    pub async fn add(
        &mut self,
        scan: ScanRecord,
        products: Vec<ProductRecord>,
    ) -> Result<(), SinkError> {
        self.scans.push(scan);
        self.products.extend(products);
        if self.scans.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write out whatever is buffered. No-op on an empty buffer.
    pub async fn flush(&mut self) -> Result<(), SinkError> {
        if self.scans.is_empty() && self.products.is_empty() {
            return Ok(());
        }

        let mut attempt = 0u32;
        loop {
            match self.sink.write_batch(&self.scans, &self.products).await {
                Ok(()) => break,
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, "batch write failed, retrying: {err}");
                    sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }

        self.scans_written += self.scans.len() as u64;
        self.products_written += self.products.len() as u64;
        self.flushes += 1;
        debug!(
            scans = self.scans.len(),
            products = self.products.len(),
            flushes = self.flushes,
            "batch flushed"
        );
        self.scans.clear();
        self.products.clear();
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.scans.len()
    }

    pub fn scans_written(&self) -> u64 {
        self.scans_written
    }

    pub fn products_written(&self) -> u64 {
        self.products_written
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use std::collections::BTreeMap;

    fn scan(id: &str) -> ScanRecord {
        ScanRecord {
            scan_id: id.into(),
            ip: "192.0.2.1".into(),
            port: 80,
            protocol: "tcp".into(),
            ssl_tls: false,
            used_probes: BTreeMap::new(),
            scan_tries: 0,
            sended_probes: 0,
            banners: BTreeMap::new(),
            timestamp: 0,
            total_time_spent: String::new(),
            hex_banners: BTreeMap::new(),
            banners_hashes: BTreeMap::new(),
            products_count: 0,
            product_services: Vec::new(),
        }
    }

    fn product(scan_id: &str) -> ProductRecord {
        ProductRecord {
            scan_id: scan_id.into(),
            probe: "GetRequest".into(),
            service: "http".into(),
            regex: String::new(),
            softmatch: false,
            vendorproductname: None,
            info: None,
            os: None,
            devicetype: None,
            hostname: None,
            cpe: Vec::new(),
        }
    }

    #[tokio::test]
    async fn flushes_exactly_at_batch_size() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = BatchWriter::new(sink.clone(), 2, 0);

        writer.add(scan("a"), vec![]).await.unwrap();
        assert_eq!(sink.batches().len(), 0);
        writer.add(scan("b"), vec![product("b")]).await.unwrap();
        assert_eq!(sink.batches().len(), 1);
        writer.add(scan("c"), vec![]).await.unwrap();
        assert_eq!(sink.batches().len(), 1);

        writer.flush().await.unwrap();
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0.len(), 2);
        assert_eq!(batches[0].1.len(), 1);
        assert_eq!(batches[1].0.len(), 1);
        assert_eq!(writer.scans_written(), 3);
        assert_eq!(writer.products_written(), 1);
        assert_eq!(writer.flushes(), 2);
    }

    #[tokio::test]
    async fn final_flush_on_empty_buffer_is_a_noop() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = BatchWriter::new(sink.clone(), 2, 0);
        writer.flush().await.unwrap();
        assert!(sink.batches().is_empty());
        assert_eq!(writer.flushes(), 0);
    }

    #[tokio::test]
    async fn rejected_batch_is_retried_whole() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = BatchWriter::new(sink.clone(), 2, 2);
        sink.fail_next(1);

        writer.add(scan("a"), vec![product("a")]).await.unwrap();
        writer.add(scan("b"), vec![]).await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        // Same rows arrived together after the retry.
        assert_eq!(batches[0].0.len(), 2);
        assert_eq!(batches[0].1.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = BatchWriter::new(sink.clone(), 1, 1);
        sink.fail_next(5);

        let result = writer.add(scan("a"), vec![]).await;
        assert!(result.is_err());
        assert!(sink.batches().is_empty());
    }
}
