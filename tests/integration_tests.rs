use std::io::Write as _;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use svcharvest::catalog::ProbeCatalog;
use svcharvest::fingerprint::md5_hex;
use svcharvest::scheduler::{run_scan, ScanConfig};
use svcharvest::sink::MemorySink;
use svcharvest::targets::Target;
use svcharvest::worker::WorkerConfig;

const NGINX_BANNER: &[u8] = b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\n\r\n";

fn local_target(port: u16) -> Target {
    Target {
        ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
        port,
        protocol: "tcp".into(),
        ssl_tls: false,
    }
}

fn test_config(batch_size: usize) -> ScanConfig {
    ScanConfig {
        concurrency: 8,
        batch_size,
        sink_retries: 0,
        worker: WorkerConfig {
            timeout: Duration::from_millis(500),
            max_tries: 2,
            extended: true,
            max_response: 16 * 1024,
        },
        progress: false,
    }
}

/// Catalog with a single HTTP probe hinting the given port, carrying the
/// nginx rule plus a generic HTTP softmatch.
fn http_catalog(port: u16) -> ProbeCatalog {
    let payload = general_purpose::STANDARD.encode(b"GET / HTTP/1.0\r\n\r\n");
    let json = format!(
        r#"{{"probes":[{{
            "name":"GetRequest","payload":"{payload}","ports":[{port}],"rarity":1,
            "rules":[
              {{"service":"http","pattern":"Server: nginx/?([\\d.]*)",
                "vendorproductname":"nginx","info":"$1",
                "cpe":["cpe:/a:nginx:nginx:$1"]}},
              {{"service":"http","pattern":"^HTTP/1\\.[01] \\d\\d\\d","softmatch":true}}
            ]}}]}}"#
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    ProbeCatalog::from_file(file.path()).unwrap()
}

async fn serve_banner(listener: TcpListener, banner: &'static [u8], read_first: bool) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            if read_first {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
            }
            let _ = socket.write_all(banner).await;
        });
    }
}

#[tokio::test]
async fn end_to_end_http_identification() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_banner(listener, NGINX_BANNER, true));

    let catalog = Arc::new(http_catalog(port));
    let sink = Arc::new(MemorySink::new());
    let summary = run_scan(
        vec![local_target(port)],
        catalog,
        sink.clone(),
        test_config(10),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.targets_scanned, 1);
    assert_eq!(summary.products_matched, 1);
    assert_eq!(summary.batches_flushed, 1);

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    let (scans, products) = &batches[0];
    assert_eq!(scans.len(), 1);
    let scan = &scans[0];
    assert!(scan.used_probes.contains_key("GetRequest"));
    assert_eq!(scan.banners_hashes["GetRequest"].md5, md5_hex(NGINX_BANNER));
    assert_eq!(scan.sended_probes, 1);
    assert_eq!(scan.products_count, 1);
    assert_eq!(scan.product_services, vec!["http"]);

    assert_eq!(products.len(), 1);
    let product = &products[0];
    assert_eq!(product.scan_id, scan.scan_id);
    assert_eq!(product.service, "http");
    assert_eq!(product.vendorproductname.as_deref(), Some("nginx"));
    assert!(product.info.as_deref().unwrap().contains("1.18.0"));
    assert!(!product.softmatch);
}

#[tokio::test]
async fn three_targets_with_batch_size_two_flush_twice() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_banner(
        listener,
        b"220 files.example.com FTP server ready\r\n",
        false,
    ));

    let sink = Arc::new(MemorySink::new());
    let mut cfg = test_config(2);
    cfg.concurrency = 1; // sequential completion for deterministic flush sizes
    let summary = run_scan(
        vec![local_target(port), local_target(port), local_target(port)],
        Arc::new(ProbeCatalog::builtin()),
        sink.clone(),
        cfg,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.targets_scanned, 3);
    assert_eq!(summary.batches_flushed, 2);
    let batches = sink.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].0.len(), 2);
    assert_eq!(batches[1].0.len(), 1);

    // No record dropped or duplicated across flushes.
    let ids: Vec<String> = batches
        .iter()
        .flat_map(|(scans, _)| scans.iter().map(|s| s.scan_id.clone()))
        .collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn unresponsive_target_emits_single_empty_record() {
    // Bind then drop so the port actively refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let sink = Arc::new(MemorySink::new());
    let summary = run_scan(
        vec![local_target(port)],
        Arc::new(ProbeCatalog::builtin()),
        sink.clone(),
        test_config(10),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.targets_scanned, 1);
    assert_eq!(summary.products_matched, 0);

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    let (scans, products) = &batches[0];
    assert_eq!(scans.len(), 1);
    assert!(scans[0].banners.is_empty());
    assert!(scans[0].hex_banners.is_empty());
    assert_eq!(scans[0].products_count, 0);
    assert_eq!(scans[0].scan_tries, 2);
    assert!(products.is_empty());
}

#[tokio::test]
async fn pre_cancelled_run_pulls_no_targets() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let sink = Arc::new(MemorySink::new());
    let summary = run_scan(
        vec![local_target(1)],
        Arc::new(ProbeCatalog::builtin()),
        sink.clone(),
        test_config(10),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(summary.targets_scanned, 0);
    assert!(sink.batches().is_empty());
}

/// Accept connections and hold them open without ever answering.
async fn hold_connections(listener: TcpListener) {
    let mut held = Vec::new();
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        held.push(socket);
    }
}

#[tokio::test]
async fn mid_run_cancellation_abandons_in_flight_workers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(hold_connections(listener));

    let mut cfg = test_config(10);
    // Long enough that only cancellation can end the attempt quickly.
    cfg.worker.timeout = Duration::from_secs(30);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let sink = Arc::new(MemorySink::new());
    let started = Instant::now();
    let summary = run_scan(
        vec![local_target(port)],
        Arc::new(ProbeCatalog::builtin()),
        sink.clone(),
        cfg,
        cancel,
    )
    .await
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    // The abandoned target still gets its (empty) record flushed.
    assert_eq!(summary.targets_scanned, 1);
    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].0[0].banners.is_empty());
}

#[tokio::test]
async fn fatal_sink_failure_ends_the_run_early() {
    let fast = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fast_port = fast.local_addr().unwrap().port();
    tokio::spawn(serve_banner(
        fast,
        b"220 files.example.com FTP server ready\r\n",
        false,
    ));

    let slow = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let slow_port = slow.local_addr().unwrap().port();
    tokio::spawn(hold_connections(slow));

    let sink = Arc::new(MemorySink::new());
    sink.fail_next(10);

    let mut cfg = test_config(1);
    cfg.concurrency = 1;
    cfg.sink_retries = 0;
    cfg.worker.timeout = Duration::from_secs(30);

    let catalog = Arc::new(ProbeCatalog::builtin());
    let started = Instant::now();
    let result = run_scan(
        vec![
            local_target(fast_port),
            local_target(slow_port),
            local_target(slow_port),
        ],
        catalog,
        sink.clone(),
        cfg,
        CancellationToken::new(),
    )
    .await;

    // The first flush fails and the run stops without probing the silent
    // targets to their timeout.
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(sink.batches().is_empty());
}

#[tokio::test]
async fn short_mode_stops_after_first_responsive_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_banner(listener, b"SSH-2.0-OpenSSH_8.9p1\r\n", false));

    let sink = Arc::new(MemorySink::new());
    let mut cfg = test_config(10);
    cfg.worker.extended = false;
    let summary = run_scan(
        vec![local_target(port)],
        Arc::new(ProbeCatalog::builtin()),
        sink.clone(),
        cfg,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.targets_scanned, 1);
    let batches = sink.batches();
    let scan = &batches[0].0[0];
    // NullProbe answered; GenericLines was never sent.
    assert_eq!(scan.sended_probes, 1);
    assert_eq!(scan.banners.len(), 1);
    assert!(scan.banners.contains_key("NullProbe"));
    assert_eq!(
        batches[0].1[0].vendorproductname.as_deref(),
        Some("OpenSSH")
    );
}
