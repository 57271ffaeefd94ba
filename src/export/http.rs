use std::io::Write;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use super::Batch;
use crate::config::HttpExportConfig;

/// HTTP NDJSON exporter with compression.
///
/// Each batch is split into bodies of at most `batch_size` lines, optionally
/// compressed, and POSTed in order. The first failed request aborts the
/// batch; the caller decides whether to count or retry it.
pub struct HttpExporter {
    cfg: HttpExportConfig,
    client: Option<reqwest::Client>,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpExportConfig) -> Self {
        Self { cfg, client: None }
    }

    pub fn name(&self) -> &str {
        "http"
    }

    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        if self.cfg.address.is_empty() {
            bail!("http address is required");
        }
        if self.cfg.batch_size == 0 {
            bail!("http batch_size must be positive");
        }
        // Fail on an unknown algorithm at startup rather than on first export.
        compress(&[], &self.cfg.compression)?;

        let mut client_builder = reqwest::Client::builder().timeout(self.cfg.export_timeout);

        if !self.cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        self.client = Some(client_builder.build().context("building HTTP client")?);

        tracing::info!(
            address = %self.cfg.address,
            compression = %self.cfg.compression,
            batch_size = self.cfg.batch_size,
            "HTTP exporter started",
        );

        Ok(())
    }

    pub async fn export(&self, batch: &Batch) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };

        if batch.is_empty() {
            return Ok(());
        }

        let bodies = batch
            .to_ndjson_chunks(self.cfg.batch_size)
            .context("serializing batch to JSON")?;

        for body in bodies {
            send_body(client, &self.cfg, body)
                .await
                .with_context(|| format!("exporting {} rows", batch.kind()))?;
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.client.take();
        Ok(())
    }
}

/// Sends one NDJSON body via HTTP.
async fn send_body(client: &reqwest::Client, cfg: &HttpExportConfig, body: Vec<u8>) -> Result<()> {
    let raw_len = body.len();

    let compressed = compress(&body, &cfg.compression).context("compressing NDJSON data")?;

    let mut request = client
        .post(&cfg.address)
        .header("Content-Type", "application/x-ndjson")
        .body(compressed);

    if let Some(encoding) = content_encoding(&cfg.compression) {
        request = request.header("Content-Encoding", encoding);
    }

    for (k, v) in &cfg.headers {
        request = request.header(k.as_str(), v.as_str());
    }

    let resp = request
        .send()
        .await
        .context("sending HTTP export request")?;

    let status = resp.status();
    // Drain body for connection reuse.
    let _ = resp.bytes().await;

    if !status.is_success() {
        bail!("HTTP export unexpected status: {status}");
    }

    tracing::debug!(bytes = raw_len, "exported body via HTTP");

    Ok(())
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use axum::body::Bytes;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;
    use crate::pipeline::SlowTrace;

    #[test]
    fn test_compress_none() {
        let data = b"hello world";
        let result = compress(data, "none").expect("compress none");
        assert_eq!(result, data);
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"hello world compressed with gzip";
        let compressed = compress(data, "gzip").expect("gzip compress");
        assert_ne!(compressed, data.as_slice());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_zstd_roundtrip() {
        let data = b"hello world compressed with zstd";
        let compressed = compress(data, "zstd").expect("zstd compress");
        let decompressed = zstd::decode_all(compressed.as_slice()).expect("zstd decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_rejects_unknown() {
        assert!(compress(b"x", "snappy").is_err());
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("zstd"), Some("zstd"));
        assert_eq!(content_encoding("zlib"), Some("deflate"));
        assert_eq!(content_encoding("none"), None);
        assert_eq!(content_encoding(""), None);
    }

    #[tokio::test]
    async fn test_export_posts_ndjson_bodies() {
        let received: Arc<Mutex<Vec<(Option<String>, Vec<u8>)>>> = Arc::default();
        let sink = Arc::clone(&received);
        let app = Router::new().route(
            "/ingest",
            post(move |headers: HeaderMap, body: Bytes| {
                let sink = Arc::clone(&sink);
                async move {
                    let encoding = headers
                        .get("content-encoding")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    sink.lock().push((encoding, body.to_vec()));
                    "ok"
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let cfg = HttpExportConfig {
            enabled: true,
            address: format!("http://{addr}/ingest"),
            compression: "none".to_string(),
            batch_size: 2,
            ..Default::default()
        };
        let mut exporter = HttpExporter::new(cfg);
        exporter.start(CancellationToken::new()).await.expect("start");

        let rows = (0..3)
            .map(|i| SlowTrace {
                service: "svc".to_string(),
                endpoint: "/a".to_string(),
                trace_id: format!("t{i}"),
                segment_id: format!("s{i}"),
                start_time: 0,
                duration_ms: 600 + i,
                is_error: false,
            })
            .collect();
        exporter
            .export(&Batch::SlowTraces(rows))
            .await
            .expect("export");

        let received = received.lock();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, None);
        let first = String::from_utf8(received[0].1.clone()).expect("utf8");
        assert_eq!(first.lines().count(), 2);
        assert!(first.contains("\"kind\":\"slow_trace\""));
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_compression() {
        let cfg = HttpExportConfig {
            enabled: true,
            address: "http://127.0.0.1:1/ingest".to_string(),
            compression: "brotli".to_string(),
            ..Default::default()
        };
        let mut exporter = HttpExporter::new(cfg);
        assert!(exporter.start(CancellationToken::new()).await.is_err());
    }
}
