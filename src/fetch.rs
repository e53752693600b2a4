//! Gateway fetch pipeline
//!
//! Retrieves content that missed every local tier. Source order:
//!
//! 1. the local daemon (unix socket when connected, HTTP loopback
//!    otherwise), skipped entirely in `gateway_only` mode;
//! 2. the configured public gateways, in order.
//!
//! Bodies above 10 MiB are streamed in 1 MiB chunks; a failure mid-stream
//! discards the partial buffer — partial bodies are never returned and
//! never cached. Every attempt is accounted per source so the metrics
//! report can compare transports.

use crate::backend::BackendRef;
use crate::cache::cid::Cid;
use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::metrics::{ConnectionKind, MetricsCollector};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bodies above this are read in chunks instead of one buffer
pub const STREAM_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Read granularity when streaming
pub const STREAM_CHUNK_BYTES: usize = 1024 * 1024;

/// Bodies above this emit progress telemetry per chunk
pub const PROGRESS_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

// =============================================================================
// Attempt Accounting
// =============================================================================

/// How one source attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok,
    NotFound,
    Timeout,
    ConnectionError,
    HttpError(u16),
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Ok => "ok",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::Timeout => "timeout",
            FetchOutcome::ConnectionError => "connection_error",
            FetchOutcome::HttpError(_) => "http_error",
        }
    }
}

/// One source attempt: `(source, bytes, wall_time, outcome)`
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    pub source: String,
    pub connection: ConnectionKind,
    pub bytes: u64,
    pub elapsed: Duration,
    pub outcome: FetchOutcome,
}

/// A successful fetch with its provenance
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub bytes: Bytes,
    pub source: String,
    pub attempts: Vec<FetchAttempt>,
}

// =============================================================================
// Gateway Fetcher
// =============================================================================

/// External content retriever
pub struct GatewayFetcher {
    backend: Option<BackendRef>,
    /// Transport the daemon connection ended up on, for accounting
    daemon_connection: ConnectionKind,
    config: FetchConfig,
    http: reqwest::Client,
    metrics: Arc<MetricsCollector>,
}

impl GatewayFetcher {
    pub fn new(
        backend: Option<BackendRef>,
        daemon_connection: ConnectionKind,
        config: FetchConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.source_timeout_seconds))
            .build()?;
        Ok(Self {
            backend,
            daemon_connection,
            config,
            http,
            metrics,
        })
    }

    /// Fetch a CID from the first source that can serve it
    pub async fn fetch(&self, cid: &Cid) -> Result<FetchResult> {
        let mut attempts: Vec<FetchAttempt> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        if !self.config.gateway_only {
            if let Some(backend) = &self.backend {
                let started = Instant::now();
                let outcome = match tokio::time::timeout(
                    Duration::from_secs(self.config.source_timeout_seconds),
                    backend.get(cid),
                )
                .await
                {
                    Ok(Ok(bytes)) => {
                        let attempt = self.record(
                            backend.name(),
                            self.daemon_connection,
                            bytes.len() as u64,
                            started.elapsed(),
                            FetchOutcome::Ok,
                        );
                        attempts.push(attempt);
                        return Ok(FetchResult {
                            bytes,
                            source: backend.name().to_string(),
                            attempts,
                        });
                    }
                    Ok(Err(e)) if e.is_not_found() => FetchOutcome::NotFound,
                    Ok(Err(e)) => {
                        debug!(cid = %cid, error = %e, "daemon fetch failed");
                        FetchOutcome::ConnectionError
                    }
                    Err(_) => FetchOutcome::Timeout,
                };
                attempts.push(self.record(
                    backend.name(),
                    self.daemon_connection,
                    0,
                    started.elapsed(),
                    outcome,
                ));
                failures.push(format!("{}: {}", backend.name(), outcome.label()));

                // A clean daemon miss is final unless fallback is enabled
                if outcome == FetchOutcome::NotFound && !self.config.use_gateway_fallback {
                    return Err(Error::not_found(
                        cid.as_str(),
                        "local daemon miss, gateway fallback disabled",
                    ));
                }
            }
        }

        for gateway in &self.config.gateway_urls {
            let started = Instant::now();
            match self.fetch_from_gateway(gateway, cid).await {
                Ok(bytes) => {
                    let attempt = self.record(
                        gateway,
                        ConnectionKind::Gateway,
                        bytes.len() as u64,
                        started.elapsed(),
                        FetchOutcome::Ok,
                    );
                    attempts.push(attempt);
                    return Ok(FetchResult {
                        bytes,
                        source: gateway.clone(),
                        attempts,
                    });
                }
                Err(outcome) => {
                    warn!(gateway, cid = %cid, outcome = outcome.label(), "gateway fetch failed");
                    attempts.push(self.record(
                        gateway,
                        ConnectionKind::Gateway,
                        0,
                        started.elapsed(),
                        outcome,
                    ));
                    failures.push(format!("{}: {}", gateway, outcome.label()));
                }
            }
        }

        Err(Error::not_found(
            cid.as_str(),
            if failures.is_empty() {
                "no sources configured".to_string()
            } else {
                format!("all sources exhausted [{}]", failures.join("; "))
            },
        ))
    }

    fn record(
        &self,
        source: &str,
        connection: ConnectionKind,
        bytes: u64,
        elapsed: Duration,
        outcome: FetchOutcome,
    ) -> FetchAttempt {
        self.metrics.record_transfer(
            source,
            connection,
            bytes,
            elapsed,
            outcome == FetchOutcome::Ok,
            outcome.label(),
        );
        FetchAttempt {
            source: source.to_string(),
            connection,
            bytes,
            elapsed,
            outcome,
        }
    }

    /// One gateway attempt; errors come back as the outcome that the
    /// accounting wants rather than a full error chain.
    async fn fetch_from_gateway(
        &self,
        base: &str,
        cid: &Cid,
    ) -> std::result::Result<Bytes, FetchOutcome> {
        let url = if base.ends_with('/') {
            format!("{base}{}", urlencoding::encode(cid.as_str()))
        } else {
            format!("{base}/{}", urlencoding::encode(cid.as_str()))
        };

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(FetchOutcome::Timeout),
            Err(_) => return Err(FetchOutcome::ConnectionError),
        };

        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(FetchOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(FetchOutcome::HttpError(status.as_u16()));
        }

        let content_length = response.content_length().unwrap_or(0);
        if content_length > STREAM_THRESHOLD_BYTES {
            self.read_streamed(response, content_length, cid).await
        } else {
            match response.bytes().await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.is_timeout() => Err(FetchOutcome::Timeout),
                Err(_) => Err(FetchOutcome::ConnectionError),
            }
        }
    }

    /// Chunked body read. Any mid-stream failure discards the partial
    /// buffer; a short body (stream ended early) counts as a failure too.
    async fn read_streamed(
        &self,
        response: reqwest::Response,
        content_length: u64,
        cid: &Cid,
    ) -> std::result::Result<Bytes, FetchOutcome> {
        let mut buffer = BytesMut::with_capacity(content_length.min(u32::MAX as u64) as usize);
        let mut stream = response.bytes_stream();
        let mut next_progress = STREAM_CHUNK_BYTES as u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) if e.is_timeout() => return Err(FetchOutcome::Timeout),
                Err(_) => return Err(FetchOutcome::ConnectionError),
            };
            buffer.extend_from_slice(&chunk);

            if content_length > PROGRESS_THRESHOLD_BYTES && buffer.len() as u64 >= next_progress {
                debug!(
                    cid = %cid,
                    received = buffer.len(),
                    total = content_length,
                    percent = (buffer.len() as f64 / content_length as f64 * 100.0) as u32,
                    "streaming progress"
                );
                next_progress += STREAM_CHUNK_BYTES as u64;
            }
        }

        if (buffer.len() as u64) < content_length {
            // Truncated body: never expose a partial payload
            return Err(FetchOutcome::ConnectionError);
        }
        Ok(buffer.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CasBackend, MockBackend};
    use crate::cache::cid::derive_cid;
    use crate::clock::ManualClock;
    use crate::config::MetricsConfig;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    /// Serve `payload` at any /<cid> path; empty payload means 404
    async fn spawn_gateway(payload: Option<Vec<u8>>) -> String {
        let make_svc = make_service_fn(move |_conn| {
            let payload = payload.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req| {
                    let payload = payload.clone();
                    async move {
                        let response = match payload {
                            Some(body) => Response::new(Body::from(body)),
                            None => Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("not found"))
                                .unwrap(),
                        };
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(&addr).serve(make_svc);
        let bound = server.local_addr();
        tokio::spawn(async move {
            let _ = server.await;
        });
        format!("http://{bound}/ipfs/")
    }

    fn metrics() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new(
            MetricsConfig::default(),
            Arc::new(ManualClock::at(1_000_000)),
        ))
    }

    fn fetcher(backend: Option<BackendRef>, config: FetchConfig) -> (GatewayFetcher, Arc<MetricsCollector>) {
        let metrics = metrics();
        let fetcher = GatewayFetcher::new(
            backend,
            ConnectionKind::Http,
            config,
            metrics.clone(),
        )
        .unwrap();
        (fetcher, metrics)
    }

    #[tokio::test]
    async fn test_daemon_serves_first() {
        let backend = Arc::new(MockBackend::new());
        let data = Bytes::from("from daemon");
        let cid = backend.put(data.clone()).await.unwrap();

        let config = FetchConfig {
            gateway_urls: vec![],
            ..Default::default()
        };
        let (fetcher, _) = fetcher(Some(backend), config);

        let result = fetcher.fetch(&cid).await.unwrap();
        assert_eq!(result.bytes, data);
        assert_eq!(result.source, "mock");
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.attempts[0].outcome, FetchOutcome::Ok);
    }

    #[tokio::test]
    async fn test_gateway_fallback_after_dead_gateway() {
        // G1 refuses connections, G2 serves 128 bytes
        let payload = vec![0xabu8; 128];
        let cid = derive_cid(&payload);
        let good = spawn_gateway(Some(payload.clone())).await;
        let dead = "http://127.0.0.1:1/ipfs/".to_string();

        let backend = Arc::new(MockBackend::new());
        backend.set_healthy(false);

        let config = FetchConfig {
            gateway_urls: vec![dead.clone(), good.clone()],
            use_gateway_fallback: true,
            ..Default::default()
        };
        let (fetcher, metrics) = fetcher(Some(backend), config);

        let result = fetcher.fetch(&cid).await.unwrap();
        assert_eq!(result.bytes.len(), 128);
        assert_eq!(result.source, good);

        // one failed daemon attempt, one failed gateway, one success
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[1].outcome, FetchOutcome::ConnectionError);
        assert_eq!(result.attempts[2].outcome, FetchOutcome::Ok);
        assert_eq!(result.attempts[2].bytes, 128);

        assert_eq!(
            metrics.transfer_outcomes(&dead),
            vec![("connection_error", 0)]
        );
        assert_eq!(metrics.transfer_outcomes(&good), vec![("ok", 128)]);
    }

    #[tokio::test]
    async fn test_daemon_miss_fatal_without_fallback() {
        let backend = Arc::new(MockBackend::new());
        let gateway = spawn_gateway(Some(b"reachable".to_vec())).await;

        let config = FetchConfig {
            gateway_urls: vec![gateway],
            use_gateway_fallback: false,
            ..Default::default()
        };
        let (fetcher, _) = fetcher(Some(backend), config);

        // the daemon returns a clean miss, so the gateway is never tried
        let err = fetcher.fetch(&Cid::new("bafymissing")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("fallback disabled"));
    }

    #[tokio::test]
    async fn test_gateway_only_skips_daemon() {
        let payload = b"gateway only".to_vec();
        let cid = derive_cid(&payload);
        let gateway = spawn_gateway(Some(payload.clone())).await;

        let backend = Arc::new(MockBackend::new());
        backend.insert_block(&cid, Bytes::from(payload));

        let config = FetchConfig {
            gateway_urls: vec![gateway],
            gateway_only: true,
            ..Default::default()
        };
        let (fetcher, _) = fetcher(Some(backend.clone()), config);

        let result = fetcher.fetch(&cid).await.unwrap();
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.attempts[0].connection, ConnectionKind::Gateway);
        // the daemon was never consulted
        assert_eq!(backend.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_aggregates_failures() {
        let missing = spawn_gateway(None).await;
        let dead = "http://127.0.0.1:1/ipfs/".to_string();

        let config = FetchConfig {
            gateway_urls: vec![dead.clone(), missing.clone()],
            gateway_only: true,
            ..Default::default()
        };
        let (fetcher, _) = fetcher(None, config);

        let err = fetcher.fetch(&Cid::new("bafynowhere")).await.unwrap_err();
        assert!(err.is_not_found());
        let message = err.to_string();
        assert!(message.contains("connection_error"));
        assert!(message.contains("not_found"));
        assert!(message.contains(&dead));
    }

    #[tokio::test]
    async fn test_http_error_falls_through() {
        // a gateway that 500s on everything
        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|_req| async {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::from("boom"))
                        .unwrap(),
                )
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let broken = format!("http://{}/ipfs/", server.local_addr());
        tokio::spawn(async move {
            let _ = server.await;
        });

        let payload = b"second chance".to_vec();
        let cid = derive_cid(&payload);
        let good = spawn_gateway(Some(payload)).await;

        let config = FetchConfig {
            gateway_urls: vec![broken, good],
            gateway_only: true,
            ..Default::default()
        };
        let (fetcher, _) = fetcher(None, config);

        let result = fetcher.fetch(&cid).await.unwrap();
        assert_eq!(result.attempts[0].outcome, FetchOutcome::HttpError(500));
        assert_eq!(result.attempts[1].outcome, FetchOutcome::Ok);
    }
}
