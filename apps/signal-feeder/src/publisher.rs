use crate::telemetry::Metric;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where points are written. Only used to compute the write URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEndpoint {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub precision: String,
}

impl DatabaseEndpoint {
    pub fn write_url(&self) -> String {
        format!(
            "http://{}:{}/write?db={}&precision={}",
            self.host, self.port, self.db_name, self.precision
        )
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to build write request: {0}")]
    Construction(#[source] reqwest::Error),
    #[error("write request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("write endpoint returned {status}")]
    Rejected { status: StatusCode },
    #[error("failed to release write response: {0}")]
    ResourceRelease(#[source] reqwest::Error),
}

#[derive(Debug, Default)]
pub struct PublishStats {
    published: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    release_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: u64,
    pub rejected: u64,
    pub failed: u64,
    pub release_failures: u64,
    pub last_error: Option<String>,
}

impl PublishStats {
    fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self, err: impl Into<String>) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    fn record_failed(&self, err: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    fn record_release_failure(&self) {
        self.release_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> PublishSummary {
        PublishSummary {
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

/// Posts one line-protocol point per request. Delivery is at-most-once:
/// failures are logged and counted, never retried.
#[derive(Clone)]
pub struct Publisher {
    client: Client,
    url: Arc<str>,
    stats: Arc<PublishStats>,
}

impl Publisher {
    pub fn new(endpoint: &DatabaseEndpoint, timeout: Duration) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PublishError::Construction)?;
        Ok(Self {
            client,
            url: endpoint.write_url().into(),
            stats: Arc::new(PublishStats::default()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> Arc<PublishStats> {
        self.stats.clone()
    }

    /// Sends the point and consumes it, whatever the outcome.
    pub async fn deliver(&self, metric: Metric) {
        match self.publish(&metric).await {
            Ok(()) => self.stats.record_published(),
            Err(err @ PublishError::Rejected { .. }) => {
                tracing::warn!(error=%err, timestamp_ms = metric.timestamp_ms(), "point rejected by write endpoint");
                self.stats.record_rejected(err.to_string());
            }
            Err(err) => {
                tracing::error!(error=%err, url=%self.url, "failed to publish point");
                self.stats.record_failed(err.to_string());
            }
        }
    }

    pub async fn publish(&self, metric: &Metric) -> Result<(), PublishError> {
        let line = metric.flatten();
        tracing::debug!(%line, "publishing point");

        let request = self
            .client
            .post(&*self.url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(line)
            .build()
            .map_err(PublishError::Construction)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(PublishError::Transport)?;

        let status = response.status();
        if let Err(err) = release(response).await {
            tracing::warn!(error=%err, "write response not fully drained");
            self.stats.record_release_failure();
        }
        if !status.is_success() {
            return Err(PublishError::Rejected { status });
        }
        Ok(())
    }
}

/// Drains the body so the pooled connection is handed back. The response is
/// dropped on return either way.
async fn release(response: Response) -> Result<(), PublishError> {
    response
        .bytes()
        .await
        .map(|_| ())
        .map_err(PublishError::ResourceRelease)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TagSet, MEASUREMENT, TEMPERATURE_FIELD};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn endpoint(host: &str, port: u16) -> DatabaseEndpoint {
        DatabaseEndpoint {
            host: host.to_string(),
            port,
            db_name: "iot_field_metrics".to_string(),
            precision: "ms".to_string(),
        }
    }

    fn metric() -> Metric {
        Metric::with_field(
            MEASUREMENT,
            Arc::new(TagSet::new()),
            TEMPERATURE_FIELD,
            "0.0000",
            1_700_000_000_000,
        )
    }

    fn closed_port() -> Option<u16> {
        // Bind then drop so nothing is listening on the port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").ok()?;
        let port = listener.local_addr().ok()?.port();
        drop(listener);
        Some(port)
    }

    async fn bind_local() -> Option<(TcpListener, u16)> {
        let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
        let port = listener.local_addr().ok()?.port();
        Some((listener, port))
    }

    /// Reads one request: headers plus a `Content-Length` body.
    async fn read_request(stream: &mut TcpStream) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            let Some(head_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let content_length = text[..head_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + content_length {
                return Ok(());
            }
        }
    }

    #[test]
    fn builds_write_url() {
        assert_eq!(
            endpoint("localhost", 8086).write_url(),
            "http://localhost:8086/write?db=iot_field_metrics&precision=ms"
        );
    }

    #[tokio::test]
    async fn malformed_url_is_a_construction_error() {
        let publisher = Publisher::new(&endpoint("bad host", 8086), DEFAULT_WRITE_TIMEOUT).unwrap();
        let err = publisher.publish(&metric()).await.unwrap_err();
        assert!(matches!(err, PublishError::Construction(_)), "{err:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let Some(port) = closed_port() else {
            // Sandbox environments can block binding attempts.
            return;
        };
        let publisher =
            Publisher::new(&endpoint("127.0.0.1", port), Duration::from_secs(2)).unwrap();
        let err = publisher.publish(&metric()).await.unwrap_err();
        assert!(matches!(err, PublishError::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn deliver_counts_failures_without_panicking() {
        let Some(port) = closed_port() else {
            return;
        };
        let publisher =
            Publisher::new(&endpoint("127.0.0.1", port), Duration::from_secs(2)).unwrap();

        publisher.deliver(metric()).await;
        publisher.deliver(metric()).await;

        let summary = publisher.stats().snapshot();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.published, 0);
        assert!(summary
            .last_error
            .as_deref()
            .is_some_and(|err| err.starts_with("write request failed")));
    }

    #[tokio::test]
    async fn truncated_response_body_is_a_release_failure() {
        let Some((listener, port)) = bind_local().await else {
            return;
        };
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                if read_request(&mut stream).await.is_err() {
                    continue;
                }
                // Announces 100 bytes, sends 5, then closes.
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
                    .await;
            }
        });
        let publisher =
            Publisher::new(&endpoint("127.0.0.1", port), Duration::from_secs(5)).unwrap();

        publisher.deliver(metric()).await;
        let summary = publisher.stats().snapshot();
        assert_eq!(summary.published, 1);
        assert_eq!(summary.release_failures, 1);
        assert_eq!(summary.failed, 0);

        publisher.deliver(metric()).await;
        let summary = publisher.stats().snapshot();
        assert_eq!(summary.published, 2);
        assert_eq!(summary.release_failures, 2);
    }

    #[tokio::test]
    async fn silent_endpoint_hits_the_client_timeout() {
        let Some((listener, port)) = bind_local().await else {
            return;
        };
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let publisher =
            Publisher::new(&endpoint("127.0.0.1", port), Duration::from_millis(200)).unwrap();

        match publisher.publish(&metric()).await {
            Err(PublishError::Transport(err)) => assert!(err.is_timeout(), "{err:?}"),
            other => panic!("expected a transport timeout, got {other:?}"),
        }

        publisher.deliver(metric()).await;
        publisher.deliver(metric()).await;
        let summary = publisher.stats().snapshot();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.published, 0);
    }
}
