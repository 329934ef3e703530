use crate::error::{BlackboxError, Result};
use crate::metrics::CrashMetrics;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Best-effort push of the full metrics registry to a push-style aggregator.
///
/// One `PUT` per attempt against the job/instance-scoped endpoint, so the
/// aggregator atomically replaces any prior push under the same grouping key.
/// The attempt is abandoned once the deadline elapses; a failed or abandoned
/// push loses that snapshot, which is the accepted trade-off here.
pub struct MetricsPublisher {
    client: reqwest::Client,
    url: String,
    metrics: Arc<CrashMetrics>,
}

impl MetricsPublisher {
    pub fn new(
        gateway_url: &str,
        job: &str,
        instance: &str,
        metrics: Arc<CrashMetrics>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| BlackboxError::publish(format!("failed to build client: {}", e)))?;

        let url = format!(
            "{}/metrics/job/{}/instance/{}",
            gateway_url.trim_end_matches('/'),
            job,
            instance
        );

        Ok(Self {
            client,
            url,
            metrics,
        })
    }

    /// Push the current registry snapshot, bounded by `deadline`
    pub async fn push(&self, deadline: Duration) -> Result<()> {
        let body = self.metrics.render()?;

        let request = self
            .client
            .put(&self.url)
            .header(CONTENT_TYPE, self.metrics.content_type())
            .body(body)
            .send();

        let response = match timeout(deadline, request).await {
            Err(_) => {
                return Err(BlackboxError::publish(format!(
                    "push abandoned after {:?}",
                    deadline
                )))
            }
            Ok(Err(e)) => {
                return Err(BlackboxError::publish(format!("push request failed: {}", e)))
            }
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            return Err(BlackboxError::publish(format!(
                "aggregator responded with status {}",
                response.status()
            )));
        }

        debug!("Metrics snapshot pushed to {}", self.url);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatal::{FailureEvent, FailureKind};

    fn metrics() -> Arc<CrashMetrics> {
        Arc::new(CrashMetrics::new("testsvc", "test-1").expect("build crash metrics"))
    }

    #[test]
    fn test_push_url_shape() {
        let publisher = MetricsPublisher::new("http://gateway:9091/", "testsvc", "test-1", metrics())
            .expect("build publisher");
        assert_eq!(
            publisher.push_url(),
            "http://gateway:9091/metrics/job/testsvc/instance/test-1"
        );
    }

    #[tokio::test]
    async fn test_push_sends_rendered_registry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .match_header("content-type", mockito::Matcher::Regex("text/plain".to_string()))
            .match_body(mockito::Matcher::Regex(
                "process_crashes_total".to_string(),
            ))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let metrics = metrics();
        metrics.record(&FailureEvent::from_signal(FailureKind::Terminate, "SIGTERM"));

        let publisher = MetricsPublisher::new(&server.url(), "testsvc", "test-1", metrics)
            .expect("build publisher");
        publisher
            .push(Duration::from_secs(2))
            .await
            .expect("push succeeds");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_surfaces_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .with_status(502)
            .create_async()
            .await;

        let publisher = MetricsPublisher::new(&server.url(), "testsvc", "test-1", metrics())
            .expect("build publisher");
        let err = publisher
            .push(Duration::from_secs(2))
            .await
            .expect_err("bad gateway surfaces as error");
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn test_push_surfaces_connection_failure() {
        // Bind-and-drop leaves a port nothing is listening on
        let server = mockito::Server::new_async().await;
        let url = server.url();
        drop(server);

        let publisher = MetricsPublisher::new(&url, "testsvc", "test-1", metrics())
            .expect("build publisher");
        assert!(publisher.push(Duration::from_secs(2)).await.is_err());
    }
}
