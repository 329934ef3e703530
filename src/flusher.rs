use crate::transport::TransportSet;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Drains every registered log transport before process exit.
///
/// Transports with an explicit flush are awaited; the rest get a fixed grace
/// delay for their buffered writes. All transports drain concurrently and one
/// transport's failure or stall never blocks the others. The aggregate is
/// bounded by the flush deadline; delivery is best-effort, not guaranteed.
pub struct LogFlusher {
    transports: Arc<TransportSet>,
}

impl LogFlusher {
    pub fn new(transports: Arc<TransportSet>) -> Self {
        Self { transports }
    }

    pub async fn flush(&self, deadline: Duration, grace: Duration) {
        let transports = self.transports.all();
        if transports.is_empty() {
            return;
        }

        let drains = transports.into_iter().map(|transport| async move {
            if transport.supports_flush() {
                match transport.flush().await {
                    Ok(()) => debug!("Transport {} flushed", transport.name()),
                    Err(e) => warn!("Transport {} flush failed: {}", transport.name(), e),
                }
            } else {
                // No explicit flush operation; leave the buffered writer its
                // grace window to drain.
                tokio::time::sleep(grace).await;
            }
        });

        if timeout(deadline, join_all(drains)).await.is_err() {
            warn!(
                "Log flush deadline of {:?} elapsed before all transports drained",
                deadline
            );
        }
    }
}
