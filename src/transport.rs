use crate::config::BlackboxConfig;
use crate::error::{BlackboxError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Event, Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::{Context, Layer};

/// A structured log record bound for the registered transports.
///
/// Routing labels on the wire are static only; everything event-specific
/// lives in `metadata` so the sink's routing-key space stays bounded.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Map<String, Value>,
}

impl LogRecord {
    pub fn new<S: Into<String>>(level: Level, message: S) -> Self {
        Self {
            level: level.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Serialized line shipped to the sink: message, timestamp, level, and
    /// the nested metadata object
    pub fn to_line(&self) -> String {
        serde_json::json!({
            "message": self.message,
            "timestamp": self.timestamp.to_rfc3339(),
            "level": self.level,
            "metadata": self.metadata,
        })
        .to_string()
    }
}

/// A destination for structured log records.
///
/// `emit` is synchronous enqueue-only so it can run inside a tracing layer;
/// transports that buffer expose `flush` to drain on demand. Transports
/// without a meaningful flush report `supports_flush() == false` and are
/// given a fixed grace delay at drain time instead.
#[async_trait]
pub trait LogTransport: Send + Sync {
    fn name(&self) -> &str;

    fn emit(&self, record: LogRecord);

    fn supports_flush(&self) -> bool {
        true
    }

    async fn flush(&self) -> Result<()>;
}

/// The process-lifetime set of registered log transports
#[derive(Default)]
pub struct TransportSet {
    inner: RwLock<Vec<Arc<dyn LogTransport>>>,
}

impl TransportSet {
    pub fn register(&self, transport: Arc<dyn LogTransport>) {
        self.inner.write().push(transport);
    }

    pub fn all(&self) -> Vec<Arc<dyn LogTransport>> {
        self.inner.read().clone()
    }

    /// Hand a copy of the record to every registered transport
    pub fn broadcast(&self, record: &LogRecord) {
        for transport in self.inner.read().iter() {
            transport.emit(record.clone());
        }
    }
}

/// Transport shipping batched records to a remote log-ingestion endpoint.
///
/// The stream carries only static routing labels (service, env, stream);
/// per-record fields travel inside each line's metadata object. Records are
/// buffered in memory and forwarded by a background task; `flush` drains the
/// buffer immediately. Failed batches are dropped, not retried.
pub struct LokiTransport {
    endpoint: String,
    client: reqwest::Client,
    labels: BTreeMap<String, String>,
    buffer: Mutex<Vec<LogRecord>>,
}

impl LokiTransport {
    pub fn new(config: &BlackboxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| {
                BlackboxError::transport("loki", format!("failed to build client: {}", e))
            })?;

        let mut labels = BTreeMap::new();
        labels.insert("stream".to_string(), "blackbox".to_string());
        labels.insert("service".to_string(), config.service.name.clone());
        labels.insert("env".to_string(), config.service.environment.clone());

        Ok(Self {
            endpoint: format!(
                "{}/loki/api/v1/push",
                config.loki.url.trim_end_matches('/')
            ),
            client,
            labels,
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background forwarder that drains the buffer on an interval
    pub fn spawn_forwarder(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.forward_pending().await {
                            warn!("Log forward failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn forward_pending(&self) -> Result<()> {
        let batch = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.post(batch).await
    }

    async fn post(&self, batch: Vec<LogRecord>) -> Result<()> {
        let values: Vec<Value> = batch
            .iter()
            .map(|record| {
                let ts = record
                    .timestamp
                    .timestamp_nanos_opt()
                    .unwrap_or_default()
                    .to_string();
                serde_json::json!([ts, record.to_line()])
            })
            .collect();

        let payload = serde_json::json!({
            "streams": [{
                "stream": &self.labels,
                "values": values,
            }]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BlackboxError::transport("loki", format!("push failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BlackboxError::transport(
                "loki",
                format!("push rejected with status {}", response.status()),
            ));
        }

        Ok(())
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[async_trait]
impl LogTransport for LokiTransport {
    fn name(&self) -> &str {
        "loki"
    }

    fn emit(&self, record: LogRecord) {
        self.buffer.lock().push(record);
    }

    async fn flush(&self) -> Result<()> {
        self.forward_pending().await
    }
}

/// JSON-lines mirror on stdout for collectors that scrape container output.
///
/// Writes go through the non-blocking appender, so they are buffered by a
/// background thread with no explicit flush operation; the drain path covers
/// this transport with the fixed grace delay.
pub struct ConsoleTransport {
    writer: Mutex<NonBlocking>,
}

impl ConsoleTransport {
    pub fn new() -> (Self, WorkerGuard) {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        (
            Self {
                writer: Mutex::new(writer),
            },
            guard,
        )
    }
}

#[async_trait]
impl LogTransport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    fn emit(&self, record: LogRecord) {
        let mut line = record.to_line();
        line.push('\n');
        let _ = self.writer.lock().write_all(line.as_bytes());
    }

    fn supports_flush(&self) -> bool {
        false
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Tracing layer that tees warn/error events into the registered transports
pub struct TransportLayer {
    transports: Arc<TransportSet>,
}

impl TransportLayer {
    pub fn new(transports: Arc<TransportSet>) -> Self {
        Self { transports }
    }
}

impl<S: Subscriber> Layer<S> for TransportLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: event.metadata().level().to_string(),
            message: visitor.message.unwrap_or_default(),
            timestamp: Utc::now(),
            metadata: visitor.fields,
        };

        self.transports.broadcast(&record);
    }
}

/// Collects event fields into the record's metadata map, with the implicit
/// `message` field split out
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, Value>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(
                field.name().to_string(),
                Value::String(format!("{:?}", value)),
            );
        }
    }
}
