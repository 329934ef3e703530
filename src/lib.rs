pub mod config;
pub mod error;
pub mod context;
pub mod metrics;
pub mod transport;
pub mod flusher;
pub mod publish;
pub mod fatal;
pub mod coordinator;
pub mod scrape;

pub use config::BlackboxConfig;
pub use context::ObservabilityContext;
pub use coordinator::{ShutdownCoordinator, ShutdownState};
pub use error::{BlackboxError, Result};
pub use fatal::{ErrorInfo, FailureEvent, FailureKind, FailureReporter, FatalEventSink};
pub use flusher::LogFlusher;
pub use metrics::CrashMetrics;
pub use publish::MetricsPublisher;
pub use scrape::ScrapeServer;
pub use transport::{
    ConsoleTransport, LogRecord, LogTransport, LokiTransport, TransportLayer, TransportSet,
};
