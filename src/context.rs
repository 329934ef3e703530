use crate::config::BlackboxConfig;
use crate::error::Result;
use crate::metrics::CrashMetrics;
use crate::transport::{LogTransport, TransportSet};
use std::sync::Arc;

/// Process-lifetime aggregate owning the crash metric registry, the set of
/// log transports, and the loaded configuration. Constructed once by the
/// application entry point and shared by reference; there are no module-level
/// singletons behind it.
pub struct ObservabilityContext {
    config: BlackboxConfig,
    metrics: Arc<CrashMetrics>,
    transports: Arc<TransportSet>,
}

impl ObservabilityContext {
    pub fn new(config: BlackboxConfig, transports: Arc<TransportSet>) -> Result<Self> {
        let metrics = Arc::new(CrashMetrics::new(
            &config.service.name,
            &config.service.instance,
        )?);
        Ok(Self {
            config,
            metrics,
            transports,
        })
    }

    pub fn config(&self) -> &BlackboxConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<CrashMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn transports(&self) -> Arc<TransportSet> {
        Arc::clone(&self.transports)
    }

    pub fn register_transport(&self, transport: Arc<dyn LogTransport>) {
        self.transports.register(transport);
    }
}
