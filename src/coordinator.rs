use crate::config::ShutdownConfig;
use crate::context::ObservabilityContext;
use crate::error::Result;
use crate::fatal::{FailureEvent, FailureKind};
use crate::flusher::LogFlusher;
use crate::publish::MetricsPublisher;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle of the one shutdown sequence a process gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    InProgress,
    Completed,
}

const IDLE: u8 = 0;
const IN_PROGRESS: u8 = 1;
const COMPLETED: u8 = 2;

/// Monotonic state cell; the Idle->InProgress edge is taken at most once
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(IDLE, IN_PROGRESS, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn complete(&self) {
        self.0.store(COMPLETED, Ordering::SeqCst);
    }

    fn get(&self) -> ShutdownState {
        match self.0.load(Ordering::SeqCst) {
            IDLE => ShutdownState::Idle,
            IN_PROGRESS => ShutdownState::InProgress,
            _ => ShutdownState::Completed,
        }
    }
}

/// Margin granted past the watchdog before the hard stop fires
const HARD_STOP_MARGIN: Duration = Duration::from_millis(500);

/// Orchestrates the one-way record -> publish -> flush -> exit sequence.
///
/// The single-flight guard is the sole concurrency-correctness mechanism:
/// concurrent fatal triggers race on one atomic edge, the winner runs the
/// sequence and every loser is logged and dropped. Once a sequence begins no
/// error is rethrown to any caller; the contract is that the process exits
/// within a bounded time whatever the downstream telemetry does.
pub struct ShutdownCoordinator {
    context: Arc<ObservabilityContext>,
    publisher: MetricsPublisher,
    flusher: LogFlusher,
    state: StateCell,
    deadlines: ShutdownConfig,
    drain_token: Option<CancellationToken>,
}

impl ShutdownCoordinator {
    pub fn new(context: Arc<ObservabilityContext>) -> Result<Self> {
        let config = context.config();
        let publisher = MetricsPublisher::new(
            &config.push.gateway_url,
            &config.service.name,
            &config.service.instance,
            context.metrics(),
        )?;
        let flusher = LogFlusher::new(context.transports());
        let deadlines = config.shutdown.clone();

        Ok(Self {
            context,
            publisher,
            flusher,
            state: StateCell::new(),
            deadlines,
            drain_token: None,
        })
    }

    /// Token cancelled at the start of the sequence so auxiliary tasks (the
    /// scrape server, the log forwarder) stand down before the process exits
    pub fn with_drain_token(mut self, token: CancellationToken) -> Self {
        self.drain_token = Some(token);
        self
    }

    pub fn state(&self) -> ShutdownState {
        self.state.get()
    }

    /// Production entry point: runs the sequence and terminates the process.
    /// Secondary triggers return after a log line; the primary never returns.
    pub async fn trigger(&self, event: FailureEvent) {
        if self.state.get() == ShutdownState::Idle {
            // Hard stop on a plain thread: even a wedged runtime cannot hold
            // the process open past the watchdog plus margin. A sequence that
            // could not complete cleanly exits on the fatal-path code.
            let bound = self.deadlines.watchdog() + HARD_STOP_MARGIN;
            std::thread::spawn(move || {
                std::thread::sleep(bound);
                std::process::exit(1);
            });
        }

        if let Some(code) = self.begin(event).await {
            std::process::exit(code);
        }
    }

    /// Run the shutdown sequence without touching the process boundary.
    /// Returns `None` for secondary triggers, `Some(exit_code)` once the
    /// sequence (or its watchdog) has finished.
    pub async fn begin(&self, event: FailureEvent) -> Option<i32> {
        if !self.state.try_begin() {
            warn!(
                "Secondary fatal trigger ignored, shutdown already underway: {} ({:?})",
                event.kind.reason(),
                event.occurred_at
            );
            return None;
        }

        // Capture the original diagnostic before anything that could fail
        self.log_failure(&event);

        let code = exit_code(event.kind);

        // In-memory capture comes first and cannot stall
        self.context.metrics().record(&event);

        if let Some(token) = &self.drain_token {
            token.cancel();
        }

        let sequence = async {
            if let Err(e) = self.publisher.push(self.deadlines.publish_deadline()).await {
                warn!("Metrics publish failed during shutdown: {}", e);
            }
            self.flusher
                .flush(
                    self.deadlines.flush_deadline(),
                    self.deadlines.transport_grace(),
                )
                .await;
        };

        if timeout(self.deadlines.watchdog(), sequence).await.is_err() {
            warn!(
                "Shutdown watchdog expired after {:?}; exiting with code {}",
                self.deadlines.watchdog(),
                code
            );
        }

        self.state.complete();
        info!("Shutdown sequence complete, exit code {}", code);
        Some(code)
    }

    /// Log the fatal event in full, backtrace included, before any telemetry
    /// step runs
    fn log_failure(&self, event: &FailureEvent) {
        match event.kind {
            FailureKind::Interrupt | FailureKind::Terminate => {
                let signal = event.signal.as_deref().unwrap_or("signal");
                info!("Received {}, beginning telemetry flush", signal);
            }
            FailureKind::Panic | FailureKind::TaskFailure => match &event.error {
                Some(info) => {
                    error!("Fatal {}: {}", event.kind.reason(), info.message);
                    if let Some(backtrace) = &info.backtrace {
                        error!("Backtrace:\n{}", backtrace);
                    }
                }
                None => error!("Fatal {} with no captured error", event.kind.reason()),
            },
        }
    }
}

/// Exit code for a trigger kind: signals terminate cleanly, fatal errors
/// do not
fn exit_code(kind: FailureKind) -> i32 {
    match kind {
        FailureKind::Interrupt | FailureKind::Terminate => 0,
        FailureKind::Panic | FailureKind::TaskFailure => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlackboxConfig;
    use crate::error::Result;
    use crate::transport::{LogRecord, LogTransport, TransportSet};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::time::Instant;

    struct FlushProbe {
        flushed: AtomicBool,
    }

    impl FlushProbe {
        fn new() -> Self {
            Self {
                flushed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl LogTransport for FlushProbe {
        fn name(&self) -> &str {
            "probe"
        }

        fn emit(&self, _record: LogRecord) {}

        async fn flush(&self) -> Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StuckTransport;

    #[async_trait]
    impl LogTransport for StuckTransport {
        fn name(&self) -> &str {
            "stuck"
        }

        fn emit(&self, _record: LogRecord) {}

        async fn flush(&self) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn test_config(gateway: &str) -> BlackboxConfig {
        let mut config = BlackboxConfig::default();
        config.service.name = "testsvc".to_string();
        config.service.instance = "test-1".to_string();
        config.push.gateway_url = gateway.to_string();
        config.shutdown.publish_deadline_ms = 500;
        config.shutdown.flush_deadline_ms = 500;
        config.shutdown.transport_grace_ms = 50;
        config.shutdown.watchdog_ms = 2000;
        config
    }

    fn build(
        gateway: &str,
        transports: Arc<TransportSet>,
    ) -> (Arc<ShutdownCoordinator>, Arc<ObservabilityContext>) {
        let context = Arc::new(
            ObservabilityContext::new(test_config(gateway), transports).expect("build context"),
        );
        let coordinator =
            Arc::new(ShutdownCoordinator::new(Arc::clone(&context)).expect("build coordinator"));
        (coordinator, context)
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(FailureKind::Interrupt), 0);
        assert_eq!(exit_code(FailureKind::Terminate), 0);
        assert_eq!(exit_code(FailureKind::Panic), 1);
        assert_eq!(exit_code(FailureKind::TaskFailure), 1);
    }

    #[tokio::test]
    async fn test_panic_runs_full_sequence() {
        let mut server = mockito::Server::new_async().await;
        let push = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .match_body(mockito::Matcher::Regex("reason=\"panic\"".to_string()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let transports = Arc::new(TransportSet::default());
        let probe = Arc::new(FlushProbe::new());
        transports.register(probe.clone());

        let (coordinator, context) = build(&server.url(), transports);
        assert_eq!(coordinator.state(), ShutdownState::Idle);

        let event = FailureEvent::from_panic("boom".to_string(), None, String::new());
        let code = coordinator.begin(event.clone()).await;

        assert_eq!(code, Some(1));
        assert_eq!(coordinator.state(), ShutdownState::Completed);
        assert_eq!(context.metrics().crash_count("panic"), 1);
        assert_eq!(
            context.metrics().last_exit("panic"),
            event.occurred_at.timestamp()
        );
        assert!(probe.flushed.load(Ordering::SeqCst));
        push.assert_async().await;
    }

    #[tokio::test]
    async fn test_sigterm_exits_cleanly() {
        let mut server = mockito::Server::new_async().await;
        let push = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .match_body(mockito::Matcher::Regex("reason=\"SIGTERM\"".to_string()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let (coordinator, context) = build(&server.url(), Arc::new(TransportSet::default()));

        let code = coordinator
            .begin(FailureEvent::from_signal(FailureKind::Terminate, "SIGTERM"))
            .await;

        assert_eq!(code, Some(0));
        assert_eq!(context.metrics().crash_count("SIGTERM"), 1);
        push.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_skip_flush() {
        let mut server = mockito::Server::new_async().await;
        let _push = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .with_status(500)
            .create_async()
            .await;

        let transports = Arc::new(TransportSet::default());
        let probe = Arc::new(FlushProbe::new());
        transports.register(probe.clone());

        let (coordinator, _context) = build(&server.url(), transports);

        let code = coordinator
            .begin(FailureEvent::from_panic("boom".to_string(), None, String::new()))
            .await;

        // Exit code still comes from the trigger kind, and the flush ran
        assert_eq!(code, Some(1));
        assert!(probe.flushed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_one_sequence() {
        let mut server = mockito::Server::new_async().await;
        let push = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let (coordinator, context) = build(&server.url(), Arc::new(TransportSet::default()));

        let first = FailureEvent::from_panic("first".to_string(), None, String::new());
        let second = FailureEvent::from_panic("second".to_string(), None, String::new());
        let (a, b) = tokio::join!(coordinator.begin(first), coordinator.begin(second));

        // Exactly one trigger won the race; the other was logged and dropped
        assert!(a.is_some() ^ b.is_some());
        assert_eq!(context.metrics().crash_count("panic"), 1);
        push.assert_async().await;
    }

    #[tokio::test]
    async fn test_trigger_after_completion_is_secondary() {
        let mut server = mockito::Server::new_async().await;
        let _push = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .with_status(200)
            .create_async()
            .await;

        let (coordinator, _context) = build(&server.url(), Arc::new(TransportSet::default()));

        let code = coordinator
            .begin(FailureEvent::from_signal(FailureKind::Interrupt, "SIGINT"))
            .await;
        assert_eq!(code, Some(0));

        let late = coordinator
            .begin(FailureEvent::from_panic("late".to_string(), None, String::new()))
            .await;
        assert_eq!(late, None);
        assert_eq!(coordinator.state(), ShutdownState::Completed);
    }

    #[tokio::test]
    async fn test_watchdog_bounds_a_stuck_sequence() {
        let mut server = mockito::Server::new_async().await;
        let _push = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .with_status(200)
            .create_async()
            .await;

        let transports = Arc::new(TransportSet::default());
        transports.register(Arc::new(StuckTransport));

        let mut config = test_config(&server.url());
        // Flush would block for 10s; the watchdog cuts the sequence at 200ms
        config.shutdown.flush_deadline_ms = 10_000;
        config.shutdown.watchdog_ms = 200;

        let context =
            Arc::new(ObservabilityContext::new(config, transports).expect("build context"));
        let coordinator =
            ShutdownCoordinator::new(Arc::clone(&context)).expect("build coordinator");

        let started = Instant::now();
        let code = coordinator
            .begin(FailureEvent::from_signal(FailureKind::Terminate, "SIGTERM"))
            .await;

        assert_eq!(code, Some(0));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(coordinator.state(), ShutdownState::Completed);
    }

    #[tokio::test]
    async fn test_drain_token_cancelled_at_sequence_start() {
        let mut server = mockito::Server::new_async().await;
        let _push = server
            .mock("PUT", "/metrics/job/testsvc/instance/test-1")
            .with_status(200)
            .create_async()
            .await;

        let token = CancellationToken::new();
        let context = Arc::new(
            ObservabilityContext::new(
                test_config(&server.url()),
                Arc::new(TransportSet::default()),
            )
            .expect("build context"),
        );
        let coordinator = ShutdownCoordinator::new(Arc::clone(&context))
            .expect("build coordinator")
            .with_drain_token(token.clone());

        coordinator
            .begin(FailureEvent::from_signal(FailureKind::Interrupt, "SIGINT"))
            .await;

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_unreachable_aggregator_is_swallowed() {
        // Bind-and-drop leaves a port with no listener
        let server = mockito::Server::new_async().await;
        let url = server.url();
        drop(server);

        let transports = Arc::new(TransportSet::default());
        let probe = Arc::new(FlushProbe::new());
        transports.register(probe.clone());

        let (coordinator, context) = build(&url, transports);

        let code = coordinator
            .begin(FailureEvent::from_task_error(&anyhow::anyhow!("db gone")))
            .await;

        assert_eq!(code, Some(1));
        assert_eq!(context.metrics().crash_count("task_failure"), 1);
        assert!(probe.flushed.load(Ordering::SeqCst));
    }
}
