use crate::coordinator::ShutdownCoordinator;
use chrono::{DateTime, Utc};
use std::backtrace::Backtrace;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

/// Kind of process-fatal trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A panic reached the process panic hook
    Panic,
    /// A spawned task reported an unrecoverable error
    TaskFailure,
    /// Interrupt signal (Ctrl+C)
    Interrupt,
    /// Termination signal (systemd stop)
    Terminate,
}

impl FailureKind {
    /// Metric label value for this kind
    pub fn reason(&self) -> &'static str {
        match self {
            FailureKind::Panic => "panic",
            FailureKind::TaskFailure => "task_failure",
            FailureKind::Interrupt => "SIGINT",
            FailureKind::Terminate => "SIGTERM",
        }
    }
}

/// Details of the error behind a fatal trigger
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub backtrace: Option<String>,
}

/// A normalized process-fatal event, immutable once constructed
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub kind: FailureKind,
    pub occurred_at: DateTime<Utc>,
    pub error: Option<ErrorInfo>,
    pub signal: Option<String>,
}

impl FailureEvent {
    /// Event for a received process signal
    pub fn from_signal(kind: FailureKind, name: &str) -> Self {
        Self {
            kind,
            occurred_at: Utc::now(),
            error: None,
            signal: Some(name.to_string()),
        }
    }

    /// Event for a panic caught by the process panic hook
    pub fn from_panic(message: String, location: Option<String>, backtrace: String) -> Self {
        let message = match location {
            Some(location) => format!("panicked at {}: {}", location, message),
            None => message,
        };
        Self {
            kind: FailureKind::Panic,
            occurred_at: Utc::now(),
            error: Some(ErrorInfo {
                name: "panic".to_string(),
                message,
                backtrace: if backtrace.is_empty() {
                    None
                } else {
                    Some(backtrace)
                },
            }),
            signal: None,
        }
    }

    /// Event for an unrecoverable error reported by a spawned task
    pub fn from_task_error(error: &anyhow::Error) -> Self {
        Self {
            kind: FailureKind::TaskFailure,
            occurred_at: Utc::now(),
            error: Some(ErrorInfo {
                name: "task_failure".to_string(),
                message: format!("{:#}", error),
                backtrace: Some(Backtrace::force_capture().to_string()),
            }),
            signal: None,
        }
    }
}

/// Cloneable handle that application tasks use to surface unrecoverable errors
#[derive(Clone)]
pub struct FailureReporter {
    sender: mpsc::UnboundedSender<FailureEvent>,
}

impl FailureReporter {
    /// Report an unrecoverable task error; triggers the shutdown sequence
    pub fn report(&self, error: anyhow::Error) {
        let event = FailureEvent::from_task_error(&error);
        if self.sender.send(event).is_err() {
            last_resort(&format!("task failure after event channel closed: {:#}", error));
        }
    }
}

/// Subscribes to the process-fatal trigger sources and forwards normalized
/// events to the shutdown coordinator. Nothing on these paths may propagate
/// an error back into a trigger source; internal failures go straight to
/// stderr instead of the structured logger.
pub struct FatalEventSink;

impl FatalEventSink {
    /// Install the panic hook, signal listeners and the failure event pump.
    /// Returns the reporter handle for application tasks.
    pub fn install(coordinator: Arc<ShutdownCoordinator>) -> FailureReporter {
        let (sender, mut receiver) = mpsc::unbounded_channel::<FailureEvent>();

        // Panic hook: runs on the panicking thread and cannot await, so it
        // forwards through the channel to the pump task below. The previous
        // hook still runs, keeping the default panic report on stderr.
        let panic_sender = sender.clone();
        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info.payload());
            let location = info.location().map(|l| l.to_string());
            let backtrace = Backtrace::force_capture().to_string();
            let event = FailureEvent::from_panic(message, location, backtrace);
            if panic_sender.send(event).is_err() {
                last_resort(&format!("panic after event channel closed: {}", info));
            }
            previous_hook(info);
        }));

        // Pump: delivers panic and task-failure events to the coordinator
        let pump_coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                pump_coordinator.trigger(event).await;
            }
        });

        Self::spawn_signal_listeners(coordinator);

        FailureReporter { sender }
    }

    /// Spawn listener tasks for the termination and interrupt signals
    fn spawn_signal_listeners(coordinator: Arc<ShutdownCoordinator>) {
        // Handle SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            let coordinator_sigterm = Arc::clone(&coordinator);
            tokio::spawn(async move {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        if stream.recv().await.is_some() {
                            info!("Received SIGTERM signal");
                            coordinator_sigterm
                                .trigger(FailureEvent::from_signal(
                                    FailureKind::Terminate,
                                    "SIGTERM",
                                ))
                                .await;
                        }
                    }
                    Err(e) => {
                        last_resort(&format!("failed to register SIGTERM handler: {}", e))
                    }
                }
            });
        }

        // Handle SIGINT (Ctrl+C) - Cross-platform
        let coordinator_sigint = Arc::clone(&coordinator);
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT signal (Ctrl+C)");
                    coordinator_sigint
                        .trigger(FailureEvent::from_signal(FailureKind::Interrupt, "SIGINT"))
                        .await;
                }
                Err(e) => last_resort(&format!("failed to register SIGINT handler: {}", e)),
            }
        });
    }
}

/// Stringify a panic payload; non-string payloads get a synthetic description
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Last-resort channel for failures inside the fatal path itself: a direct
/// stderr write that cannot recurse into the structured logger.
pub(crate) fn last_resort(message: &str) {
    eprintln!("blackbox: {}", message);
}
