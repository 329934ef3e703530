use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use blackbox::{
    BlackboxConfig, ConsoleTransport, FatalEventSink, LogTransport, LokiTransport,
    ObservabilityContext, ScrapeServer, ShutdownCoordinator, TransportLayer, TransportSet,
};

#[derive(Parser, Debug)]
#[command(name = "blackbox")]
#[command(about = "Crash-telemetry flush coordinator")]
#[command(version)]
#[command(long_about = "Records crash metrics, publishes the metrics snapshot to a push \
gateway and drains buffered log transports before terminating the process with a \
deterministic exit code. Exposes the registry on a scrape endpoint while running.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "blackbox.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the service")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - wire everything up but don't serve
    #[arg(long, help = "Perform dry run - build all components but don't start them")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // The transport set exists before logging so the transport layer can tee
    // warn/error events into it from the first line onward
    let transports = Arc::new(TransportSet::default());
    let _log_guard = init_logging(&args, Arc::clone(&transports))?;

    info!("Starting blackbox v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let config = match BlackboxConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Validate configuration if requested
    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    // Build the process-lifetime observability context
    let context = Arc::new(ObservabilityContext::new(
        config.clone(),
        Arc::clone(&transports),
    )?);

    // Register log transports: remote sink plus the stdout JSON mirror
    let loki = Arc::new(LokiTransport::new(&config)?);
    context.register_transport(Arc::clone(&loki) as Arc<dyn LogTransport>);
    let (console, _console_guard) = ConsoleTransport::new();
    context.register_transport(Arc::new(console));

    // Handle dry run mode
    if args.dry_run {
        info!("Dry run mode - components built but not started");
        println!("✓ Dry run completed successfully - all components built");
        return Ok(());
    }

    let drain_token = CancellationToken::new();

    // Background forwarder ships buffered log records on an interval
    let _forwarder = Arc::clone(&loki).spawn_forwarder(
        Duration::from_millis(config.loki.forward_interval_ms),
        drain_token.child_token(),
    );

    // Scrape endpoint serves the registry until the shutdown sequence begins
    let scrape_server = ScrapeServer::new(config.scrape.clone(), Arc::clone(&context));
    let scrape_token = drain_token.child_token();
    tokio::spawn(async move {
        if let Err(e) = scrape_server.start(scrape_token).await {
            error!("Scrape server error: {}", e);
        }
    });

    // Coordinator owns the one-way shutdown sequence and the process exit
    let coordinator = Arc::new(
        ShutdownCoordinator::new(Arc::clone(&context))?.with_drain_token(drain_token),
    );

    // Fatal trigger sources: panic hook, signals, task-failure reports
    let _failure_reporter = FatalEventSink::install(Arc::clone(&coordinator));

    info!(
        "blackbox is running: service={} instance={}",
        config.service.name, config.service.instance
    );

    // The coordinator terminates the process; this task just parks
    futures::future::pending::<()>().await;
    Ok(())
}

fn init_logging(args: &Args, transports: Arc<TransportSet>) -> Result<WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    // Create environment filter
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("blackbox={}", log_level)));

    // Human-readable logs go to stderr through the non-blocking appender
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    // Configure format based on options
    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(writer)
            .boxed(),
        Some("pretty") => fmt::layer()
            .pretty()
            .with_target(true)
            .with_writer(writer)
            .boxed(),
        None => fmt::layer().with_target(true).with_writer(writer).boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).with_writer(writer).boxed()
        }
    };

    // Initialize subscriber with the transport tee layer
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(TransportLayer::new(transports))
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Blackbox Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    match toml::to_string_pretty(&BlackboxConfig::default()) {
        Ok(rendered) => println!("{}", rendered),
        Err(e) => eprintln!("Failed to render default configuration: {}", e),
    }
}
