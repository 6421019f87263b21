//! mqgate - embeddable MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   mqgate [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Configuration file path
//!   -b, --bind <ADDR>           Bind address (default: 0.0.0.0:1883)
//!   -p, --port <PORT>           Override only the bind port
//!   -w, --workers <N>           Number of worker threads (default: CPU count)
//!   --max-payload-size <N>      Maximum inbound packet size (default: 256KB)
//!   --report-interval <DUR>     Log the metrics report periodically (e.g. 30s)
//!   --metrics-bind <ADDR>       Serve /metrics and /report on this address
//!   -l, --log-level             Log level (error, warn, info, debug, trace)
//!   -h, --help                  Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mqgate::broker::Broker;
use mqgate::config::Config;
use mqgate::metrics::MetricsServer;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// mqgate - embeddable MQTT broker
#[derive(Parser, Debug)]
#[command(name = "mqgate")]
#[command(author = "mqgate Contributors")]
#[command(version)]
#[command(about = "MQTT v3.1/v3.1.1 broker with clean sessions, Last Will and live metrics")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// TCP port (keeps the configured bind host)
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of worker threads (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum inbound packet size in bytes
    #[arg(long)]
    max_payload_size: Option<usize>,

    /// Interval for logging the metrics report
    #[arg(long, value_parser = parse_duration)]
    report_interval: Option<Duration>,

    /// Enable the HTTP metrics endpoint on this address
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Missing file means defaults; environment overrides apply either way
    let mut file_config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Error loading configuration: {}", e);
        std::process::exit(1);
    });

    // Setup logging - CLI overrides RUST_LOG, RUST_LOG overrides config
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.to_tracing_level().as_str()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(file_config.log.level.to_lowercase())),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(bind) = args.bind {
        file_config.server.bind = bind;
    }
    if let Some(port) = args.port {
        file_config.server.bind.set_port(port);
    }
    if let Some(workers) = args.workers {
        file_config.server.workers = workers;
    }
    if let Some(size) = args.max_payload_size {
        file_config.limits.max_payload_size = size;
    }
    if args.report_interval.is_some() {
        file_config.metrics.report_interval = args.report_interval;
    }
    if let Some(bind) = args.metrics_bind {
        file_config.metrics.enabled = true;
        file_config.metrics.bind = bind;
    }
    if let Err(e) = file_config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let broker_config = file_config.broker_config();

    info!("Starting mqgate MQTT broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Workers: {}", broker_config.num_workers);
    info!("  Max payload size: {} bytes", broker_config.max_payload_size);
    info!("  Connect timeout: {:?}", broker_config.connect_timeout);
    match broker_config.report_interval {
        Some(interval) => info!("  Metrics report: every {:?}", interval),
        None => info!("  Metrics report: disabled"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(broker_config.num_workers)
        .thread_name("mqgate-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let broker = Arc::new(Broker::new(broker_config));

        if file_config.metrics.enabled {
            let server = MetricsServer::new(broker.metrics().clone(), file_config.metrics.bind)
                .with_top_topics(file_config.metrics.top_topics);
            let shutdown = broker.shutdown_signal();
            tokio::spawn(async move {
                if let Err(e) = server.run(shutdown).await {
                    error!("Metrics server error: {}", e);
                }
            });
        }

        let signal_broker = broker.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                signal_broker.shutdown();
            }
        });

        broker.run().await?;
        info!("\n{}", broker.metrics_report());
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
