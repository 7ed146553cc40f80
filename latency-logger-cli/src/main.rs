use std::{io, path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use latency_logger::prelude::*;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Monitor URL request latency.
#[derive(Debug, Parser)]
#[command(name = "latency-logger", version)]
struct Args {
    /// File of `interval,url` lines, with the interval in seconds
    #[arg(value_name = "FILE")]
    targets: PathBuf,

    /// Number of workers
    #[arg(
        short = 'W',
        long,
        value_name = "N",
        env = "LATENCY_LOGGER_WORKERS",
        default_value_t = MonitorConfig::DEFAULT_WORKERS
    )]
    workers: usize,

    /// Maximum number of checks waiting for a worker
    #[arg(short = 'Q', long, value_name = "N", default_value_t = MonitorConfig::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Seconds before a check is abandoned
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    request_timeout: u64,

    /// Seconds before a connection attempt is abandoned
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    connect_timeout: u64,

    /// Longest time any component waits before re-checking for shutdown
    #[arg(
        long,
        value_name = "MILLISECONDS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval_ms: u64,

    /// Append records to this file instead of writing them to standard output
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    #[cfg(feature = "kafka")]
    #[command(flatten)]
    kafka: KafkaArgs,
}

#[cfg(feature = "kafka")]
#[derive(Debug, clap::Args)]
struct KafkaArgs {
    /// Produce records to this Kafka cluster instead of writing JSON lines
    #[arg(long, value_name = "HOSTS", env = "KAFKA_BOOTSTRAP_SERVERS")]
    kafka_bootstrap_servers: Option<String>,

    #[arg(long, value_name = "TOPIC", env = "KAFKA_TOPIC", default_value = "latency")]
    kafka_topic: String,

    #[arg(long, value_name = "ID", default_value = "latency-logger")]
    kafka_client_id: String,

    /// CA certificate used to verify the brokers
    #[arg(
        long,
        value_name = "PATH",
        env = "KAFKA_CA_CERT",
        requires_all = ["kafka_ssl_certificate", "kafka_ssl_key"]
    )]
    kafka_ssl_ca: Option<String>,

    #[arg(long, value_name = "PATH", env = "KAFKA_AUTH_CERT", requires = "kafka_ssl_ca")]
    kafka_ssl_certificate: Option<String>,

    #[arg(long, value_name = "PATH", env = "KAFKA_AUTH_KEY", requires = "kafka_ssl_ca")]
    kafka_ssl_key: Option<String>,

    /// Seconds to wait for the brokers to acknowledge a record
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    kafka_delivery_timeout: u64,
}

#[cfg(feature = "kafka")]
impl KafkaArgs {
    fn config(&self) -> Option<KafkaConfig> {
        let bootstrap_servers = self.kafka_bootstrap_servers.clone()?;
        let ssl = match (
            &self.kafka_ssl_ca,
            &self.kafka_ssl_certificate,
            &self.kafka_ssl_key,
        ) {
            (Some(ca), Some(certificate), Some(key)) => Some(KafkaSsl {
                ca_location: ca.clone(),
                certificate_location: certificate.clone(),
                key_location: key.clone(),
            }),
            _ => None,
        };
        Some(KafkaConfig {
            bootstrap_servers,
            topic: self.kafka_topic.clone(),
            client_id: self.kafka_client_id.clone(),
            ssl,
            delivery_timeout: Duration::from_secs(self.kafka_delivery_timeout),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    let targets = match load_targets(&args.targets) {
        Ok(targets) => targets,
        Err(error) => {
            tracing::error!(path = %args.targets.display(), ?error, "Invalid targets file: {error}");
            return ExitCode::FAILURE;
        }
    };
    let config = match MonitorConfig::new(
        args.queue_capacity,
        args.workers,
        Duration::from_millis(args.poll_interval_ms),
    ) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(?error, "Invalid configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    let probe = match ReqwestProbe::new(
        Duration::from_secs(args.request_timeout),
        Duration::from_secs(args.connect_timeout),
    ) {
        Ok(probe) => probe,
        Err(error) => {
            tracing::error!(?error, "Failed to build HTTP client: {error}");
            return ExitCode::FAILURE;
        }
    };

    let signals = match Signals::new() {
        Ok(signals) => signals,
        Err(error) => {
            tracing::error!(?error, "Failed to listen for signals: {error}");
            return ExitCode::FAILURE;
        }
    };
    let shutdown = ShutdownSignal::new();
    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(error) = forward_signals(shutdown, signals).await {
                tracing::error!(?error, "Failed to listen for signals: {error}");
            }
        }
    });

    #[cfg(feature = "kafka")]
    {
        if let Some(kafka) = args.kafka.config() {
            let code = match KafkaPublisher::new(&kafka).await {
                Ok(publisher) => run(targets, config, probe, publisher, None, shutdown).await,
                Err(error) => {
                    tracing::error!(?error, "Failed to connect to Kafka: {error}");
                    ExitCode::FAILURE
                }
            };
            signals.abort();
            return code;
        }
    }

    let code = match json_lines(args.output.as_ref()).await {
        Ok((publisher, writer)) => {
            run(targets, config, probe, publisher, Some(writer), shutdown).await
        }
        Err(error) => {
            tracing::error!(?error, "Failed to open output: {error}");
            ExitCode::FAILURE
        }
    };
    signals.abort();
    code
}

async fn json_lines(
    output: Option<&PathBuf>,
) -> io::Result<(JsonLinesPublisher, JoinHandle<io::Result<()>>)> {
    match output {
        Some(path) => JsonLinesPublisher::append_to(path, JsonLinesPublisher::DEFAULT_BUFFER).await,
        None => Ok(JsonLinesPublisher::stdout(JsonLinesPublisher::DEFAULT_BUFFER)),
    }
}

async fn run<B>(
    targets: Vec<Target>,
    config: MonitorConfig,
    probe: ReqwestProbe,
    publisher: B,
    writer: Option<JoinHandle<io::Result<()>>>,
    shutdown: ShutdownSignal,
) -> ExitCode
where
    B: Publisher + Send + Sync + 'static,
{
    let monitor = match Monitor::new(targets, config, probe, publisher) {
        Ok(monitor) => monitor,
        Err(error) => {
            tracing::error!(?error, "Invalid configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    let result = monitor.run(shutdown).await;

    // The writer finishes once the last publisher clone, owned by the monitor, is dropped.
    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::error!(?error, "Failed to write latency records: {error}"),
            Err(error) => tracing::error!(?error, "Record writer failed: {error}"),
        }
    }

    match result {
        Ok(summary) => {
            tracing::info!(
                dispatched = summary.dispatched,
                processed = summary.processed,
                abandoned = summary.abandoned,
                "Shut down cleanly"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(?error, "{error}");
            ExitCode::FAILURE
        }
    }
}

/// The signals that ask the process to shut down.
struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            )?,
        })
    }

    async fn recv(&mut self) -> io::Result<&'static str> {
        #[cfg(unix)]
        let signal = tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = self.terminate.recv() => Ok("SIGTERM"),
        };
        #[cfg(not(unix))]
        let signal = tokio::signal::ctrl_c().await.map(|()| "Ctrl-C");
        signal
    }
}

/// Triggers `shutdown` on SIGINT or SIGTERM. Later signals are logged and ignored.
async fn forward_signals(shutdown: ShutdownSignal, mut signals: Signals) -> io::Result<()> {
    loop {
        let signal = signals.recv().await?;
        on_signal(&shutdown, signal);
    }
}

/// Returns whether this signal started the shutdown.
fn on_signal(shutdown: &ShutdownSignal, signal: &str) -> bool {
    let first = shutdown.trigger();
    if first {
        tracing::info!(signal, "Received signal, shutting down");
    } else {
        tracing::warn!(signal, "Shutdown already in progress, ignoring signal");
    }
    first
}
