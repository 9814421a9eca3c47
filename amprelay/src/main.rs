mod config;

use clap::{Args, Parser};
use config::{Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "amprelay";

#[derive(Args)]
struct ConfigArgs {
    /// YAML config file. PORT and the API keys are read from the environment on top of it.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(version, about = "Relays events and profile lookups to Amperity")]
enum CliCommand {
    /// Run the relay
    Relay(ConfigArgs),
    /// Load and validate the configuration, then exit
    Validate(ConfigArgs),
}

#[derive(thiserror::Error, Debug)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("invalid sentry dsn: {0}")]
    Sentry(String),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Relay(#[from] relay::errors::RelayError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Relay(args) => run(args),
        CliCommand::Validate(args) => validate(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: ConfigArgs) -> Result<(), StartupError> {
    let config = Config::load(args.config.as_deref())?;

    // Held for the lifetime of the process so buffered events get flushed on exit.
    let _sentry = config
        .common
        .logging
        .as_ref()
        .map(init_sentry)
        .transpose()?;
    init_tracing();

    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!("starting relay");
    rt.block_on(relay::run(config.relay))?;
    tracing::info!("relay stopped");

    Ok(())
}

fn validate(args: ConfigArgs) -> Result<(), StartupError> {
    let config = Config::load(args.config.as_deref())?;
    let relay = &config.relay;

    println!(
        "config ok: relay on {}:{}, admin on {}:{}, upstream {} (tenant {})",
        relay.listener.host,
        relay.listener.port,
        relay.admin_listener.host,
        relay.admin_listener.port,
        relay.upstream.base_url,
        relay.upstream.tenant,
    );
    println!(
        "stream api key: {}, profile api key: {}",
        presence(&relay.credentials.stream_api_key),
        presence(&relay.credentials.profile_api_key),
    );

    Ok(())
}

fn presence(key: &Option<String>) -> &'static str {
    match key {
        Some(_) => "set",
        None => "missing",
    }
}

fn init_sentry(logging: &LoggingConfig) -> Result<sentry::ClientInitGuard, StartupError> {
    let dsn = logging
        .sentry_dsn
        .parse::<sentry::types::Dsn>()
        .map_err(|e| StartupError::Sentry(e.to_string()))?;

    Ok(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_metrics(config: &MetricsConfig) -> Result<(), StartupError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| StartupError::Metrics(e.to_string()))?;

    metrics::set_global_recorder(recorder).map_err(|e| StartupError::Metrics(e.to_string()))?;
    shared::describe_all!(relay::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "sending metrics to statsd"
    );
    Ok(())
}
