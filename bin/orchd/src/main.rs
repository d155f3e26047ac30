//! ---
//! orch_section: "05-daemon"
//! orch_subsection: "binary"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Binary entrypoint for the orchestrator daemon."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use orch_api::{spawn_api_server, ApiServer, ApiState};
use orch_common::{init_tracing, AppConfig, LogFormat};
use orch_core::Orchestrator;
use orch_metrics::{new_registry, spawn_http_server, DaemonMetrics, EngineMetrics};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["configs/orchd.toml", "configs/orchd.example.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    version = env!("CARGO_PKG_VERSION"),
    about = "Platform orchestrator daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured stdout log format")]
    log_format: Option<CliLogFormat>,

    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 30,
        help = "Upper bound on waiting for in-flight work during shutdown"
    )]
    shutdown_grace_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Commands {
    #[command(about = "Run the orchestrator")]
    Run,
    #[command(about = "Load and validate configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let candidates: Vec<PathBuf> = match &cli.config {
        Some(path) => vec![path.clone()],
        None => DEFAULT_CONFIG_CANDIDATES.into_iter().map(PathBuf::from).collect(),
    };

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded_config.config;
    let config_path = loaded_config.source;
    let load_duration = load_started.elapsed();

    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!(
                "configuration OK: {} ({} providers, metrics {}, api {})",
                config_path.display(),
                config.providers.len(),
                enabled_label(config.metrics.enabled),
                enabled_label(config.api.enabled),
            );
        }
        Commands::Run => {
            init_tracing("orchd", &config.logging)?;
            info!(config_path = %config_path.display(), "configuration loaded");
            run_daemon(
                config,
                load_duration,
                Duration::from_secs(cli.shutdown_grace_secs),
            )
            .await?
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, load_duration: Duration, grace: Duration) -> Result<()> {
    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"));
    let engine_metrics = EngineMetrics::new(metrics_registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let orchestrator = Arc::new(Orchestrator::from_config(&config, Some(engine_metrics))?);
    info!(
        providers = orchestrator.provider_registry().len(),
        execution_timeout_secs = config.engine.execution_timeout.map(|t| t.as_secs()),
        serialize_resource_operations = config.engine.serialize_resource_operations,
        retry_attempts = config.engine.retry.max_attempts,
        "orchestration engine ready"
    );

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        match spawn_api_server(ApiState::new(orchestrator.clone()), config.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    let engine = orchestrator.engine();
    let in_flight = engine.in_flight();
    if in_flight > 0 {
        info!(in_flight, grace_secs = grace.as_secs(), "waiting for background work");
        if tokio::time::timeout(grace, engine.wait_idle()).await.is_err() {
            warn!(
                in_flight = engine.in_flight(),
                "grace period elapsed; remaining work will be failed on exit"
            );
        }
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

fn enabled_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run() {
        let cli = Cli::try_parse_from(["orchd"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.shutdown_grace_secs, 30);
        assert!(cli.log_format.is_none());
    }

    #[test]
    fn parses_overrides_and_subcommand() {
        let cli = Cli::try_parse_from([
            "orchd",
            "--config",
            "configs/orchd.example.toml",
            "--log-format",
            "pretty",
            "check-config",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("configs/orchd.example.toml")));
        assert_eq!(LogFormat::from(cli.log_format.unwrap()), LogFormat::Pretty);
        assert_eq!(cli.command, Some(Commands::CheckConfig));
    }
}
