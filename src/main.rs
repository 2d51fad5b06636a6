use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use voicelink_gateway::{ApiServer, Collaborators, Gateway, GatewayConfig};

/// Rotated log files kept on disk
const MAX_LOG_FILES: usize = 7;

/// Voicelink - real-time voice assistant gateway for embedded devices
#[derive(Parser)]
#[command(name = "voicelink", version, about)]
struct Cli {
    /// Address to bind
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// TOML file with session, segmentation, streaming and trigger overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for daily-rotated log files
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "info,voicelink_gateway=info".to_string()),
        1 => "info,voicelink_gateway=debug".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let _guard = match init_logging(&filter, cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Console logging plus an optional daily-rotated file
fn init_logging(filter: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let console = tracing_subscriber::fmt::layer().with_filter(EnvFilter::new(filter));

    let Some(dir) = log_dir else {
        tracing_subscriber::registry().with(console).init();
        return Ok(None);
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("voicelink")
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(EnvFilter::new(filter));

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(Some(guard))
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = GatewayConfig::from_env()?;

    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(path) = &cli.config {
        config.apply_file(path)?;
        config.validate()?;
    }
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    if let Some(Command::CheckConfig) = cli.command {
        println!(
            "configuration ok: listening on {}:{}{}, memory service {}",
            config.server.host,
            config.server.port,
            config.server.ws_path,
            if config.memory_api.is_some() {
                "configured"
            } else {
                "not configured"
            }
        );
        return Ok(());
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        llm_model = %config.openai.llm_model,
        memory = config.memory_api.is_some(),
        "starting voicelink gateway"
    );

    let collaborators = Collaborators::from_config(&config)?;
    let gateway = Arc::new(Gateway::new(&config, collaborators)?);

    ApiServer::new(gateway, &config.server)
        .run(voicelink_gateway::api::shutdown_signal())
        .await?;
    Ok(())
}
