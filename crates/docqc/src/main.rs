use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};

use docqc::config::{default_config_path, load_config, resolve_api_key};
use docqc::error::ConfigError;
use docqc::pipeline::engine_profile_dir;
use docqc::{
    init_logging, Database, DocQcError, HttpQcApi, NoopCheck, Pipeline, PipelineDeps,
    SofficeEngine,
};

/// Watches folders for documents, converts them and submits them for remote QC.
#[derive(Parser, Debug)]
#[command(name = "docqc", version, about)]
struct Cli {
    /// Path to the JSON config file (default: ~/.docqc/docqc.json).
    #[arg(short, long, env = "DOCQC_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `logging.level` from the config.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("docqc: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), DocQcError> {
    let config_path = cli
        .config
        .or_else(default_config_path)
        .ok_or_else(|| ConfigError::Validation {
            message: "could not determine the config path; pass --config".to_string(),
        })?;
    let config = load_config(&config_path)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, config.logging.json)?;
    info!(
        "Starting docqc v{} with config {}",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let database_path = config
        .database_file()
        .ok_or_else(|| ConfigError::Validation {
            message: "could not determine the database path; set database_path".to_string(),
        })?;
    let database = Database::open(&database_path)?;

    let api_key = resolve_api_key(&config.api)?;
    if api_key.is_none() {
        info!("No API key configured, requests are sent unauthenticated");
    }
    let api = HttpQcApi::from_config(&config.api, api_key)?;

    let engine = SofficeEngine::new(
        PathBuf::from(&config.conversion.engine_binary),
        config.conversion.process_name.clone(),
        engine_profile_dir(&config),
    );

    let pipeline = Pipeline::start(
        &config,
        PipelineDeps {
            database,
            engine: Box::new(engine),
            api: Arc::new(api),
            check: Arc::new(NoopCheck),
        },
    )?;

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || signal.notify_one()) {
        error!("Failed to install signal handler: {}", e);
    }

    shutdown.notified().await;
    info!("Received shutdown signal");
    pipeline.shutdown().await;
    Ok(())
}
