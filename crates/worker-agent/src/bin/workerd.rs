//! Main binary for the inference worker daemon (workerd)

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use worker_agent::{init_logging, Agent, AgentConfig, AgentError, Result};

#[derive(Parser)]
#[command(name = "workerd")]
#[command(about = "Inference worker daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker
    Start {
        /// Override configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start { ref config }) => {
            let config_path = config.clone().or(cli.config.clone());
            start_worker(config_path, &cli).await
        }
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => {
            let config_path = cli.config.clone();
            start_worker(config_path, &cli).await
        }
    }
}

async fn start_worker(config_path: Option<PathBuf>, cli: &Cli) -> Result<()> {
    let mut config = AgentConfig::load(config_path.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    init_logging(&config.logging)?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("Using default configuration"),
    }

    let agent = Agent::from_config(config)?;
    info!(worker = %agent.pool().worker(), "Starting worker");

    if let Err(e) = agent.run().await {
        error!(error = %e, "Worker failed");
        std::process::exit(1);
    }
    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        let yaml = serde_yaml::to_string(&config)
            .map_err(|e| AgentError::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", yaml);
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = AgentConfig::load(Some(config_path.as_path()))?;
    config.validate()?;

    println!("Configuration is valid");
    println!("Worker: {}", config.worker.worker.id);
    println!("API: {}", config.server.bind_addr);
    println!("Model repository: {}", config.worker.storage.model_repository);
    println!("Models:");
    for model in &config.models {
        println!("  - {} ({})", model.variant, model.framework);
    }

    Ok(())
}
