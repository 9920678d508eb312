//! custos-agent daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use custos_agent::agent::Agent;
use custos_agent::backend::HttpBackend;
use custos_agent::config::Config;
use custos_agent::lock::LoggingEnforcement;

#[derive(Parser)]
#[command(name = "custos-agent")]
#[command(about = "Persistent device-management agent")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "custos-agent.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "CUSTOS_DATA_DIR")]
    data_dir: Option<String>,

    /// Device ID (overrides config file)
    #[arg(long, env = "CUSTOS_DEVICE_ID")]
    device_id: Option<String>,

    /// Backend base URL (overrides config file)
    #[arg(long, env = "CUSTOS_BACKEND_URL")]
    backend_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("custos_agent=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting custos-agent");
    info!("Config file: {}", cli.config);

    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&content)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(device_id) = cli.device_id {
        config.device.id = device_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.device.data_dir = PathBuf::from(data_dir);
    }
    if let Some(url) = cli.backend_url {
        config.backend.url = url;
    }

    info!("Device ID: {}", config.device.id);
    info!("Data dir: {}", config.device.data_dir.display());

    let backend = Arc::new(HttpBackend::new(
        &config.backend.url,
        &config.backend.api_key,
        &config.device.id,
        std::time::Duration::from_secs(config.backend.request_timeout_secs),
    )?);

    let agent = Arc::new(Agent::start(config, backend, Arc::new(LoggingEnforcement))?);

    let runner = agent.clone();
    tokio::spawn(async move {
        runner.run().await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
