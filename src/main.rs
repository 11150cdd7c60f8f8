//! Lookalike CLI
//!
//! Command-line interface for running the similarity lookup service.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lookalike::{metrics, ApiServer, AppState, PipelineBuilder, Result, ServiceConfig};

#[derive(Parser)]
#[command(name = "lookalike")]
#[command(author, version, about = "Visual-similarity lookup service", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },

    /// Start the lookup API
    Start {
        /// HTTP API listen address
        #[arg(long)]
        api_addr: Option<String>,

        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => {
            info!("Writing default configuration to: {}", output);
            ServiceConfig::default().save(&output)?;
            info!("Configuration saved; set region, endpoints and bucket before starting");
        }

        Commands::Start {
            api_addr,
            metrics_addr,
        } => {
            let mut config = if Path::new(&cli.config).exists() {
                info!("Loading configuration from: {}", cli.config);
                ServiceConfig::load(&cli.config)?
            } else {
                info!("No configuration file, using defaults and environment");
                ServiceConfig::default()
            };
            config.apply_env();
            if let Some(addr) = api_addr {
                config.api.listen_address = addr;
            }
            if let Some(addr) = metrics_addr {
                config.metrics.enabled = true;
                config.metrics.listen_address = addr.to_string();
            }
            config.validate()?;

            if config.metrics.enabled {
                let addr: SocketAddr = config
                    .metrics
                    .listen_address
                    .parse()
                    .map_err(|e| lookalike::Error::Config(format!("metrics address: {}", e)))?;
                metrics::install_exporter(addr)?;
                info!("Metrics available at http://{}/metrics", addr);
            }

            let pipeline = PipelineBuilder::connect(&config).await?.build()?;
            info!(?pipeline, "Pipeline ready");

            let state = AppState::new(pipeline, config.api.max_neighbors);
            let server = ApiServer::with_state(config.api.clone(), state);

            server
                .run_until(async {
                    if let Err(e) = signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                    info!("Received shutdown signal");
                })
                .await?;
            info!("Server stopped");
        }
    }

    Ok(())
}
