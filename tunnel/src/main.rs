use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tlstun_engine::keycache::{EcdsaKeys, KeyCache};
use tlstun_engine::Service;

mod config;

use config::TlstunConfig;

#[derive(Parser)]
#[command(name = "tlstun")]
#[command(version)]
#[command(about = "TLS tunnel in front of or behind arbitrary TCP services", long_about = None)]
struct Cli {
    /// Configuration file (default: tlstun.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "tlstun=debug,tlstun_engine=debug"
    } else {
        "tlstun=info,tlstun_engine=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let path = match cli.config {
        Some(path) => path,
        None => TlstunConfig::find_config().context("No tlstun.yml found, use --config")?,
    };
    let config = TlstunConfig::load(&path)?;
    info!("Loaded {} service(s) from {}", config.services.len(), path.display());

    // shared by every service so a key size is generated once per lifetime
    let keys = Arc::new(KeyCache::new(EcdsaKeys));

    for service_config in &config.services {
        let addr = service_config.accept_addr()?;
        let service = Service::build(service_config.to_options(), Arc::clone(&keys))
            .await
            .with_context(|| format!("Failed to set up service '{}'", service_config.name))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {} for '{}'", addr, service_config.name))?;

        let service = Arc::new(service);
        tokio::spawn(async move {
            let name = service.name().to_string();
            if let Err(e) = service.serve(listener).await {
                error!("Service {} stopped: {}", name, e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");
    Ok(())
}
