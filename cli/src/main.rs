//! FluidMCP — gateway CLI.
//!
//! Three subcommands:
//! - `fluidmcp run`: launch the gateway from a TOML config (or an installed
//!   package manifest)
//! - `fluidmcp serve`: launch API-only, fleet managed via admin endpoints
//! - `fluidmcp install`: populate the local package cache from the registry

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fluidmcp::install::{DEFAULT_REGISTRY_URL, install_package, load_manifest};
use fluidmcp::{GatewayConfig, run_gateway};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// FluidMCP — MCP server gateway and LLM proxy.
#[derive(Parser)]
#[command(
    name = "fluidmcp",
    version,
    about = "FluidMCP — hosts MCP stdio servers and proxies LLM providers behind one HTTP surface"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the gateway with a configuration file or installed package
    Run {
        /// Path to fluidmcp.toml [default: ./fluidmcp.toml or ~/.config/fluidmcp/fluidmcp.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Installed package directory to serve instead of a config file
        #[arg(long)]
        package: Option<PathBuf>,
    },
    /// Launch API-only; manage the fleet through the admin endpoints
    Serve {
        /// HTTP port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind address
        #[arg(long)]
        host: Option<String>,
    },
    /// Fetch a package (name or name@version) into the local cache
    Install {
        /// Package reference, e.g. `acme/echo@1.2.0`
        package: String,
        /// Registry base URL
        #[arg(long, default_value = DEFAULT_REGISTRY_URL)]
        registry: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity; logs go to stderr so stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the root token for graceful shutdown.
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down FluidMCP...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Run { config, package } => {
            let config = match package {
                Some(dir) => config_from_package(&dir).await?,
                None => {
                    let path = resolve_config(config)?;
                    load_config(&path).await?
                }
            };
            run_gateway(config, cancel)
                .await
                .map_err(|e| anyhow::anyhow!("gateway failed: {e}"))?;
        }
        Commands::Serve { port, host } => {
            let mut config = GatewayConfig::default();
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            run_gateway(config, cancel)
                .await
                .map_err(|e| anyhow::anyhow!("gateway failed: {e}"))?;
        }
        Commands::Install { package, registry } => {
            let cache_root = package_cache_root()?;
            let dir = install_package(&package, &registry, &cache_root)
                .await
                .map_err(|e| anyhow::anyhow!("install failed: {e}"))?;
            println!("{}", dir.display());
        }
    }

    Ok(())
}

/// Resolve config file path: explicit flag → ./fluidmcp.toml →
/// ~/.config/fluidmcp/fluidmcp.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("fluidmcp.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("fluidmcp").join("fluidmcp.toml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No fluidmcp.toml found. Searched ./fluidmcp.toml and ~/.config/fluidmcp/fluidmcp.toml. \
         Use --config to specify a path."
    ))
}

/// Load and parse a fluidmcp.toml config file.
async fn load_config(config_path: &PathBuf) -> Result<GatewayConfig> {
    let content = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("failed to read config file {config_path:?}"))?;
    GatewayConfig::from_toml(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {config_path:?}: {e}"))
}

/// Build a single-server config from an installed package directory.
async fn config_from_package(dir: &Path) -> Result<GatewayConfig> {
    let manifest = load_manifest(dir)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load package manifest from {dir:?}: {e}"))?;
    let server = manifest.to_server_config(dir.to_path_buf());
    let mut config = GatewayConfig::default();
    config.servers.insert(server.id.clone(), server);
    Ok(config)
}

/// Package cache root: ~/.fluidmcp/packages.
fn package_cache_root() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".fluidmcp").join("packages"))
}
