use std::net::TcpListener;
use std::path::Path;

use anyhow::Result;
use clap::Parser;

use meridian_common::config::MeridianConfig;
use meridian_server::{conn, observability, Server};

#[derive(Parser, Debug)]
#[command(name = "meridian", about = "Meridian — in-memory geospatial store")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "meridian.toml")]
    config: String,

    /// Listen address (overrides config).
    #[arg(long)]
    addr: Option<String>,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<String>,

    /// Disable the append-only log (pure in-memory mode).
    #[arg(long)]
    no_aof: bool,

    /// Metrics listen address (overrides config; empty disables).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let default_config = MeridianConfig::default();
        println!("{}", toml::to_string_pretty(&default_config)?);
        return Ok(());
    }

    observability::init_tracing();
    tracing::info!("starting meridian...");

    let mut config = load_config(&cli.config);
    if let Some(addr) = &cli.addr {
        config.server.listen_addr = addr.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.server.data_dir = dir.clone();
    }
    if cli.no_aof {
        config.aof.enabled = false;
    }
    if let Some(addr) = &cli.metrics_addr {
        config.metrics.listen_addr = addr.clone();
    }

    if !config.metrics.listen_addr.is_empty() {
        if let Err(e) = observability::init_metrics(&config.metrics.listen_addr) {
            tracing::warn!("failed to initialize metrics: {}", e);
        }
    }

    let data_dir = config.server.data_dir.clone();
    let listen_addr = config.server.listen_addr.clone();
    let server = Server::open(config, Path::new(&data_dir))
        .map_err(|e| anyhow::anyhow!("server init: {}", e))?;
    server.start_background();

    let listener = TcpListener::bind(&listen_addr)?;
    conn::serve(server, listener)?;
    Ok(())
}

fn load_config(path: &str) -> MeridianConfig {
    match MeridianConfig::load(Path::new(path)) {
        Ok(config) => config,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no config at {}, using defaults", path);
            MeridianConfig::default()
        }
        Err(e) => {
            tracing::warn!("failed to load {}: {}; using defaults", path, e);
            MeridianConfig::default()
        }
    }
}
