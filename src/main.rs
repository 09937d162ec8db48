//! RelayKit - SOCKS5 / redirect relay

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relaykit::app::metrics::init_metrics;
use relaykit::app::stats_api::start_api_server;
use relaykit::config::Config;
use relaykit::error::{Error, Result};
use relaykit::{Registry, Runtime};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::example())
            .map_err(|e| Error::Config(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    let Some(path) = args.config else {
        print_help();
        return Err(Error::Config("no config file specified".into()));
    };
    let config = Config::load(&path)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    info!("RelayKit v{} starting...", env!("CARGO_PKG_VERSION"));

    let metrics_addr = args
        .metrics
        .or_else(|| config.metrics.as_ref().map(|m| m.addr.clone()));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        init_metrics();
        let runtime = Runtime::from_config(&config, &Registry::with_defaults()).await?;

        if let Some(addr) = metrics_addr {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    let collector = runtime.collector();
                    let shutdown_rx = runtime.shutdown_handle().subscribe();
                    tokio::spawn(start_api_server(addr, collector, shutdown_rx));
                }
                Err(e) => warn!("Invalid metrics address {}: {}", addr, e),
            }
        }

        runtime.run_until_ctrl_c().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
    metrics: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;
        let mut metrics = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics" => {
                    if i + 1 < args.len() {
                        metrics = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, gen_config, version, metrics }
    }
}

fn print_help() {
    println!(r#"RelayKit - SOCKS5 / redirect relay

USAGE:
    relaykit [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example config
    --metrics <ADDR>        Metrics listen address (e.g., 127.0.0.1:9000)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    relaykit -c config.json
    relaykit -c config.json --metrics 127.0.0.1:9000
    relaykit --gen-config > config.json

METRICS ENDPOINTS:
    GET /metrics            Prometheus metrics
    GET /stats              Per-service and per-client counters (JSON)
"#);
}

fn print_version() {
    println!("RelayKit v{}", env!("CARGO_PKG_VERSION"));
}
