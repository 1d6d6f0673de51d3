use anyhow::{Context, Result};
use clap::Parser;
use mygate::config::Config;
use mygate::Mygate;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mygate")]
#[command(about = "A transparent MySQL proxy with master/slave routing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to the runtime configuration file
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    init_logging(&config);

    info!("Starting mygate v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", cli.config);

    let registry = config
        .load_registry()
        .with_context(|| format!("Failed to load backend registry from {:?}", config.mysql_conf))?;
    info!(
        "{} backend nodes in {:?}",
        registry.nodes().len(),
        config.mysql_conf
    );

    if config.daemon {
        info!("daemon = true: running in the foreground, detaching is left to the service manager");
    }

    let mut mygate = Mygate::new(config, registry);
    mygate
        .initialize()
        .context("Failed to bind the listening socket")?;
    mygate.run().context("mygate stopped")?;

    Ok(())
}

/// `RUST_LOG` wins over `loglevel`; output goes to the `log` file when it
/// can be opened
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.loglevel.directive()));

    match OpenOptions::new().create(true).append(true).open(&config.log) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(Mutex::new(file))
            .init(),
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            warn!("Cannot open log file {:?} ({}), logging to stderr", config.log, e);
        }
    }
}
