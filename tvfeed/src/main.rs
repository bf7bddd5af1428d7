//! tvfeed: command console for the tuner/feed arbitration core.
//!
//! Reads one command per line from stdin or a script file and applies it to a
//! feed registry backed by a configuration-driven source provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tvfeed_core::{FeedEvent, FeedRegistry, StaticProviderConfig, StaticSourceProvider};

mod command;
mod logging;

use command::{execute, parse_line, Flow};

/// Default configuration file, used when present.
const DEFAULT_CONFIG: &str = "tvfeed.toml";

/// tvfeed - Tuner and feed arbitration console
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Command script to run instead of reading stdin
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Number of tuner devices (overrides the configuration file)
    #[arg(short, long)]
    devices: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    provider: Option<StaticProviderConfig>,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit path > auto-detect > built-in sample
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(config) => {
                eprintln!("Loaded config from: {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Failed to load config file {}: {}", path.display(), e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_deref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    let _log_guard = logging::init_logging(
        &log_dir,
        retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let mut provider_config = file_config
        .provider
        .unwrap_or_else(|| StaticProviderConfig::sample(2));
    if let Some(devices) = args.devices {
        provider_config.devices = devices;
    }

    info!("tvfeed starting...");
    info!("  Devices: {}", provider_config.devices);
    info!("  Groups: {}", provider_config.groups.len());
    if provider_config.tune_delay_ms > 0 {
        info!("  Simulated tune delay: {}ms", provider_config.tune_delay_ms);
    }

    let provider = Arc::new(StaticSourceProvider::new(provider_config));
    let mut registry = FeedRegistry::new(provider);

    let events = tokio::spawn(log_events(registry.subscribe()));

    match &args.script {
        Some(path) => {
            info!("Running script: {}", path.display());
            let file = tokio::fs::File::open(path).await?;
            run_console(&mut registry, BufReader::new(file)).await?;
        }
        None => run_console(&mut registry, BufReader::new(tokio::io::stdin())).await?,
    }

    registry.shutdown();
    // Closing the channel ends the event logger
    drop(registry);
    if let Err(e) = events.await {
        warn!("Event logger failed: {}", e);
    }

    info!("tvfeed stopped");
    Ok(())
}

/// Process commands until end of input or `quit`.
async fn run_console<R>(registry: &mut FeedRegistry, input: R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            None => continue,
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match execute(registry, command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => {
                error!("Command failed: {}", e);
                eprintln!("error: {}", e);
            }
        }
    }

    Ok(())
}

/// Log every committed feed change until the registry goes away.
async fn log_events(mut events: broadcast::Receiver<FeedEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => info!("Event: {}", event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event logger lagged, {} events missed", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
